//! Result-path expressions for reshaping service responses.
//!
//! Supported syntax, a small JMESPath-like subset:
//!
//! - `a.b.c` and `"quoted key"` field access, `@` for the current node
//! - `[2]`, `[-1]` index access
//! - `[*]` list projection, `[]` flatten projection
//! - `[?status == 'OPEN']`, `[?count != 3]` filter projection
//! - `a || b` alternation: the first non-empty alternative wins
//! - `{name: expr, other: expr}` builds an object from the current node,
//!   usually after a projection as in `ids[].{id: @}`
//!
//! After a projection the rest of the expression applies to every element,
//! and elements that evaluate to `null` are dropped.

use serde_json::Value;

use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(i64),
    Project,
    Flatten,
    Filter(Comparison),
    Select(Vec<(String, Vec<Step>)>),
}

#[derive(Debug, Clone, PartialEq)]
struct Comparison {
    lhs: Vec<Step>,
    negate: bool,
    rhs: Value,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    alternatives: Vec<Vec<Step>>,
}

impl PathExpr {
    pub fn parse(source: &str) -> Result<Self, QueryError> {
        let mut parser = Parser {
            chars: source.chars().collect(),
            pos: 0,
            source,
        };
        let mut alternatives = vec![parser.chain()?];
        loop {
            parser.skip_ws();
            if parser.eat_str("||") {
                alternatives.push(parser.chain()?);
            } else if parser.at_end() {
                break;
            } else {
                return Err(parser.error("unexpected character"));
            }
        }
        Ok(Self { alternatives })
    }

    /// Name of the final field in a plain dotted path (`a.b.c` -> `c`).
    pub fn leaf_name(&self) -> Option<&str> {
        match self.alternatives.as_slice() {
            [steps] => match steps.last() {
                Some(Step::Field(name)) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Evaluate against `data`. Missing values yield `Value::Null`.
    pub fn eval(&self, data: &Value) -> Value {
        let mut result = Value::Null;
        for steps in &self.alternatives {
            result = eval_steps(steps, data);
            if is_truthy(&result) {
                return result;
            }
        }
        result
    }
}

fn eval_steps(steps: &[Step], data: &Value) -> Value {
    let mut current = data.clone();
    for (i, step) in steps.iter().enumerate() {
        let rest = &steps[i + 1..];
        match step {
            Step::Field(name) => {
                current = match current {
                    Value::Object(mut map) => map.remove(name).unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            Step::Index(index) => {
                current = match current {
                    Value::Array(mut items) => {
                        let len = items.len() as i64;
                        let idx = if *index < 0 { len + index } else { *index };
                        if idx >= 0 && idx < len {
                            items.swap_remove(idx as usize)
                        } else {
                            Value::Null
                        }
                    }
                    _ => Value::Null,
                };
            }
            Step::Project => {
                return match current {
                    Value::Array(items) => project(items, rest),
                    _ => Value::Null,
                };
            }
            Step::Flatten => {
                return match current {
                    Value::Array(items) => {
                        let flat = items
                            .into_iter()
                            .flat_map(|item| match item {
                                Value::Array(inner) => inner,
                                other => vec![other],
                            })
                            .collect();
                        project(flat, rest)
                    }
                    _ => Value::Null,
                };
            }
            Step::Filter(cmp) => {
                return match current {
                    Value::Array(items) => {
                        let kept = items
                            .into_iter()
                            .filter(|item| {
                                let lhs = eval_steps(&cmp.lhs, item);
                                (lhs == cmp.rhs) != cmp.negate
                            })
                            .collect();
                        project(kept, rest)
                    }
                    _ => Value::Null,
                };
            }
            Step::Select(fields) => {
                if current.is_null() {
                    return Value::Null;
                }
                current = Value::Object(
                    fields
                        .iter()
                        .map(|(name, steps)| (name.clone(), eval_steps(steps, &current)))
                        .collect(),
                );
            }
        }
        if current.is_null() {
            return Value::Null;
        }
    }
    current
}

fn project(items: Vec<Value>, rest: &[Step]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|item| eval_steps(rest, item))
            .filter(|v| !v.is_null())
            .collect(),
    )
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, what: &str) -> QueryError {
        QueryError::validation(format!(
            "invalid path expression '{}': {what} at position {}",
            self.source, self.pos
        ))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        let end = self.pos + s.chars().count();
        if end <= self.chars.len() && self.chars[self.pos..end].iter().copied().eq(s.chars()) {
            self.pos = end;
            true
        } else {
            false
        }
    }

    /// A chain of field accesses and brackets.
    fn chain(&mut self) -> Result<Vec<Step>, QueryError> {
        self.skip_ws();
        let mut steps = Vec::new();

        match self.peek() {
            Some('@') => {
                self.pos += 1;
            }
            Some('[') => steps.push(self.bracket()?),
            Some('{') => steps.push(self.select()?),
            _ => steps.push(Step::Field(self.identifier()?)),
        }

        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    if self.peek() == Some('{') {
                        steps.push(self.select()?);
                    } else {
                        steps.push(Step::Field(self.identifier()?));
                    }
                }
                Some('[') => steps.push(self.bracket()?),
                _ => break,
            }
        }
        Ok(steps)
    }

    fn identifier(&mut self) -> Result<String, QueryError> {
        if self.eat('"') {
            let start = self.pos;
            while self.peek().is_some_and(|c| c != '"') {
                self.pos += 1;
            }
            if !self.eat('"') {
                return Err(self.error("unterminated quoted identifier"));
            }
            return Ok(self.chars[start..self.pos - 1].iter().collect());
        }

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '$')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn bracket(&mut self) -> Result<Step, QueryError> {
        self.pos += 1; // '['
        self.skip_ws();

        let step = if self.eat(']') {
            return Ok(Step::Flatten);
        } else if self.eat('*') {
            Step::Project
        } else if self.eat('?') {
            Step::Filter(self.comparison()?)
        } else {
            Step::Index(self.integer()?)
        };

        self.skip_ws();
        if !self.eat(']') {
            return Err(self.error("expected ']'"));
        }
        Ok(step)
    }

    fn select(&mut self) -> Result<Step, QueryError> {
        self.pos += 1; // '{'
        let mut fields = Vec::new();
        loop {
            self.skip_ws();
            let name = self.identifier()?;
            self.skip_ws();
            if !self.eat(':') {
                return Err(self.error("expected ':'"));
            }
            let steps = self.chain()?;
            fields.push((name, steps));
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            if self.eat('}') {
                return Ok(Step::Select(fields));
            }
            return Err(self.error("expected ',' or '}'"));
        }
    }

    fn integer(&mut self) -> Result<i64, QueryError> {
        let start = self.pos;
        self.eat('-');
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse().map_err(|_| self.error("expected index"))
    }

    fn comparison(&mut self) -> Result<Comparison, QueryError> {
        let lhs = self.chain()?;
        self.skip_ws();
        let negate = if self.eat_str("==") {
            false
        } else if self.eat_str("!=") {
            true
        } else {
            return Err(self.error("expected '==' or '!='"));
        };
        self.skip_ws();
        let rhs = self.literal()?;
        Ok(Comparison { lhs, negate, rhs })
    }

    fn literal(&mut self) -> Result<Value, QueryError> {
        if self.eat('\'') {
            let start = self.pos;
            while self.peek().is_some_and(|c| c != '\'') {
                self.pos += 1;
            }
            if !self.eat('\'') {
                return Err(self.error("unterminated string literal"));
            }
            let text: String = self.chars[start..self.pos - 1].iter().collect();
            return Ok(Value::String(text));
        }

        if self.eat('`') {
            let start = self.pos;
            while self.peek().is_some_and(|c| c != '`') {
                self.pos += 1;
            }
            if !self.eat('`') {
                return Err(self.error("unterminated JSON literal"));
            }
            let text: String = self.chars[start..self.pos - 1].iter().collect();
            return serde_json::from_str(&text).map_err(|_| self.error("invalid JSON literal"));
        }

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '.' || c == '-')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        serde_json::from_str(&text).map_err(|_| self.error("expected literal"))
    }
}
