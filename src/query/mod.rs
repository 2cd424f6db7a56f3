//! Query, filter and join engine.
//!
//! A [`QuerySpec`] names one root operation. Its result is reduced to a list
//! of records (or a single record), optionally filtered by an attribute
//! pattern, and then enriched by any number of joins. Each join issues one
//! secondary call per record, concurrently, and merges the answers back by
//! join key.

mod join;

#[cfg(test)]
mod tests;

use regex::Regex;
use serde_json::{Map, Value};

use crate::dispatch::Dispatcher;
use crate::error::QueryError;
use crate::path::PathExpr;

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Keep records whose attribute matches a regular expression.
#[derive(Debug, Clone)]
pub struct AttributeFilter {
    attribute: PathExpr,
    pattern: Regex,
}

impl AttributeFilter {
    pub fn new(attribute: &str, pattern: &str) -> Result<Self, QueryError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| QueryError::validation(format!("invalid filter pattern '{pattern}': {e}")))?;
        Ok(Self {
            attribute: PathExpr::parse(attribute)?,
            pattern,
        })
    }

    /// Records without the attribute never match.
    pub fn matches(&self, record: &Value) -> bool {
        match self.attribute.eval(record) {
            Value::Null => false,
            value => self.pattern.is_match(&render_scalar(&value)),
        }
    }
}

/// One enrichment step.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub operation: String,
    key_paths: Vec<PathExpr>,
    pub extra_args: Map<String, Value>,
    /// Merge the whole secondary response instead of its first member.
    /// Unset means: only for joins after the first.
    store_root: Option<bool>,
}

impl JoinSpec {
    /// `key_paths` are dotted attribute paths; together they form the join key.
    pub fn new(operation: &str, key_paths: &[&str]) -> Result<Self, QueryError> {
        if key_paths.is_empty() {
            return Err(QueryError::validation(format!(
                "join on {operation} needs at least one key path"
            )));
        }

        let key_paths = key_paths
            .iter()
            .map(|p| {
                let expr = PathExpr::parse(p)?;
                if expr.leaf_name().is_none() {
                    return Err(QueryError::validation(format!(
                        "join key '{p}' must be a dotted attribute path"
                    )));
                }
                Ok(expr)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            operation: operation.to_string(),
            key_paths,
            extra_args: Map::new(),
            store_root: None,
        })
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_store_root(mut self, store_root: bool) -> Self {
        self.store_root = Some(store_root);
        self
    }

    /// Whether the join at `position` in a query merges whole responses.
    pub fn stores_root(&self, position: usize) -> bool {
        self.store_root.unwrap_or(position > 0)
    }

    pub fn key_paths(&self) -> &[PathExpr] {
        &self.key_paths
    }
}

#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub operation: String,
    pub arguments: Map<String, Value>,
    pub result_path: Option<PathExpr>,
    pub filter: Option<AttributeFilter>,
    pub joins: Vec<JoinSpec>,
    /// Cache lifetime for the root call, overriding the dispatcher's.
    pub ttl_seconds: Option<i64>,
}

impl QuerySpec {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            arguments: Map::new(),
            result_path: None,
            filter: None,
            joins: Vec::new(),
            ttl_seconds: None,
        }
    }

    pub fn arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.to_string(), value.into());
        self
    }

    pub fn args(mut self, args: Map<String, Value>) -> Self {
        self.arguments.extend(args);
        self
    }

    pub fn result_path(mut self, expression: &str) -> Result<Self, QueryError> {
        self.result_path = Some(PathExpr::parse(expression)?);
        Ok(self)
    }

    pub fn filter(mut self, filter: AttributeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }
}

/// Result of a query: a list of records, or one record when the root
/// response had no list to pick.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    List(Vec<Value>),
    Single(Value),
}

impl QueryOutput {
    pub fn into_records(self) -> Vec<Value> {
        match self {
            QueryOutput::List(records) => records,
            QueryOutput::Single(record) => vec![record],
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            QueryOutput::List(records) => Value::Array(records),
            QueryOutput::Single(record) => record,
        }
    }
}

pub struct QueryEngine {
    dispatcher: Dispatcher,
    concurrency: usize,
}

impl QueryEngine {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn query(&self, spec: &QuerySpec) -> Result<QueryOutput, QueryError> {
        let raw = match spec.ttl_seconds {
            Some(ttl) => {
                self.dispatcher
                    .call_with_ttl(&spec.operation, &spec.arguments, ttl)
                    .await?
            }
            None => self.dispatcher.call(&spec.operation, &spec.arguments).await?,
        };

        let mut output = extract(raw, spec.result_path.as_ref());

        if let Some(filter) = &spec.filter {
            output = match output {
                QueryOutput::List(records) => {
                    QueryOutput::List(records.into_iter().filter(|r| filter.matches(r)).collect())
                }
                QueryOutput::Single(record) if filter.matches(&record) => QueryOutput::Single(record),
                QueryOutput::Single(_) => QueryOutput::List(Vec::new()),
            };
        }

        if spec.joins.is_empty() {
            return Ok(output);
        }

        let (mut records, wrapped) = match output {
            QueryOutput::List(records) => (records, false),
            QueryOutput::Single(record) => (vec![record], true),
        };

        for (position, join) in spec.joins.iter().enumerate() {
            let store_root = join.stores_root(position);
            join::apply(&self.dispatcher, join, store_root, &mut records, self.concurrency).await?;
        }

        if wrapped && let Some(record) = records.pop() {
            return Ok(QueryOutput::Single(record));
        }
        Ok(QueryOutput::List(records))
    }
}

/// Pick the working data out of a root response.
///
/// With a result path the path decides. Without one, the first field (in
/// response order) holding a list wins; a response without any list field
/// is a single record.
fn extract(raw: Value, result_path: Option<&PathExpr>) -> QueryOutput {
    if let Some(path) = result_path {
        return match path.eval(&raw) {
            Value::Array(records) => QueryOutput::List(records),
            Value::Null => QueryOutput::List(Vec::new()),
            other => QueryOutput::Single(other),
        };
    }

    match raw {
        Value::Array(records) => QueryOutput::List(records),
        Value::Object(map) => {
            let first_list = map.values().position(Value::is_array);
            match first_list {
                Some(index) => match map.into_iter().nth(index) {
                    Some((_, Value::Array(records))) => QueryOutput::List(records),
                    _ => QueryOutput::List(Vec::new()),
                },
                None => QueryOutput::Single(Value::Object(map)),
            }
        }
        other => QueryOutput::Single(other),
    }
}

/// String form of a value for matching and join keys. Missing is empty.
pub(crate) fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
