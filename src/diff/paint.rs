//! Terminal output for diff rows.

use std::io::{self, Write};

use crossterm::style::{Attribute, Color, Stylize};

use super::{DiffRow, LineText};

const SEPARATOR: &str = "⋯";
const GUTTER: &str = "│";

#[derive(Debug, Clone, Copy)]
pub struct PaintOptions {
    pub color: bool,
}

impl Default for PaintOptions {
    fn default() -> Self {
        Self { color: true }
    }
}

pub fn write_rows<W: Write + ?Sized>(out: &mut W, rows: &[DiffRow], options: PaintOptions) -> io::Result<()> {
    let width = number_width(rows);

    for row in rows {
        match row {
            DiffRow::Context { left, right, text } => {
                let numbers = gutter(Some(*left), Some(*right), width);
                writeln!(out, "{numbers} {}", paint_text(text, None, ' ', options))?;
            }
            DiffRow::Removed { left, text } => {
                let numbers = gutter(Some(*left), None, width);
                writeln!(out, "{numbers} {}", paint_text(text, Some(Color::Red), '-', options))?;
            }
            DiffRow::Added { right, text } => {
                let numbers = gutter(None, Some(*right), width);
                writeln!(out, "{numbers} {}", paint_text(text, Some(Color::Green), '+', options))?;
            }
            DiffRow::Separator => {
                let line = format!("{:>w$} {SEPARATOR}", "", w = width * 2 + 1);
                if options.color {
                    writeln!(out, "{}", line.dark_grey())?;
                } else {
                    writeln!(out, "{line}")?;
                }
            }
            DiffRow::Comment { comment, .. } => {
                let numbers = gutter(None, None, width);
                let body = format!("{}: {}", comment.author, comment.text);
                if options.color {
                    writeln!(out, "{numbers} {}", body.yellow().attribute(Attribute::Dim))?;
                } else {
                    writeln!(out, "{numbers} # {body}")?;
                }
            }
        }
    }
    Ok(())
}

fn number_width(rows: &[DiffRow]) -> usize {
    rows.iter()
        .flat_map(|r| [r.left(), r.right()])
        .flatten()
        .max()
        .map(|n| n.to_string().len())
        .unwrap_or(1)
}

fn gutter(left: Option<usize>, right: Option<usize>, width: usize) -> String {
    let cell = |n: Option<usize>| n.map(|n| n.to_string()).unwrap_or_default();
    format!("{:>width$} {:>width$} {GUTTER}", cell(left), cell(right))
}

/// Render one side of a line. Without color the row kind is shown as a
/// leading marker instead.
fn paint_text(text: &LineText, color: Option<Color>, marker: char, options: PaintOptions) -> String {
    if !options.color {
        return format!("{marker} {}", text.to_plain_string());
    }

    let mut out = String::new();
    match color {
        Some(color) => {
            out.push_str(&text.indent.as_str().with(color).to_string());
            for segment in &text.segments {
                let styled = segment.text.as_str().with(color);
                let styled = if segment.emphasized {
                    styled.attribute(Attribute::Bold).attribute(Attribute::Reverse)
                } else {
                    styled
                };
                out.push_str(&styled.to_string());
            }
        }
        None => out.push_str(&text.to_plain_string()),
    }
    out
}
