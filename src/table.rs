//! Column-aligned text tables for query records.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use crossterm::style::{Attribute, Stylize};
use serde_json::Value;

use crate::error::QueryError;
use crate::path::PathExpr;
use crate::query::render_scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Align {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellStyle {
    #[default]
    Plain,
    /// Timestamps shown as "3 minutes ago".
    RelativeTime,
    /// Colored by value: open or succeeded is green, failed or deleted is red.
    Status,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub header: String,
    pub path: PathExpr,
    pub align: Align,
    pub style: CellStyle,
}

impl Column {
    pub fn new(header: &str, path: &str) -> Result<Self, QueryError> {
        Ok(Self {
            header: header.to_string(),
            path: PathExpr::parse(path)?,
            align: Align::Left,
            style: CellStyle::Plain,
        })
    }

    pub fn align(mut self, align: Align) -> Self {
        self.align = align;
        self
    }

    pub fn style(mut self, style: CellStyle) -> Self {
        self.style = style;
        self
    }
}

pub struct Table {
    columns: Vec<Column>,
    color: bool,
    now: DateTime<Utc>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            color: true,
            now: Utc::now(),
        }
    }

    /// One plain column per path, headed by the path itself.
    pub fn from_paths(paths: &[&str]) -> Result<Self, QueryError> {
        let columns = paths
            .iter()
            .map(|p| Column::new(p, p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(columns))
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Reference time for relative timestamps.
    #[cfg(test)]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Unstyled cell text, one row per record.
    pub fn cells(&self, records: &[Value]) -> Vec<Vec<String>> {
        records
            .iter()
            .map(|record| {
                self.columns
                    .iter()
                    .map(|column| {
                        let value = column.path.eval(record);
                        match column.style {
                            CellStyle::RelativeTime => parse_timestamp(&value)
                                .map(|t| relative_time(t, self.now))
                                .unwrap_or_else(|| render_scalar(&value)),
                            _ => render_scalar(&value),
                        }
                    })
                    .collect()
            })
            .collect()
    }

    pub fn write<W: Write + ?Sized>(&self, out: &mut W, records: &[Value]) -> io::Result<()> {
        let rows = self.cells(records);

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                rows.iter()
                    .map(|row| row[i].chars().count())
                    .chain(std::iter::once(column.header.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let header: Vec<String> = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(column, width)| pad(&column.header, *width, column.align))
            .collect();
        let header = header.join("  ");
        if self.color {
            writeln!(out, "{}", header.as_str().attribute(Attribute::Bold))?;
        } else {
            writeln!(out, "{}", header.trim_end())?;
        }

        let rule = widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("  ");
        if self.color {
            writeln!(out, "{}", rule.dark_grey())?;
        } else {
            writeln!(out, "{rule}")?;
        }

        for row in &rows {
            let line: Vec<String> = self
                .columns
                .iter()
                .zip(&widths)
                .zip(row)
                .map(|((column, width), cell)| {
                    let padded = pad(cell, *width, column.align);
                    if self.color {
                        paint_cell(&padded, cell, column.style)
                    } else {
                        padded
                    }
                })
                .collect();
            let line = line.join("  ");
            writeln!(out, "{}", line.trim_end())?;
        }
        Ok(())
    }
}

fn pad(text: &str, width: usize, align: Align) -> String {
    match align {
        Align::Left => format!("{text:<width$}"),
        Align::Right => format!("{text:>width$}"),
    }
}

fn paint_cell(padded: &str, raw: &str, style: CellStyle) -> String {
    match style {
        CellStyle::Status => match raw.to_ascii_uppercase().as_str() {
            "OPEN" | "SUCCEEDED" | "SUCCESS" | "MERGED" | "ADDED" | "MODIFIED" => {
                padded.green().to_string()
            }
            "FAILED" | "FAILURE" | "DELETED" => padded.red().to_string(),
            _ => padded.attribute(Attribute::Dim).to_string(),
        },
        CellStyle::RelativeTime => padded.dark_grey().to_string(),
        CellStyle::Plain => padded.to_string(),
    }
}

/// RFC 3339 strings or epoch seconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp(secs.trunc() as i64, 0)
        }
        _ => None,
    }
}

pub fn relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = now.signed_duration_since(then).num_seconds();
    if seconds < 60 {
        return "just now".to_string();
    }

    let (count, unit) = if seconds < 3_600 {
        (seconds / 60, "minute")
    } else if seconds < 86_400 {
        (seconds / 3_600, "hour")
    } else if seconds < 30 * 86_400 {
        (seconds / 86_400, "day")
    } else if seconds < 365 * 86_400 {
        (seconds / (30 * 86_400), "month")
    } else {
        (seconds / (365 * 86_400), "year")
    };

    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}
