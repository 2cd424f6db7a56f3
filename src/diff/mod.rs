//! Line-aligned text diff with intra-line highlighting.
//!
//! Alignment runs on whitespace-trimmed lines so that re-indentation alone is
//! not a change. Rendered rows put each side's original indentation back.
//! Review comments can be overlaid on destination lines; they never affect
//! the alignment.

pub mod paint;


use std::collections::HashMap;

use serde::Deserialize;
use similar::{ChangeTag, DiffOp, DiffTag, TextDiff};

/// Unchanged lines kept around each change run.
pub const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    /// Part of an intra-line change.
    pub emphasized: bool,
}

/// Rendered text of one side of a line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineText {
    pub indent: String,
    pub segments: Vec<Segment>,
}

impl LineText {
    fn plain(indent: &str, text: &str) -> Self {
        Self {
            indent: indent.to_string(),
            segments: vec![Segment {
                text: text.to_string(),
                emphasized: false,
            }],
        }
    }

    /// Full text without styling.
    pub fn to_plain_string(&self) -> String {
        let mut out = self.indent.clone();
        for segment in &self.segments {
            out.push_str(&segment.text);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Comment {
    pub author: String,
    pub text: String,
}

/// Comments to show under destination lines, per document.
#[derive(Debug, Clone, Default)]
pub struct CommentOverlay {
    entries: HashMap<(String, usize), Vec<Comment>>,
}

/// A comment as stored in a comments file.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayEntry {
    pub document: String,
    pub line: usize,
    pub author: String,
    pub text: String,
}

impl CommentOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, document: &str, line: usize, comment: Comment) {
        self.entries
            .entry((document.to_string(), line))
            .or_default()
            .push(comment);
    }

    pub fn comments_for(&self, document: &str, line: usize) -> &[Comment] {
        self.entries
            .get(&(document.to_string(), line))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of comments on `document`, across all lines.
    pub fn count_for(&self, document: &str) -> usize {
        self.entries
            .iter()
            .filter(|((doc, _), _)| doc == document)
            .map(|(_, comments)| comments.len())
            .sum()
    }
}

impl FromIterator<OverlayEntry> for CommentOverlay {
    fn from_iter<I: IntoIterator<Item = OverlayEntry>>(iter: I) -> Self {
        let mut overlay = Self::new();
        for entry in iter {
            overlay.add(
                &entry.document,
                entry.line,
                Comment {
                    author: entry.author,
                    text: entry.text,
                },
            );
        }
        overlay
    }
}

/// One rendered output row. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRow {
    Context {
        left: usize,
        right: usize,
        text: LineText,
    },
    Removed {
        left: usize,
        text: LineText,
    },
    Added {
        right: usize,
        text: LineText,
    },
    /// Marks elided unchanged lines between two change regions.
    Separator,
    Comment {
        right: usize,
        comment: Comment,
    },
}

impl DiffRow {
    pub fn left(&self) -> Option<usize> {
        match self {
            DiffRow::Context { left, .. } | DiffRow::Removed { left, .. } => Some(*left),
            _ => None,
        }
    }

    pub fn right(&self) -> Option<usize> {
        match self {
            DiffRow::Context { right, .. }
            | DiffRow::Added { right, .. }
            | DiffRow::Comment { right, .. } => Some(*right),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn text(&self) -> Option<&LineText> {
        match self {
            DiffRow::Context { text, .. }
            | DiffRow::Removed { text, .. }
            | DiffRow::Added { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Aligned pair of 0-based line indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Aligned {
    left: Option<usize>,
    right: Option<usize>,
    changed: bool,
}

/// Diff `from` against `to`.
///
/// `overlay` pairs the comments with the document name they are keyed on.
pub fn render(from: &str, to: &str, overlay: Option<(&CommentOverlay, &str)>) -> Vec<DiffRow> {
    let old_lines: Vec<&str> = from.lines().collect();
    let new_lines: Vec<&str> = to.lines().collect();
    let old_trimmed: Vec<&str> = old_lines.iter().map(|l| l.trim()).collect();
    let new_trimmed: Vec<&str> = new_lines.iter().map(|l| l.trim()).collect();

    let mut rows = Vec::new();
    for (i, group) in align(&old_trimmed, &new_trimmed).into_iter().enumerate() {
        if i > 0 {
            rows.push(DiffRow::Separator);
        }
        for pair in group {
            let start = rows.len();
            push_pair(&mut rows, pair, &old_lines, &new_lines, &old_trimmed, &new_trimmed);
            attach_comments(&mut rows, start, overlay);
        }
    }
    rows
}

/// Group aligned pairs into context windows.
fn align(old: &[&str], new: &[&str]) -> Vec<Vec<Aligned>> {
    let diff = TextDiff::from_slices(old, new);

    let groups: Vec<Vec<DiffOp>> = if diff.ops().iter().all(|op| op.tag() == DiffTag::Equal) {
        vec![diff.ops().to_vec()]
    } else {
        diff.grouped_ops(CONTEXT_LINES)
    };

    groups
        .iter()
        .map(|group| group.iter().flat_map(expand_op).collect())
        .collect()
}

fn expand_op(op: &DiffOp) -> Vec<Aligned> {
    match *op {
        DiffOp::Equal {
            old_index,
            new_index,
            len,
        } => (0..len)
            .map(|k| Aligned {
                left: Some(old_index + k),
                right: Some(new_index + k),
                changed: false,
            })
            .collect(),
        DiffOp::Delete {
            old_index, old_len, ..
        } => (0..old_len)
            .map(|k| Aligned {
                left: Some(old_index + k),
                right: None,
                changed: true,
            })
            .collect(),
        DiffOp::Insert {
            new_index, new_len, ..
        } => (0..new_len)
            .map(|k| Aligned {
                left: None,
                right: Some(new_index + k),
                changed: true,
            })
            .collect(),
        DiffOp::Replace {
            old_index,
            old_len,
            new_index,
            new_len,
        } => (0..old_len.max(new_len))
            .map(|k| Aligned {
                left: (k < old_len).then_some(old_index + k),
                right: (k < new_len).then_some(new_index + k),
                changed: true,
            })
            .collect(),
    }
}

fn push_pair(
    rows: &mut Vec<DiffRow>,
    pair: Aligned,
    old_lines: &[&str],
    new_lines: &[&str],
    old_trimmed: &[&str],
    new_trimmed: &[&str],
) {
    match (pair.left, pair.right) {
        (Some(l), Some(r)) if !pair.changed => rows.push(DiffRow::Context {
            left: l + 1,
            right: r + 1,
            text: LineText::plain(indent_of(new_lines[r]), new_trimmed[r]),
        }),
        (Some(l), Some(r)) => {
            let (old_segments, new_segments) = inline_segments(old_trimmed[l], new_trimmed[r]);
            rows.push(DiffRow::Removed {
                left: l + 1,
                text: LineText {
                    indent: indent_of(old_lines[l]).to_string(),
                    segments: old_segments,
                },
            });
            rows.push(DiffRow::Added {
                right: r + 1,
                text: LineText {
                    indent: indent_of(new_lines[r]).to_string(),
                    segments: new_segments,
                },
            });
        }
        (Some(l), None) => rows.push(DiffRow::Removed {
            left: l + 1,
            text: LineText::plain(indent_of(old_lines[l]), old_trimmed[l]),
        }),
        (None, Some(r)) => rows.push(DiffRow::Added {
            right: r + 1,
            text: LineText::plain(indent_of(new_lines[r]), new_trimmed[r]),
        }),
        (None, None) => {}
    }
}

/// Insert overlay comments after each row from `start` on that has a
/// destination line.
fn attach_comments(rows: &mut Vec<DiffRow>, start: usize, overlay: Option<(&CommentOverlay, &str)>) {
    let Some((overlay, document)) = overlay else {
        return;
    };

    let produced: Vec<DiffRow> = rows.drain(start..).collect();
    for row in produced {
        let right = row.right();
        rows.push(row);
        if let Some(line) = right {
            for comment in overlay.comments_for(document, line) {
                rows.push(DiffRow::Comment {
                    right: line,
                    comment: comment.clone(),
                });
            }
        }
    }
}

fn indent_of(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Character-level segments for the old and new side of a changed pair.
fn inline_segments(old: &str, new: &str) -> (Vec<Segment>, Vec<Segment>) {
    let diff = TextDiff::from_chars(old, new);

    let mut left: Vec<Segment> = Vec::new();
    let mut right: Vec<Segment> = Vec::new();

    for change in diff.iter_all_changes() {
        let text = change.value();
        match change.tag() {
            ChangeTag::Equal => {
                push_segment(&mut left, text, false);
                push_segment(&mut right, text, false);
            }
            ChangeTag::Delete => push_segment(&mut left, text, true),
            ChangeTag::Insert => push_segment(&mut right, text, true),
        }
    }

    (left, right)
}

/// Append text, merging with the previous segment when the style matches.
fn push_segment(segments: &mut Vec<Segment>, text: &str, emphasized: bool) {
    match segments.last_mut() {
        Some(last) if last.emphasized == emphasized => last.text.push_str(text),
        _ => segments.push(Segment {
            text: text.to_string(),
            emphasized,
        }),
    }
}
