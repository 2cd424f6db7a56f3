//! `pr`: one pull request with its approval state, changed files, diffs and
//! review comments.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::Args;
use crossterm::style::Stylize;
use regex::Regex;
use serde_json::{Value, json};

use super::{Session, author_name, enrich_pull_request, is_binary_path};
use crate::diff::paint::{self, PaintOptions};
use crate::diff::{self, Comment, CommentOverlay};
use crate::error::QueryError;
use crate::query::{JoinSpec, QuerySpec};
use crate::table::{Align, CellStyle, Column, Table};

#[derive(Args, Debug, Clone, Default)]
pub struct PrArgs {
    /// Pull request id
    pub id: String,

    /// Show file diffs
    #[arg(short, long, default_value_t = false)]
    pub diffs: bool,

    /// Show review comments under the diffed lines (implies --diffs)
    #[arg(short, long, default_value_t = false)]
    pub comments: bool,

    /// Only diff files whose path matches this regular expression (implies --diffs)
    #[arg(short, long, value_name = "PATTERN")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Deleted,
    Modified,
}

impl Change {
    fn from_code(code: &str) -> Result<Self, QueryError> {
        match code {
            "A" => Ok(Change::Added),
            "D" => Ok(Change::Deleted),
            "M" => Ok(Change::Modified),
            other => Err(QueryError::validation(format!("unknown change type '{other}'"))),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Change::Added => "added",
            Change::Deleted => "deleted",
            Change::Modified => "modified",
        }
    }

    fn marker(self) -> &'static str {
        match self {
            Change::Added => "+added+",
            Change::Deleted => "-deleted-",
            Change::Modified => "+modified+",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChangedFile {
    path: String,
    before: Option<String>,
    after: Option<String>,
    change: Change,
}

/// Review comments split into pull-request level remarks and line comments
/// on the source side of the change.
#[derive(Debug, Default)]
struct ReviewComments {
    general: Vec<Comment>,
    overlay: CommentOverlay,
}

pub async fn run_pr(session: &Session, out: &mut dyn Write, args: &PrArgs) -> Result<()> {
    let show_diffs = args.diffs || args.comments || args.file.is_some();
    let file_pattern = args
        .file
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid --file pattern")?;
    let color = session.settings.color;

    let spec = QuerySpec::new("getPullRequest")
        .arg("pullRequestId", args.id.as_str())
        .result_path("pullRequest")?
        .join(
            JoinSpec::new(
                "evaluatePullRequestApprovalRules",
                &["pullRequestId", "revisionId"],
            )?
            .with_store_root(true),
        );
    let mut record = session.engine.query(&spec).await?.into_value();
    if !record.is_object() {
        return Err(QueryError::validation(format!("pull request {} not found", args.id)).into());
    }
    enrich_pull_request(&mut record);

    Table::new(vec![
        Column::new("id", "pullRequestId")?.align(Align::Right),
        Column::new("title", "title")?,
        Column::new("author", "author")?,
        Column::new("repository", "pullRequestTargets[0].repositoryName")?,
        Column::new("activity", "lastActivityDate")?.style(CellStyle::RelativeTime),
        Column::new("status", "pullRequestStatus")?.style(CellStyle::Status),
        Column::new("approvals", "approvalStatus")?,
    ])
    .with_color(color)
    .write(out, std::slice::from_ref(&record))?;

    let target = |field: &str| {
        record
            .pointer(&format!("/pullRequestTargets/0/{field}"))
            .cloned()
            .unwrap_or(Value::Null)
    };
    let repository = target("repositoryName").as_str().unwrap_or_default().to_string();
    // The destination is the "before" side, the source the "after" side.
    let differences = QuerySpec::new("getDifferences")
        .arg("repositoryName", repository.as_str())
        .arg("beforeCommitSpecifier", target("destinationCommit"))
        .arg("afterCommitSpecifier", target("sourceCommit"))
        .result_path("differences")?;
    let files = changed_files(&session.engine.query(&differences).await?.into_records())?;

    writeln!(out)?;
    if !show_diffs {
        writeln!(out, "changes:")?;
        let rows: Vec<Value> = files
            .iter()
            .map(|f| json!({"file": f.path, "change": f.change.label()}))
            .collect();
        Table::new(vec![
            Column::new("file", "file")?,
            Column::new("change", "change")?.style(CellStyle::Status),
        ])
        .with_color(color)
        .write(out, &rows)?;
        return Ok(());
    }

    let comments = if args.comments {
        let threads = QuerySpec::new("getCommentsForPullRequest")
            .arg("pullRequestId", args.id.as_str())
            .result_path("commentsForPullRequestData")?;
        review_comments(&session.engine.query(&threads).await?.into_records())
    } else {
        ReviewComments::default()
    };

    if !comments.general.is_empty() {
        writeln!(out, "PR comments")?;
        let rows: Vec<Value> = comments
            .general
            .iter()
            .map(|c| json!({"author": c.author, "comment": c.text}))
            .collect();
        Table::new(vec![Column::new("author", "author")?, Column::new("comment", "comment")?])
            .with_color(color)
            .write(out, &rows)?;
        writeln!(out)?;
    }

    let mut matched = 0;
    for file in &files {
        if is_binary_path(Path::new(&file.path)) {
            writeln!(out, "{} (binary)", file.path)?;
            continue;
        }
        if let Some(pattern) = &file_pattern
            && !pattern.is_match(&file.path)
        {
            continue;
        }
        matched += 1;

        let count = comments.overlay.count_for(&file.path);
        writeln!(out, "{}", file_heading(&file.path, file.change, count, color))?;

        let from = match (&file.before, &file.after) {
            (Some(before), Some(_)) => blob_text(session, &repository, before).await?,
            (None, Some(_)) if file_pattern.is_some() => String::new(),
            _ => continue,
        };
        let Some(after) = &file.after else {
            continue;
        };
        let to = blob_text(session, &repository, after).await?;

        let rows = diff::render(&from, &to, Some((&comments.overlay, file.path.as_str())));
        paint::write_rows(out, &rows, PaintOptions { color })?;
    }

    if let Some(pattern) = &args.file
        && matched == 0
    {
        return Err(
            QueryError::validation(format!("no files matching pattern '{pattern}' in PR")).into(),
        );
    }
    Ok(())
}

fn changed_files(differences: &[Value]) -> Result<Vec<ChangedFile>, QueryError> {
    differences
        .iter()
        .map(|d| {
            let text = |pointer: &str| d.pointer(pointer).and_then(Value::as_str).map(str::to_string);
            let code = d.get("changeType").and_then(Value::as_str).unwrap_or_default();
            Ok(ChangedFile {
                path: text("/afterBlob/path")
                    .or_else(|| text("/beforeBlob/path"))
                    .unwrap_or_default(),
                before: text("/beforeBlob/blobId"),
                after: text("/afterBlob/blobId"),
                change: Change::from_code(code)?,
            })
        })
        .collect()
}

/// Threads without a location are pull-request level. Located threads on
/// the "AFTER" version become overlay comments; the rest are dropped.
fn review_comments(threads: &[Value]) -> ReviewComments {
    let mut review = ReviewComments::default();

    for thread in threads {
        let comments = thread
            .get("comments")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .map(|c| Comment {
                        author: c
                            .get("authorArn")
                            .and_then(Value::as_str)
                            .map(author_name)
                            .unwrap_or_default(),
                        text: c
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        match thread.get("location") {
            None | Some(Value::Null) => review.general.extend(comments),
            Some(location)
                if location.get("relativeFileVersion").and_then(Value::as_str) == Some("AFTER") =>
            {
                let path = location
                    .get("filePath")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let Some(line) = location.get("filePosition").and_then(Value::as_u64) else {
                    continue;
                };
                for comment in comments {
                    review.overlay.add(path, line as usize, comment);
                }
            }
            Some(_) => {}
        }
    }
    review
}

/// Blob contents, always fetched fresh.
async fn blob_text(session: &Session, repository: &str, blob_id: &str) -> Result<String> {
    let spec = QuerySpec::new("getBlob")
        .arg("blobId", blob_id)
        .arg("repositoryName", repository)
        .result_path("content")?
        .ttl(0);
    let content = session.engine.query(&spec).await?.into_value();
    let encoded = content
        .as_str()
        .with_context(|| format!("Blob {blob_id} has no content"))?;
    let bytes = STANDARD
        .decode(encoded)
        .with_context(|| format!("Blob {blob_id} is not valid base64"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn file_heading(path: &str, change: Change, comments: usize, color: bool) -> String {
    let note = match comments {
        0 => String::new(),
        n => format!(" {n} comment(s)"),
    };
    if !color {
        return format!("{path} {}{note}", change.marker());
    }
    let marker = match change {
        Change::Deleted => change.marker().red(),
        _ => change.marker().green(),
    };
    format!("{} {marker}{}", path.bold(), note.cyan())
}
