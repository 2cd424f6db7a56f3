//! Command bodies. Each writes to the sink it is given and reports failures
//! through its `Result`; `main` decides how to present them.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde_json::{Map, Value};

use crate::cache::{ResponseCache, format_bytes};
use crate::config::Config;
use crate::diff::paint::{self, PaintOptions};
use crate::diff::{self, CommentOverlay, OverlayEntry};
use crate::dispatch::{CacheOptions, Dispatcher};
use crate::error::QueryError;
use crate::query::{AttributeFilter, JoinSpec, QueryEngine, QuerySpec};
use crate::remote::RemoteService;
use crate::table::{Align, CellStyle, Column, Table};
use crate::vcs::RepoContext;

mod pull_request;

pub use pull_request::{PrArgs, run_pr};

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "pdf", "zip", "gz", "jar", "exe", "dll", "so", "class", "ico",
    "woff", "woff2",
];

/// Effective settings after config file, environment and flags.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ttl_seconds: i64,
    pub concurrency: usize,
    pub color: bool,
    pub cache_dir: PathBuf,
    pub protected_branches: Vec<String>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl_seconds: config.cache.ttl_seconds,
            concurrency: config.query.concurrency,
            color: config.output.color,
            cache_dir: config.cache_dir(),
            protected_branches: config.repository.protected_branches.clone(),
        }
    }
}

/// Everything a remote-backed command needs.
pub struct Session {
    engine: QueryEngine,
    settings: Settings,
}

impl Session {
    pub fn new(service: Arc<dyn RemoteService>, settings: Settings) -> Self {
        let dispatcher = Dispatcher::new(
            service,
            ResponseCache::new(&settings.cache_dir),
            CacheOptions {
                ttl_seconds: settings.ttl_seconds,
            },
        );
        Self {
            engine: QueryEngine::new(dispatcher).with_concurrency(settings.concurrency),
            settings,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Remote operation to call, e.g. listRepositories
    pub operation: String,

    /// Call argument as KEY=VALUE (repeatable, values are strings)
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    pub args: Vec<String>,

    /// Call arguments as a JSON object
    #[arg(long, value_name = "JSON")]
    pub args_json: Option<String>,

    /// Result path selecting the records, e.g. 'pullRequestIds[].{id: @}'
    #[arg(long, value_name = "EXPR")]
    pub path: Option<String>,

    /// Keep records whose attribute matches a regular expression
    #[arg(long, value_name = "ATTR=PATTERN")]
    pub filter: Option<String>,

    /// Enrich records: operation:path[+path][:root|member][:key=value,...]
    #[arg(long = "join", value_name = "SPEC")]
    pub joins: Vec<String>,

    /// Print a table with these comma-separated attribute paths
    #[arg(long, value_name = "A,B,C")]
    pub columns: Option<String>,

    /// Print JSON even when columns are given
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ReposArgs {
    /// Regular expression matched against repository names
    #[arg(short, long)]
    pub filter: Option<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PrsArgs {
    /// Repository name (defaults to the current checkout's repository)
    #[arg(short, long)]
    pub repository: Option<String>,

    /// OPEN, CLOSED or ANY
    #[arg(long, default_value = "OPEN")]
    pub status: String,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct DiffArgs {
    pub from: PathBuf,
    pub to: PathBuf,

    /// JSON file with [{"document", "line", "author", "text"}, ...]
    #[arg(long, value_name = "FILE")]
    pub comments: Option<PathBuf>,

    /// Document name the comments are keyed on (defaults to TO's file name)
    #[arg(long, value_name = "DOCUMENT")]
    pub name: Option<String>,
}

pub async fn run_query(session: &Session, out: &mut dyn Write, args: &QueryArgs) -> Result<()> {
    let spec = build_query(args)?;
    let output = session.engine.query(&spec).await?;

    match &args.columns {
        Some(columns) if !args.json => {
            let paths: Vec<&str> = columns
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect();
            let table = Table::from_paths(&paths)?.with_color(session.settings.color);
            table.write(out, &output.into_records())?;
        }
        _ => write_json(out, &output.into_value())?,
    }
    Ok(())
}

pub fn build_query(args: &QueryArgs) -> Result<QuerySpec> {
    let mut spec = QuerySpec::new(&args.operation);

    if let Some(json) = &args.args_json {
        let value: Value = serde_json::from_str(json).context("Invalid --args-json")?;
        let Value::Object(map) = value else {
            bail!("--args-json must be a JSON object");
        };
        spec = spec.args(map);
    }
    for raw in &args.args {
        let (name, value) = split_pair(raw, "--arg")?;
        spec = spec.arg(name, value);
    }
    if let Some(path) = &args.path {
        spec = spec.result_path(path)?;
    }
    if let Some(filter) = &args.filter {
        let (attribute, pattern) = split_pair(filter, "--filter")?;
        spec = spec.filter(AttributeFilter::new(attribute, pattern)?);
    }
    for raw in &args.joins {
        spec = spec.join(parse_join(raw)?);
    }
    Ok(spec)
}

/// Parse `operation:path1+path2[:root|member][:key=value,...]`.
///
/// Only the first two colons separate sections; argument values may contain
/// colons of their own.
pub fn parse_join(raw: &str) -> Result<JoinSpec> {
    let mut parts = raw.splitn(3, ':');
    let operation = parts.next().unwrap_or_default().trim();
    let keys = parts.next().unwrap_or_default().trim();
    if operation.is_empty() || keys.is_empty() {
        bail!("--join expects operation:path[+path][:root][:key=value,...], got '{raw}'");
    }

    let key_paths: Vec<&str> = keys.split('+').map(str::trim).collect();
    let mut join = JoinSpec::new(operation, &key_paths)?;

    let rest = parts.next().unwrap_or_default();
    let (mode, pairs) = match rest.split_once(':') {
        Some((head, tail)) if matches!(head, "root" | "member") => (head, tail),
        _ if matches!(rest, "root" | "member") => (rest, ""),
        _ => ("", rest),
    };
    match mode {
        "root" => join = join.with_store_root(true),
        "member" => join = join.with_store_root(false),
        _ => {}
    }

    let mut extra = Map::new();
    for pair in pairs.split(',').filter(|p| !p.is_empty()) {
        let (name, value) = split_pair(pair, "--join")?;
        extra.insert(name.to_string(), Value::String(value.to_string()));
    }
    Ok(join.with_args(extra))
}

fn split_pair<'a>(raw: &'a str, flag: &str) -> Result<(&'a str, &'a str)> {
    raw.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .with_context(|| format!("{flag} expects KEY=VALUE, got '{raw}'"))
}

pub async fn run_repos(session: &Session, out: &mut dyn Write, args: &ReposArgs) -> Result<()> {
    let mut spec = QuerySpec::new("listRepositories")
        .result_path("repositories")?
        .join(JoinSpec::new("getRepository", &["repositoryName"])?);
    if let Some(pattern) = &args.filter {
        spec = spec.filter(AttributeFilter::new("repositoryName", pattern)?);
    }

    let records = session.engine.query(&spec).await?.into_records();
    if records.is_empty() {
        if args.filter.is_some() {
            return Err(QueryError::validation("no results matched filter").into());
        }
        writeln!(out, "No repositories found.")?;
        return Ok(());
    }

    if args.json {
        return write_json(out, &Value::Array(records));
    }

    let table = Table::new(vec![
        Column::new("name", "repositoryName")?,
        Column::new("default branch", "defaultBranch")?,
        Column::new("last modified", "lastModifiedDate")?.style(CellStyle::RelativeTime),
    ])
    .with_color(session.settings.color);
    table.write(out, &records)?;
    Ok(())
}

pub async fn run_prs(session: &Session, out: &mut dyn Write, args: &PrsArgs, cwd: &Path) -> Result<()> {
    let repository = match &args.repository {
        Some(name) => name.clone(),
        None => RepoContext::discover(cwd)?.name,
    };
    let status = args.status.to_ascii_uppercase();

    let mut spec = QuerySpec::new("listPullRequests").arg("repositoryName", repository.as_str());
    match status.as_str() {
        "OPEN" | "CLOSED" => spec = spec.arg("pullRequestStatus", status.as_str()),
        "ANY" => {}
        other => bail!("Invalid status '{other}'. Use OPEN, CLOSED or ANY"),
    }
    let spec = spec
        .result_path("pullRequestIds[].{pullRequestId: @}")?
        .join(JoinSpec::new("getPullRequest", &["pullRequestId"])?);

    let mut records = session.engine.query(&spec).await?.into_records();
    if records.is_empty() {
        return Err(QueryError::validation(format!(
            "no PRs with {status} state in repo {repository}"
        ))
        .into());
    }

    for record in &mut records {
        enrich_pull_request(record);
    }

    if args.json {
        return write_json(out, &Value::Array(records));
    }

    let table = Table::new(vec![
        Column::new("id", "pullRequestId")?.align(Align::Right),
        Column::new("title", "title")?,
        Column::new("author", "author")?,
        Column::new("activity", "lastActivityDate")?.style(CellStyle::RelativeTime),
        Column::new("status", "pullRequestStatus")?.style(CellStyle::Status),
    ])
    .with_color(session.settings.color);
    table.write(out, &records)?;
    Ok(())
}

/// User name from an ARN such as `arn:aws:iam::123456789012:user/dana`.
fn author_name(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_string()
}

/// Add `author` and, when an approval evaluation was joined in,
/// `approvalStatus`.
fn enrich_pull_request(record: &mut Value) {
    let author = record.get("authorArn").and_then(Value::as_str).map(author_name);
    let approvals = record.get("evaluation").map(|evaluation| {
        if evaluation.get("approved").and_then(Value::as_bool) == Some(true) {
            return "Approved".to_string();
        }
        let count = |field: &str| evaluation.get(field).and_then(Value::as_array).map_or(0, Vec::len);
        let satisfied = count("approvalRulesSatisfied");
        let total = satisfied + count("approvalRulesNotSatisfied");
        format!("{satisfied} of {total} rules satisfied")
    });

    if let Value::Object(map) = record {
        if let Some(author) = author {
            map.insert("author".to_string(), Value::String(author));
        }
        if let Some(approvals) = approvals {
            map.insert("approvalStatus".to_string(), Value::String(approvals));
        }
    }
}

pub fn run_diff(out: &mut dyn Write, args: &DiffArgs, color: bool) -> Result<()> {
    if let Some(path) = [&args.from, &args.to].into_iter().find(|p| is_binary_path(p)) {
        writeln!(out, "Skipping binary file: {}", path.display())?;
        return Ok(());
    }

    let from = fs::read_to_string(&args.from)
        .with_context(|| format!("Failed to read {}", args.from.display()))?;
    let to = fs::read_to_string(&args.to)
        .with_context(|| format!("Failed to read {}", args.to.display()))?;

    let overlay = args.comments.as_deref().map(load_comments).transpose()?;
    let document = args.name.clone().unwrap_or_else(|| {
        args.to
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let rows = diff::render(&from, &to, overlay.as_ref().map(|o| (o, document.as_str())));
    if rows.is_empty() {
        writeln!(out, "Both files are empty.")?;
        return Ok(());
    }
    paint::write_rows(out, &rows, PaintOptions { color })?;
    Ok(())
}

fn is_binary_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

pub fn load_comments(path: &Path) -> Result<CommentOverlay> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read comments file {}", path.display()))?;
    let entries: Vec<OverlayEntry> =
        serde_json::from_str(&content).context("Failed to parse comments file")?;
    Ok(entries.into_iter().collect())
}

pub fn run_status(out: &mut dyn Write, cwd: &Path, protected_branches: &[String]) -> Result<()> {
    let context = RepoContext::discover(cwd)?;

    writeln!(out, "Repository:  {}", context.name)?;
    writeln!(out, "Root:        {}", context.root.display())?;
    writeln!(
        out,
        "Branch:      {}",
        context.branch.as_deref().unwrap_or("(detached)")
    )?;
    writeln!(
        out,
        "Last commit: {}",
        context.last_commit.as_deref().unwrap_or("(none)")
    )?;

    context.ensure_not_protected(protected_branches)?;
    Ok(())
}

pub fn run_cache_clear(out: &mut dyn Write, cache: &ResponseCache) -> Result<()> {
    let removed = cache.clear()?;
    writeln!(
        out,
        "🧹 Removed {removed} cached responses from {}",
        cache.dir().display()
    )?;
    Ok(())
}

pub fn run_cache_stats(out: &mut dyn Write, cache: &ResponseCache) -> Result<()> {
    let stats = cache.stats();
    writeln!(out, "📦 Cache directory: {}", cache.dir().display())?;
    writeln!(out, "   Entries: {}", stats.entries)?;
    writeln!(out, "   Size: {}", format_bytes(stats.total_bytes))?;
    Ok(())
}

fn write_json(out: &mut dyn Write, value: &Value) -> Result<()> {
    let json = simd_json::to_string_pretty(value)?;
    writeln!(out, "{json}")?;
    Ok(())
}
