//! Local repository context read through the `git` command line.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoContext {
    pub root: PathBuf,
    /// Remote repository name, falling back to the directory name.
    pub name: String,
    /// `None` when HEAD is detached.
    pub branch: Option<String>,
    pub last_commit: Option<String>,
}

impl RepoContext {
    pub fn discover(dir: &Path) -> Result<Self, QueryError> {
        let root = git(dir, &["rev-parse", "--show-toplevel"])?
            .map(PathBuf::from)
            .ok_or_else(|| QueryError::validation("must be inside a repository"))?;

        let name = git(&root, &["config", "--get", "remote.origin.url"])?
            .and_then(|url| repository_name_from_url(&url))
            .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let branch = git(&root, &["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        let last_commit = git(&root, &["log", "-1", "--format=%s"])?;

        Ok(Self {
            root,
            name,
            branch,
            last_commit,
        })
    }

    /// Refuse to continue on one of the `protected` branches.
    pub fn ensure_not_protected(&self, protected: &[String]) -> Result<(), QueryError> {
        match &self.branch {
            Some(branch) if protected.iter().any(|p| p == branch) => Err(QueryError::validation(
                format!("branch {branch} is protected"),
            )),
            _ => Ok(()),
        }
    }
}

/// Run git in `dir`. A non-zero exit or empty output is `None`; failing to
/// start git at all is an error.
fn git(dir: &Path, args: &[&str]) -> Result<Option<String>, QueryError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .map_err(|e| QueryError::validation(format!("could not run git: {e}")))?;

    if !output.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!text.is_empty()).then_some(text))
}

/// Last path component of a remote URL, without a `.git` suffix.
///
/// Handles `https://host/org/name.git`, `git@host:org/name.git` and
/// `codecommit::region://name` forms.
pub fn repository_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    (!name.is_empty()).then(|| name.to_string())
}
