//! Time-boxed on-disk cache for remote call results.
//!
//! Every entry is a single file named after the operation and a hash of its
//! arguments. An entry's age is its file modification time. Entries older
//! than the TTL are swept on every access; nothing here is required for
//! correctness, so I/O problems only ever turn into cache misses.

pub mod codec;


use std::fs::{self, File};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::debug_log;

const TEMP_EXTENSION: &str = "tmp";

/// Statistics about the cache directory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Filesystem-backed response cache.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default location under the platform temp root.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("reposcope-cache")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, operation: &str, args: &Map<String, Value>) -> PathBuf {
        self.dir.join(codec::entry_file_name(operation, args))
    }

    /// Return the cached result for `operation(args)` if it is younger than
    /// `ttl_seconds`, otherwise run `fetch` and store what it returns.
    ///
    /// A TTL of zero or less bypasses the store entirely. Fetch errors are
    /// returned as-is and never cached.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        operation: &str,
        args: &Map<String, Value>,
        ttl_seconds: i64,
        fetch: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if ttl_seconds <= 0 {
            return fetch().await;
        }

        let ttl = Duration::from_secs(ttl_seconds as u64);
        self.sweep(ttl);

        let path = self.entry_path(operation, args);
        if let Some(value) = read_fresh(&path, ttl) {
            debug_log::cache("HIT", &path.display().to_string());
            return Ok(value);
        }
        debug_log::cache("MISS", &path.display().to_string());

        let value = fetch().await?;
        match self.store(&path, &value) {
            Ok(()) => debug_log::cache("STORE", &path.display().to_string()),
            Err(e) => debug_log::cache("STORE_FAILED", &format!("{}: {e:#}", path.display())),
        }
        Ok(value)
    }

    fn store(&self, path: &Path, value: &Value) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache dir {}", self.dir.display()))?;

        let bytes = codec::encode(value)?;

        // Atomic write via temp file + rename
        let temp_path = path.with_extension(format!("{}.{TEMP_EXTENSION}", std::process::id()));
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete every entry whose age is at least `ttl`.
    ///
    /// Other processes may be sweeping the same directory, so files that
    /// vanish between listing and removal are ignored.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = SystemTime::now();
        let mut deleted = 0;

        for (path, modified, _) in list_entries(&self.dir) {
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < ttl {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    debug_log::cache("SWEEP_FAILED", &format!("{}: {e}", path.display()));
                }
            }
        }

        if deleted > 0 {
            debug_log::cache("SWEEP", &format!("removed {deleted} entries"));
        }
        deleted
    }

    /// Remove all entries regardless of age.
    pub fn clear(&self) -> Result<usize> {
        let mut deleted = 0;
        for (path, _, _) in list_entries(&self.dir) {
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> CacheStats {
        list_entries(&self.dir)
            .into_iter()
            .filter(|(path, _, _)| has_extension(path, codec::ENTRY_EXTENSION))
            .fold(CacheStats::default(), |mut stats, (_, _, size)| {
                stats.entries += 1;
                stats.total_bytes += size;
                stats
            })
    }
}

fn read_fresh(path: &Path, ttl: Duration) -> Option<Value> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age >= ttl {
        return None;
    }

    let mut bytes = fs::read(path).ok()?;
    match codec::decode(&mut bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            debug_log::cache("CORRUPT", &format!("{}: {e:#}", path.display()));
            None
        }
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(extension)
}

/// Collect cache files (entries and leftover temp files) with mtime and size.
fn list_entries(dir: &Path) -> Vec<(PathBuf, SystemTime, u64)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if !(has_extension(&path, codec::ENTRY_EXTENSION)
                || has_extension(&path, TEMP_EXTENSION))
            {
                return None;
            }
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified, metadata.len()))
        })
        .collect()
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
