//! Debug trace for diagnosing cache and dispatch behaviour.
//!
//! Enable by setting environment variable: REPOSCOPE_DEBUG_LOG=1
//! Lines are appended to `reposcope-debug.log` in the platform temp directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(false);
static START_TIME: OnceLock<Instant> = OnceLock::new();
static LOG_FILE: OnceLock<Option<std::sync::Mutex<std::fs::File>>> = OnceLock::new();

pub fn log_path() -> PathBuf {
    std::env::temp_dir().join("reposcope-debug.log")
}

/// Initialize debug logging. Call once at startup.
pub fn init() {
    if std::env::var("REPOSCOPE_DEBUG_LOG").is_err() {
        return;
    }

    START_TIME.get_or_init(Instant::now);
    let file = LOG_FILE.get_or_init(|| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path())
            .ok()
            .map(std::sync::Mutex::new)
    });

    // An unwritable log location leaves logging off.
    if file.is_some() {
        ENABLED.store(true, Ordering::SeqCst);
        log("DEBUG", "init", "Debug logging initialized");
    }
}

/// Check if debug logging is enabled.
#[inline]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Log a debug message with timestamp and thread ID.
pub fn log(category: &str, action: &str, detail: &str) {
    if !is_enabled() {
        return;
    }

    let elapsed = START_TIME
        .get()
        .map(|s| s.elapsed().as_millis())
        .unwrap_or(0);
    let thread_id = std::thread::current().id();

    let msg = format!(
        "[{:>8}ms] [{:?}] [{}] {} - {}\n",
        elapsed, thread_id, category, action, detail
    );

    if let Some(Some(file_mutex)) = LOG_FILE.get()
        && let Ok(mut file) = file_mutex.lock()
    {
        let _ = file.write_all(msg.as_bytes());
        let _ = file.flush();
    }
}

#[inline]
pub fn cache(action: &str, detail: &str) {
    if is_enabled() {
        log("CACHE", action, detail);
    }
}

#[inline]
pub fn dispatch(action: &str, detail: &str) {
    if is_enabled() {
        log("DISPATCH", action, detail);
    }
}

#[inline]
pub fn join(action: &str, detail: &str) {
    if is_enabled() {
        log("JOIN", action, detail);
    }
}

/// RAII guard that logs elapsed time when dropped.
pub struct TimedSpan {
    category: &'static str,
    label: String,
    started: Instant,
}

impl TimedSpan {
    pub fn new(category: &'static str, label: String) -> Self {
        Self {
            category,
            label,
            started: Instant::now(),
        }
    }
}

impl Drop for TimedSpan {
    fn drop(&mut self) {
        if is_enabled() {
            let detail = format!("{} ({}ms)", self.label, self.started.elapsed().as_millis());
            log(self.category, "DONE", &detail);
        }
    }
}
