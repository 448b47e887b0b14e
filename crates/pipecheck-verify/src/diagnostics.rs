//! Per-attempt diagnostic logs.
//!
//! Token fetches, registry calls and uploads each open an [`AttemptLog`]
//! while they are in flight. A log that ends in success is deleted at once;
//! a log that fails (or is dropped without an outcome) is retained and its
//! path reported in the verdict. [`Diagnostics::purge`] removes whatever is
//! left when the run passes or is cancelled.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use pipecheck_common::Result;

#[derive(Debug)]
struct Inner {
    run_id: String,
    dir: PathBuf,
    seq: AtomicU32,
    retained: Mutex<Vec<PathBuf>>,
}

/// Owner of every diagnostic log written during one run
#[derive(Debug, Clone)]
pub struct Diagnostics {
    inner: Arc<Inner>,
}

impl Diagnostics {
    /// Logs are written under `<base>/<run_id>/`, created on first use
    pub fn new(base: &Path, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            inner: Arc::new(Inner {
                dir: base.join(&run_id),
                run_id,
                seq: AtomicU32::new(0),
                retained: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Run this log set belongs to
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Directory holding this run's logs
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Open a log for one attempt of `kind` (e.g. `token-fetch`)
    pub fn begin(&self, kind: &str) -> Result<AttemptLog> {
        std::fs::create_dir_all(&self.inner.dir)?;
        let n = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.inner.dir.join(format!("{:02}-{}.log", n, kind));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut log = AttemptLog {
            owner: self.clone(),
            path,
            file: Some(file),
            resolved: false,
        };
        log.record(format_args!("begin {}", kind));
        Ok(log)
    }

    /// Logs kept because their attempt failed
    pub fn retained(&self) -> Vec<PathBuf> {
        self.inner.retained.lock().clone()
    }

    /// Remove every log and the run directory
    ///
    /// Best-effort: failures are logged, never returned.
    pub fn purge(&self) {
        self.inner.retained.lock().clear();
        match std::fs::remove_dir_all(&self.inner.dir) {
            Ok(()) => debug!(dir = %self.inner.dir.display(), "Removed diagnostics"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                dir = %self.inner.dir.display(),
                error = %e,
                "Failed to remove diagnostics"
            ),
        }
    }

    fn retain(&self, path: PathBuf) {
        self.inner.retained.lock().push(path);
    }
}

/// Log file for one in-flight attempt
///
/// Must end with [`AttemptLog::succeed`] or [`AttemptLog::fail`]; dropping an
/// unresolved log retains it.
#[derive(Debug)]
pub struct AttemptLog {
    owner: Diagnostics,
    path: PathBuf,
    file: Option<File>,
    resolved: bool,
}

impl AttemptLog {
    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timestamped line. Callers redact secrets first.
    pub fn record(&mut self, line: impl Display) {
        if let Some(file) = self.file.as_mut() {
            let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            if let Err(e) = writeln!(file, "{} {}", stamp, line) {
                warn!(path = %self.path.display(), error = %e, "Failed to write diagnostic log");
            }
        }
    }

    /// The attempt succeeded: delete the log
    pub fn succeed(mut self) {
        self.resolved = true;
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove diagnostic log");
            }
        }
    }

    /// The attempt failed: record why and retain the log
    pub fn fail(mut self, reason: impl Display) {
        self.record(format_args!("failed: {}", reason));
        self.keep();
    }

    fn keep(&mut self) {
        self.resolved = true;
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        self.owner.retain(self.path.clone());
    }
}

impl Drop for AttemptLog {
    fn drop(&mut self) {
        if !self.resolved {
            self.record("attempt abandoned");
            self.keep();
        }
    }
}
