//! Persistent, append-only debug logs.
//!
//! The upgrade hooks and the boot entrypoint may be torn down by the test
//! harness right after they finish, before anything written to stdout is
//! collected. Each line is therefore appended and closed immediately to a
//! file that survives a container restart, and mirrored to tracing.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

/// An append-only log file.
#[derive(Debug, Clone)]
pub struct DebugLog {
    path: Utf8PathBuf,
}

impl DebugLog {
    /// Log to the given file; the parent directory is created on first write.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The log file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Record a progress message.
    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!("{msg}");
        self.append(msg);
    }

    /// Record a non-fatal problem.
    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::warn!("{msg}");
        self.append(&format!("WARNING: {msg}"));
    }

    fn append(&self, msg: &str) {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{ts}] {msg}\n");
        if let Err(e) = self.try_append(&line) {
            // Nowhere better to report this
            tracing::debug!("Failed to write {}: {e}", self.path);
        }
    }

    fn try_append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(line.as_bytes())
    }
}
