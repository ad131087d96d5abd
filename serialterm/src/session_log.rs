//! Append-only record of the bytes received during one session.

use {
    crate::error::Result,
    log::{debug, warn},
    std::{
        fs::{self, File, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Per-session traffic log.
///
/// Every append is flushed immediately, so the file is complete up to the
/// last received chunk even if the process dies.
#[derive(Debug, Default)]
pub struct LogSink {
    file: Option<File>,
    path: Option<PathBuf>,
}

/// File name for a session on `port` started at `millis` since the epoch.
///
/// Characters that are awkward in file names (`/`, `\`, `:`) become `_`.
pub fn session_file_name(port: &str, millis: u128) -> String {
    let port: String = port
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();
    let port = port.trim_matches('_');
    format!("session-{millis}-{port}.log")
}

impl LogSink {
    /// A sink that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a new session log for `port` inside `dir`.
    pub fn open(dir: &Path, port: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let path = dir.join(session_file_name(port, millis));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Session log: {}", path.display());
        Ok(Self {
            file: Some(file),
            path: Some(path),
        })
    }

    /// Whether appends reach a file.
    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Path of the log file, if one was opened.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append and flush. A no-op once the sink is disabled or closed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(bytes)?;
            file.flush()?;
        }
        Ok(())
    }

    /// Stop logging for the rest of the session, keeping the path for reference.
    pub fn disable(&mut self) {
        self.file = None;
    }

    /// Flush and close the file.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                warn!("Flushing session log failed: {e}");
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.close();
    }
}
