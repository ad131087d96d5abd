//! Error types for serialterm.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for serialterm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of port lifecycle operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// The named port does not exist on this host.
    #[error("Port not found: {port}")]
    NotFound {
        /// Port name that was requested.
        port: String,
    },

    /// The port exists but is claimed by another process or not accessible.
    #[error("Access denied to {port}: {reason}")]
    AccessDenied {
        /// Port name that was requested.
        port: String,
        /// Backend-provided reason.
        reason: String,
    },

    /// The requested serial settings cannot be applied.
    #[error("Configuration rejected for {port}: {reason}")]
    ConfigRejected {
        /// Port name the settings were meant for.
        port: String,
        /// Why the settings were refused.
        reason: String,
    },

    /// The operation is not allowed in the current engine state.
    #[error("Busy: {0}")]
    Busy(String),
}

/// Failures of data transfers between the engine and the device.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The file selected for upload could not be opened or read.
    #[error("Cannot read {}: {source}", path.display())]
    FileError {
        /// File that was being uploaded.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The device vanished or the handle was invalidated.
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// The transfer was stopped before it finished.
    #[error("Transfer cancelled")]
    Cancelled,
}

/// Failures of hand-off queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was closed; producers must stop.
    #[error("Queue closed")]
    Closed,
}

/// Error type for serialterm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Port lifecycle error.
    #[error(transparent)]
    Port(#[from] PortError),

    /// Transfer error.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// I/O error (serial port, log file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Flat classification of every error, as reported to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// See [`PortError::NotFound`].
    NotFound,
    /// See [`PortError::AccessDenied`].
    AccessDenied,
    /// See [`PortError::ConfigRejected`].
    ConfigRejected,
    /// See [`PortError::Busy`].
    Busy,
    /// See [`TransferError::FileError`].
    FileError,
    /// See [`TransferError::LinkLost`].
    LinkLost,
    /// See [`TransferError::Cancelled`].
    Cancelled,
    /// See [`QueueError::Closed`].
    QueueClosed,
    /// Plain I/O failure.
    Io,
    /// Invalid configuration.
    Config,
}

impl PortError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::ConfigRejected { .. } => ErrorKind::ConfigRejected,
            Self::Busy(_) => ErrorKind::Busy,
        }
    }

    /// Shorthand for a [`PortError::Busy`] error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }
}

impl TransferError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileError { .. } => ErrorKind::FileError,
            Self::LinkLost(_) => ErrorKind::LinkLost,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl Error {
    /// Classify this error for the UI layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Port(e) => e.kind(),
            Self::Transfer(e) => e.kind(),
            Self::Queue(QueueError::Closed) => ErrorKind::QueueClosed,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this is a [`PortError::Busy`] refusal.
    pub fn is_busy(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::AccessDenied => "access denied",
            Self::ConfigRejected => "configuration rejected",
            Self::Busy => "busy",
            Self::FileError => "file error",
            Self::LinkLost => "link lost",
            Self::Cancelled => "cancelled",
            Self::QueueClosed => "queue closed",
            Self::Io => "I/O error",
            Self::Config => "configuration error",
        };
        f.write_str(name)
    }
}
