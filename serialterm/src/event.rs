//! Events the engine reports to its UI collaborator.

use {
    crate::error::ErrorKind,
    std::{fmt, path::PathBuf, sync::mpsc},
};

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EngineState {
    /// No workers running; the port may be reconfigured or switched.
    #[default]
    Disconnected,
    /// Opening the port and starting workers.
    Connecting,
    /// Workers are running and hold the port endpoints.
    Connected,
    /// Stopping workers and releasing the port.
    Disconnecting,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        })
    }
}

/// Notification emitted by the engine or one of its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Bytes received from the device, in arrival order.
    ByteReceived(Vec<u8>),
    /// An upload was accepted.
    TransferStarted {
        /// File being uploaded.
        path: PathBuf,
        /// File size in bytes.
        total: u64,
    },
    /// An upload chunk was queued for transmission.
    TransferProgress {
        /// Bytes queued so far.
        sent: u64,
        /// File size in bytes.
        total: u64,
    },
    /// The whole file was queued.
    TransferCompleted {
        /// Bytes queued.
        bytes: u64,
    },
    /// The upload was stopped before the end of the file.
    TransferCancelled,
    /// The device went away; the session should be disconnected.
    LinkLost,
    /// An operation failed.
    OperationFailed {
        /// Flat classification.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// The engine moved to a new state.
    StateChanged(EngineState),
}

impl EngineEvent {
    /// Build an [`EngineEvent::OperationFailed`] from any error.
    pub fn failed(kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self::OperationFailed {
            kind,
            message: message.to_string(),
        }
    }
}

/// Receiver of engine events. Called from worker threads.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block for long.
    fn emit(&self, event: EngineEvent);
}

impl EventSink for mpsc::Sender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::SyncSender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        let _ = self.send(event);
    }
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}
