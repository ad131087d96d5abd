//! Presentation queue → UI events and the session log.

use {
    crate::{
        error::ErrorKind,
        event::{EngineEvent, EventSink},
        queue::{Marker, QueueItem, TransferQueue},
        session_log::LogSink,
    },
    log::{debug, warn},
    std::{sync::Arc, time::Duration},
};

/// Event shown to the UI for a control marker.
pub(crate) fn marker_event(marker: Marker) -> EngineEvent {
    match marker {
        Marker::TransferComplete { bytes } => EngineEvent::TransferCompleted { bytes },
        Marker::TransferCancelled => EngineEvent::TransferCancelled,
        Marker::LinkLost => EngineEvent::LinkLost,
        Marker::Failed(kind) => EngineEvent::failed(kind, "worker stopped on error"),
    }
}

/// Drains the presentation queue in order.
///
/// Runs until the queue is closed and empty, so nothing enqueued before
/// `close` is lost. There is no stop signal: closing the queue is the stop.
pub struct PresentationWorker {
    /// Source queue.
    pub queue: Arc<TransferQueue<QueueItem>>,
    /// Event destination.
    pub events: Arc<dyn EventSink>,
    /// Session log; closed when the worker exits.
    pub log: LogSink,
    /// Wait per pop before re-checking for close.
    pub poll_interval: Duration,
}

impl PresentationWorker {
    /// Run until the queue is closed and drained.
    pub fn run(mut self) {
        loop {
            match self.queue.pop_wait(self.poll_interval) {
                Some(QueueItem::Data(bytes)) => {
                    self.record(&bytes);
                    self.events.emit(EngineEvent::ByteReceived(bytes));
                },
                Some(QueueItem::Marker(marker)) => {
                    debug!("Presenting {marker:?}");
                    self.events.emit(marker_event(marker));
                },
                None if self.queue.is_closed() && self.queue.is_empty() => break,
                None => {},
            }
        }
        self.log.close();
        debug!("Presentation worker stopped");
    }

    fn record(&mut self, bytes: &[u8]) {
        if let Err(e) = self.log.append(bytes) {
            warn!("Session log disabled: {e}");
            self.log.disable();
            self.events.emit(EngineEvent::failed(
                ErrorKind::Io,
                format!("session log write failed, logging disabled: {e}"),
            ));
        }
    }
}
