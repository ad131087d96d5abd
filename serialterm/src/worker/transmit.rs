//! Outbound queue → device.

use {
    crate::{
        error::ErrorKind,
        event::{EngineEvent, EventSink},
        port::Port,
        queue::{QueueItem, TransferQueue},
        signal::StopSignal,
    },
    log::{debug, error, trace},
    std::{io, sync::Arc, time::Duration},
};

/// Relays queued bytes to the writer endpoint.
///
/// Markers are consumed: the wire carries raw bytes only.
pub struct TransmitWorker {
    /// Writer endpoint.
    pub writer: Box<dyn Port>,
    /// Source queue.
    pub outbound: Arc<TransferQueue<QueueItem>>,
    /// Event destination.
    pub events: Arc<dyn EventSink>,
    /// Wait per pop before re-checking the stop signal.
    pub poll_interval: Duration,
    /// Cancellation signal.
    pub stop: StopSignal,
}

impl TransmitWorker {
    /// Run until stopped, the queue closes, or a write fails.
    pub fn run(mut self) {
        while !self.stop.is_raised() {
            let Some(item) = self.outbound.claim_wait(self.poll_interval) else {
                if self.outbound.is_closed() {
                    break;
                }
                continue;
            };
            let written = match item {
                QueueItem::Data(bytes) => self.write_chunk(&bytes),
                QueueItem::Marker(marker) => {
                    trace!("Consumed {marker:?}");
                    Ok(())
                },
            };
            self.outbound.release();

            if let Err(e) = written {
                error!("Write to {} failed: {e}", self.writer.name());
                self.events.emit(EngineEvent::failed(
                    ErrorKind::Io,
                    format!("write to {} failed: {e}", self.writer.name()),
                ));
                return;
            }
        }
        debug!("Transmit worker stopped");
    }

    /// Write one chunk, retrying timeouts until it is out or the worker is
    /// stopped. A stop mid-chunk abandons the rest of it.
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            if self.stop.is_raised() {
                debug!("Stopped with {} bytes unsent", bytes.len() - offset);
                return Ok(());
            }
            match self.writer.write(&bytes[offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => offset += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    trace!("Write timed out; retrying");
                },
                Err(e) => return Err(e),
            }
        }
        trace!("Sent {} bytes", bytes.len());
        self.writer.flush()
    }
}
