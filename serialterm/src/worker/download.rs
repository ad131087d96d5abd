//! Polled reads: device → presentation queue.

use {
    crate::{
        port::Port,
        queue::{Marker, QueueItem, TransferQueue},
        signal::StopSignal,
    },
    log::{debug, error, trace, warn},
    std::{io, sync::Arc},
};

/// Read failures that are just an idle poll.
fn is_idle(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Read failures after which the handle is no longer usable.
fn is_fatal(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::PermissionDenied
    )
}

/// Reads the device with a short timeout and forwards whatever arrives.
pub struct DownloadWorker {
    /// Reader endpoint; its timeout is the poll interval.
    pub reader: Box<dyn Port>,
    /// Destination for received bytes and the `LinkLost` marker.
    pub presentation: Arc<TransferQueue<QueueItem>>,
    /// Optional mirror of received bytes.
    pub inbound: Option<Arc<TransferQueue<QueueItem>>>,
    /// Read buffer size.
    pub buffer_size: usize,
    /// Consecutive transient failures tolerated before giving up.
    pub retry_budget: u32,
    /// Cancellation signal.
    pub stop: StopSignal,
}

impl DownloadWorker {
    /// Run until stopped or until the link is lost.
    pub fn run(mut self) {
        let mut buf = vec![0u8; self.buffer_size.max(1)];
        let mut failures = 0u32;

        while !self.stop.is_raised() {
            match self.reader.read(&mut buf) {
                Ok(0) => failures = 0,
                Ok(n) => {
                    failures = 0;
                    trace!("Received {n} bytes");
                    // The queues may already belong to the next session
                    if self.stop.is_raised() {
                        debug!("Dropping {n} bytes read after stop");
                        break;
                    }
                    if !self.forward(&buf[..n]) {
                        debug!("Presentation queue closed; download stopping");
                        return;
                    }
                },
                Err(e) if is_idle(e.kind()) => failures = 0,
                Err(e) if is_fatal(e.kind()) => {
                    if !self.stop.is_raised() {
                        warn!("Link to {} lost: {e}", self.reader.name());
                        self.link_lost();
                    }
                    return;
                },
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Read from {} failed ({failures}/{}): {e}",
                        self.reader.name(),
                        self.retry_budget
                    );
                    if failures >= self.retry_budget {
                        error!(
                            "Giving up on {} after {failures} consecutive read failures",
                            self.reader.name()
                        );
                        self.link_lost();
                        return;
                    }
                },
            }
        }
        debug!("Download worker stopped");
    }

    fn forward(&self, bytes: &[u8]) -> bool {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.push(QueueItem::Data(bytes.to_vec()));
        }
        self.presentation
            .push(QueueItem::Data(bytes.to_vec()))
            .is_ok()
    }

    fn link_lost(&self) {
        let _ = self
            .presentation
            .push(QueueItem::Marker(Marker::LinkLost));
    }
}
