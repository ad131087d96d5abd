//! File upload: file → outbound queue.

use {
    crate::{
        error::{ErrorKind, TransferError},
        event::{EngineEvent, EventSink},
        queue::{Marker, QueueItem, TransferQueue},
        signal::StopSignal,
    },
    log::{debug, info, trace, warn},
    std::{
        fs::File,
        io::{self, Read},
        path::PathBuf,
        sync::Arc,
        time::Duration,
    },
};

/// Reads a file in fixed-size chunks and queues them for transmission.
pub struct UploadWorker {
    /// File to upload.
    pub path: PathBuf,
    /// Bytes per queued chunk.
    pub chunk_size: usize,
    /// Maximum queued items before the worker waits.
    pub backlog: usize,
    /// How long a single backpressure wait lasts before the stop signal is
    /// re-checked.
    pub poll_interval: Duration,
    /// Destination queue.
    pub outbound: Arc<TransferQueue<QueueItem>>,
    /// Event destination.
    pub events: Arc<dyn EventSink>,
    /// Cancellation signal.
    pub stop: StopSignal,
}

enum Outcome {
    Completed(u64),
    Cancelled,
    QueueClosed,
    ReadFailed(io::Error),
}

/// Fill `buf` as far as the reader allows. Returns the byte count (0 at EOF).
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl UploadWorker {
    /// Run to completion, cancellation or failure.
    pub fn run(self) {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(source) => {
                let err = TransferError::FileError {
                    path: self.path.clone(),
                    source,
                };
                warn!("{err}");
                self.events.emit(EngineEvent::failed(err.kind(), &err));
                return;
            },
        };
        let total = file.metadata().map_or(0, |m| m.len());
        info!("Uploading {} ({total} bytes)", self.path.display());
        self.events.emit(EngineEvent::TransferStarted {
            path: self.path.clone(),
            total,
        });

        match self.pump(&mut file, total) {
            Outcome::Completed(bytes) => {
                // The marker is what tells a consumer the stream is whole;
                // if the queue closed underneath us there is nobody to tell
                if self
                    .outbound
                    .push(QueueItem::Marker(Marker::TransferComplete { bytes }))
                    .is_ok()
                {
                    info!("Upload of {} queued ({bytes} bytes)", self.path.display());
                    self.events.emit(EngineEvent::TransferCompleted { bytes });
                }
            },
            Outcome::Cancelled => {
                info!("Upload of {} cancelled", self.path.display());
                let _ = self
                    .outbound
                    .push(QueueItem::Marker(Marker::TransferCancelled));
                self.events.emit(EngineEvent::TransferCancelled);
            },
            Outcome::QueueClosed => {
                debug!("Outbound queue closed during upload; stopping");
            },
            Outcome::ReadFailed(source) => {
                let err = TransferError::FileError {
                    path: self.path.clone(),
                    source,
                };
                warn!("{err}");
                let _ = self
                    .outbound
                    .push(QueueItem::Marker(Marker::Failed(ErrorKind::FileError)));
                self.events.emit(EngineEvent::failed(err.kind(), &err));
            },
        }
    }

    fn pump(&self, file: &mut impl Read, total: u64) -> Outcome {
        let mut buf = vec![0u8; self.chunk_size.max(1)];
        let mut sent = 0u64;

        loop {
            if self.stop.is_raised() {
                return Outcome::Cancelled;
            }
            if !self.outbound.wait_for_room(self.backlog, self.poll_interval) {
                if self.stop.is_raised() {
                    return Outcome::Cancelled;
                }
                if self.outbound.is_closed() {
                    return Outcome::QueueClosed;
                }
                continue;
            }

            let n = match read_chunk(file, &mut buf) {
                Ok(0) => return Outcome::Completed(sent),
                Ok(n) => n,
                Err(e) => return Outcome::ReadFailed(e),
            };
            if self.outbound.push(QueueItem::Data(buf[..n].to_vec())).is_err() {
                // A stop and a close can race; the stop decides
                return if self.stop.is_raised() {
                    Outcome::Cancelled
                } else {
                    Outcome::QueueClosed
                };
            }
            sent += n as u64;
            trace!("Queued {n} bytes ({sent}/{total})");
            self.events.emit(EngineEvent::TransferProgress { sent, total });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;

    fn worker(
        path: PathBuf,
        chunk_size: usize,
        backlog: usize,
    ) -> (UploadWorker, Arc<TransferQueue<QueueItem>>, mpsc::Receiver<EngineEvent>) {
        let outbound = Arc::new(TransferQueue::new());
        let (tx, rx) = mpsc::channel();
        let worker = UploadWorker {
            path,
            chunk_size,
            backlog,
            poll_interval: Duration::from_millis(5),
            outbound: Arc::clone(&outbound),
            events: Arc::new(tx),
            stop: StopSignal::new(),
        };
        (worker, outbound, rx)
    }

    fn file_with(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_chunks_then_complete_marker() {
        let file = file_with(250);
        let (worker, outbound, rx) = worker(file.path().to_path_buf(), 100, 64);
        worker.run();

        let items = outbound.drain();
        let sizes: Vec<usize> = items
            .iter()
            .filter_map(|item| match item {
                QueueItem::Data(bytes) => Some(bytes.len()),
                QueueItem::Marker(_) => None,
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(
            items.last().and_then(QueueItem::marker),
            Some(Marker::TransferComplete { bytes: 250 })
        );

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            events.first(),
            Some(EngineEvent::TransferStarted { total: 250, .. })
        ));
        assert_eq!(
            events.last(),
            Some(&EngineEvent::TransferCompleted { bytes: 250 })
        );
    }

    #[test]
    fn test_empty_file_completes_without_data() {
        let file = file_with(0);
        let (worker, outbound, _rx) = worker(file.path().to_path_buf(), 16, 4);
        worker.run();
        assert_eq!(
            outbound.drain(),
            vec![QueueItem::Marker(Marker::TransferComplete { bytes: 0 })]
        );
    }

    #[test]
    fn test_missing_file_reports_file_error_and_leaves_queue_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, outbound, rx) = worker(dir.path().join("absent.bin"), 16, 4);
        worker.run();

        assert!(outbound.is_empty());
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            EngineEvent::OperationFailed {
                kind: ErrorKind::FileError,
                ..
            }
        ));
    }

    #[test]
    fn test_stop_before_start_cancels_once() {
        let file = file_with(64);
        let (worker, outbound, rx) = worker(file.path().to_path_buf(), 16, 4);
        worker.stop.raise();
        worker.run();

        assert_eq!(
            outbound.drain(),
            vec![QueueItem::Marker(Marker::TransferCancelled)]
        );
        assert!(rx.try_iter().any(|e| e == EngineEvent::TransferCancelled));
    }

    #[test]
    fn test_closed_queue_stops_quietly() {
        let file = file_with(64);
        let (worker, outbound, rx) = worker(file.path().to_path_buf(), 16, 4);
        outbound.close();
        worker.run();

        assert!(outbound.is_empty());
        assert!(
            !rx.try_iter()
                .any(|e| matches!(e, EngineEvent::TransferCompleted { .. }))
        );
    }

    /// Raises the stop and closes the queue while a chunk is being read,
    /// the window a disconnect hits between the stop check and the push.
    struct StopDuringRead {
        stop: StopSignal,
        outbound: Arc<TransferQueue<QueueItem>>,
    }

    impl Read for StopDuringRead {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.stop.raise();
            self.outbound.close();
            buf.fill(b'z');
            Ok(buf.len())
        }
    }

    #[test]
    fn test_stop_racing_queue_close_still_cancels() {
        let file = file_with(0);
        let (worker, outbound, _rx) = worker(file.path().to_path_buf(), 8, 4);
        let mut reader = StopDuringRead {
            stop: worker.stop.clone(),
            outbound: Arc::clone(&outbound),
        };
        assert!(matches!(worker.pump(&mut reader, 8), Outcome::Cancelled));
    }
}
