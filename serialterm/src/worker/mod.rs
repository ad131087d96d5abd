//! Supervised worker threads.
//!
//! Every worker runs on its own OS thread and owns a clone of a
//! [`StopSignal`]. The supervisor raises the signal, then waits a bounded
//! time for the thread to finish. A thread that overruns the bound is
//! detached, never killed; the worker bodies poll their signal at every
//! blocking boundary so this only happens when a device call itself hangs.

mod download;
mod presentation;
mod transmit;
mod upload;

pub use {
    download::DownloadWorker, presentation::PresentationWorker, transmit::TransmitWorker,
    upload::UploadWorker,
};

use {
    crate::signal::StopSignal,
    log::{debug, error, warn},
    std::{
        io,
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

const JOIN_POLL: Duration = Duration::from_millis(5);

/// A running worker thread plus its stop signal.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` on a named thread.
    pub fn spawn<F>(name: &'static str, stop: StopSignal, body: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = thread::Builder::new()
            .name(format!("serialterm-{name}"))
            .spawn(body)?;
        debug!("Started {name} worker");
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    /// Worker name, as used in log messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the worker to stop. Does not wait.
    pub fn signal(&self) {
        self.stop.raise();
    }

    /// Whether the thread has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread to finish.
    ///
    /// Returns `true` if it finished (cleanly or by panicking) and `false` if
    /// it was detached.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;

        while !thread.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} worker did not stop within {timeout:?}; detaching it",
                    self.name
                );
                return false;
            }
            thread::sleep(JOIN_POLL.min(deadline - now));
        }

        if thread.join().is_err() {
            error!("{} worker panicked", self.name);
        } else {
            debug!("Joined {} worker", self.name);
        }
        true
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Dropping an unjoined handle detaches the thread; make sure it
            // at least knows it should wind down
            self.stop.raise();
        }
    }
}
