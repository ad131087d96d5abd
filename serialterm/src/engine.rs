//! The engine supervisor.
//!
//! [`Engine`] is the only component that starts or stops workers or touches
//! the active port. It owns the [`PortManager`], the three hand-off queues and
//! one [`WorkerHandle`] per worker kind; nothing is global.
//!
//! ```text
//!  Command ──► Engine ──► PortManager (open / configure / switch / close)
//!                │
//!                ├─► UploadWorker ──► outbound ──► TransmitWorker ──► device
//!                │
//!  device ──► DownloadWorker ──► presentation ──► PresentationWorker ──► EventSink
//!                                       (inbound mirror)               └► LogSink
//! ```
//!
//! State machine:
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`.
//! Reconfiguring or switching is only allowed while Disconnected; workers hold
//! lent endpoints while Connected and the port cannot change underneath them.

use {
    crate::{
        error::{Error, PortError, Result},
        event::{EngineEvent, EngineState, EventSink},
        port::{PortIdentity, PortInfo, PortManager, PortOpener, SerialSettings, SystemOpener},
        queue::{QueueItem, TransferQueue},
        session_log::LogSink,
        signal::StopSignal,
        worker::{DownloadWorker, PresentationWorker, TransmitWorker, UploadWorker, WorkerHandle},
    },
    log::{debug, info, warn},
    std::{
        path::PathBuf,
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bytes per upload chunk.
    pub chunk_size: usize,
    /// Outbound items an upload may have queued before it waits.
    pub upload_backlog: usize,
    /// Read timeout of the download worker and wait granularity of the others.
    pub poll_interval: Duration,
    /// Bound on waiting for a worker to acknowledge a stop.
    pub join_timeout: Duration,
    /// Download read buffer size.
    pub read_buffer_size: usize,
    /// Consecutive transient read failures before the link counts as lost.
    pub read_retry_budget: u32,
    /// Directory for session logs. `None` disables logging.
    pub log_dir: Option<PathBuf>,
    /// Relay the outbound queue to the device.
    pub relay_outbound: bool,
    /// Mirror received bytes onto the inbound queue.
    pub mirror_inbound: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            upload_backlog: 64,
            poll_interval: Duration::from_millis(50),
            join_timeout: Duration::from_secs(2),
            read_buffer_size: 1024,
            read_retry_budget: 5,
            log_dir: None,
            relay_outbound: true,
            mirror_inbound: false,
        }
    }
}

impl EngineConfig {
    /// Reject values the workers cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |what: &str| Err(Error::Config(format!("{what} must be non-zero")));
        if self.chunk_size == 0 {
            return fail("chunk_size");
        }
        if self.upload_backlog == 0 {
            return fail("upload_backlog");
        }
        if self.poll_interval.is_zero() {
            return fail("poll_interval");
        }
        if self.read_buffer_size == 0 {
            return fail("read_buffer_size");
        }
        if self.read_retry_budget == 0 {
            return fail("read_retry_budget");
        }
        Ok(())
    }
}

/// Requests the UI layer can make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the port and start the workers.
    Connect(PortIdentity),
    /// Stop the workers and close the port.
    Disconnect,
    /// Replace the open port (Disconnected only).
    SwitchPort(PortIdentity),
    /// Change line settings (Disconnected only).
    Configure(SerialSettings),
    /// Upload a file.
    SendFile(PathBuf),
    /// Queue raw bytes, typically keystrokes.
    SendBytes(Vec<u8>),
    /// Stop the running upload.
    CancelTransfer,
    /// Tear everything down for good.
    Shutdown,
}

#[derive(Default)]
struct Workers {
    presentation: Option<WorkerHandle>,
    download: Option<WorkerHandle>,
    transmit: Option<WorkerHandle>,
    upload: Option<WorkerHandle>,
}

/// Serial terminal engine.
pub struct Engine {
    config: EngineConfig,
    ports: PortManager,
    events: Arc<dyn EventSink>,
    state: EngineState,
    outbound: Arc<TransferQueue<QueueItem>>,
    inbound: Arc<TransferQueue<QueueItem>>,
    presentation: Arc<TransferQueue<QueueItem>>,
    workers: Workers,
    shut_down: bool,
}

impl Engine {
    /// Create an engine over the given port backend.
    pub fn new(
        opener: Arc<dyn PortOpener>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ports: PortManager::new(opener),
            events,
            state: EngineState::Disconnected,
            outbound: Arc::new(TransferQueue::new()),
            inbound: Arc::new(TransferQueue::new()),
            presentation: Arc::new(TransferQueue::new()),
            workers: Workers::default(),
            shut_down: false,
        })
    }

    /// Create an engine over native ports plus auto-created `loop://` devices.
    pub fn with_system_ports(events: Arc<dyn EventSink>, config: EngineConfig) -> Result<Self> {
        Self::new(Arc::new(SystemOpener::default()), events, config)
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Active tunables.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The port manager (read-only).
    pub fn ports(&self) -> &PortManager {
        &self.ports
    }

    /// Identity of the open port, if any.
    pub fn current_port(&self) -> Option<&PortIdentity> {
        self.ports.handle().map(|h| h.identity())
    }

    /// Ports visible to the backend.
    pub fn list_ports(&self) -> Vec<PortInfo> {
        self.ports.opener().list_ports()
    }

    /// Outbound queue (upload and keystroke bytes toward the device).
    pub fn outbound(&self) -> &Arc<TransferQueue<QueueItem>> {
        &self.outbound
    }

    /// Whether everything queued toward the device has been written,
    /// including a chunk the relay is still pushing out.
    pub fn is_outbound_drained(&self) -> bool {
        self.outbound.is_settled()
    }

    /// Inbound mirror of received bytes.
    pub fn inbound(&self) -> &Arc<TransferQueue<QueueItem>> {
        &self.inbound
    }

    /// Presentation queue (received bytes and markers toward the UI).
    pub fn presentation(&self) -> &Arc<TransferQueue<QueueItem>> {
        &self.presentation
    }

    /// Whether an upload worker is still running.
    pub fn is_uploading(&self) -> bool {
        self.workers
            .upload
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Whether the engine has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!("Engine {} -> {state}", self.state);
            self.state = state;
            self.events.emit(EngineEvent::StateChanged(state));
        }
    }

    /// Report a failed command to the UI and hand it back to the caller.
    fn fail<T>(&self, err: Error) -> Result<T> {
        self.events.emit(EngineEvent::failed(err.kind(), &err));
        Err(err)
    }

    fn require(&self, state: EngineState, operation: &str) -> Result<()> {
        if self.shut_down {
            return self.fail(PortError::busy("engine has been shut down").into());
        }
        if self.state != state {
            return self.fail(
                PortError::busy(format!("cannot {operation} while {}", self.state)).into(),
            );
        }
        Ok(())
    }

    /// Dispatch one command.
    pub fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Connect(identity) => self.connect(&identity),
            Command::Disconnect => self.disconnect(),
            Command::SwitchPort(identity) => self.switch_port(&identity),
            Command::Configure(settings) => self.configure(&settings),
            Command::SendFile(path) => self.send_file(path),
            Command::SendBytes(bytes) => self.send_bytes(&bytes),
            Command::CancelTransfer => {
                self.cancel_transfer();
                Ok(())
            },
            Command::Shutdown => {
                self.shutdown();
                Ok(())
            },
        }
    }

    /// Open `identity` and start the session workers.
    ///
    /// A port left open by [`Engine::switch_port`] is reused when the names
    /// match; its settings are brought in line with `identity`.
    pub fn connect(&mut self, identity: &PortIdentity) -> Result<()> {
        self.require(EngineState::Disconnected, "connect")?;
        self.set_state(EngineState::Connecting);

        match self.start_session(identity) {
            Ok(()) => {
                info!("Connected to {} at {}", identity.name, identity.settings);
                self.set_state(EngineState::Connected);
                Ok(())
            },
            Err(e) => {
                warn!("Connect to {} failed: {e}", identity.name);
                let joined = self.stop_workers();
                self.reset_queues();
                self.release_port(joined);
                self.set_state(EngineState::Disconnected);
                self.fail(e)
            },
        }
    }

    fn start_session(&mut self, identity: &PortIdentity) -> Result<()> {
        if self.ports.is_open_on(&identity.name) {
            debug!("Reusing open handle on {}", identity.name);
            self.ports.configure(&identity.settings)?;
        } else {
            self.ports.open(identity)?;
        }

        let log = match &self.config.log_dir {
            Some(dir) => LogSink::open(dir, &identity.name)?,
            None => LogSink::disabled(),
        };
        let lease = self.ports.lend(self.config.poll_interval)?;

        let presentation = PresentationWorker {
            queue: Arc::clone(&self.presentation),
            events: Arc::clone(&self.events),
            log,
            poll_interval: self.config.poll_interval,
        };
        self.workers.presentation = Some(WorkerHandle::spawn(
            "presentation",
            StopSignal::new(),
            move || presentation.run(),
        )?);

        let stop = StopSignal::new();
        let download = DownloadWorker {
            reader: lease.reader,
            presentation: Arc::clone(&self.presentation),
            inbound: self
                .config
                .mirror_inbound
                .then(|| Arc::clone(&self.inbound)),
            buffer_size: self.config.read_buffer_size,
            retry_budget: self.config.read_retry_budget,
            stop: stop.clone(),
        };
        self.workers.download = Some(WorkerHandle::spawn("download", stop, move || {
            download.run();
        })?);

        if self.config.relay_outbound {
            let stop = StopSignal::new();
            let transmit = TransmitWorker {
                writer: lease.writer,
                outbound: Arc::clone(&self.outbound),
                events: Arc::clone(&self.events),
                poll_interval: self.config.poll_interval,
                stop: stop.clone(),
            };
            self.workers.transmit = Some(WorkerHandle::spawn("transmit", stop, move || {
                transmit.run();
            })?);
        }
        Ok(())
    }

    /// Start uploading `path`. Only one upload runs at a time.
    pub fn send_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.require(EngineState::Connected, "send a file")?;
        if self.is_uploading() {
            return self.fail(PortError::busy("an upload is already running").into());
        }
        if let Some(finished) = self.workers.upload.take() {
            finished.join_timeout(self.config.join_timeout);
        }

        let stop = StopSignal::new();
        let upload = UploadWorker {
            path: path.into(),
            chunk_size: self.config.chunk_size,
            backlog: self.config.upload_backlog,
            poll_interval: self.config.poll_interval,
            outbound: Arc::clone(&self.outbound),
            events: Arc::clone(&self.events),
            stop: stop.clone(),
        };
        match WorkerHandle::spawn("upload", stop, move || upload.run()) {
            Ok(handle) => {
                self.workers.upload = Some(handle);
                Ok(())
            },
            Err(e) => self.fail(e.into()),
        }
    }

    /// Queue raw bytes for the device.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.require(EngineState::Connected, "send bytes")?;
        if bytes.is_empty() {
            return Ok(());
        }
        match self.outbound.push(QueueItem::Data(bytes.to_vec())) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Ask the running upload to stop. Returns whether there was one.
    pub fn cancel_transfer(&mut self) -> bool {
        match &self.workers.upload {
            Some(handle) if !handle.is_finished() => {
                debug!("Cancelling upload");
                handle.signal();
                true
            },
            _ => false,
        }
    }

    /// Purge and close the open port and open `identity` instead.
    pub fn switch_port(&mut self, identity: &PortIdentity) -> Result<()> {
        self.require(EngineState::Disconnected, "switch ports")?;
        match self.ports.switch(identity) {
            Ok(_) => Ok(()),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Change the line settings of the open port, or just validate them when
    /// no port is open.
    pub fn configure(&mut self, settings: &SerialSettings) -> Result<()> {
        self.require(EngineState::Disconnected, "reconfigure the port")?;
        match self.ports.configure(settings) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Stop every worker and close the port. A no-op unless Connected.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state != EngineState::Connected {
            return Ok(());
        }
        self.set_state(EngineState::Disconnecting);
        let joined = self.stop_workers();
        self.reset_queues();
        self.release_port(joined);
        info!("Disconnected");
        self.set_state(EngineState::Disconnected);
        Ok(())
    }

    /// Disconnect if the download worker has exited on its own.
    ///
    /// Returns whether a disconnect happened.
    pub fn check_link(&mut self) -> bool {
        if self.state != EngineState::Connected {
            return false;
        }
        let exited = self
            .workers
            .download
            .as_ref()
            .is_some_and(WorkerHandle::is_finished);
        if !exited {
            return false;
        }
        warn!("Download worker exited; disconnecting");
        // disconnect never fails once Connected
        let _ = self.disconnect();
        true
    }

    /// Tear everything down. Safe to call repeatedly; runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        if self.state == EngineState::Connected {
            let _ = self.disconnect();
        }
        self.ports.close();
        self.outbound.close();
        self.inbound.close();
        self.presentation.close();
        self.shut_down = true;
        info!("Engine shut down");
    }

    /// Signal, then join with a bound. The upload goes first, while outbound
    /// is still open for its terminal marker. Then the reader and the relay,
    /// and the presentation worker last so it can drain what they queued.
    ///
    /// Returns whether every worker was joined, in which case the lent
    /// endpoints are known to be gone.
    fn stop_workers(&mut self) -> bool {
        let deadline = Instant::now() + self.config.join_timeout;
        let upload = self.workers.upload.take();
        let others = [self.workers.download.take(), self.workers.transmit.take()];
        for handle in upload.iter().chain(others.iter().flatten()) {
            debug!("Stopping {} worker", handle.name());
            handle.signal();
        }

        // The upload queues its cancel marker before outbound closes
        let mut joined = true;
        if let Some(handle) = upload {
            joined &= handle.join_timeout(self.config.join_timeout);
        }

        // Wake anything parked on the outbound queue
        self.outbound.close();
        self.inbound.close();

        for handle in others.into_iter().flatten() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            joined &= handle.join_timeout(remaining);
        }

        self.presentation.close();
        if let Some(handle) = self.workers.presentation.take() {
            // The session log closes when the worker exits
            joined &= handle.join_timeout(self.config.join_timeout);
        }
        joined
    }

    fn reset_queues(&self) {
        for queue in [&self.outbound, &self.inbound, &self.presentation] {
            queue.clear();
            queue.reopen();
        }
    }

    fn release_port(&mut self, workers_joined: bool) {
        if workers_joined {
            self.ports.reclaim();
        }
        self.ports.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
