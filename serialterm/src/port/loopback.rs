//! In-memory loopback device.
//!
//! A loopback port behaves like a serial device whose TX line is wired to its
//! RX line: written bytes can be read back. The [`LoopbackController`] side
//! lets a harness script what the "device" sends, inject timeouts and errors,
//! stall writes, or pull the plug, which is how the engine is exercised
//! without hardware.

use {
    crate::{
        error::PortError,
        port::{Port, PortIdentity, PortOpener, SerialSettings},
    },
    log::{debug, trace},
    std::{
        collections::{HashMap, VecDeque},
        io::{self, Read, Write},
        sync::{Arc, Condvar, Mutex, MutexGuard},
        time::{Duration, Instant},
    },
};

/// One scripted outcome for a read call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// Bytes arriving from the device.
    Data(Vec<u8>),
    /// A read that completes with zero bytes.
    Empty,
    /// A read that times out.
    Timeout,
    /// A read that fails with the given error kind.
    Error(io::ErrorKind),
}

#[derive(Debug, Default)]
struct DeviceState {
    rx: VecDeque<ReadEvent>,
    written: Vec<u8>,
    claimed: bool,
    echo: bool,
    unplugged: bool,
    stall_writes: bool,
    reject_settings: bool,
    settings: Option<SerialSettings>,
    purges: usize,
    opens: usize,
}

#[derive(Debug, Default)]
struct Device {
    state: Mutex<DeviceState>,
    readable: Condvar,
}

impl Device {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not wedge every other endpoint
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Releases the device claim once every endpoint of an open port is gone.
#[derive(Debug)]
struct Claim {
    device: Arc<Device>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.device.lock().claimed = false;
    }
}

/// Registry of loopback devices, usable as a [`PortOpener`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackOpener {
    devices: Arc<Mutex<HashMap<String, Arc<Device>>>>,
    auto_create: bool,
}

impl LoopbackOpener {
    /// A registry that only opens devices created through [`Self::create`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that creates an echoing device on first open of an unknown name.
    pub fn auto_creating() -> Self {
        Self {
            auto_create: true,
            ..Self::default()
        }
    }

    /// Register a device under `name` and return its controller.
    ///
    /// Registering an existing name returns a controller for the same device.
    pub fn create(&self, name: impl Into<String>) -> LoopbackController {
        let name = name.into();
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let device = devices
            .entry(name)
            .or_default()
            .clone();
        LoopbackController { device }
    }

    /// Controller for an already registered device.
    pub fn controller(&self, name: &str) -> Option<LoopbackController> {
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .map(|device| LoopbackController {
                device: Arc::clone(device),
            })
    }

    fn lookup(&self, name: &str) -> Option<Arc<Device>> {
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(device) = devices.get(name) {
            return Some(Arc::clone(device));
        }
        if !self.auto_create {
            return None;
        }
        debug!("Creating loopback device {name}");
        let device = Arc::new(Device::default());
        device.lock().echo = true;
        devices.insert(name.to_string(), Arc::clone(&device));
        Some(device)
    }
}

impl PortOpener for LoopbackOpener {
    fn open(&self, identity: &PortIdentity) -> Result<Box<dyn Port>, PortError> {
        let device = self
            .lookup(&identity.name)
            .ok_or_else(|| PortError::NotFound {
                port: identity.name.clone(),
            })?;

        identity.settings.validate(&identity.name)?;

        {
            let mut state = device.lock();
            if state.unplugged {
                return Err(PortError::NotFound {
                    port: identity.name.clone(),
                });
            }
            if state.claimed {
                return Err(PortError::AccessDenied {
                    port: identity.name.clone(),
                    reason: "device is already open".into(),
                });
            }
            if state.reject_settings {
                return Err(PortError::ConfigRejected {
                    port: identity.name.clone(),
                    reason: format!("device refuses {}", identity.settings),
                });
            }
            state.claimed = true;
            state.opens += 1;
            state.settings = Some(identity.settings.clone());
        }

        debug!("Opened loopback {} at {}", identity.name, identity.settings);
        Ok(Box::new(LoopbackPort {
            claim: Arc::new(Claim {
                device: Arc::clone(&device),
            }),
            device,
            name: identity.name.clone(),
            timeout: identity.settings.timeout,
        }))
    }

    fn list_ports(&self) -> Vec<crate::port::PortInfo> {
        let devices = self
            .devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<_> = devices.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| crate::port::PortInfo {
                name,
                vid: None,
                pid: None,
                manufacturer: None,
                product: Some("loopback".into()),
            })
            .collect()
    }
}

/// Harness-side handle to a loopback device.
#[derive(Debug, Clone)]
pub struct LoopbackController {
    device: Arc<Device>,
}

impl LoopbackController {
    /// Queue bytes for the port to read.
    pub fn push_read(&self, bytes: impl Into<Vec<u8>>) {
        self.push_event(ReadEvent::Data(bytes.into()));
    }

    /// Queue an arbitrary read outcome.
    pub fn push_event(&self, event: ReadEvent) {
        self.device.lock().rx.push_back(event);
        self.device.readable.notify_all();
    }

    /// Echo written bytes back to the read side.
    pub fn set_echo(&self, echo: bool) {
        self.device.lock().echo = echo;
    }

    /// Make writes block for the full timeout and then fail, like a device
    /// holding off flow control forever.
    pub fn set_stall_writes(&self, stall: bool) {
        self.device.lock().stall_writes = stall;
    }

    /// Refuse any settings on the next open or reconfigure.
    pub fn set_reject_settings(&self, reject: bool) {
        self.device.lock().reject_settings = reject;
    }

    /// Simulate the device disappearing. Open endpoints start failing.
    pub fn unplug(&self) {
        self.device.lock().unplugged = true;
        self.device.readable.notify_all();
    }

    /// Bring an unplugged device back.
    pub fn replug(&self) {
        self.device.lock().unplugged = false;
    }

    /// Take everything written to the device so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.device.lock().written)
    }

    /// Number of bytes written and not yet taken.
    pub fn written_len(&self) -> usize {
        self.device.lock().written.len()
    }

    /// Whether some open endpoint currently holds the device.
    pub fn is_claimed(&self) -> bool {
        self.device.lock().claimed
    }

    /// How many times the device buffers were purged.
    pub fn purge_count(&self) -> usize {
        self.device.lock().purges
    }

    /// How many times the device was opened.
    pub fn open_count(&self) -> usize {
        self.device.lock().opens
    }

    /// Settings currently applied to the device.
    pub fn settings(&self) -> Option<SerialSettings> {
        self.device.lock().settings.clone()
    }

    /// Scripted reads not yet consumed.
    pub fn pending_reads(&self) -> usize {
        self.device.lock().rx.len()
    }
}

/// An open endpoint on a loopback device.
pub struct LoopbackPort {
    device: Arc<Device>,
    claim: Arc<Claim>,
    name: String,
    timeout: Duration,
}

fn unplugged_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "loopback device unplugged")
}

impl Port for LoopbackPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn apply_settings(&mut self, settings: &SerialSettings) -> io::Result<()> {
        let mut state = self.device.lock();
        if state.reject_settings {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device refuses {settings}"),
            ));
        }
        state.settings = Some(settings.clone());
        drop(state);
        self.timeout = settings.timeout;
        Ok(())
    }

    fn purge(&mut self) -> io::Result<()> {
        let mut state = self.device.lock();
        state.rx.clear();
        state.purges += 1;
        Ok(())
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn Port>> {
        Ok(Box::new(Self {
            device: Arc::clone(&self.device),
            claim: Arc::clone(&self.claim),
            name: self.name.clone(),
            timeout: self.timeout,
        }))
    }
}

impl Read for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.device.lock();

        loop {
            if state.unplugged {
                return Err(unplugged_error());
            }
            if let Some(event) = state.rx.pop_front() {
                return match event {
                    ReadEvent::Data(mut bytes) => {
                        let n = bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                        if n < bytes.len() {
                            state.rx.push_front(ReadEvent::Data(bytes.split_off(n)));
                        }
                        trace!("loopback read {n} bytes");
                        Ok(n)
                    },
                    ReadEvent::Empty => Ok(0),
                    ReadEvent::Timeout => {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"))
                    },
                    ReadEvent::Error(kind) => Err(io::Error::new(kind, "scripted read error")),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
            state = self
                .device
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }
}

impl Write for LoopbackPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if state.unplugged {
            return Err(unplugged_error());
        }
        if state.stall_writes {
            drop(state);
            std::thread::sleep(self.timeout);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write stalled"));
        }

        state.written.extend_from_slice(buf);
        if state.echo {
            state.rx.push_back(ReadEvent::Data(buf.to_vec()));
            self.device.readable.notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
