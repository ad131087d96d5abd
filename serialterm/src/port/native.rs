//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).

use {
    crate::{
        error::PortError,
        port::{
            DataBits, FlowControl, Parity, Port, PortIdentity, PortInfo, PortOpener,
            SerialSettings, StopBits,
        },
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given identity.
    pub fn open(identity: &PortIdentity) -> Result<Self, PortError> {
        let settings = &identity.settings;
        settings.validate(&identity.name)?;

        let path = identity.device_path();
        debug!("Opening {} ({path}) at {settings}", identity.name);

        let port = serialport::new(&path, settings.baud_rate)
            .timeout(settings.timeout)
            .data_bits(settings.data_bits.into())
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits.into())
            .flow_control(settings.flow_control.into())
            .open()
            .map_err(|e| map_open_error(&identity.name, e))?;

        Ok(Self {
            port,
            name: identity.name.clone(),
            timeout: settings.timeout,
        })
    }
}

/// Translate a backend open failure into the engine's taxonomy.
fn map_open_error(port: &str, err: serialport::Error) -> PortError {
    use serialport::ErrorKind as Kind;

    match err.kind() {
        Kind::NoDevice | Kind::Io(io::ErrorKind::NotFound) => PortError::NotFound {
            port: port.to_string(),
        },
        Kind::InvalidInput => PortError::ConfigRejected {
            port: port.to_string(),
            reason: err.description,
        },
        // EBUSY, EACCES and everything the OS won't explain: the device is
        // there but we can't have it
        Kind::Io(_) | Kind::Unknown => PortError::AccessDenied {
            port: port.to_string(),
            reason: err.description,
        },
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn apply_settings(&mut self, settings: &SerialSettings) -> io::Result<()> {
        trace!("Applying {settings} to {}", self.name);
        self.port.set_baud_rate(settings.baud_rate)?;
        self.port.set_data_bits(settings.data_bits.into())?;
        self.port.set_parity(settings.parity.into())?;
        self.port.set_stop_bits(settings.stop_bits.into())?;
        self.port.set_flow_control(settings.flow_control.into())?;
        self.set_timeout(settings.timeout)
    }

    fn purge(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn Port>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(Self {
            port,
            name: self.name.clone(),
            timeout: self.timeout,
        }))
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

/// Opener for OS serial devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    fn open(&self, identity: &PortIdentity) -> Result<Box<dyn Port>, PortError> {
        Ok(Box::new(NativePort::open(identity)?))
    }

    fn list_ports(&self) -> Vec<PortInfo> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                debug!("Port enumeration failed: {e}");
                return Vec::new();
            },
        };

        ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product) = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer,
                        info.product,
                    ),
                    _ => (None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                }
            })
            .collect()
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => Self::Five,
            DataBits::Six => Self::Six,
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}
