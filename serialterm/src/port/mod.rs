//! Port abstraction for serial communication.
//!
//! The engine never talks to a backend directly. It goes through two traits:
//!
//! - [`PortOpener`] turns a [`PortIdentity`] into an open [`Port`], mapping
//!   backend failures onto [`PortError`].
//! - [`Port`] is the open byte stream. It can be cloned into independent
//!   reader/writer endpoints so that the download and transmit workers run
//!   concurrently on one device.
//!
//! ```text
//!            +--------------+
//!            |  PortManager |
//!            +------+-------+
//!                   | PortOpener
//!         +---------+----------+
//!         v                    v
//! +---------------+    +----------------+
//! |  NativeOpener |    | LoopbackOpener |
//! |  (serialport) |    |  (in-memory)   |
//! +---------------+    +----------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use serialterm::port::{PortIdentity, PortOpener, SerialSettings, SystemOpener};
//! use std::io::Write;
//!
//! fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = PortIdentity::new("COM1", SerialSettings::new(9600));
//!     let mut port = SystemOpener::default().open(&identity)?;
//!     port.write_all(b"AT\r\n")?;
//!     Ok(())
//! }
//! ```

pub mod loopback;
pub mod manager;
#[cfg(feature = "native")]
pub mod native;

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Duration;

use crate::error::PortError;

pub use loopback::{LoopbackController, LoopbackOpener, LoopbackPort};
pub use manager::PortManager;
#[cfg(feature = "native")]
pub use native::{NativeOpener, NativePort};

/// Prefix selecting the in-memory loopback backend.
pub const LOOPBACK_PREFIX: &str = "loop://";

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialSettings {
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
    /// Read/write timeout used for blocking device I/O.
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl SerialSettings {
    /// 8-N-1 settings at the given baud rate.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the flow control mode.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Check the settings before they are applied to any device.
    pub fn validate(&self, port: &str) -> Result<(), PortError> {
        let reject = |reason: &str| PortError::ConfigRejected {
            port: port.to_string(),
            reason: reason.to_string(),
        };
        if self.baud_rate == 0 {
            return Err(reject("baud rate must be non-zero"));
        }
        if self.timeout.is_zero() {
            return Err(reject("timeout must be non-zero"));
        }
        if self.data_bits == DataBits::Five && self.stop_bits == StopBits::Two {
            // 5 data bits pair with 1.5 stop bits on real UARTs, which we don't model
            return Err(reject("5 data bits cannot use 2 stop bits"));
        }
        Ok(())
    }
}

impl fmt::Display for SerialSettings {
    /// Classic `9600-8-N-1` notation.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        write!(
            f,
            "{}-{}-{}-{}",
            self.baud_rate,
            self.data_bits.bits(),
            parity,
            self.stop_bits.bits()
        )?;
        match self.flow_control {
            FlowControl::None => Ok(()),
            FlowControl::Hardware => f.write_str(" (RTS/CTS)"),
            FlowControl::Software => f.write_str(" (XON/XOFF)"),
        }
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl DataBits {
    /// Numeric bit count.
    pub fn bits(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl FromStr for DataBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "5" => Ok(Self::Five),
            "6" => Ok(Self::Six),
            "7" => Ok(Self::Seven),
            "8" => Ok(Self::Eight),
            other => Err(format!("Invalid data bits: '{other}' (expected 5-8)")),
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Self::None),
            "o" | "odd" => Ok(Self::Odd),
            "e" | "even" => Ok(Self::Even),
            other => Err(format!("Invalid parity: '{other}' (expected none, odd or even)")),
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

impl StopBits {
    /// Numeric stop bit count.
    pub fn bits(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(Self::One),
            "2" => Ok(Self::Two),
            other => Err(format!("Invalid stop bits: '{other}' (expected 1 or 2)")),
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

impl FromStr for FlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "hardware" | "rtscts" | "rts/cts" => Ok(Self::Hardware),
            "software" | "xonxoff" | "xon/xoff" => Ok(Self::Software),
            other => Err(format!(
                "Invalid flow control: '{other}' (expected none, hardware or software)"
            )),
        }
    }
}

/// A port name plus the settings it should be opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortIdentity {
    /// Symbolic name as given by the operator (`COM1`, `/dev/ttyUSB0`, `loop://a`).
    pub name: String,
    /// Line settings.
    pub settings: SerialSettings,
}

impl PortIdentity {
    /// Create a new identity.
    pub fn new(name: impl Into<String>, settings: SerialSettings) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    /// The device path the backend should open.
    ///
    /// `COM1`..`COM4` are logical aliases: kept verbatim on Windows and mapped
    /// to `/dev/ttyS0`..`/dev/ttyS3` elsewhere. Everything else passes through.
    pub fn device_path(&self) -> String {
        match logical_com_index(&self.name) {
            Some(index) if !cfg!(windows) => format!("/dev/ttyS{}", index - 1),
            _ => self.name.clone(),
        }
    }

    /// Whether this identity selects the in-memory loopback backend.
    pub fn is_loopback(&self) -> bool {
        self.name.starts_with(LOOPBACK_PREFIX)
    }
}

fn logical_com_index(name: &str) -> Option<u8> {
    let digits = name
        .strip_prefix("COM")
        .or_else(|| name.strip_prefix("com"))?;
    match digits.parse::<u8>() {
        Ok(n @ 1..=4) => Some(n),
        _ => None,
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// An open serial connection.
///
/// Implementations exist for:
///
/// - Native platforms via the `serialport` crate
/// - The in-memory loopback device
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set the read/write timeout of this endpoint only.
    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Apply a complete set of line settings.
    fn apply_settings(&mut self, settings: &SerialSettings) -> std::io::Result<()>;

    /// Discard bytes buffered for transmission and bytes received but unread.
    fn purge(&mut self) -> std::io::Result<()>;

    /// Create an independent endpoint on the same device.
    ///
    /// Each clone has its own timeout; reads and writes may run concurrently
    /// on different clones.
    fn try_clone_port(&self) -> std::io::Result<Box<dyn Port>>;
}

/// Opens ports by identity.
pub trait PortOpener: Send + Sync {
    /// Open and fully configure a port.
    fn open(&self, identity: &PortIdentity) -> Result<Box<dyn Port>, PortError>;

    /// List ports this backend can see.
    fn list_ports(&self) -> Vec<PortInfo> {
        Vec::new()
    }
}

/// Opener that routes `loop://` names to a loopback registry and everything
/// else to the native backend.
///
/// The default registry creates an echoing device on first use, so
/// `loop://anything` works out of the box.
#[derive(Clone)]
pub struct SystemOpener {
    loopback: LoopbackOpener,
}

impl Default for SystemOpener {
    fn default() -> Self {
        Self::with_loopback(LoopbackOpener::auto_creating())
    }
}

impl SystemOpener {
    /// Use a specific loopback registry (shared with a test or demo harness).
    pub fn with_loopback(loopback: LoopbackOpener) -> Self {
        Self { loopback }
    }

    /// The loopback registry this opener consults.
    pub fn loopback(&self) -> &LoopbackOpener {
        &self.loopback
    }
}

impl PortOpener for SystemOpener {
    fn open(&self, identity: &PortIdentity) -> Result<Box<dyn Port>, PortError> {
        if identity.is_loopback() {
            return self.loopback.open(identity);
        }
        #[cfg(feature = "native")]
        {
            NativeOpener.open(identity)
        }
        #[cfg(not(feature = "native"))]
        {
            Err(PortError::NotFound {
                port: identity.name.clone(),
            })
        }
    }

    fn list_ports(&self) -> Vec<PortInfo> {
        #[cfg(feature = "native")]
        {
            NativeOpener.list_ports()
        }
        #[cfg(not(feature = "native"))]
        {
            Vec::new()
        }
    }
}
