//! # serialterm
//!
//! The communication engine of a serial-line terminal.
//!
//! A handful of supervised worker threads share one serial port and a set of
//! hand-off queues:
//!
//! - the **download** worker polls the port and queues what arrives,
//! - the **presentation** worker turns queued bytes into UI events and the
//!   session log,
//! - the **upload** worker reads a file into the outbound queue,
//! - the **transmit** worker relays the outbound queue onto the wire.
//!
//! [`Engine`] owns all of them together with the [`port::PortManager`], takes
//! [`Command`]s and reports [`EngineEvent`]s through an [`EventSink`]. The
//! port cannot be reconfigured or switched while workers hold it.
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//! - **Loopback**: `loop://<name>` in-memory devices, on every platform
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use serialterm::{Engine, EngineConfig, EngineEvent, PortIdentity, SerialSettings};
//! use std::sync::{Arc, mpsc};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, rx) = mpsc::channel();
//!     let mut engine = Engine::with_system_ports(Arc::new(tx), EngineConfig::default())?;
//!
//!     engine.connect(&PortIdentity::new("/dev/ttyUSB0", SerialSettings::new(115200)))?;
//!     engine.send_bytes(b"AT\r\n")?;
//!
//!     while let Ok(event) = rx.recv() {
//!         if let EngineEvent::ByteReceived(bytes) = event {
//!             print!("{}", String::from_utf8_lossy(&bytes));
//!             break;
//!         }
//!     }
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod event;
pub mod port;
pub mod queue;
pub mod session_log;
pub mod signal;
pub mod worker;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeOpener, NativePort};
pub use {
    engine::{Command, Engine, EngineConfig},
    error::{Error, ErrorKind, PortError, QueueError, Result, TransferError},
    event::{EngineEvent, EngineState, EventSink, NullSink},
    port::{
        DataBits, FlowControl, LoopbackController, LoopbackOpener, Parity, Port, PortIdentity,
        PortInfo, PortManager, PortOpener, SerialSettings, StopBits, SystemOpener,
    },
    queue::{Marker, QueueItem, TransferQueue},
    session_log::LogSink,
    signal::StopSignal,
};
