//! Configuration file support for serialterm.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SERIALTERM_*)
//! 3. Local config file (./serialterm.toml)
//! 4. Global config file (~/.config/serialterm/config.toml)
//!
//! Layers 1 and 2 are handled by clap; this module merges 3 and 4.
//!
//! ```toml
//! [port]
//! name = "/dev/ttyUSB0"
//! baud = 115200
//! parity = "none"
//!
//! [log]
//! dir = "~/serial-logs"
//!
//! [engine]
//! chunk_size = 512
//! poll_interval_ms = 20
//! ```

use directories::{BaseDirs, ProjectDirs};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "serialterm.toml";

/// Default line settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0", "COM3" or "loop://demo").
    pub name: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Data bits (5-8).
    pub data_bits: Option<String>,
    /// Parity (none, odd, even).
    pub parity: Option<String>,
    /// Stop bits (1, 2).
    pub stop_bits: Option<String>,
    /// Flow control (none, hardware, software).
    pub flow_control: Option<String>,
}

/// Session log settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// Directory for session logs.
    pub dir: Option<PathBuf>,
}

impl LogConfig {
    /// The log directory with a leading `~` replaced by the home directory.
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir.as_deref().map(expand_home)
    }
}

/// Expand a leading `~` component. TOML values never pass through a shell.
fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    if let Some(dirs) = BaseDirs::new() {
        dirs.home_dir().join(rest)
    } else {
        warn!("No home directory; using {} as given", path.display());
        path.to_path_buf()
    }
}

/// Engine tunables. Unset values keep the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSection {
    /// Bytes per upload chunk.
    pub chunk_size: Option<usize>,
    /// Outbound backlog limit for uploads.
    pub upload_backlog: Option<usize>,
    /// Read poll interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Worker stop bound in milliseconds.
    pub join_timeout_ms: Option<u64>,
    /// Read buffer size.
    pub read_buffer_size: Option<usize>,
    /// Consecutive read failures tolerated.
    pub read_retry_budget: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Read and parse one file. Missing files are silently skipped; broken
    /// ones are reported and skipped.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Ignoring invalid TOML in {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "serialterm").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Overlay every value `other` sets.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        let Self { port, log, engine } = other;
        take(&mut self.port.name, port.name);
        take(&mut self.port.baud, port.baud);
        take(&mut self.port.data_bits, port.data_bits);
        take(&mut self.port.parity, port.parity);
        take(&mut self.port.stop_bits, port.stop_bits);
        take(&mut self.port.flow_control, port.flow_control);

        take(&mut self.log.dir, log.dir);

        take(&mut self.engine.chunk_size, engine.chunk_size);
        take(&mut self.engine.upload_backlog, engine.upload_backlog);
        take(&mut self.engine.poll_interval_ms, engine.poll_interval_ms);
        take(&mut self.engine.join_timeout_ms, engine.join_timeout_ms);
        take(&mut self.engine.read_buffer_size, engine.read_buffer_size);
        take(&mut self.engine.read_retry_budget, engine.read_retry_budget);
    }
}
