//! serialterm CLI - an interactive serial terminal.
//!
//! ## Features
//!
//! - Raw-mode terminal with keystroke relay, timestamps and session logs
//! - File upload with progress reporting
//! - Interactive serial port selection
//! - Loopback devices (`loop://<name>`) for demos without hardware
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use serialterm::{
    DataBits, EngineConfig, ErrorKind, FlowControl, Parity, PortIdentity, PortInfo,
    SerialSettings, StopBits,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

mod commands;
mod config;
mod render;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Failures with a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad invocation (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration value (exit 3).
    #[error("{0}")]
    Config(String),
    /// Stopped by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for an error that reached `main`.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli) = cause.downcast_ref::<CliError>() {
            return cli.exit_code();
        }
        if let Some(engine) = cause.downcast_ref::<serialterm::Error>() {
            return match engine.kind() {
                ErrorKind::NotFound | ErrorKind::AccessDenied | ErrorKind::Busy => 4,
                ErrorKind::ConfigRejected | ErrorKind::Config => 3,
                ErrorKind::Cancelled => 130,
                _ => 1,
            };
        }
    }
    1
}

/// serialterm - talk to devices on a serial line.
///
/// Environment variables:
///   SERIALTERM_PORT              - Default serial port
///   SERIALTERM_BAUD              - Default baud rate (default: 115200)
///   SERIALTERM_LOG_DIR           - Directory for session logs
///   SERIALTERM_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "serialterm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (`loop://<name>` for a loopback device).
    #[arg(short, long, global = true, env = "SERIALTERM_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "SERIALTERM_BAUD")]
    baud: Option<u32>,

    /// Data bits (5-8).
    #[arg(long, global = true, value_name = "BITS")]
    data_bits: Option<DataBits>,

    /// Parity (none, odd, even).
    #[arg(long, global = true)]
    parity: Option<Parity>,

    /// Stop bits (1, 2).
    #[arg(long, global = true, value_name = "BITS")]
    stop_bits: Option<StopBits>,

    /// Flow control (none, hardware, software).
    #[arg(long, global = true, value_name = "MODE")]
    flow_control: Option<FlowControl>,

    /// Directory for session logs of received data.
    #[arg(long, global = true, value_name = "DIR", env = "SERIALTERM_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "SERIALTERM_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Open an interactive terminal on a port.
    ///
    /// Keys: Ctrl+] exit, Ctrl+T toggle timestamps, Ctrl+U upload the
    /// --upload file, Ctrl+X cancel the upload.
    #[command(visible_alias = "term")]
    Terminal {
        /// File sent when Ctrl+U is pressed.
        #[arg(long, value_name = "FILE")]
        upload: Option<PathBuf>,

        /// Prefix received lines with timestamps.
        #[arg(long)]
        timestamps: bool,

        /// Drop control characters from received data.
        #[arg(long)]
        clean: bool,
    },

    /// Send a file to the device and exit.
    Send {
        /// File to send.
        file: PathBuf,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install when omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install the script into the shell's completion directory.
        #[arg(long)]
        install: bool,
    },
}

const DEFAULT_BAUD: u32 = 115_200;

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "serialterm v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

fn run(cli: &Cli) -> Result<()> {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }

    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::list_ports::cmd_list_ports(*json),
        Commands::Terminal {
            upload,
            timestamps,
            clean,
        } => commands::terminal::cmd_terminal(
            cli,
            &config,
            &commands::terminal::TerminalOptions {
                upload: upload.clone(),
                timestamps: *timestamps,
                clean: *clean,
            },
        ),
        Commands::Send { file } => commands::send::cmd_send(cli, &config, file),
        Commands::Completions { shell, install } => {
            commands::completions::cmd_completions(*shell, *install)
        },
    }
}

/// Parse an optional config string, naming the key on failure.
fn parse_config_value<T>(key: &str, value: Option<&str>) -> Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    value
        .map(|v| T::from_str(v).map_err(|e| CliError::Config(format!("[port] {key}: {e}"))))
        .transpose()
        .map_err(Into::into)
}

/// Line settings: command line, then config file, then 115200-8-N-1.
fn serial_settings(cli: &Cli, config: &Config) -> Result<SerialSettings> {
    let port = &config.port;
    let data_bits = cli
        .data_bits
        .or(parse_config_value("data_bits", port.data_bits.as_deref())?);
    let parity = cli
        .parity
        .or(parse_config_value("parity", port.parity.as_deref())?);
    let stop_bits = cli
        .stop_bits
        .or(parse_config_value("stop_bits", port.stop_bits.as_deref())?);
    let flow_control = cli
        .flow_control
        .or(parse_config_value("flow_control", port.flow_control.as_deref())?);

    Ok(SerialSettings {
        baud_rate: cli.baud.or(port.baud).unwrap_or(DEFAULT_BAUD),
        data_bits: data_bits.unwrap_or_default(),
        parity: parity.unwrap_or_default(),
        stop_bits: stop_bits.unwrap_or_default(),
        flow_control: flow_control.unwrap_or_default(),
        ..SerialSettings::default()
    })
}

/// Engine tunables from the config file, with the session log directory
/// taken from the command line first.
fn engine_config(cli: &Cli, config: &Config) -> EngineConfig {
    let section = &config.engine;
    let defaults = EngineConfig::default();
    EngineConfig {
        chunk_size: section.chunk_size.unwrap_or(defaults.chunk_size),
        upload_backlog: section.upload_backlog.unwrap_or(defaults.upload_backlog),
        poll_interval: section
            .poll_interval_ms
            .map_or(defaults.poll_interval, Duration::from_millis),
        join_timeout: section
            .join_timeout_ms
            .map_or(defaults.join_timeout, Duration::from_millis),
        read_buffer_size: section.read_buffer_size.unwrap_or(defaults.read_buffer_size),
        read_retry_budget: section
            .read_retry_budget
            .unwrap_or(defaults.read_retry_budget),
        log_dir: cli.log_dir.clone().or_else(|| config.log.resolved_dir()),
        ..defaults
    }
}

/// Pick the port and the settings to open it with.
fn session_identity(
    cli: &Cli,
    config: &Config,
    detect: impl FnOnce() -> Vec<PortInfo>,
) -> Result<PortIdentity> {
    let settings = serial_settings(cli, config)?;
    let name = serial::select_port(cli.port.as_deref(), config, detect, cli.non_interactive)
        .context("No port to connect to")?;
    Ok(PortIdentity::new(name, settings))
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;
    use serialterm::{PortError, TransferError};

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_terminal() {
        let cli = Cli::try_parse_from([
            "serialterm",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "57600",
            "terminal",
            "--upload",
            "fw.bin",
            "--timestamps",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(57600));
        match cli.command {
            Commands::Terminal {
                upload,
                timestamps,
                clean,
            } => {
                assert_eq!(upload, Some(PathBuf::from("fw.bin")));
                assert!(timestamps);
                assert!(!clean);
            },
            _ => panic!("Expected Terminal command"),
        }
    }

    #[test]
    fn test_cli_parse_line_settings() {
        let cli = Cli::try_parse_from([
            "serialterm",
            "--data-bits",
            "7",
            "--parity",
            "even",
            "--stop-bits",
            "2",
            "--flow-control",
            "hardware",
            "send",
            "a.bin",
        ])
        .unwrap();
        assert_eq!(cli.data_bits, Some(DataBits::Seven));
        assert_eq!(cli.parity, Some(Parity::Even));
        assert_eq!(cli.stop_bits, Some(StopBits::Two));
        assert_eq!(cli.flow_control, Some(FlowControl::Hardware));
    }

    #[test]
    fn test_cli_rejects_bad_parity() {
        assert!(Cli::try_parse_from(["serialterm", "--parity", "mark", "list-ports"]).is_err());
    }

    #[test]
    fn test_cli_parse_verbose_count() {
        let cli = Cli::try_parse_from(["serialterm", "-vv", "list-ports"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_send_requires_file() {
        assert!(Cli::try_parse_from(["serialterm", "send"]).is_err());
    }

    #[test]
    fn test_settings_precedence() {
        let cli = Cli::try_parse_from(["serialterm", "--parity", "odd", "list-ports"]).unwrap();
        let mut config = Config::default();
        config.port.baud = Some(9600);
        config.port.parity = Some("even".into());
        config.port.stop_bits = Some("2".into());

        let settings = serial_settings(&cli, &config).unwrap();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.parity, Parity::Odd);
        assert_eq!(settings.stop_bits, StopBits::Two);
        assert_eq!(settings.data_bits, DataBits::Eight);
    }

    #[test]
    fn test_settings_default_baud() {
        let cli = Cli::try_parse_from(["serialterm", "list-ports"]).unwrap();
        let settings = serial_settings(&cli, &Config::default()).unwrap();
        assert_eq!(settings.baud_rate, DEFAULT_BAUD);
    }

    #[test]
    fn test_bad_config_value_is_config_error() {
        let cli = Cli::try_parse_from(["serialterm", "list-ports"]).unwrap();
        let mut config = Config::default();
        config.port.data_bits = Some("9".into());
        let err = serial_settings(&cli, &config).unwrap_err();
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn test_engine_config_layers() {
        let cli =
            Cli::try_parse_from(["serialterm", "--log-dir", "cli-logs", "list-ports"]).unwrap();
        let mut config = Config::default();
        config.log.dir = Some(PathBuf::from("cfg-logs"));
        config.engine.chunk_size = Some(32);
        config.engine.poll_interval_ms = Some(10);

        let engine = engine_config(&cli, &config);
        assert_eq!(engine.chunk_size, 32);
        assert_eq!(engine.poll_interval, Duration::from_millis(10));
        assert_eq!(engine.log_dir, Some(PathBuf::from("cli-logs")));
        assert_eq!(engine.upload_backlog, EngineConfig::default().upload_backlog);
    }

    #[test]
    fn test_config_log_dir_expands_home() {
        let cli = Cli::try_parse_from(["serialterm", "list-ports"]).unwrap();
        let mut config = Config::default();
        config.log.dir = Some(PathBuf::from("~/serial-logs"));

        let log_dir = engine_config(&cli, &config).log_dir.unwrap();
        assert!(log_dir.ends_with("serial-logs"));
        if directories::BaseDirs::new().is_some() {
            assert!(!log_dir.starts_with("~"));
        }
    }

    #[test]
    fn test_session_identity_uses_explicit_port() {
        let cli = Cli::try_parse_from(["serialterm", "-p", "loop://x", "send", "f"]).unwrap();
        let identity = session_identity(&cli, &Config::default(), Vec::new).unwrap();
        assert_eq!(identity.name, "loop://x");
        assert!(identity.is_loopback());
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::from(CliError::Usage("x".into()));
        assert_eq!(exit_code(&usage), 2);

        let cancelled = anyhow::Error::from(CliError::Cancelled("x".into()));
        assert_eq!(exit_code(&cancelled), 130);

        let missing = anyhow::Error::from(serialterm::Error::from(PortError::NotFound {
            port: "COM9".into(),
        }))
        .context("Failed to connect");
        assert_eq!(exit_code(&missing), 4);

        let lost = anyhow::Error::from(serialterm::Error::from(TransferError::LinkLost(
            "gone".into(),
        )));
        assert_eq!(exit_code(&lost), 1);

        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }
}
