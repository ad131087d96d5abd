//! Serial port selection.
//!
//! Order of preference:
//! 1. `--port` / `SERIALTERM_PORT`
//! 2. `[port] name` from the config files
//! 3. the only detected port, if exactly one exists
//! 4. an interactive picker (refused with `--non-interactive` or without a TTY)

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    serialterm::PortInfo,
    std::io::IsTerminal,
};

/// What the selection rules decided before any prompting.
#[derive(Debug)]
enum Choice {
    Use(String),
    Prompt(Vec<PortInfo>),
}

fn usage_err(message: impl Into<String>) -> anyhow::Error {
    CliError::Usage(message.into()).into()
}

fn decide(
    explicit: Option<&str>,
    config: &Config,
    detect: impl FnOnce() -> Vec<PortInfo>,
    non_interactive: bool,
) -> Result<Choice> {
    if let Some(name) = explicit {
        return Ok(Choice::Use(name.to_string()));
    }
    if let Some(name) = &config.port.name {
        debug!("Using port from config: {name}");
        return Ok(Choice::Use(name.clone()));
    }

    let mut detected = detect();
    match detected.len() {
        0 => Err(usage_err(
            "No serial ports found; pass --port (loop://<name> for a loopback device)",
        )),
        1 => {
            let port = detected.remove(0);
            info!("Auto-selected port: {}", port.name);
            Ok(Choice::Use(port.name))
        },
        n if non_interactive => Err(usage_err(format!(
            "Found {n} serial ports (multiple candidates); pass --port in non-interactive mode"
        ))),
        _ => Ok(Choice::Prompt(detected)),
    }
}

/// Resolve the port to connect to. `detect` only runs when neither the
/// command line nor the config names a port.
pub fn select_port(
    explicit: Option<&str>,
    config: &Config,
    detect: impl FnOnce() -> Vec<PortInfo>,
    non_interactive: bool,
) -> Result<String> {
    match decide(explicit, config, detect, non_interactive)? {
        Choice::Use(name) => Ok(name),
        Choice::Prompt(ports) => {
            ensure_interactive_terminal()?;
            pick(&ports)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Choosing a port interactively needs a terminal; pass --port instead",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("Port selection cancelled".into()).into()
        },
        DialoguerError::IO(io_err) => usage_err(format!("Port prompt failed: {io_err}")),
    }
}

/// One picker line: name, USB ids and product.
pub fn describe_port(port: &PortInfo) -> String {
    let ids = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{ids}{product}", port.name)
}

fn pick(ports: &[PortInfo]) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&describe_port(p), width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .get(index)
            .map(|p| p.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".into()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(0x1A86),
            pid: Some(0x7523),
            manufacturer: None,
            product: Some("USB Serial".to_string()),
        }
    }

    fn is_usage(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_)))
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = Config::default();
        config.port.name = Some("/dev/ttyS9".into());
        let choice = decide(Some("COM1"), &config, || unreachable!(), true).unwrap();
        assert!(matches!(choice, Choice::Use(name) if name == "COM1"));
    }

    #[test]
    fn test_config_port_beats_detection() {
        let mut config = Config::default();
        config.port.name = Some("/dev/ttyS9".into());
        let choice = decide(None, &config, || unreachable!(), false).unwrap();
        assert!(matches!(choice, Choice::Use(name) if name == "/dev/ttyS9"));
    }

    #[test]
    fn test_single_detected_port_is_used() {
        let choice = decide(None, &Config::default(), || vec![port("/dev/ttyUSB0")], true).unwrap();
        assert!(matches!(choice, Choice::Use(name) if name == "/dev/ttyUSB0"));
    }

    #[test]
    fn test_no_ports_is_usage_error() {
        let err = decide(None, &Config::default(), Vec::new, false).unwrap_err();
        assert!(is_usage(&err));
    }

    #[test]
    fn test_multiple_ports_non_interactive_is_usage_error() {
        let err = decide(
            None,
            &Config::default(),
            || vec![port("/dev/ttyUSB0"), port("/dev/ttyUSB1")],
            true,
        )
        .unwrap_err();
        assert!(is_usage(&err));
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_multiple_ports_interactive_prompts() {
        let choice = decide(
            None,
            &Config::default(),
            || vec![port("/dev/ttyUSB0"), port("/dev/ttyUSB1")],
            false,
        )
        .unwrap();
        assert!(matches!(choice, Choice::Prompt(ports) if ports.len() == 2));
    }

    #[test]
    fn test_describe_port_includes_ids() {
        console::set_colors_enabled(false);
        assert_eq!(
            describe_port(&port("/dev/ttyUSB0")),
            "/dev/ttyUSB0 (1A86:7523) - USB Serial"
        );
    }
}
