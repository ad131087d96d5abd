//! `list-ports`: enumerate serial ports.

use anyhow::{Context, Result};
use console::style;
use serialterm::{PortInfo, PortOpener, SystemOpener};

use crate::serial::describe_port;

pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = SystemOpener::default().list_ports();

    if json {
        let text = serde_json::to_string_pretty(&ports).context("Failed to encode port list")?;
        println!("{text}");
        return Ok(());
    }

    print_human(&ports);
    Ok(())
}

fn print_human(ports: &[PortInfo]) {
    eprintln!("{}", style("Available serial ports:").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        eprintln!(
            "  {}",
            style("Loopback devices are always available as loop://<name>").dim()
        );
        return;
    }
    for port in ports {
        eprintln!("  {} {}", style("•").green(), describe_port(port));
    }
}
