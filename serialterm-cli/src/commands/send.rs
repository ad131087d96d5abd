//! `send`: upload one file and exit.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use serialterm::{Engine, EngineEvent, ErrorKind, TransferError};
use std::path::Path;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::{
    Cli, CliError, engine_config, session_identity, use_fancy_output, was_interrupted,
};

const EVENT_WAIT: Duration = Duration::from_millis(100);

/// How long queued bytes may take to reach the wire after the upload.
const DRAIN_LIMIT: Duration = Duration::from_secs(30);

/// Send `file` to the selected port.
pub(crate) fn cmd_send(cli: &Cli, config: &Config, file: &Path) -> Result<()> {
    let size = std::fs::metadata(file)
        .with_context(|| format!("Cannot read {}", file.display()))?
        .len();

    let (tx, rx) = mpsc::channel();
    let mut engine = Engine::with_system_ports(Arc::new(tx), engine_config(cli, config))?;
    let identity = session_identity(cli, config, || engine.list_ports())?;

    if !cli.quiet {
        eprintln!(
            "{} Sending {} ({size} bytes) to {} at {}",
            style("📦").cyan(),
            file.display(),
            style(&identity.name).green(),
            identity.settings
        );
    }

    engine
        .connect(&identity)
        .with_context(|| format!("Failed to connect to {}", identity.name))?;
    let result = engine
        .send_file(file)
        .map_err(anyhow::Error::from)
        .and_then(|()| {
            follow_upload(&mut engine, &rx, progress_bar(cli, size), &identity.name)
        });

    engine.disconnect()?;
    engine.shutdown();

    let bytes = result?;
    if !cli.quiet {
        eprintln!("{} Sent {bytes} bytes", style("✓").green());
    }
    Ok(())
}

fn progress_bar(cli: &Cli, size: u64) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(size);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                 {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Track upload events until the file is queued, then wait for the relay
/// to put it on the wire. Returns the byte count.
fn follow_upload(
    engine: &mut Engine,
    rx: &mpsc::Receiver<EngineEvent>,
    pb: ProgressBar,
    port: &str,
) -> Result<u64> {
    let mut cancel_requested = false;
    let bytes = loop {
        if was_interrupted() && !cancel_requested {
            debug!("Interrupted; cancelling upload");
            cancel_requested = engine.cancel_transfer();
        }
        if engine.check_link() {
            pb.abandon();
            return Err(link_lost(port));
        }

        let Ok(event) = rx.recv_timeout(EVENT_WAIT) else {
            continue;
        };
        match event {
            EngineEvent::TransferStarted { total, .. } => pb.set_length(total),
            EngineEvent::TransferProgress { sent, .. } => pb.set_position(sent),
            EngineEvent::TransferCompleted { bytes } => {
                pb.finish_and_clear();
                break bytes;
            },
            EngineEvent::TransferCancelled => {
                pb.abandon();
                return Err(CliError::Cancelled("Upload cancelled".into()).into());
            },
            EngineEvent::LinkLost => {
                pb.abandon();
                return Err(link_lost(port));
            },
            EngineEvent::OperationFailed { kind, message } => {
                pb.abandon();
                return Err(failure(kind, message));
            },
            EngineEvent::ByteReceived(_) | EngineEvent::StateChanged(_) => {},
        }
    };

    let deadline = Instant::now() + DRAIN_LIMIT;
    while !engine.is_outbound_drained() {
        if was_interrupted() {
            return Err(CliError::Cancelled("Interrupted while draining".into()).into());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("Device did not accept the data within {DRAIN_LIMIT:?}");
        }
        if engine.check_link() {
            return Err(link_lost(port));
        }
        std::thread::sleep(engine.config().poll_interval);
    }
    Ok(bytes)
}

fn link_lost(port: &str) -> anyhow::Error {
    serialterm::Error::from(TransferError::LinkLost(port.to_string())).into()
}

fn failure(kind: ErrorKind, message: String) -> anyhow::Error {
    match kind {
        ErrorKind::Cancelled => CliError::Cancelled(message).into(),
        _ => anyhow::anyhow!("{kind}: {message}"),
    }
}
