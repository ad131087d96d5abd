//! Interactive terminal on top of the engine.
//!
//! - Keyboard (crossterm raw mode) → `send_bytes`
//! - `ByteReceived` events → screen, through a [`Renderer`]
//! - Ctrl+] exit, Ctrl+T toggle timestamps, Ctrl+U upload, Ctrl+X cancel
//!
//! Other Ctrl+letter chords reach the device as control bytes, so Ctrl+C
//! interrupts the remote program rather than this one.

use anyhow::{Context, Result};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use log::debug;
use serialterm::{Engine, EngineEvent, ErrorKind, TransferError};
use std::io::{self, IsTerminal, Write as _};
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use crate::config::Config;
use crate::render::Renderer;
use crate::{
    Cli, CliError, clear_interrupted_flag, engine_config, session_identity, was_interrupted,
};

const KEY_POLL: Duration = Duration::from_millis(50);

pub(crate) struct TerminalOptions {
    pub upload: Option<PathBuf>,
    pub timestamps: bool,
    pub clean: bool,
}

/// What a key press asks for.
#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Exit,
    ToggleTimestamps,
    Upload,
    CancelUpload,
    Send(Vec<u8>),
    Ignore,
}

fn key_action(code: KeyCode, modifiers: KeyModifiers) -> KeyAction {
    let ctrl = modifiers.contains(KeyModifiers::CONTROL);
    match code {
        // Ctrl+] arrives as Ctrl+5 on some terminals
        KeyCode::Char(']' | '5') if ctrl => KeyAction::Exit,
        KeyCode::Char('t') if ctrl => KeyAction::ToggleTimestamps,
        KeyCode::Char('u') if ctrl => KeyAction::Upload,
        KeyCode::Char('x') if ctrl => KeyAction::CancelUpload,
        KeyCode::Char(c) if ctrl && c.is_ascii_alphabetic() => {
            KeyAction::Send(vec![(c.to_ascii_lowercase() as u8) & 0x1F])
        },
        KeyCode::Char(c) if !ctrl && !modifiers.contains(KeyModifiers::ALT) => {
            let mut buf = [0u8; 4];
            KeyAction::Send(c.encode_utf8(&mut buf).as_bytes().to_vec())
        },
        // Works with both \n and \r\n devices
        KeyCode::Enter => KeyAction::Send(b"\r\n".to_vec()),
        KeyCode::Backspace => KeyAction::Send(vec![0x08]),
        KeyCode::Tab => KeyAction::Send(vec![0x09]),
        KeyCode::Esc => KeyAction::Send(vec![0x1B]),
        _ => KeyAction::Ignore,
    }
}

/// Output side of the terminal.
///
/// In TTY mode received data and status lines share stderr so they cannot
/// reorder; otherwise data goes to stdout and status to stderr.
struct Screen {
    renderer: Renderer,
    tty_mode: bool,
    quiet: bool,
}

impl Screen {
    fn data(&mut self, bytes: &[u8]) {
        let text = self.renderer.render(bytes);
        if text.is_empty() {
            return;
        }
        if self.tty_mode {
            eprint!("{text}");
            io::stderr().flush().ok();
        } else {
            print!("{text}");
            io::stdout().flush().ok();
        }
    }

    fn status(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        let lead = self.renderer.break_line();
        if self.tty_mode {
            eprint!("{lead}\r\x1b[2K{message}\r\n");
        } else {
            if !lead.is_empty() {
                println!();
            }
            eprintln!("{message}");
        }
        io::stderr().flush().ok();
    }
}

/// Outcome of one event, from the loop's point of view.
enum Flow {
    Continue,
    LinkLost,
}

fn show_event(screen: &mut Screen, event: EngineEvent) -> Flow {
    match event {
        EngineEvent::ByteReceived(bytes) => screen.data(&bytes),
        EngineEvent::TransferStarted { path, total } => screen.status(&format!(
            "{} Uploading {} ({total} bytes)",
            style("⇪").cyan(),
            path.display()
        )),
        EngineEvent::TransferProgress { .. } => {},
        EngineEvent::TransferCompleted { bytes } => screen.status(&format!(
            "{} Upload queued ({bytes} bytes)",
            style("✓").green()
        )),
        EngineEvent::TransferCancelled => {
            screen.status(&format!("{} Upload cancelled", style("⚠").yellow()));
        },
        EngineEvent::LinkLost => {
            screen.status(&format!("{} Link lost", style("✗").red()));
            return Flow::LinkLost;
        },
        EngineEvent::OperationFailed { kind, message } => {
            screen.status(&format!("{} {message}", style("⚠").yellow()));
            if kind == ErrorKind::LinkLost {
                return Flow::LinkLost;
            }
        },
        EngineEvent::StateChanged(state) => debug!("Engine {state}"),
    }
    Flow::Continue
}

/// Run the interactive terminal.
pub(crate) fn cmd_terminal(cli: &Cli, config: &Config, options: &TerminalOptions) -> Result<()> {
    if !io::stdin().is_terminal() {
        return Err(CliError::Usage(
            "the terminal needs an interactive stdin; use `serialterm send` for scripted uploads"
                .into(),
        )
        .into());
    }

    let (tx, rx) = mpsc::channel();
    let mut engine = Engine::with_system_ports(Arc::new(tx), engine_config(cli, config))?;
    let identity = session_identity(cli, config, || engine.list_ports())?;

    let mut screen = Screen {
        renderer: Renderer::new(options.timestamps, options.clean),
        tty_mode: io::stdout().is_terminal() && io::stderr().is_terminal(),
        quiet: cli.quiet,
    };
    screen.status(&format!(
        "{} Opening {} at {}",
        style("📡").cyan(),
        style(&identity.name).green(),
        identity.settings
    ));

    engine
        .connect(&identity)
        .with_context(|| format!("Failed to connect to {}", identity.name))?;
    screen.status(
        &style("Ctrl+] exit · Ctrl+T timestamps · Ctrl+U upload · Ctrl+X cancel upload")
            .dim()
            .to_string(),
    );

    let outcome = {
        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        let _raw_guard = RawModeGuard;
        session_loop(&mut engine, &rx, &mut screen, options)
    };

    engine.disconnect()?;
    while let Ok(event) = rx.try_recv() {
        show_event(&mut screen, event);
    }
    engine.shutdown();
    clear_interrupted_flag();
    screen.status(&format!("{} Terminal closed", style("👋").cyan()));

    match outcome? {
        Flow::Continue => Ok(()),
        Flow::LinkLost => {
            Err(serialterm::Error::from(TransferError::LinkLost(identity.name)).into())
        },
    }
}

fn session_loop(
    engine: &mut Engine,
    rx: &mpsc::Receiver<EngineEvent>,
    screen: &mut Screen,
    options: &TerminalOptions,
) -> Result<Flow> {
    loop {
        if was_interrupted() {
            return Ok(Flow::Continue);
        }

        while let Ok(event) = rx.try_recv() {
            if let Flow::LinkLost = show_event(screen, event) {
                return Ok(Flow::LinkLost);
            }
        }
        if engine.check_link() {
            return Ok(Flow::LinkLost);
        }

        if !event::poll(KEY_POLL)? {
            continue;
        }
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            ..
        }) = event::read()?
        else {
            continue;
        };

        match key_action(code, modifiers) {
            KeyAction::Exit => return Ok(Flow::Continue),
            KeyAction::ToggleTimestamps => {
                screen.renderer.timestamps = !screen.renderer.timestamps;
                let state = if screen.renderer.timestamps { "on" } else { "off" };
                screen.status(&format!("{} Timestamps {state}", style("⏱").cyan()));
            },
            KeyAction::Upload => match &options.upload {
                // Refusals are reported through OperationFailed
                Some(path) => {
                    let _ = engine.send_file(path);
                },
                None => screen.status(&format!(
                    "{} No file to upload; start with --upload <FILE>",
                    style("ℹ").blue()
                )),
            },
            KeyAction::CancelUpload => {
                if !engine.cancel_transfer() {
                    screen.status(&format!("{} No upload running", style("ℹ").blue()));
                }
            },
            KeyAction::Send(bytes) => {
                let _ = engine.send_bytes(&bytes);
            },
            KeyAction::Ignore => {},
        }
    }
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
