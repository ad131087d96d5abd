//! Turning received bytes into terminal text.
//!
//! Device output arrives in arbitrary chunks: multi-byte UTF-8 sequences can
//! be split across reads and lines rarely end on a chunk boundary. The
//! [`Renderer`] carries that state between chunks.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stateful byte → text converter for the terminal view.
#[derive(Debug)]
pub(crate) struct Renderer {
    pending: Vec<u8>,
    at_line_start: bool,
    /// Prefix each line with a wall-clock timestamp.
    pub timestamps: bool,
    /// Drop control characters other than newline and tab.
    pub clean: bool,
}

impl Renderer {
    pub(crate) fn new(timestamps: bool, clean: bool) -> Self {
        Self {
            pending: Vec::new(),
            at_line_start: true,
            timestamps,
            clean,
        }
    }

    /// Render one received chunk. May return an empty string while a split
    /// UTF-8 sequence is incomplete.
    pub(crate) fn render(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let text = decode_lossy(&mut self.pending);
        let text = if self.clean {
            strip_controls(&text)
        } else {
            text
        };
        let stamp = self.timestamps.then(timestamp_now);
        layout_lines(&text, stamp.as_deref(), &mut self.at_line_start)
    }

    /// Text to emit before a status line so it starts in column zero.
    pub(crate) fn break_line(&mut self) -> &'static str {
        if self.at_line_start {
            ""
        } else {
            self.at_line_start = true;
            "\r\n"
        }
    }
}

/// Decode as much of `buffer` as possible.
///
/// Invalid sequences become U+FFFD; an incomplete trailing sequence stays in
/// `buffer` for the next chunk.
pub(crate) fn decode_lossy(buffer: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                out.push_str(valid);
                buffer.clear();
                return out;
            },
            Err(err) => {
                let good = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&buffer[..good]));
                let Some(bad) = err.error_len() else {
                    buffer.drain(..good);
                    return out;
                };
                out.push(char::REPLACEMENT_CHARACTER);
                buffer.drain(..(good + bad).min(buffer.len()));
            },
        }
    }
}

/// Keep printable text, `\n` and `\t`; map `\r` to `\n`; drop other controls.
pub(crate) fn strip_controls(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\n' | '\t' => Some(c),
            '\r' => Some('\n'),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect()
}

/// Normalise line endings to `\r\n` (raw mode needs the explicit return) and
/// prefix every new line with `stamp` when given.
pub(crate) fn layout_lines(text: &str, stamp: Option<&str>, at_line_start: &mut bool) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' || c == '\n' {
            if c == '\r' && chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push_str("\r\n");
            *at_line_start = true;
            continue;
        }
        if *at_line_start {
            if let Some(stamp) = stamp {
                let _ = write!(out, "\x1b[90m[{stamp}]\x1b[0m ");
            }
            *at_line_start = false;
        }
        out.push(c);
    }
    out
}

/// `HH:MM:SS.mmm` (UTC).
fn timestamp_now() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    )
}
