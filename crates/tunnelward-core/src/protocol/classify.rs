//! Sentinel-line classification for the streaming protocol.
//!
//! Lines that match neither sentinel accumulate in a buffer. The buffer is
//! flushed to `debug` logging when a sentinel matches, when it grows past
//! [`MAX_BUFFERED_LINES`], and at end of stream.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Printed once the tunnel is up.
static READY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)press ctrl-c to exit").expect("static regex is valid"));

/// Printed when the tunnel gives up; group 1 is the vendor's message.
static ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*\* Error:\s+(.*)$").expect("static regex is valid")
});

const ERROR_SENTINEL: &str = "*** Error";

pub const MAX_BUFFERED_LINES: usize = 200;

/// A state-changing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Ready,
    Error(String),
}

#[derive(Debug, Default)]
pub struct OutputClassifier {
    buffer: Vec<String>,
}

impl OutputClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. Returns a signal if the line is a sentinel.
    pub fn push_line(&mut self, line: &str) -> Option<Signal> {
        let line = line.trim_end_matches(['\r', '\n']);
        self.buffer.push(line.to_string());

        let signal = if READY.is_match(line) {
            Some(Signal::Ready)
        } else if line.contains(ERROR_SENTINEL) {
            let message = ERROR
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| self.buffer.join("\n"));
            Some(Signal::Error(message))
        } else {
            None
        };

        if signal.is_some() || self.buffer.len() >= MAX_BUFFERED_LINES {
            self.flush();
        }
        signal
    }

    /// Log and drop everything buffered so far.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        debug!(output = %self.buffer.join("\n"), "tunnel output");
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
