//! Log setup for embedding apps
//!
//! Output goes to stderr, or to `ipt.log` in the state directory. Unless
//! unsafe logging is asked for, IP addresses are scrubbed from every line
//! before it is written.

use crate::Result;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{Level, debug, warn};

/// Log file name inside the state directory
pub const LOG_FILE_NAME: &str = "ipt.log";

const SCRUBBED: &str = "[scrubbed]";

lazy_static! {
    // 192.0.2.1 and 192.0.2.1:443
    static ref IPV4_RE: Regex = Regex::new(
        r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b"
    ).unwrap();

    // Full and compressed forms, optionally bracketed with a port. Two
    // colons alone (paths like ptproxy::relay) are left alone.
    static ref IPV6_RE: Regex = Regex::new(
        r"\[?(?:\b(?:[0-9A-Fa-f]{1,4}:){3,7}[0-9A-Fa-f]{1,4}\b|\b(?:[0-9A-Fa-f]{1,4}:)+:(?:[0-9A-Fa-f]{1,4}(?::[0-9A-Fa-f]{1,4})*)?|::[0-9A-Fa-f]{1,4}(?::[0-9A-Fa-f]{1,4})*\b)\]?(?::\d{1,5})?"
    ).unwrap();
}

/// LogSettings configures the subscriber installed by [`init`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// ERROR, WARN, INFO or DEBUG; anything else means ERROR
    pub level: String,
    /// Write to the state directory instead of stderr
    pub to_file: bool,
    /// Keep addresses in the output
    pub unsafe_logging: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "ERROR".into(),
            to_file: false,
            unsafe_logging: false,
        }
    }
}

/// parse_level maps a level name, case-insensitively
pub fn parse_level(level: &str) -> Option<Level> {
    match level.trim().to_ascii_uppercase().as_str() {
        "" | "ERROR" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" | "NOTICE" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        _ => None,
    }
}

/// init installs the global subscriber. If one is installed already it
/// stays in place.
pub fn init(settings: &LogSettings, state_dir: &Path) -> Result<()> {
    let level = parse_level(&settings.level);

    let file = if settings.to_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(state_dir.join(LOG_FILE_NAME))?;
        Some(Arc::new(Mutex::new(file)))
    } else {
        None
    };

    let sink = LogSink {
        file,
        scrub: !settings.unsafe_logging,
    };

    let installed = tracing_subscriber::fmt()
        .with_max_level(level.unwrap_or(Level::ERROR))
        .with_target(false)
        .with_ansi(!settings.to_file)
        .with_writer(move || sink.clone())
        .try_init();

    if installed.is_err() {
        debug!("log subscriber already installed");
    }
    if level.is_none() {
        warn!("failed to set log level {:?}, using ERROR", settings.level);
    }

    Ok(())
}

/// scrub replaces IP addresses in text
pub fn scrub(text: &str) -> Cow<'_, str> {
    match IPV4_RE.replace_all(text, SCRUBBED) {
        Cow::Borrowed(text) => IPV6_RE.replace_all(text, SCRUBBED),
        Cow::Owned(text) => Cow::Owned(IPV6_RE.replace_all(&text, SCRUBBED).into_owned()),
    }
}

/// LogSink is the writer behind the subscriber
#[derive(Clone)]
struct LogSink {
    file: Option<Arc<Mutex<File>>>,
    scrub: bool,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let line = if self.scrub { scrub(&text) } else { Cow::Borrowed(&*text) };

        match &self.file {
            Some(file) => file.lock().write_all(line.as_bytes())?,
            None => io::stderr().write_all(line.as_bytes())?,
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.file {
            Some(file) => file.lock().flush(),
            None => io::stderr().flush(),
        }
    }
}
