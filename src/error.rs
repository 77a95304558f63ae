//! Error types for the transport controller

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Controller error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "error with state directory {path:?}: {source}\n  \
         the state directory needs to be set to a writable directory.\n  \
         Use an app-private directory to avoid information leaks.\n  \
         Use a non-temporary directory to allow reuse of potentially stored state."
    )]
    StateDir { path: PathBuf, source: io::Error },

    #[error("invalid proxy URL {url:?}: {reason}")]
    ProxyUrl { url: String, reason: String },

    #[error("no such transport: {0}")]
    UnknownTransport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to launch {method}: {reason}")]
    Launch { method: String, reason: String },

    #[error("invalid SOCKS arg: {key}={value}")]
    InvalidArgument { key: String, value: String },

    #[error("SOCKS error: {0}")]
    Socks(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("{method}: {message}")]
    Transport { method: String, message: String },
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn socks<S: Into<String>>(msg: S) -> Self {
        Error::Socks(msg.into())
    }

    pub fn proxy<S: Into<String>>(msg: S) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn dial<S: Into<String>>(msg: S) -> Self {
        Error::Dial(msg.into())
    }

    pub fn launch(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Launch {
            method: method.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(key: impl Into<String>, value: impl Into<String>) -> Self {
        Error::InvalidArgument {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn transport(method: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn proxy_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ProxyUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error belongs to a `start` call rather than a single connection
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::StateDir { .. }
                | Error::ProxyUrl { .. }
                | Error::UnknownTransport(_)
                | Error::Config(_)
                | Error::Launch { .. }
        )
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::TimedOut, e))
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let e = Error::invalid_argument("max", "notanumber");
        assert_eq!(e.to_string(), "invalid SOCKS arg: max=notanumber");
        assert!(!e.is_configuration());
    }

    #[test]
    fn test_state_dir_message_names_path() {
        let e = Error::StateDir {
            path: PathBuf::from("/nope/state"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = e.to_string();
        assert!(msg.contains("/nope/state"));
        assert!(msg.contains("writable directory"));
        assert!(e.is_configuration());
    }
}
