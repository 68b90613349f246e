//! Error types for Polygate

use thiserror::Error;

use crate::common::Network;

/// Main error type for Polygate
#[derive(Error, Debug)]
pub enum Error {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden by ruleset")]
    Forbidden,

    #[error("no ruleset matched")]
    NoRulesetMatched,

    #[error("resolve failed: {0}")]
    ResolveFailed(String),

    #[error("connect failed: {0}")]
    ConnectFailed(DialFailure),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported protocol version: {0}")]
    NotSupportedVersion(u8),

    #[error("destination required")]
    DestinationRequired,

    #[error("no connector for network: {0}")]
    NoConnector(Network),

    #[error("cancelled")]
    Cancelled,

    #[error("copier error: {0}")]
    Copier(std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is part of normal connection teardown and
    /// should stay out of error-level logs.
    pub fn is_benign(&self) -> bool {
        match self {
            Error::Cancelled | Error::NoRulesetMatched => true,
            Error::Io(e) => is_benign_disconnect(e),
            _ => false,
        }
    }

    /// Wrap a dial-layer io error into a classified `ConnectFailed`.
    pub fn dial(e: std::io::Error) -> Self {
        Error::ConnectFailed(DialFailure::classify(&e))
    }
}

/// Result type alias for Polygate
pub type Result<T> = std::result::Result<T, Error>;

/// Classified upstream dial failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialFailure {
    Refused,
    NetworkUnreachable,
    HostUnreachable,
    Timeout,
    Other(String),
}

impl DialFailure {
    /// Prefer the structured io error kind; fall back to message text for
    /// kinds the platform reports as `Other`.
    pub fn classify(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => return DialFailure::Refused,
            ErrorKind::TimedOut => return DialFailure::Timeout,
            ErrorKind::HostUnreachable => return DialFailure::HostUnreachable,
            ErrorKind::NetworkUnreachable => return DialFailure::NetworkUnreachable,
            _ => {}
        }
        let msg = e.to_string();
        if msg.contains("refused") {
            DialFailure::Refused
        } else if msg.contains("network is unreachable") {
            DialFailure::NetworkUnreachable
        } else if msg.contains("host is unreachable") || msg.contains("no route to host") {
            DialFailure::HostUnreachable
        } else {
            DialFailure::Other(msg)
        }
    }
}

impl std::fmt::Display for DialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialFailure::Refused => write!(f, "connection refused"),
            DialFailure::NetworkUnreachable => write!(f, "network is unreachable"),
            DialFailure::HostUnreachable => write!(f, "host is unreachable"),
            DialFailure::Timeout => write!(f, "connect timeout"),
            DialFailure::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Whether an io error is a normal way for one side of a pipe to go away.
pub fn is_benign_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
    )
}
