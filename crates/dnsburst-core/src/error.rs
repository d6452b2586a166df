//! Engine error kinds.
//!
//! Fatal errors (bad configuration, unreadable datafile, socket setup) stop
//! the run before the start barrier opens. Everything that can go wrong on
//! the hot path — a busy socket, a short reply, a forged transaction id — is
//! handled locally by the sender/receiver loops and never surfaces here.

use std::fmt;
use std::io;

/// Errors that terminate a run.
#[derive(Debug)]
pub enum Error {
    /// Invalid or contradictory configuration, rejected before any worker starts.
    Config(String),
    /// The datafile could not be parsed into query descriptors.
    InvalidInput(String),
    /// A socket or pipe could not be set up.
    Io(io::Error),
    /// TLS client configuration failed.
    Tls(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Tls(msg) => write!(f, "tls setup failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
