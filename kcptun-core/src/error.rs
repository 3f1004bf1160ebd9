use std::fmt;
use std::io;

/// Crate-wide error kinds, grouped by the recovery action they imply.
///
/// Per-packet and per-session faults never reach this type: they are handled at the
/// point of detection (dropped, or translated into a session reset). Only faults that
/// should abort startup or bubble out of configuration loading are represented here.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Config(String),
    Crypto(String),
    Bind(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Crypto(msg) => write!(f, "cryptography error: {}", msg),
            Error::Bind(e) => write!(f, "bind error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
