use std::{error::Error, fmt, io};

#[derive(Debug)]
pub enum StoreErr {
    Io(io::Error),
    KeyNotFound(String),
    Timeout(Vec<String>),
    Encoding(String),
    Remote(String),
}

impl fmt::Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::KeyNotFound(key) => write!(f, "key {key} is not in the store"),
            Self::Timeout(keys) => write!(f, "timed out waiting for keys {keys:?}"),
            Self::Encoding(reason) => write!(f, "bad store value: {reason}"),
            Self::Remote(reason) => write!(f, "store server error: {reason}"),
        }
    }
}

impl Error for StoreErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Encoding(value.to_string())
    }
}

impl From<StoreErr> for io::Error {
    fn from(value: StoreErr) -> Self {
        match value {
            StoreErr::Io(e) => e,
            StoreErr::KeyNotFound(_) => io::Error::new(io::ErrorKind::NotFound, value.to_string()),
            StoreErr::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, value.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreErr>;
