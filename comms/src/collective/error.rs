use std::{error::Error, fmt, io, time::Duration};

#[derive(Debug)]
pub enum CollectiveErr {
    Io(io::Error),
    Timeout {
        op: &'static str,
        after: Duration,
    },
    LengthMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    JoinMismatch(String),
    Disconnected {
        op: &'static str,
    },
    Unexpected {
        op: &'static str,
        got: String,
    },
    Remote(String),
}

impl CollectiveErr {
    /// Every collective failure leaves the group in an unknown state.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Timeout { op, after } => {
                write!(f, "{op} timed out after {after:?}, a peer likely failed")
            }
            Self::LengthMismatch { op, expected, got } => {
                write!(f, "{op} expected {expected} bytes but the peer sent {got}")
            }
            Self::JoinMismatch(reason) => write!(f, "group join rejected: {reason}"),
            Self::Disconnected { op } => write!(f, "a peer left the group during {op}"),
            Self::Unexpected { op, got } => write!(f, "unexpected message during {op}: {got}"),
            Self::Remote(reason) => write!(f, "peer reported an error: {reason}"),
        }
    }
}

impl Error for CollectiveErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CollectiveErr> for io::Error {
    fn from(value: CollectiveErr) -> Self {
        match value {
            CollectiveErr::Io(e) => e,
            CollectiveErr::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, value.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectiveErr>;
