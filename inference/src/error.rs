use std::{error::Error, fmt, io};

use comms::weights::WireErr;
use model::{CheckpointErr, RegistryErr};

use crate::fusion::FusionErr;

pub type Result<T> = std::result::Result<T, ReceiverErr>;

/// Failures that stop the weight receiver.
#[derive(Debug)]
pub enum ReceiverErr {
    Wire(WireErr),
    Fusion(FusionErr),
    Registry(RegistryErr),
    Checkpoint(CheckpointErr),
    /// The receiver task never started or panicked.
    Aborted(String),
}

impl fmt::Display for ReceiverErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "wire error: {e}"),
            Self::Fusion(e) => write!(f, "fusion error: {e}"),
            Self::Registry(e) => write!(f, "registry error: {e}"),
            Self::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            Self::Aborted(detail) => write!(f, "receiver aborted: {detail}"),
        }
    }
}

impl Error for ReceiverErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Fusion(e) => Some(e),
            Self::Registry(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
            Self::Aborted(_) => None,
        }
    }
}

impl From<WireErr> for ReceiverErr {
    fn from(value: WireErr) -> Self {
        Self::Wire(value)
    }
}

impl From<FusionErr> for ReceiverErr {
    fn from(value: FusionErr) -> Self {
        Self::Fusion(value)
    }
}

impl From<RegistryErr> for ReceiverErr {
    fn from(value: RegistryErr) -> Self {
        Self::Registry(value)
    }
}

impl From<CheckpointErr> for ReceiverErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<ReceiverErr> for io::Error {
    fn from(value: ReceiverErr) -> Self {
        match value {
            ReceiverErr::Checkpoint(e) => e.into(),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
