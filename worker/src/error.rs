use std::{error::Error, fmt, io};

use comms::{CollectiveErr, StoreErr, sparse::SparseErr};
use model::CheckpointErr;

use crate::backend::BackendErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures, every one of them ends the control loop.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Collective(CollectiveErr),
    Store(StoreErr),
    Sparse(SparseErr),
    Checkpoint(CheckpointErr),
    Decode {
        iteration: u64,
        detail: String,
    },
    NotConfigured {
        iteration: u64,
        operation: &'static str,
    },
    Fp32AccumUnsupported {
        iteration: u64,
    },
    MissingMetadata {
        iteration: u64,
        results_len: usize,
    },
    Backend {
        iteration: u64,
        operation: &'static str,
        source: BackendErr,
    },
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Collective(e) => write!(f, "collective error: {e}"),
            WorkerErr::Store(e) => write!(f, "store error: {e}"),
            WorkerErr::Sparse(e) => write!(f, "sparse results error: {e}"),
            WorkerErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            WorkerErr::Decode { iteration, detail } => {
                write!(f, "invalid operation at iteration {iteration}: {detail}")
            }
            WorkerErr::NotConfigured {
                iteration,
                operation,
            } => write!(
                f,
                "got {operation} at iteration {iteration} before the trainer was configured"
            ),
            WorkerErr::Fp32AccumUnsupported { iteration } => write!(
                f,
                "float32 gradient accumulation requested at iteration {iteration} is not supported"
            ),
            WorkerErr::MissingMetadata {
                iteration,
                results_len,
            } => write!(
                f,
                "{results_len} sparse results announced at iteration {iteration} without metadata"
            ),
            WorkerErr::Backend {
                iteration,
                operation,
                source,
            } => write!(f, "{operation} failed at iteration {iteration}: {source}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Collective(e) => Some(e),
            WorkerErr::Store(e) => Some(e),
            WorkerErr::Sparse(e) => Some(e),
            WorkerErr::Checkpoint(e) => Some(e),
            WorkerErr::Backend { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CollectiveErr> for WorkerErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

impl From<StoreErr> for WorkerErr {
    fn from(value: StoreErr) -> Self {
        Self::Store(value)
    }
}

impl From<SparseErr> for WorkerErr {
    fn from(value: SparseErr) -> Self {
        Self::Sparse(value)
    }
}

impl From<CheckpointErr> for WorkerErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
