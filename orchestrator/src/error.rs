use std::{fmt, io};

use comms::{CollectiveErr, StoreErr, sparse::SparseErr, weights::WireErr};
use worker::{BackendErr, WorkerErr};

/// The orchestrator's result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All errors that can occur in the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before publishing anything.
    InvalidConfig(String),
    /// An operation that needs a trainer was issued before `configure`.
    NotConfigured { operation: &'static str },
    /// The local trainer failed while running an operation.
    Trainer {
        iteration: u64,
        operation: &'static str,
        source: BackendErr,
    },
    Collective(CollectiveErr),
    Store(StoreErr),
    Sparse(SparseErr),
    Wire(WireErr),
    Worker(WorkerErr),
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::NotConfigured { operation } => {
                write!(f, "cannot issue {operation} before configuring the trainer")
            }
            Self::Trainer {
                iteration,
                operation,
                source,
            } => write!(f, "local {operation} failed at iteration {iteration}: {source}"),
            Self::Collective(e) => write!(f, "collective error: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Sparse(e) => write!(f, "sparse results error: {e}"),
            Self::Wire(e) => write!(f, "weight broadcast error: {e}"),
            Self::Worker(e) => write!(f, "worker error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Trainer { source, .. } => Some(source),
            Self::Collective(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Sparse(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::Worker(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CollectiveErr> for OrchestratorError {
    fn from(e: CollectiveErr) -> Self {
        Self::Collective(e)
    }
}

impl From<StoreErr> for OrchestratorError {
    fn from(e: StoreErr) -> Self {
        Self::Store(e)
    }
}

impl From<SparseErr> for OrchestratorError {
    fn from(e: SparseErr) -> Self {
        Self::Sparse(e)
    }
}

impl From<WireErr> for OrchestratorError {
    fn from(e: WireErr) -> Self {
        Self::Wire(e)
    }
}

impl From<WorkerErr> for OrchestratorError {
    fn from(e: WorkerErr) -> Self {
        Self::Worker(e)
    }
}

impl From<OrchestratorError> for io::Error {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
