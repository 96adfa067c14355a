pub mod backend;
pub mod batch;
pub mod bootstrap;
pub mod config;
pub mod dummy;
pub mod error;
mod metrics;
mod state;
pub mod worker;

pub use backend::{Backend, BackendErr, Trainer};
pub use batch::Batch;
pub use config::WorkerConfig;
pub use dummy::DummyBackend;
pub use error::WorkerErr;
pub use metrics::WorkerMetrics;
pub use state::WorkerState;
pub use worker::{Snapshot, Worker};
