mod broadcaster;
pub mod config;
mod coordinator;
pub mod error;
pub mod session;

pub use broadcaster::WeightBroadcaster;
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::OrchestratorError;
pub use session::{Session, SessionReport};
