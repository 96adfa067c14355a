//! The inference side of weight synchronization.

mod error;
pub mod fusion;
pub mod receiver;
pub mod runtime;

pub use error::{ReceiverErr, Result};
pub use fusion::{FusionConfig, FusionLayer};
pub use receiver::{ReceiverConfig, ReceiverStats, UpdateMode, WeightReceiver};
pub use runtime::{InferenceRuntime, LocalRuntime, attach_receiver};
