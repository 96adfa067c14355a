//! Parameter storage and the tensor transforms applied to incoming weights.

pub mod checkpoint;
mod error;
pub mod registry;
pub mod transforms;

pub use checkpoint::CheckpointErr;
pub use error::{RegistryErr, TransformErr};
pub use registry::ParameterRegistry;
