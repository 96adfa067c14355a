use std::{collections::BTreeMap, error::Error, fmt};

use comms::{
    Tensor,
    sparse::SparseResult,
    specs::operation::{Forward, Hyperparameters, OptimizeStep, TrainStep},
};

use crate::batch::Batch;

/// A failure inside the numerical backend, opaque to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendErr(pub String);

impl BackendErr {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

impl fmt::Display for BackendErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for BackendErr {}

pub type Result<T> = std::result::Result<T, BackendErr>;

/// The loaded model a worker drives.
pub trait Backend: Send {
    /// Whether gradients can be accumulated in float32.
    fn supports_fp32_grad_accum(&self) -> bool;

    /// Builds the trainer for the given hyperparameters.
    fn configure(&mut self, hyperparameters: &Hyperparameters) -> Result<Box<dyn Trainer>>;

    /// Runs the model without touching its parameters.
    ///
    /// # Returns
    /// The loss when the batch carries labels.
    fn forward(&mut self, batch: &Batch, forward: &Forward) -> Result<Option<f32>>;
}

/// Training state created by `Backend::configure`.
pub trait Trainer: Send {
    /// Applies `results` from the previous step, then runs forward and backward on `batch`.
    ///
    /// # Returns
    /// This rank's loss.
    fn train(&mut self, step: &TrainStep, batch: &Batch, results: &[Vec<SparseResult>]) -> Result<f32>;

    /// Applies `results` to the parameters.
    fn optimize(&mut self, step: &OptimizeStep, results: &[Vec<SparseResult>]) -> Result<()>;

    /// Materialises the full parameters.
    fn extract(&mut self) -> Result<BTreeMap<String, Tensor>>;
}
