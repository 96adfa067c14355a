//! A deterministic stand-in for a numerical backend.
//!
//! The loss only depends on the batch tokens, and sparse results are applied
//! as `w[idx] -= lr * val / results_len` on the parameters in name order.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use comms::{
    Tensor,
    sparse::SparseResult,
    specs::operation::{Forward, Hyperparameters, OptimizeStep, TrainStep},
};
use log::debug;
use model::{CheckpointErr, ParameterRegistry, checkpoint, transforms};

use crate::{
    backend::{Backend, BackendErr, Result, Trainer},
    batch::Batch,
};

const DEFAULT_LR: f64 = 1.0;

pub struct DummyBackend {
    registry: Arc<ParameterRegistry>,
    fp32_grad_accum: bool,
}

impl DummyBackend {
    pub fn new(registry: Arc<ParameterRegistry>) -> Self {
        Self {
            registry,
            fp32_grad_accum: false,
        }
    }

    /// Loads every `.safetensors` file in `files`, the rest are ignored.
    pub fn from_files<P: AsRef<Path>>(files: &[P]) -> std::result::Result<Self, CheckpointErr> {
        let weights: Vec<&Path> = files
            .iter()
            .map(AsRef::as_ref)
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();

        let params = checkpoint::load_all(&weights)?;
        Ok(Self::new(Arc::new(ParameterRegistry::new(params))))
    }

    pub fn with_fp32_grad_accum(mut self, supported: bool) -> Self {
        self.fp32_grad_accum = supported;
        self
    }

    pub fn registry(&self) -> Arc<ParameterRegistry> {
        Arc::clone(&self.registry)
    }
}

impl Backend for DummyBackend {
    fn supports_fp32_grad_accum(&self) -> bool {
        self.fp32_grad_accum
    }

    fn configure(&mut self, hyperparameters: &Hyperparameters) -> Result<Box<dyn Trainer>> {
        let lr = match hyperparameters.optimizer_spec.get("lr") {
            Some(lr) => lr
                .as_f64()
                .ok_or_else(|| BackendErr::new(format!("optimizer lr must be a number, got {lr}")))?,
            None => DEFAULT_LR,
        };

        Ok(Box::new(DummyTrainer {
            registry: Arc::clone(&self.registry),
            params: self.registry.names().into_iter().map(String::from).collect(),
            lr,
        }))
    }

    fn forward(&mut self, batch: &Batch, forward: &Forward) -> Result<Option<f32>> {
        let scale = forward.loss_scale.unwrap_or(1.0) as f32;
        Ok(batch.labels.is_some().then(|| batch_loss(batch) * scale))
    }
}

struct DummyTrainer {
    registry: Arc<ParameterRegistry>,
    params: Vec<String>,
    lr: f64,
}

impl DummyTrainer {
    fn lr_at(&self, step: u32, warmup: Option<(u32, u32)>) -> f64 {
        match warmup {
            Some((start, end)) if step < end => {
                let span = end.saturating_sub(start).max(1) as f64;
                self.lr * (step.saturating_sub(start) as f64 / span).clamp(0.0, 1.0)
            }
            _ => self.lr,
        }
    }

    fn apply(&self, results: &[Vec<SparseResult>], lr: f64) -> Result<()> {
        let scale = -lr / results.len().max(1) as f64;

        for result in results {
            if result.len() != self.params.len() {
                return Err(BackendErr::new(format!(
                    "expected results for {} parameters, got {}",
                    self.params.len(),
                    result.len()
                )));
            }

            for (name, sparse) in self.params.iter().zip(result) {
                let dense: usize = sparse.xshape.iter().product();
                if dense != sparse.totalk {
                    return Err(BackendErr::new(format!(
                        "{name}: xshape {:?} does not hold {} elements",
                        sparse.xshape, sparse.totalk
                    )));
                }

                let idx = sparse.sparse_idx.to_f64_vec();
                let vals: Vec<f64> = sparse.sparse_val.to_f64_vec().into_iter().map(|v| v * scale).collect();

                self.registry
                    .update_with(name, |param| {
                        if param.numel() != sparse.totalk {
                            return Err(BackendErr::new(format!(
                                "{name} holds {} elements, result is for {}",
                                param.numel(),
                                sparse.totalk
                            )));
                        }
                        transforms::scatter_add(param, &idx, &vals).map_err(|e| BackendErr::new(format!("{name}: {e}")))
                    })
                    .map_err(|e| BackendErr::new(e.to_string()))??;
            }
        }

        debug!(results = results.len(), lr = lr; "applied sparse results");
        Ok(())
    }
}

impl Trainer for DummyTrainer {
    fn train(&mut self, step: &TrainStep, batch: &Batch, results: &[Vec<SparseResult>]) -> Result<f32> {
        self.apply(results, self.lr_at(step.step, step.warmup_lr_range))?;
        Ok(batch_loss(batch))
    }

    fn optimize(&mut self, step: &OptimizeStep, results: &[Vec<SparseResult>]) -> Result<()> {
        self.apply(results, self.lr_at(step.step, step.warmup_lr_range))
    }

    fn extract(&mut self) -> Result<BTreeMap<String, Tensor>> {
        Ok(self.registry.snapshot())
    }
}

/// `ln(1 + mean(input_ids))`
fn batch_loss(batch: &Batch) -> f32 {
    let ids = batch.input_ids.to_f64_vec();
    let mean = ids.iter().sum::<f64>() / ids.len().max(1) as f64;
    mean.max(0.0).ln_1p() as f32
}
