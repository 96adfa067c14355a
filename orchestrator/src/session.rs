use comms::{
    Collective, RendezvousStore, Tensor,
    sparse::SparseResult,
    specs::operation::{Hyperparameters, OptimizeStep, TrainStep},
};
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::index};
use serde_json::json;
use worker::{Backend, Batch};

use crate::{
    Coordinator, CoordinatorConfig, WeightBroadcaster,
    error::{OrchestratorError, Result},
};

/// What a finished session did.
#[derive(Debug, Default, Clone)]
pub struct SessionReport {
    /// The group-averaged loss of every step.
    pub losses: Vec<f32>,
    /// How many times the weights were pushed to the receivers.
    pub broadcasts: usize,
}

/// Drives a full training run from the coordinator.
///
/// Batches are random tokens and every rank contributes one random sparse
/// result per step, which the next step applies before training.
pub struct Session<C, S, B, W> {
    coordinator: Coordinator<C, S, B>,
    broadcaster: Option<WeightBroadcaster<W>>,
    /// Dense shapes of the trainable parameters, in name order.
    shapes: Vec<Vec<usize>>,
    rng: StdRng,
}

impl<C, S, B, W> Session<C, S, B, W>
where
    C: Collective,
    S: RendezvousStore,
    B: Backend,
    W: Collective,
{
    /// Creates a new `Session`.
    ///
    /// # Arguments
    /// * `coordinator` - The coordinator of the training group.
    /// * `broadcaster` - Where extracted weights go, if anywhere.
    /// * `shapes` - The dense shape of every trainable parameter, in name order.
    /// * `seed` - Seeds batches and results, `None` draws one from the OS.
    pub fn new(
        coordinator: Coordinator<C, S, B>,
        broadcaster: Option<WeightBroadcaster<W>>,
        shapes: Vec<Vec<usize>>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            coordinator,
            broadcaster,
            shapes,
            rng,
        }
    }

    /// Runs `cfg.steps` train steps, then a final optimize, then tells
    /// workers and receivers to stop.
    pub async fn run(mut self, cfg: &CoordinatorConfig) -> Result<SessionReport> {
        let mut report = SessionReport::default();

        self.coordinator
            .configure(Hyperparameters {
                lr_scheduler_spec: json!({"constant": {}}),
                optimizer_spec: json!({"lr": cfg.lr}),
                micro_batch_size: cfg.batch_shape[0],
                grad_accum_in_fp32: false,
            })
            .await?;

        let mut results = Vec::new();
        for step in 0..cfg.steps {
            let mut batch = self.random_batch(cfg)?;
            let train = TrainStep {
                step,
                zero_optimizer: true,
                batch_id: (step as u64, 0),
                batch: batch.descriptor(),
                warmup_lr_range: None,
                sparse_results_len: 0,
                sparse_results_metadata: None,
            };

            let loss = self.coordinator.train(train, &mut batch, &results).await?;
            info!(step = step, loss = loss; "train step");
            report.losses.push(loss);

            results = self.random_results(cfg.topk)?;

            if (step + 1) % cfg.extract_every == 0 {
                report.broadcasts += self.push_weights().await?;
            }
        }

        let optimize = OptimizeStep {
            step: cfg.steps,
            warmup_lr_range: None,
            sparse_results_len: 0,
            sparse_results_metadata: None,
        };
        self.coordinator.optimize(optimize, &results).await?;
        report.broadcasts += self.push_weights().await?;

        self.coordinator.exit().await?;
        if let Some(broadcaster) = &mut self.broadcaster {
            broadcaster.broadcast_shutdown().await?;
        }

        Ok(report)
    }

    async fn push_weights(&mut self) -> Result<usize> {
        let params = self.coordinator.extract().await?;

        match &mut self.broadcaster {
            Some(broadcaster) => {
                broadcaster.broadcast_state_dict(params).await?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn random_batch(&mut self, cfg: &CoordinatorConfig) -> Result<Batch> {
        let numel = cfg.batch_shape.iter().product();
        let ids: Vec<i64> = (0..numel).map(|_| self.rng.random_range(0..cfg.vocab_size)).collect();

        let input_ids = Tensor::from_vec(cfg.batch_shape.clone(), ids).map_err(invalid)?;
        Batch::new(input_ids.clone())
            .and_then(|batch| batch.with_labels(input_ids))
            .map_err(invalid)
    }

    /// One result per rank, `topk` distinct entries per parameter.
    fn random_results(&mut self, topk: usize) -> Result<Vec<Vec<SparseResult>>> {
        if self.shapes.is_empty() {
            return Ok(Vec::new());
        }

        let world_size = self.coordinator.world_size();
        let mut results = Vec::with_capacity(world_size);

        for _ in 0..world_size {
            let mut result = Vec::with_capacity(self.shapes.len());

            for xshape in &self.shapes {
                let totalk: usize = xshape.iter().product();
                let k = topk.min(totalk);

                let idx: Vec<i64> = index::sample(&mut self.rng, totalk, k)
                    .into_iter()
                    .map(|i| i as i64)
                    .collect();
                let val: Vec<f32> = (0..k).map(|_| self.rng.random_range(-1.0..1.0)).collect();

                result.push(SparseResult {
                    sparse_idx: Tensor::from_vec(vec![k], idx).map_err(invalid)?,
                    sparse_val: Tensor::from_vec(vec![k], val).map_err(invalid)?,
                    xshape: xshape.clone(),
                    totalk,
                });
            }

            results.push(result);
        }

        Ok(results)
    }
}

fn invalid(e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::InvalidConfig(e.to_string())
}
