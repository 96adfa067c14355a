use std::collections::BTreeMap;

use comms::{
    Collective, RendezvousStore, StoreErr, Tensor,
    sparse::{self, SparseResult, SparseResultMetadata},
    specs::{
        handshake::Handshake,
        operation::{self, Forward, Hyperparameters, Operation, OptimizeStep, TrainStep},
    },
};
use log::{debug, info};
use worker::{Backend, Batch, Trainer, batch};

use crate::error::{OrchestratorError, Result};

/// The sender side of the control loop.
///
/// Publishes one operation per iteration, then broadcasts its payloads and
/// runs it on the local trainer, the same way every worker does.
pub struct Coordinator<C, S, B> {
    collective: C,
    store: S,
    backend: B,
    trainer: Option<Box<dyn Trainer>>,
    iteration: u64,
}

impl<C, S, B> Coordinator<C, S, B>
where
    C: Collective,
    S: RendezvousStore,
    B: Backend,
{
    /// Creates a new `Coordinator`.
    ///
    /// # Arguments
    /// * `collective` - The training group, this process must be its sender rank.
    /// * `store` - Where operations get published.
    /// * `backend` - The local copy of the model.
    ///
    /// # Returns
    /// A new coordinator or an `InvalidConfig` error.
    pub fn new(collective: C, store: S, backend: B) -> Result<Self> {
        if !collective.is_sender() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "the coordinator must be rank {}, got rank {}",
                collective.sender_rank(),
                collective.rank()
            )));
        }

        Ok(Self {
            collective,
            store,
            backend,
            trainer: None,
            iteration: 0,
        })
    }

    /// The index the next operation will be published under.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    pub async fn publish_handshake(&mut self, handshake: &Handshake) -> Result<()> {
        handshake.publish(&self.store).await?;
        info!(
            architecture = handshake.architecture.as_str(),
            dp = handshake.dp,
            tp = handshake.tp;
            "handshake published"
        );
        Ok(())
    }

    pub async fn configure(&mut self, hyperparameters: Hyperparameters) -> Result<()> {
        if hyperparameters.grad_accum_in_fp32 && !self.backend.supports_fp32_grad_accum() {
            return Err(OrchestratorError::InvalidConfig(
                "float32 gradient accumulation is not supported".into(),
            ));
        }

        let trainer = self
            .backend
            .configure(&hyperparameters)
            .map_err(|source| OrchestratorError::Trainer {
                iteration: self.iteration,
                operation: "configure",
                source,
            })?;

        self.publish(&Operation::Configure(hyperparameters)).await?;
        self.trainer = Some(trainer);
        Ok(())
    }

    /// Runs a train step on every rank.
    ///
    /// The batch descriptor and the sparse results fields of `step` are
    /// filled in from `batch` and `results`.
    ///
    /// # Returns
    /// The loss averaged over the group.
    pub async fn train(
        &mut self,
        mut step: TrainStep,
        batch: &mut Batch,
        results: &[Vec<SparseResult>],
    ) -> Result<f32> {
        self.ensure_configured("train")?;

        step.batch = batch.descriptor();
        step.sparse_results_len = results.len();
        step.sparse_results_metadata = SparseResultMetadata::from_results(results)?;

        let iteration = self.publish(&Operation::Train(step.clone())).await?;
        sparse::send_sparse_results(&mut self.collective, results).await?;
        batch::send_batch(&mut self.collective, batch).await?;

        let loss = self
            .local_trainer("train")?
            .train(&step, batch, results)
            .map_err(|source| OrchestratorError::Trainer {
                iteration,
                operation: "train",
                source,
            })?;

        let mut total = [loss];
        self.collective.all_reduce_sum(&mut total).await?;
        let loss = total[0] / self.collective.world_size() as f32;

        debug!(iteration = iteration, step = step.step, loss = loss; "train step done");
        Ok(loss)
    }

    /// Applies `results` on every rank.
    pub async fn optimize(&mut self, mut step: OptimizeStep, results: &[Vec<SparseResult>]) -> Result<()> {
        self.ensure_configured("optimize")?;

        step.sparse_results_len = results.len();
        step.sparse_results_metadata = SparseResultMetadata::from_results(results)?;

        let iteration = self.publish(&Operation::Optimize(step.clone())).await?;
        sparse::send_sparse_results(&mut self.collective, results).await?;

        self.local_trainer("optimize")?
            .optimize(&step, results)
            .map_err(|source| OrchestratorError::Trainer {
                iteration,
                operation: "optimize",
                source,
            })
    }

    /// Has every rank materialise its parameters.
    ///
    /// # Returns
    /// The local copy of the parameters.
    pub async fn extract(&mut self) -> Result<BTreeMap<String, Tensor>> {
        self.ensure_configured("extract")?;

        let iteration = self.publish(&Operation::Extract).await?;
        self.local_trainer("extract")?
            .extract()
            .map_err(|source| OrchestratorError::Trainer {
                iteration,
                operation: "extract",
                source,
            })
    }

    /// Runs inference on every rank, losses are not reduced.
    ///
    /// # Returns
    /// The local loss when `batch` carries labels.
    pub async fn forward(
        &mut self,
        batch: &mut Batch,
        logits_to_keep: Option<i64>,
        loss_scale: Option<f64>,
    ) -> Result<Option<f32>> {
        self.ensure_configured("forward")?;

        let forward = Forward {
            batch: batch.descriptor(),
            logits_to_keep,
            loss_scale,
        };

        let iteration = self.publish(&Operation::Forward(forward.clone())).await?;
        batch::send_batch(&mut self.collective, batch).await?;

        self.backend
            .forward(batch, &forward)
            .map_err(|source| OrchestratorError::Trainer {
                iteration,
                operation: "forward",
                source,
            })
    }

    /// Publishes an explicit `Exit`.
    pub async fn exit(&mut self) -> Result<()> {
        self.publish(&Operation::Exit).await?;
        info!(iterations = self.iteration; "workers told to exit");
        Ok(())
    }

    /// Enters the next iteration's barrier without publishing its key, so
    /// every worker finds nothing and exits.
    pub async fn finish(&mut self) -> Result<()> {
        self.collective.barrier().await?;
        info!(iterations = self.iteration; "control loop finished");
        Ok(())
    }

    /// Writes `op` under the current iteration and releases the workers.
    ///
    /// # Returns
    /// The iteration `op` was published under.
    async fn publish(&mut self, op: &Operation) -> Result<u64> {
        let iteration = self.iteration;
        let key = operation::operation_key(iteration);
        let raw = op.to_json().map_err(StoreErr::from)?;

        self.store.set(&key, &raw).await?;
        self.collective.barrier().await?;
        self.iteration += 1;

        debug!(iteration = iteration, operation = op.kind(); "operation published");
        Ok(iteration)
    }

    fn ensure_configured(&self, operation: &'static str) -> Result<()> {
        match self.trainer {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::NotConfigured { operation }),
        }
    }

    fn local_trainer(&mut self, operation: &'static str) -> Result<&mut dyn Trainer> {
        match self.trainer.as_deref_mut() {
            Some(trainer) => Ok(trainer),
            None => Err(OrchestratorError::NotConfigured { operation }),
        }
    }
}
