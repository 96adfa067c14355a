use std::{collections::BTreeMap, time::Instant};

use comms::{
    Collective, GetMode, RendezvousStore, StoreErr, Tensor,
    sparse::{self, SparseResult, SparseResultMetadata},
    specs::operation::{self, Forward, Hyperparameters, Operation, OptimizeStep, TrainStep},
};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::{
    backend::{Backend, Trainer},
    batch,
    error::{Result, WorkerErr},
    metrics::WorkerMetrics,
    state::WorkerState,
};

/// The parameters materialised by an `Extract` operation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub iteration: u64,
    pub params: BTreeMap<String, Tensor>,
}

enum Flow {
    Continue,
    Exit,
}

/// Executes the operations published in the store, one per iteration.
///
/// Every rank of the group runs one `Worker`, and all of them go through the
/// same operations in the same order.
pub struct Worker<C, S, B> {
    collective: C,
    store: S,
    backend: B,
    trainer: Option<Box<dyn Trainer>>,
    state: WorkerState,
    fetch_mode: GetMode,
    snapshots: Option<mpsc::Sender<Snapshot>>,
    metrics: WorkerMetrics,
}

impl<C, S, B> Worker<C, S, B>
where
    C: Collective,
    S: RendezvousStore,
    B: Backend,
{
    /// Creates a new `Worker`.
    ///
    /// # Args
    /// * `collective` - The group operations' payloads travel through.
    /// * `store` - Where operations are published.
    /// * `backend` - The loaded model.
    ///
    /// # Returns
    /// A worker that reads operations without waiting for them.
    pub fn new(collective: C, store: S, backend: B) -> Self {
        Self {
            collective,
            store,
            backend,
            trainer: None,
            state: WorkerState::Uninitialized,
            fetch_mode: GetMode::NoWait,
            snapshots: None,
            metrics: WorkerMetrics::default(),
        }
    }

    pub fn with_fetch_mode(mut self, mode: GetMode) -> Self {
        self.fetch_mode = mode;
        self
    }

    /// Sends every extracted parameter set to `tx`.
    pub fn with_snapshots(mut self, tx: mpsc::Sender<Snapshot>) -> Self {
        self.snapshots = Some(tx);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs the control loop until an `Exit` operation, a missing operation
    /// or the first failure.
    ///
    /// Every iteration starts with a barrier, so no rank reads the key of an
    /// iteration before the coordinator published it.
    ///
    /// # Returns
    /// What the worker did while running.
    ///
    /// # Errors
    /// Any `WorkerErr`, after logging it along with the iteration.
    pub async fn run(&mut self) -> Result<WorkerMetrics> {
        self.state = WorkerState::Ready;

        let rank = self.collective.rank();
        info!(rank = rank, world_size = self.collective.world_size(); "worker started");

        let mut iteration = 0;
        while self.state.is_running() {
            match self.step(iteration).await {
                Ok(Flow::Continue) => iteration += 1,
                Ok(Flow::Exit) => {
                    info!(rank = rank, iteration = iteration; "exiting");
                    self.state = WorkerState::Terminated;
                }
                Err(e) => {
                    error!(rank = rank, iteration = iteration; "worker failed: {e}");
                    self.state = WorkerState::Terminated;
                    return Err(e);
                }
            }
        }

        Ok(std::mem::take(&mut self.metrics))
    }

    async fn step(&mut self, iteration: u64) -> Result<Flow> {
        self.collective.barrier().await?;

        let Some(op) = self.fetch(iteration).await? else {
            info!(iteration = iteration; "no operation published");
            return Ok(Flow::Exit);
        };

        self.metrics.bump_iteration();
        debug!(iteration = iteration, operation = op.kind(); "dispatching");

        match op {
            Operation::Configure(hyperparameters) => self.configure(iteration, &hyperparameters)?,
            Operation::Train(step) => self.train(iteration, &step).await?,
            Operation::Optimize(step) => self.optimize(iteration, &step).await?,
            Operation::Extract => self.extract(iteration).await?,
            Operation::Forward(forward) => self.forward(iteration, &forward).await?,
            Operation::Exit => return Ok(Flow::Exit),
        }

        Ok(Flow::Continue)
    }

    async fn fetch(&mut self, iteration: u64) -> Result<Option<Operation>> {
        let key = operation::operation_key(iteration);

        match self.store.get(&key, self.fetch_mode).await {
            Ok(raw) => Operation::from_json(&raw)
                .map(Some)
                .map_err(|e| WorkerErr::Decode {
                    iteration,
                    detail: e.to_string(),
                }),
            Err(StoreErr::KeyNotFound(_) | StoreErr::Timeout(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn configure(&mut self, iteration: u64, hyperparameters: &Hyperparameters) -> Result<()> {
        if hyperparameters.grad_accum_in_fp32 && !self.backend.supports_fp32_grad_accum() {
            return Err(WorkerErr::Fp32AccumUnsupported { iteration });
        }

        let trainer = self
            .backend
            .configure(hyperparameters)
            .map_err(|source| WorkerErr::Backend {
                iteration,
                operation: "configure",
                source,
            })?;

        if self.trainer.replace(trainer).is_some() {
            warn!(iteration = iteration; "replacing the configured trainer");
        }

        info!(iteration = iteration, micro_batch_size = hyperparameters.micro_batch_size; "trainer configured");
        Ok(())
    }

    async fn train(&mut self, iteration: u64, step: &TrainStep) -> Result<()> {
        self.configured(iteration, "train")?;

        let start = Instant::now();
        let results = self
            .recv_results(iteration, step.sparse_results_len, step.sparse_results_metadata.as_ref())
            .await?;
        let batch = batch::recv_batch(&mut self.collective, &step.batch).await?;
        self.metrics.recv_time += start.elapsed();

        let start = Instant::now();
        let loss = self
            .configured(iteration, "train")?
            .train(step, &batch, &results)
            .map_err(|source| WorkerErr::Backend {
                iteration,
                operation: "train",
                source,
            })?;
        self.metrics.compute_time += start.elapsed();

        let loss = self.group_mean(loss).await?;
        debug!(iteration = iteration, step = step.step, loss = loss; "train step done");
        self.metrics.push_loss(loss);
        Ok(())
    }

    async fn optimize(&mut self, iteration: u64, step: &OptimizeStep) -> Result<()> {
        self.configured(iteration, "optimize")?;

        let start = Instant::now();
        let results = self
            .recv_results(iteration, step.sparse_results_len, step.sparse_results_metadata.as_ref())
            .await?;
        self.metrics.recv_time += start.elapsed();

        let start = Instant::now();
        self.configured(iteration, "optimize")?
            .optimize(step, &results)
            .map_err(|source| WorkerErr::Backend {
                iteration,
                operation: "optimize",
                source,
            })?;
        self.metrics.compute_time += start.elapsed();

        self.metrics.optimize_steps += 1;
        Ok(())
    }

    async fn extract(&mut self, iteration: u64) -> Result<()> {
        let params = self
            .configured(iteration, "extract")?
            .extract()
            .map_err(|source| WorkerErr::Backend {
                iteration,
                operation: "extract",
                source,
            })?;

        self.metrics.extracts += 1;
        info!(iteration = iteration, params = params.len(); "parameters extracted");

        if let Some(tx) = &self.snapshots {
            if tx.send(Snapshot { iteration, params }).await.is_err() {
                warn!(iteration = iteration; "snapshot receiver is gone");
            }
        }

        Ok(())
    }

    async fn forward(&mut self, iteration: u64, forward: &Forward) -> Result<()> {
        self.configured(iteration, "forward")?;

        let start = Instant::now();
        let batch = batch::recv_batch(&mut self.collective, &forward.batch).await?;
        self.metrics.recv_time += start.elapsed();

        let start = Instant::now();
        let loss = self
            .backend
            .forward(&batch, forward)
            .map_err(|source| WorkerErr::Backend {
                iteration,
                operation: "forward",
                source,
            })?;
        self.metrics.compute_time += start.elapsed();

        self.metrics.forwards += 1;
        debug!(iteration = iteration, loss:? = loss; "forward done");
        Ok(())
    }

    fn configured(&mut self, iteration: u64, operation: &'static str) -> Result<&mut dyn Trainer> {
        match self.trainer.as_deref_mut() {
            Some(trainer) => Ok(trainer),
            None => Err(WorkerErr::NotConfigured { iteration, operation }),
        }
    }

    async fn recv_results(
        &mut self,
        iteration: u64,
        results_len: usize,
        metadata: Option<&SparseResultMetadata>,
    ) -> Result<Vec<Vec<SparseResult>>> {
        if results_len == 0 {
            return Ok(Vec::new());
        }

        let metadata = metadata.ok_or(WorkerErr::MissingMetadata {
            iteration,
            results_len,
        })?;

        let results = sparse::broadcast_sparse_results(&mut self.collective, results_len, metadata).await?;
        self.metrics.add_sparse_results(results_len);
        Ok(results)
    }

    /// Averages `value` over the group, every rank gets the same result.
    async fn group_mean(&mut self, value: f32) -> Result<f32> {
        let mut total = [value];
        self.collective.all_reduce_sum(&mut total).await?;
        Ok(total[0] / self.collective.world_size() as f32)
    }
}
