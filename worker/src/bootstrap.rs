use comms::{Collective, RendezvousStore, specs::handshake::Handshake};
use log::{debug, info};

use crate::{Backend, Worker, WorkerConfig, WorkerMetrics, error::Result};

/// Runs a worker once the coordinator published the handshake.
///
/// # Args
/// * `collective` - The group this worker already joined.
/// * `store` - Where the handshake and the operations are published.
/// * `cfg` - The worker's configuration.
/// * `make_backend` - Loads the model the handshake describes.
///
/// # Returns
/// The worker's metrics after it left the control loop.
pub async fn run_bootstrapped<C, S, B, F>(collective: C, store: S, cfg: &WorkerConfig, make_backend: F) -> Result<WorkerMetrics>
where
    C: Collective,
    S: RendezvousStore,
    B: Backend,
    F: FnOnce(&Handshake) -> Result<B>,
{
    info!(rank = cfg.group.rank; "waiting for handshake");
    let handshake = Handshake::fetch(&store, cfg.handshake_timeout).await?;

    debug!(
        architecture = handshake.architecture.as_str(),
        dp = handshake.dp,
        tp = handshake.tp;
        "received handshake"
    );

    let backend = make_backend(&handshake)?;
    let mut worker = Worker::new(collective, store, backend).with_fetch_mode(cfg.fetch_mode());
    worker.run().await
}
