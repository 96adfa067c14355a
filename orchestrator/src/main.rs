use std::io;

use comms::{
    StoreServer, TcpGroup,
    specs::handshake::{Handshake, ModelSource},
};
use log::{error, info};
use orchestrator::{Coordinator, CoordinatorConfig, OrchestratorError, Session, WeightBroadcaster};
use tokio::signal;
use worker::DummyBackend;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let cfg = CoordinatorConfig::from_env()?;
    cfg.validate()?;

    let server = StoreServer::bind(&cfg.store_addr).await?;
    let store = server.store();
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            error!("store server stopped: {e}");
        }
    });
    info!(addr = cfg.store_addr.as_str(); "store served");

    let backend = DummyBackend::from_files(&cfg.model_files)?;
    let registry = backend.registry();
    let shapes = registry
        .names()
        .into_iter()
        .filter_map(|name| registry.meta(name))
        .map(|(shape, _)| shape)
        .collect();
    info!(params = registry.len(); "model loaded");

    info!(world_size = cfg.group.world_size; "waiting for workers");
    let group = TcpGroup::join(&cfg.group).await.map_err(OrchestratorError::from)?;
    let mut coordinator = Coordinator::new(group, store, backend)?;

    let handshake = Handshake {
        architecture: cfg.architecture.clone(),
        source: ModelSource::Files(cfg.model_files.clone()),
        dp: cfg.group.world_size,
        tp: 1,
    };
    coordinator.publish_handshake(&handshake).await?;

    let broadcaster: Option<WeightBroadcaster<TcpGroup>> = match &cfg.weights {
        Some(spec) => {
            info!(world_size = spec.world_size; "waiting for inference receivers");
            let group = TcpGroup::join(spec).await.map_err(OrchestratorError::from)?;
            Some(WeightBroadcaster::new(group)?)
        }
        None => None,
    };

    let session = Session::new(coordinator, broadcaster, shapes, cfg.seed);

    tokio::select! {
        ret = session.run(&cfg) => {
            let report = ret?;
            info!(
                steps = report.losses.len(),
                broadcasts = report.broadcasts,
                last_loss:? = report.losses.last();
                "training finished"
            );
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}
