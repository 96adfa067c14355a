use std::io;

use comms::{TcpGroup, TcpStore, specs::handshake::ModelSource};
use log::info;
use tokio::signal;

use worker::{DummyBackend, WorkerConfig, bootstrap};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let cfg = WorkerConfig::from_env()?;
    info!(
        rank = cfg.group.rank,
        world_size = cfg.group.world_size,
        store = cfg.store_addr.as_str();
        "starting worker"
    );

    let store = TcpStore::connect(&cfg.store_addr, cfg.handshake_timeout).await?;
    let group = TcpGroup::join(&cfg.group).await?;
    info!("joined the group");

    let run = bootstrap::run_bootstrapped(group, store, &cfg, |handshake| {
        let ModelSource::Files(files) = &handshake.source;
        info!(architecture = handshake.architecture.as_str(), files = files.len(); "loading model");
        Ok(DummyBackend::from_files(files)?)
    });

    tokio::select! {
        ret = run => {
            let metrics = ret?;
            info!(
                iterations = metrics.iterations,
                train_steps = metrics.train_steps,
                last_loss:? = metrics.last_loss();
                "wrapping up, disconnecting..."
            );
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}
