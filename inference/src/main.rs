use std::{env, io};

use comms::{TcpGroup, specs::group::GroupSpec};
use inference::{LocalRuntime, ReceiverConfig, attach_receiver};
use log::info;
use model::checkpoint;
use tokio::signal;

const GROUP_ENV_PREFIX: &str = "WEIGHTS";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let files: Vec<String> = env::var("MODEL_FILES")
        .map_err(io::Error::other)?
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect();

    let save_to = env::var("SAVE_PATH").ok();
    let config = ReceiverConfig::from_env()?;
    let spec = GroupSpec::from_env(GROUP_ENV_PREFIX)?;

    let mut runtime = LocalRuntime::new();
    let registry = runtime.load_safetensors(&files)?;

    info!(addr = spec.addr.as_str(), rank = spec.rank, world_size = spec.world_size; "joining weight group");
    let group = TcpGroup::join(&spec).await?;
    let receiver = attach_receiver(&mut runtime, group, config)?;

    tokio::select! {
        ret = receiver.join() => {
            let stats = ret?;
            info!(
                received = stats.received,
                applied = stats.applied,
                fused = stats.fused,
                skipped = stats.skipped_not_found + stats.skipped_mismatch + stats.skipped_unknown_dtype;
                "weight receiver finished"
            );
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    if let Some(path) = save_to {
        checkpoint::save(&path, &registry.snapshot())?;
        info!(path = path.as_str(); "saved parameters");
    }

    Ok(())
}
