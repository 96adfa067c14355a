use std::{env, io, time::Duration};

use comms::{GetMode, specs::group::GroupSpec};

const GROUP_ENV_PREFIX: &str = "GROUP";
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Immutable execution bounds for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub group: GroupSpec,
    /// Where the rendezvous store is served.
    pub store_addr: String,
    pub handshake_timeout: Duration,
    /// How long to wait for the next operation, `None` means not at all.
    pub op_wait: Option<Duration>,
}

impl WorkerConfig {
    /// Creates a new worker configuration.
    ///
    /// # Args
    /// * `group` - The collective group this worker joins.
    /// * `store_addr` - The rendezvous store address.
    ///
    /// # Returns
    /// A `WorkerConfig` that reads operations without waiting.
    pub fn new(group: GroupSpec, store_addr: impl Into<String>) -> Self {
        Self {
            group,
            store_addr: store_addr.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            op_wait: None,
        }
    }

    /// Reads the configuration from the environment.
    ///
    /// `GROUP_ADDR`, `GROUP_WORLD_SIZE`, `GROUP_RANK` and `STORE_ADDR` are
    /// required, `HANDSHAKE_TIMEOUT_MS` and `OP_WAIT_MS` are optional.
    pub fn from_env() -> io::Result<Self> {
        let group = GroupSpec::from_env(GROUP_ENV_PREFIX)?;
        let store_addr = env::var("STORE_ADDR")
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("STORE_ADDR: {e}")))?;

        let mut cfg = Self::new(group, store_addr);
        if let Some(ms) = millis("HANDSHAKE_TIMEOUT_MS")? {
            cfg.handshake_timeout = ms;
        }
        cfg.op_wait = millis("OP_WAIT_MS")?;

        Ok(cfg)
    }

    /// How the next operation is read from the store.
    pub fn fetch_mode(&self) -> GetMode {
        match self.op_wait {
            Some(wait) => GetMode::Wait(wait),
            None => GetMode::NoWait,
        }
    }
}

fn millis(name: &str) -> io::Result<Option<Duration>> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };

    raw.trim()
        .parse()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{name}={raw}: {e}")))
}
