//! Key/value rendezvous used to publish operations and handshake data.

mod error;
mod memory;
mod rendezvous;
mod tcp;

use std::time::Duration;

pub use error::{Result, StoreErr};
pub use memory::MemoryStore;
pub use rendezvous::RendezvousStore;
pub use tcp::{StoreServer, TcpStore};

/// How long a `get` may wait for the key to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Fails with `KeyNotFound` if the key is absent right now.
    NoWait,
    /// Waits up to the given duration, then fails with `Timeout`.
    Wait(Duration),
}

/// Reads `key` and decodes it as UTF-8.
pub async fn get_string<S: RendezvousStore>(store: &S, key: &str, mode: GetMode) -> Result<String> {
    let bytes = store.get(key, mode).await?;
    String::from_utf8(bytes).map_err(|e| StoreErr::Encoding(format!("{key}: {e}")))
}

/// Reads `key` and parses its UTF-8 value.
pub async fn get_parsed<S, T>(store: &S, key: &str, mode: GetMode) -> Result<T>
where
    S: RendezvousStore,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_string(store, key, mode).await?;
    raw.trim()
        .parse()
        .map_err(|e| StoreErr::Encoding(format!("{key}={raw}: {e}")))
}
