use std::time::Duration;

use super::{GetMode, Result};

/// A shared key/value store every participant can reach.
#[allow(unused)]
#[trait_variant::make(RendezvousStore: Send)]
pub trait RendezvousStoreTemplate: Sync {
    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Reads the value under `key`.
    ///
    /// # Arguments
    /// * `key` - The key to read.
    /// * `mode` - Whether to wait for the key to appear.
    ///
    /// # Returns
    /// The value, `KeyNotFound` for an absent key on `NoWait`, or `Timeout`.
    async fn get(&self, key: &str, mode: GetMode) -> Result<Vec<u8>>;

    /// Waits until every key in `keys` is present.
    async fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()>;
}
