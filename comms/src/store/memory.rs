use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, time};

use super::{GetMode, RendezvousStore, Result, StoreErr};

struct Inner {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    version: watch::Sender<u64>,
}

/// An in-process store, cloned handles share the same entries.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                version,
            }),
        }
    }

    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.entries.lock().get(key).cloned()
    }

    fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn wait_until<F>(&self, timeout: Duration, mut ready: F) -> bool
    where
        F: FnMut() -> bool + Send,
    {
        let deadline = time::Instant::now() + timeout;
        let mut changes = self.inner.version.subscribe();

        loop {
            if ready() {
                return true;
            }

            match time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return ready(),
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousStore for MemoryStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner
            .entries
            .lock()
            .insert(key.to_string(), value.to_vec());

        self.inner.version.send_modify(|version| *version += 1);
        Ok(())
    }

    async fn get(&self, key: &str, mode: GetMode) -> Result<Vec<u8>> {
        match mode {
            GetMode::NoWait => self
                .lookup(key)
                .ok_or_else(|| StoreErr::KeyNotFound(key.to_string())),
            GetMode::Wait(timeout) => {
                if self.wait_until(timeout, || self.contains(key)).await {
                    self.lookup(key)
                        .ok_or_else(|| StoreErr::KeyNotFound(key.to_string()))
                } else {
                    Err(StoreErr::Timeout(vec![key.to_string()]))
                }
            }
        }
    }

    async fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        let ready = self
            .wait_until(timeout, || keys.iter().all(|key| self.contains(key)))
            .await;

        if ready {
            return Ok(());
        }

        let missing = keys
            .iter()
            .filter(|key| !self.contains(key))
            .map(|key| key.to_string())
            .collect();

        Err(StoreErr::Timeout(missing))
    }
}
