use std::time::Duration;

use crate::store::{self, GetMode, RendezvousStore, Result, StoreErr};

const ARCHITECTURE_KEY: &str = "architecture";
const SOURCE_KEY: &str = "source";
const FILES_KEY: &str = "files";
const DP_KEY: &str = "dp";
const TP_KEY: &str = "tp";

/// Where workers load the model from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Files(Vec<String>),
}

/// One-time data every worker reads before its first operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub architecture: String,
    pub source: ModelSource,
    /// Data parallel degree.
    pub dp: usize,
    /// Tensor parallel degree.
    pub tp: usize,
}

impl Handshake {
    /// Writes every handshake key, the source kind goes last.
    pub async fn publish<S: RendezvousStore>(&self, store: &S) -> Result<()> {
        store.set(ARCHITECTURE_KEY, self.architecture.as_bytes()).await?;
        store.set(DP_KEY, self.dp.to_string().as_bytes()).await?;
        store.set(TP_KEY, self.tp.to_string().as_bytes()).await?;

        match &self.source {
            ModelSource::Files(files) => {
                store.set(FILES_KEY, &serde_json::to_vec(files)?).await?;
                store.set(SOURCE_KEY, b"files").await?;
            }
        }

        Ok(())
    }

    /// Waits up to `timeout` for the handshake and reads it.
    pub async fn fetch<S: RendezvousStore>(store: &S, timeout: Duration) -> Result<Self> {
        let mode = GetMode::Wait(timeout);
        let architecture = store::get_string(store, ARCHITECTURE_KEY, mode).await?;

        let source = match store::get_string(store, SOURCE_KEY, mode).await?.as_str() {
            "files" => {
                let raw = store.get(FILES_KEY, mode).await?;
                ModelSource::Files(serde_json::from_slice(&raw)?)
            }
            other => return Err(StoreErr::Encoding(format!("unsupported source type {other}"))),
        };

        let dp = store::get_parsed(store, DP_KEY, mode).await?;
        let tp = store::get_parsed(store, TP_KEY, mode).await?;

        Ok(Self {
            architecture,
            source,
            dp,
            tp,
        })
    }
}
