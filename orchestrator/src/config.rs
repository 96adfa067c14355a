use std::{env, io, str::FromStr};

use comms::specs::group::GroupSpec;

use crate::error::{OrchestratorError, Result};

const DEFAULT_ARCHITECTURE: &str = "dummy";
const DEFAULT_STEPS: u32 = 10;
const DEFAULT_BATCH_SHAPE: [usize; 2] = [2, 128];
const DEFAULT_LR: f64 = 0.01;
const DEFAULT_TOPK: usize = 4;
const DEFAULT_VOCAB_SIZE: i64 = 32_000;

/// What the orchestrator binary runs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// The training group, the orchestrator is its rank 0.
    pub group: GroupSpec,
    /// Inference receivers, `None` skips weight broadcasting.
    pub weights: Option<GroupSpec>,
    /// Where the rendezvous store is served.
    pub store_addr: String,
    pub architecture: String,
    pub model_files: Vec<String>,
    pub steps: u32,
    pub batch_shape: Vec<usize>,
    pub lr: f64,
    /// Sparse entries per parameter in every synthetic result.
    pub topk: usize,
    pub vocab_size: i64,
    /// Weights are extracted and broadcast every this many steps.
    pub extract_every: u32,
    pub seed: Option<u64>,
}

impl CoordinatorConfig {
    pub fn new(group: GroupSpec, store_addr: impl Into<String>, model_files: Vec<String>) -> Self {
        Self {
            group,
            weights: None,
            store_addr: store_addr.into(),
            architecture: DEFAULT_ARCHITECTURE.to_string(),
            model_files,
            steps: DEFAULT_STEPS,
            batch_shape: DEFAULT_BATCH_SHAPE.to_vec(),
            lr: DEFAULT_LR,
            topk: DEFAULT_TOPK,
            vocab_size: DEFAULT_VOCAB_SIZE,
            extract_every: DEFAULT_STEPS,
            seed: None,
        }
    }

    /// Reads the configuration from the environment.
    ///
    /// `GROUP_*`, `STORE_ADDR` and `MODEL_FILES` (comma separated) are
    /// required. `WEIGHTS_*` enables weight broadcasting when `WEIGHTS_ADDR`
    /// is set. `ARCHITECTURE`, `STEPS`, `BATCH_SIZE`, `SEQ_LEN`, `LR`, `TOPK`,
    /// `VOCAB_SIZE`, `EXTRACT_EVERY` and `SEED` are optional.
    pub fn from_env() -> io::Result<Self> {
        let group = GroupSpec::from_env("GROUP")?;
        let store_addr = required("STORE_ADDR")?;
        let model_files = required("MODEL_FILES")?
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect();

        let mut cfg = Self::new(group, store_addr, model_files);

        if env::var("WEIGHTS_ADDR").is_ok() {
            cfg.weights = Some(GroupSpec::from_env("WEIGHTS")?);
        }

        if let Ok(architecture) = env::var("ARCHITECTURE") {
            cfg.architecture = architecture;
        }

        cfg.steps = parsed("STEPS")?.unwrap_or(cfg.steps);
        cfg.batch_shape = vec![
            parsed("BATCH_SIZE")?.unwrap_or(cfg.batch_shape[0]),
            parsed("SEQ_LEN")?.unwrap_or(cfg.batch_shape[1]),
        ];
        cfg.lr = parsed("LR")?.unwrap_or(cfg.lr);
        cfg.topk = parsed("TOPK")?.unwrap_or(cfg.topk);
        cfg.vocab_size = parsed("VOCAB_SIZE")?.unwrap_or(cfg.vocab_size);
        cfg.extract_every = parsed("EXTRACT_EVERY")?.unwrap_or(cfg.steps);
        cfg.seed = parsed("SEED")?;

        Ok(cfg)
    }

    /// Checks the configuration before anything is published.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidConfig(msg));

        for spec in std::iter::once(&self.group).chain(&self.weights) {
            spec.validate().or_else(invalid)?;
            if spec.rank != 0 {
                return invalid(format!("the orchestrator must be rank 0 of {}", spec.addr));
            }
        }

        if self.model_files.is_empty() {
            return invalid("no model files given".into());
        }

        if self.batch_shape.iter().any(|&d| d == 0) {
            return invalid(format!("empty batch shape {:?}", self.batch_shape));
        }

        if self.topk == 0 || self.vocab_size <= 0 || self.extract_every == 0 {
            return invalid("topk, vocab size and extract interval must be positive".into());
        }

        Ok(())
    }
}

fn required(name: &str) -> io::Result<String> {
    env::var(name).map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("{name}: {e}")))
}

fn parsed<T>(name: &str) -> io::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };

    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{name}={raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::new(
            GroupSpec::new("127.0.0.1:29500", 3, 0),
            "127.0.0.1:29400",
            vec!["model.safetensors".into()],
        )
    }

    #[test]
    fn defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn orchestrator_must_be_the_sender() {
        let mut cfg = config();
        cfg.group.rank = 1;
        assert!(matches!(cfg.validate(), Err(OrchestratorError::InvalidConfig(_))));
    }

    #[test]
    fn weights_group_is_validated_too() {
        let mut cfg = config();
        cfg.weights = Some(GroupSpec::new("127.0.0.1:29501", 2, 2));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_batch_is_rejected() {
        let mut cfg = config();
        cfg.batch_shape = vec![0, 128];
        assert!(cfg.validate().is_err());
    }
}
