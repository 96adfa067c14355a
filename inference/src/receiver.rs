use std::{env, fs, io, path::Path, sync::Arc};

use comms::{
    Collective, Tensor,
    weights::{self, Incoming},
};
use log::{debug, error, info, warn};
use model::{ParameterRegistry, RegistryErr};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ReceiverErr, Result},
    fusion::{FusionConfig, FusionLayer, Routed},
};

const CONFIG_ENV: &str = "RECEIVER_CONFIG";

fn default_report_every() -> usize {
    100
}

/// How an incoming tensor is combined with the live parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// `w = w_new`
    #[default]
    Full,
    /// `w += delta`
    Delta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default)]
    pub mode: UpdateMode,
    /// Without it every parameter is applied under its own name.
    #[serde(default)]
    pub fusion: Option<FusionConfig>,
    /// Pending fusion groups are logged every this many messages, 0 disables it.
    #[serde(default = "default_report_every")]
    pub report_every: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            mode: UpdateMode::default(),
            fusion: None,
            report_every: default_report_every(),
        }
    }
}

impl ReceiverConfig {
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Loads the file named by `RECEIVER_CONFIG`, or the defaults if it is unset.
    pub fn from_env() -> io::Result<Self> {
        match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Counters describing what the loop did with every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub received: usize,
    pub applied: usize,
    pub buffered: usize,
    pub fused: usize,
    pub skipped_unknown_dtype: usize,
    pub skipped_not_found: usize,
    pub skipped_mismatch: usize,
    pub dropped_groups: usize,
}

/// Applies weights broadcast by a training process to a live registry.
///
/// The receiver is a non-sender member of its group. Every message is a
/// named tensor, the loop ends on the shutdown marker.
pub struct WeightReceiver<C: Collective> {
    collective: C,
    registry: Arc<ParameterRegistry>,
    mode: UpdateMode,
    fusion: Option<FusionLayer>,
    report_every: usize,
    stats: ReceiverStats,
}

impl<C: Collective> WeightReceiver<C> {
    /// Creates a new `WeightReceiver`.
    ///
    /// # Arguments
    /// * `collective` - The group the weights are broadcast on.
    /// * `registry` - The loaded parameters to update.
    /// * `config` - Update mode and fusion geometry.
    pub fn new(collective: C, registry: Arc<ParameterRegistry>, config: ReceiverConfig) -> Self {
        Self {
            collective,
            registry,
            mode: config.mode,
            fusion: config.fusion.map(FusionLayer::new),
            report_every: config.report_every,
            stats: ReceiverStats::default(),
        }
    }

    /// Runs until the shutdown marker arrives.
    ///
    /// # Returns
    /// What was done with the received messages, or the first fatal error.
    pub async fn run(mut self) -> Result<ReceiverStats> {
        info!(
            rank = self.collective.rank(),
            params = self.registry.len(),
            delta = (self.mode == UpdateMode::Delta);
            "weight receiver started"
        );

        loop {
            let incoming = match weights::recv_parameter(&mut self.collective).await {
                Ok(incoming) => incoming,
                Err(e) => {
                    error!(received = self.stats.received; "weight receiver failed: {e}");
                    return Err(e.into());
                }
            };

            match incoming {
                Incoming::Shutdown => {
                    info!(received = self.stats.received, applied = self.stats.applied; "shutdown received");
                    if let Some(fusion) = &self.fusion {
                        fusion.log_pending();
                    }
                    break;
                }
                Incoming::Skipped {
                    name,
                    shape,
                    code,
                    discarded,
                } => {
                    warn!(name = name.as_str(), shape:? = shape, code = code, discarded = discarded; "unknown dtype, skipping");
                    self.stats.received += 1;
                    self.stats.skipped_unknown_dtype += 1;
                }
                Incoming::Parameter { name, tensor } => {
                    self.stats.received += 1;
                    self.handle(name, tensor)?;
                }
            }

            if self.report_every > 0 && self.stats.received % self.report_every == 0 {
                if let Some(fusion) = &mut self.fusion {
                    self.stats.dropped_groups += fusion.evict_stale().len();
                    fusion.log_pending();
                }
            }
        }

        Ok(self.stats)
    }

    fn handle(&mut self, name: String, tensor: Tensor) -> Result<()> {
        let routed = match &mut self.fusion {
            Some(fusion) => fusion.route(name, tensor),
            None => Ok(Routed::Direct { name, tensor }),
        };

        match routed {
            Ok(Routed::Direct { name, tensor }) => self.apply(&name, tensor),
            Ok(Routed::Buffered { .. }) => {
                self.stats.buffered += 1;
                Ok(())
            }
            Ok(Routed::Fused { target, tensor }) => {
                let Some(name) = resolve_target(&self.registry, &target) else {
                    warn!(param = target.as_str(); "fused parameter not found, dropping it");
                    self.stats.dropped_groups += 1;
                    return Ok(());
                };

                self.stats.fused += 1;
                self.apply(&name, tensor)
            }
            Err(e) if e.is_fatal() => {
                error!(received = self.stats.received; "fusion failed: {e}");
                Err(e.into())
            }
            Err(e) => {
                warn!("dropping fusion group: {e}");
                self.stats.dropped_groups += 1;
                Ok(())
            }
        }
    }

    fn apply(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        let Some((shape, dtype)) = self.registry.meta(name) else {
            warn!(name = name; "parameter not found, skipping");
            self.stats.skipped_not_found += 1;
            return Ok(());
        };

        if shape != tensor.shape() {
            warn!(name = name, expected:? = shape, got:? = tensor.shape(); "shape mismatch, skipping");
            self.stats.skipped_mismatch += 1;
            return Ok(());
        }

        let tensor = if tensor.dtype() == dtype {
            tensor
        } else {
            tensor.cast(dtype)
        };

        let applied = match self.mode {
            UpdateMode::Full => self.registry.copy_into(name, &tensor),
            UpdateMode::Delta => self.registry.add_into(name, &tensor),
        };

        match applied {
            Ok(()) => {
                debug!(name = name; "parameter updated");
                self.stats.applied += 1;
                Ok(())
            }
            Err(e @ RegistryErr::NotFound(_)) => {
                warn!("{e}, skipping");
                self.stats.skipped_not_found += 1;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!("{e}, skipping");
                self.stats.skipped_mismatch += 1;
                Ok(())
            }
            Err(e) => {
                error!(name = name; "applying update failed: {e}");
                Err(ReceiverErr::Registry(e))
            }
        }
    }
}

/// Finds the registry name for a fused target.
///
/// The training side may carry a different prefix than the inference side,
/// so a unique parameter ending in the same `layers.<i>...` suffix also matches.
fn resolve_target(registry: &ParameterRegistry, target: &str) -> Option<String> {
    if registry.contains(target) {
        return Some(target.to_string());
    }

    let suffix_start = target.find("layers.")?;
    let suffix = &target[suffix_start..];

    let mut matches = registry
        .names()
        .into_iter()
        .filter(|name| name.ends_with(suffix) && name[..name.len() - suffix.len()].ends_with('.'));

    match (matches.next(), matches.next()) {
        (Some(name), None) => Some(name.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comms::Dtype;

    #[test]
    fn config_defaults_and_json() {
        let config: ReceiverConfig = serde_json::from_str(
            r#"{"mode": "delta", "fusion": {"n_heads": 32, "n_kv_heads": 8}}"#,
        )
        .unwrap();

        assert_eq!(config.mode, UpdateMode::Delta);
        assert_eq!(config.report_every, 100);
        assert_eq!(config.fusion, Some(FusionConfig::new(32, 8)));
        assert_eq!(ReceiverConfig::default().mode, UpdateMode::Full);
    }

    #[test]
    fn resolve_target_matches_a_unique_suffix() {
        let registry = ParameterRegistry::new([
            (
                "model.layers.0.self_attn.qkv_proj.weight".to_string(),
                Tensor::zeros(Dtype::F32, &[1]),
            ),
            (
                "model.layers.10.self_attn.qkv_proj.weight".to_string(),
                Tensor::zeros(Dtype::F32, &[1]),
            ),
        ]);

        assert_eq!(
            resolve_target(&registry, "layers.0.self_attn.qkv_proj.weight").as_deref(),
            Some("model.layers.0.self_attn.qkv_proj.weight")
        );
        assert_eq!(
            resolve_target(&registry, "model.layers.10.self_attn.qkv_proj.weight").as_deref(),
            Some("model.layers.10.self_attn.qkv_proj.weight")
        );
        assert_eq!(resolve_target(&registry, "layers.3.mlp.gate_up_proj.weight"), None);
    }
}
