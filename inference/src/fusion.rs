//! Reconciles per-projection training weights with fused inference weights.
//!
//! Attention q, k and v projections and the mlp gate and up projections are
//! separate tensors on the training side while the inference side stores
//! them concatenated. Components are buffered per layer until the whole group
//! has arrived, then fused and handed back as a single tensor.

use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    fmt,
    time::{Duration, Instant},
};

use comms::Tensor;
use log::{debug, warn};
use model::{TransformErr, transforms};
use serde::{Deserialize, Serialize};

fn default_apply_rotary() -> bool {
    true
}

/// Attention geometry needed to fuse q, k and v.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    /// Whether q and k go through the rotary permutation before fusing.
    #[serde(default = "default_apply_rotary")]
    pub apply_rotary: bool,
    /// Drops incomplete groups older than this many milliseconds.
    #[serde(default)]
    pub evict_after_ms: Option<u64>,
}

impl FusionConfig {
    pub fn new(n_heads: usize, n_kv_heads: usize) -> Self {
        Self {
            n_heads,
            n_kv_heads,
            apply_rotary: true,
            evict_after_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FusionKind {
    Qkv,
    GateUp,
}

impl FusionKind {
    /// The components a complete group holds, in concatenation order.
    pub fn components(self) -> &'static [Component] {
        match self {
            FusionKind::Qkv => &[Component::Q, Component::K, Component::V],
            FusionKind::GateUp => &[Component::Gate, Component::Up],
        }
    }

    fn target_module(self) -> &'static str {
        match self {
            FusionKind::Qkv => "self_attn.qkv_proj",
            FusionKind::GateUp => "mlp.gate_up_proj",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Q,
    K,
    V,
    Gate,
    Up,
}

impl Component {
    fn parse(segment: &str) -> Option<Self> {
        Some(match segment {
            "q_proj" | "wq" => Component::Q,
            "k_proj" | "wk" => Component::K,
            "v_proj" | "wv" => Component::V,
            "gate_proj" | "w1" => Component::Gate,
            "up_proj" | "w3" => Component::Up,
            _ => return None,
        })
    }

    pub fn kind(self) -> FusionKind {
        match self {
            Component::Q | Component::K | Component::V => FusionKind::Qkv,
            Component::Gate | Component::Up => FusionKind::GateUp,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Component::Q => "q",
            Component::K => "k",
            Component::V => "v",
            Component::Gate => "gate",
            Component::Up => "up",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifies one fusion group.
///
/// Weight and bias groups of the same layer get distinct keys through `tail`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Everything up to and including the layer index, e.g. `model.layers.3`.
    pub layer: String,
    pub kind: FusionKind,
    /// `weight` or `bias`.
    pub tail: String,
}

impl GroupKey {
    /// The name of the fused parameter this group is written to.
    pub fn target(&self) -> String {
        format!("{}.{}.{}", self.layer, self.kind.target_module(), self.tail)
    }

    /// Splits a parameter name into its group key and component.
    ///
    /// # Returns
    /// `None` for parameters that are not part of any fusion group.
    pub fn classify(name: &str) -> Option<(Self, Component)> {
        let parts: Vec<&str> = name.split('.').collect();

        let layer_end = parts
            .windows(2)
            .position(|w| w[0] == "layers" && w[1].parse::<usize>().is_ok())?
            + 2;

        let (&tail, middle) = parts[layer_end..].split_last()?;
        if tail != "weight" && tail != "bias" {
            return None;
        }

        let component = middle.iter().find_map(|segment| Component::parse(segment))?;
        let key = Self {
            layer: parts[..layer_end].join("."),
            kind: component.kind(),
            tail: tail.to_string(),
        };

        Some((key, component))
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target())
    }
}

#[derive(Debug)]
pub enum FusionErr {
    /// The group's components can not be fused, only that group is dropped.
    ComponentShapeMismatch {
        target: String,
        component: Component,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    Transform {
        target: String,
        source: TransformErr,
    },
}

impl FusionErr {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transform {
                source: TransformErr::OddHeadDim { .. } | TransformErr::HeadsDoNotDivide { .. },
                ..
            }
        )
    }
}

impl fmt::Display for FusionErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ComponentShapeMismatch {
                target,
                component,
                expected,
                got,
            } => write!(
                f,
                "{target}: component {component} expected shape {expected:?}, got {got:?}"
            ),
            Self::Transform { target, source } => write!(f, "{target}: {source}"),
        }
    }
}

impl Error for FusionErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transform { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FusionErr>;

/// What happened to an incoming parameter.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Not part of any group, apply as is.
    Direct { name: String, tensor: Tensor },
    /// Stored until the rest of its group arrives.
    Buffered { target: String, missing: Vec<Component> },
    /// Completed a group, apply to `target`.
    Fused { target: String, tensor: Tensor },
}

/// An incomplete group as seen from the outside.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingGroup {
    pub target: String,
    pub received: Vec<Component>,
    pub missing: Vec<Component>,
    pub age: Duration,
}

#[derive(Debug)]
struct FusionGroup {
    received: BTreeMap<Component, Tensor>,
    created: Instant,
}

impl FusionGroup {
    fn missing(&self, kind: FusionKind) -> Vec<Component> {
        kind.components()
            .iter()
            .copied()
            .filter(|c| !self.received.contains_key(c))
            .collect()
    }
}

/// Buffers group components and fuses complete groups.
#[derive(Debug)]
pub struct FusionLayer {
    config: FusionConfig,
    groups: HashMap<GroupKey, FusionGroup>,
}

impl FusionLayer {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            groups: HashMap::new(),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Routes an incoming parameter.
    ///
    /// # Arguments
    /// * `name` - The training side parameter name.
    /// * `tensor` - Its value.
    ///
    /// # Returns
    /// Where the value ends up, or an error that discarded the parameter's group.
    pub fn route(&mut self, name: String, tensor: Tensor) -> Result<Routed> {
        let Some((key, component)) = GroupKey::classify(&name) else {
            return Ok(Routed::Direct { name, tensor });
        };

        let mut group = self.groups.remove(&key).unwrap_or_else(|| FusionGroup {
            received: BTreeMap::new(),
            created: Instant::now(),
        });

        if group.received.insert(component, tensor).is_some() {
            warn!(group:% = key, component = component.label(); "component received twice, keeping the latest");
        }

        let missing = group.missing(key.kind);
        if !missing.is_empty() {
            debug!(group:% = key, component = component.label(), missing = missing.len(); "buffered component");
            let target = key.target();
            self.groups.insert(key, group);
            return Ok(Routed::Buffered { target, missing });
        }

        let target = key.target();
        let tensor = match key.kind {
            FusionKind::Qkv => self.fuse_qkv(&target, group.received)?,
            FusionKind::GateUp => fuse_gate_up(&target, group.received)?,
        };

        debug!(param = target.as_str(), shape:? = tensor.shape(); "fused group");
        Ok(Routed::Fused { target, tensor })
    }

    fn fuse_qkv(&self, target: &str, mut parts: BTreeMap<Component, Tensor>) -> Result<Tensor> {
        let (Some(q), Some(k), Some(v)) = (
            parts.remove(&Component::Q),
            parts.remove(&Component::K),
            parts.remove(&Component::V),
        ) else {
            unreachable!("fused an incomplete group");
        };

        let FusionConfig {
            n_heads, n_kv_heads, ..
        } = self.config;

        let q_rows = q.shape().first().copied().unwrap_or(0);
        if n_heads == 0 || q_rows == 0 || q_rows % n_heads != 0 {
            return Err(FusionErr::Transform {
                target: target.to_string(),
                source: TransformErr::HeadsDoNotDivide {
                    rows: q_rows,
                    n_heads,
                },
            });
        }

        let head_dim = q_rows / n_heads;
        let mut kv_shape = q.shape().to_vec();
        kv_shape[0] = n_kv_heads * head_dim;

        for (component, tensor) in [(Component::K, &k), (Component::V, &v)] {
            if tensor.shape() != kv_shape.as_slice() {
                return Err(FusionErr::ComponentShapeMismatch {
                    target: target.to_string(),
                    component,
                    expected: kv_shape.clone(),
                    got: tensor.shape().to_vec(),
                });
            }
        }

        let transform = |source| FusionErr::Transform {
            target: target.to_string(),
            source,
        };

        let dtype = q.dtype();
        let (q, k, v) = if self.config.apply_rotary {
            let q = transforms::permute_for_rotary(&q, n_heads).map_err(transform)?;
            let k = transforms::permute_for_rotary(&k.cast(dtype), n_kv_heads).map_err(transform)?;
            (q, k, v.cast(dtype))
        } else {
            (q, k.cast(dtype), v.cast(dtype))
        };

        transforms::concat_rows(&[&q, &k, &v]).map_err(transform)
    }

    /// Every incomplete group, oldest first.
    pub fn pending(&self) -> Vec<PendingGroup> {
        let mut pending: Vec<_> = self
            .groups
            .iter()
            .map(|(key, group)| PendingGroup {
                target: key.target(),
                received: group.received.keys().copied().collect(),
                missing: group.missing(key.kind),
                age: group.created.elapsed(),
            })
            .collect();

        pending.sort_by(|a, b| b.age.cmp(&a.age).then_with(|| a.target.cmp(&b.target)));
        pending
    }

    pub fn log_pending(&self) {
        for group in self.pending() {
            warn!(
                param = group.target.as_str(),
                received:? = group.received,
                missing:? = group.missing,
                age_ms = group.age.as_millis() as u64;
                "fusion group still incomplete"
            );
        }
    }

    /// Drops incomplete groups older than the configured bound.
    ///
    /// # Returns
    /// The targets of the dropped groups.
    pub fn evict_stale(&mut self) -> Vec<String> {
        let Some(limit) = self.config.evict_after_ms.map(Duration::from_millis) else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        self.groups.retain(|key, group| {
            let keep = group.created.elapsed() < limit;
            if !keep {
                warn!(group:% = key; "evicting stale fusion group");
                evicted.push(key.target());
            }
            keep
        });

        evicted
    }
}

fn fuse_gate_up(target: &str, mut parts: BTreeMap<Component, Tensor>) -> Result<Tensor> {
    let (Some(gate), Some(up)) = (parts.remove(&Component::Gate), parts.remove(&Component::Up)) else {
        unreachable!("fused an incomplete group");
    };

    if gate.shape() != up.shape() {
        return Err(FusionErr::ComponentShapeMismatch {
            target: target.to_string(),
            component: Component::Up,
            expected: gate.shape().to_vec(),
            got: up.shape().to_vec(),
        });
    }

    let up = up.cast(gate.dtype());
    transforms::concat_rows(&[&gate, &up]).map_err(|source| FusionErr::Transform {
        target: target.to_string(),
        source,
    })
}
