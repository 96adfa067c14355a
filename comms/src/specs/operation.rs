use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sparse::SparseResultMetadata;

/// Trainer configuration, the optimizer and scheduler are opaque to the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(rename = "lr_scheduler")]
    pub lr_scheduler_spec: Value,
    #[serde(rename = "optimizer")]
    pub optimizer_spec: Value,
    pub micro_batch_size: usize,
    pub grad_accum_in_fp32: bool,
}

/// The shape of the token batch broadcast after a train or forward descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub batch_shape: Vec<usize>,
    #[serde(rename = "batch_has_labels")]
    pub has_labels: bool,
    #[serde(rename = "batch_has_position_ids", default)]
    pub has_position_ids: bool,
    #[serde(rename = "batch_sequence_lengths", default)]
    pub sequence_lengths: Option<Vec<Vec<i32>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStep {
    pub step: u32,
    #[serde(rename = "zero_optim")]
    pub zero_optimizer: bool,
    pub batch_id: (u64, u64),
    #[serde(flatten)]
    pub batch: BatchDescriptor,
    #[serde(rename = "warmup_lr_between", default)]
    pub warmup_lr_range: Option<(u32, u32)>,
    #[serde(rename = "results_len")]
    pub sparse_results_len: usize,
    #[serde(rename = "results_metadata", default)]
    pub sparse_results_metadata: Option<SparseResultMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeStep {
    pub step: u32,
    #[serde(rename = "warmup_lr_between", default)]
    pub warmup_lr_range: Option<(u32, u32)>,
    #[serde(rename = "results_len")]
    pub sparse_results_len: usize,
    #[serde(rename = "results_metadata", default)]
    pub sparse_results_metadata: Option<SparseResultMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    #[serde(flatten)]
    pub batch: BatchDescriptor,
    #[serde(rename = "num_logits_to_keep", default)]
    pub logits_to_keep: Option<i64>,
    #[serde(default)]
    pub loss_scale: Option<f64>,
}

/// One step of the control loop, published under its iteration index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    #[serde(rename = "hyperparameters")]
    Configure(Hyperparameters),
    Train(TrainStep),
    Optimize(OptimizeStep),
    Extract,
    Forward(Forward),
    Exit,
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Configure(_) => "hyperparameters",
            Operation::Train(_) => "train",
            Operation::Optimize(_) => "optimize",
            Operation::Extract => "extract",
            Operation::Forward(_) => "forward",
            Operation::Exit => "exit",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The store key an iteration's operation is published under.
pub fn operation_key(iteration: u64) -> String {
    iteration.to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn train_uses_the_wire_field_names() {
        let raw = json!({
            "operation": "train",
            "step": 3,
            "batch_id": [10, 12],
            "batch_shape": [2, 128],
            "batch_has_labels": true,
            "batch_has_position_ids": false,
            "batch_sequence_lengths": null,
            "warmup_lr_between": null,
            "zero_optim": false,
            "results_len": 0,
            "results_metadata": null,
        });

        let op: Operation = serde_json::from_value(raw).unwrap();
        let Operation::Train(train) = &op else {
            panic!("expected train, got {op:?}");
        };

        assert_eq!(train.step, 3);
        assert_eq!(train.batch_id, (10, 12));
        assert_eq!(train.batch.batch_shape, vec![2, 128]);
        assert!(train.batch.has_labels);
        assert_eq!(train.sparse_results_len, 0);
        assert_eq!(op.kind(), "train");

        let back = Operation::from_json(&op.to_json().unwrap()).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn configure_is_tagged_hyperparameters() {
        let op = Operation::Configure(Hyperparameters {
            lr_scheduler_spec: json!({"constant": {"base_lr": 0.001}}),
            optimizer_spec: json!({"adamw": {}}),
            micro_batch_size: 4,
            grad_accum_in_fp32: false,
        });

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["operation"], "hyperparameters");
        assert_eq!(value["lr_scheduler"]["constant"]["base_lr"], 0.001);
        assert_eq!(value["micro_batch_size"], 4);
    }

    #[test]
    fn unit_operations_only_carry_the_tag() {
        assert_eq!(
            serde_json::from_str::<Operation>(r#"{"operation":"exit"}"#).unwrap(),
            Operation::Exit
        );
        assert_eq!(
            serde_json::to_value(Operation::Extract).unwrap(),
            json!({"operation": "extract"})
        );
    }

    #[test]
    fn optional_optimize_fields_may_be_absent() {
        let op: Operation =
            serde_json::from_str(r#"{"operation":"optimize","step":1,"results_len":0}"#).unwrap();

        assert_eq!(
            op,
            Operation::Optimize(OptimizeStep {
                step: 1,
                warmup_lr_range: None,
                sparse_results_len: 0,
                sparse_results_metadata: None,
            })
        );
    }
}
