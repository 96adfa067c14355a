//! Token batches broadcast after a train or forward operation.
//!
//! The sender broadcasts `input_ids`, then `labels` and `position_ids` when
//! the descriptor says they are present. All of them are int64 tensors of the
//! descriptor's batch shape.

use comms::{
    Collective, Dtype, Tensor, TensorErr,
    collective::{self, Result},
    specs::operation::BatchDescriptor,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub input_ids: Tensor,
    pub labels: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub sequence_lengths: Option<Vec<Vec<i32>>>,
}

impl Batch {
    /// Creates a batch of `input_ids`, which must be int64.
    pub fn new(input_ids: Tensor) -> std::result::Result<Self, TensorErr> {
        check_ids(input_ids.shape(), &input_ids)?;

        Ok(Self {
            input_ids,
            labels: None,
            position_ids: None,
            sequence_lengths: None,
        })
    }

    pub fn with_labels(mut self, labels: Tensor) -> std::result::Result<Self, TensorErr> {
        check_ids(self.input_ids.shape(), &labels)?;
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn with_position_ids(mut self, position_ids: Tensor) -> std::result::Result<Self, TensorErr> {
        check_ids(self.input_ids.shape(), &position_ids)?;
        self.position_ids = Some(position_ids);
        Ok(self)
    }

    pub fn with_sequence_lengths(mut self, lengths: Vec<Vec<i32>>) -> Self {
        self.sequence_lengths = Some(lengths);
        self
    }

    pub fn shape(&self) -> &[usize] {
        self.input_ids.shape()
    }

    /// The descriptor peers need to receive this batch.
    pub fn descriptor(&self) -> BatchDescriptor {
        BatchDescriptor {
            batch_shape: self.shape().to_vec(),
            has_labels: self.labels.is_some(),
            has_position_ids: self.position_ids.is_some(),
            sequence_lengths: self.sequence_lengths.clone(),
        }
    }
}

fn check_ids(shape: &[usize], ids: &Tensor) -> std::result::Result<(), TensorErr> {
    if ids.dtype() != Dtype::I64 {
        return Err(TensorErr::DtypeMismatch {
            expected: Dtype::I64,
            got: ids.dtype(),
        });
    }

    if ids.shape() != shape {
        return Err(TensorErr::ShapeMismatch {
            expected: shape.to_vec(),
            got: ids.shape().to_vec(),
        });
    }

    Ok(())
}

/// Receives the batch `descriptor` announces.
pub async fn recv_batch<C: Collective>(collective: &mut C, descriptor: &BatchDescriptor) -> Result<Batch> {
    let ids = || Tensor::zeros(Dtype::I64, &descriptor.batch_shape);

    let mut input_ids = ids();
    collective::broadcast_tensor(collective, &mut input_ids).await?;

    let mut labels = descriptor.has_labels.then(ids);
    if let Some(labels) = &mut labels {
        collective::broadcast_tensor(collective, labels).await?;
    }

    let mut position_ids = descriptor.has_position_ids.then(ids);
    if let Some(position_ids) = &mut position_ids {
        collective::broadcast_tensor(collective, position_ids).await?;
    }

    Ok(Batch {
        input_ids,
        labels,
        position_ids,
        sequence_lengths: descriptor.sequence_lengths.clone(),
    })
}

/// Broadcasts `batch` from the sender rank in the order `recv_batch` expects.
pub async fn send_batch<C: Collective>(collective: &mut C, batch: &mut Batch) -> Result<()> {
    collective::broadcast_tensor(collective, &mut batch.input_ids).await?;

    if let Some(labels) = &mut batch.labels {
        collective::broadcast_tensor(collective, labels).await?;
    }

    if let Some(position_ids) = &mut batch.position_ids {
        collective::broadcast_tensor(collective, position_ids).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use comms::LocalGroup;

    use super::*;

    fn ids(shape: Vec<usize>, start: i64) -> Tensor {
        let numel = shape.iter().product::<usize>() as i64;
        Tensor::from_vec(shape, (start..start + numel).collect()).unwrap()
    }

    #[test]
    fn batch_rejects_non_int64_and_mismatched_shapes() {
        assert!(matches!(
            Batch::new(Tensor::zeros(Dtype::I32, &[2, 4])),
            Err(TensorErr::DtypeMismatch { .. })
        ));

        let batch = Batch::new(ids(vec![2, 4], 0)).unwrap();
        assert!(matches!(
            batch.with_labels(ids(vec![2, 3], 0)),
            Err(TensorErr::ShapeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn labels_without_position_ids() {
        let mut members = LocalGroup::create(2);
        let mut receiver = members.pop().unwrap();
        let mut sender = members.pop().unwrap();

        let mut batch = Batch::new(ids(vec![2, 3], 0))
            .unwrap()
            .with_labels(ids(vec![2, 3], 100))
            .unwrap()
            .with_sequence_lengths(vec![vec![3], vec![2, 1]]);
        let descriptor = batch.descriptor();

        send_batch(&mut sender, &mut batch).await.unwrap();
        let received = recv_batch(&mut receiver, &descriptor).await.unwrap();

        assert_eq!(received, batch);
        assert!(received.position_ids.is_none());
    }
}
