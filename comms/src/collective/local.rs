use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{
        Barrier,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    time,
};

use super::{Collective, CollectiveErr, Result, SENDER_RANK};
use crate::specs::group::DEFAULT_TIMEOUT;

/// Builds a group of in-process members connected by channels.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates `world_size` connected members, ordered by rank.
    ///
    /// # Arguments
    /// * `world_size` - The amount of members, at least one is always created.
    ///
    /// # Returns
    /// One member per rank, each meant to be moved into its own task.
    pub fn create(world_size: usize) -> Vec<LocalMember> {
        Self::with_timeout(world_size, DEFAULT_TIMEOUT)
    }

    /// Same as `create` but every blocking call gives up after `timeout`.
    pub fn with_timeout(world_size: usize, timeout: Duration) -> Vec<LocalMember> {
        let world_size = world_size.max(1);
        let barrier = Arc::new(Barrier::new(world_size));
        let (reduce_tx, reduce_rx) = mpsc::unbounded_channel();

        let mut outboxes = Vec::with_capacity(world_size - 1);
        let mut members = Vec::with_capacity(world_size);

        for rank in 1..world_size {
            let (tx, inbox) = mpsc::unbounded_channel();
            outboxes.push(tx);

            members.push(LocalMember {
                rank,
                world_size,
                timeout,
                barrier: Arc::clone(&barrier),
                role: Role::Receiver {
                    inbox,
                    reduce_tx: reduce_tx.clone(),
                },
            });
        }

        drop(reduce_tx);

        let sender = LocalMember {
            rank: SENDER_RANK,
            world_size,
            timeout,
            barrier,
            role: Role::Sender {
                outboxes,
                reduce_rx,
            },
        };

        members.insert(SENDER_RANK, sender);
        members
    }
}

enum Role {
    Sender {
        outboxes: Vec<UnboundedSender<Vec<u8>>>,
        reduce_rx: UnboundedReceiver<(usize, Vec<f32>)>,
    },
    Receiver {
        inbox: UnboundedReceiver<Vec<u8>>,
        reduce_tx: UnboundedSender<(usize, Vec<f32>)>,
    },
}

/// One rank of a `LocalGroup`.
pub struct LocalMember {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    barrier: Arc<Barrier>,
    role: Role,
}

impl LocalMember {
    async fn recv_within<T>(
        rx: &mut UnboundedReceiver<T>,
        timeout: Duration,
        op: &'static str,
    ) -> Result<T> {
        match time::timeout(timeout, rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(CollectiveErr::Disconnected { op }),
            Err(_) => Err(CollectiveErr::Timeout { op, after: timeout }),
        }
    }

    fn fan_out(outboxes: &[UnboundedSender<Vec<u8>>], bytes: &[u8], op: &'static str) -> Result<()> {
        for outbox in outboxes {
            outbox
                .send(bytes.to_vec())
                .map_err(|_| CollectiveErr::Disconnected { op })?;
        }

        Ok(())
    }
}

impl Collective for LocalMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&mut self, buf: &mut [u8]) -> Result<()> {
        const OP: &str = "broadcast";

        match &mut self.role {
            Role::Sender { outboxes, .. } => Self::fan_out(outboxes, buf, OP),
            Role::Receiver { inbox, .. } => {
                let bytes = Self::recv_within(inbox, self.timeout, OP).await?;
                if bytes.len() != buf.len() {
                    return Err(CollectiveErr::LengthMismatch {
                        op: OP,
                        expected: buf.len(),
                        got: bytes.len(),
                    });
                }

                buf.copy_from_slice(&bytes);
                Ok(())
            }
        }
    }

    async fn discard_broadcast(&mut self) -> Result<usize> {
        match &mut self.role {
            Role::Sender { .. } => Ok(0),
            Role::Receiver { inbox, .. } => {
                let bytes = Self::recv_within(inbox, self.timeout, "discard_broadcast").await?;
                Ok(bytes.len())
            }
        }
    }

    async fn barrier(&mut self) -> Result<()> {
        time::timeout(self.timeout, self.barrier.wait())
            .await
            .map_err(|_| CollectiveErr::Timeout {
                op: "barrier",
                after: self.timeout,
            })?;

        Ok(())
    }

    async fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<()> {
        const OP: &str = "all_reduce";

        match &mut self.role {
            Role::Sender {
                outboxes,
                reduce_rx,
            } => {
                let mut contributions: Vec<Option<Vec<f32>>> = vec![None; self.world_size];

                for _ in 1..self.world_size {
                    let (rank, contribution) = Self::recv_within(reduce_rx, self.timeout, OP).await?;
                    if contribution.len() != values.len() {
                        return Err(CollectiveErr::LengthMismatch {
                            op: OP,
                            expected: values.len() * size_of::<f32>(),
                            got: contribution.len() * size_of::<f32>(),
                        });
                    }

                    contributions[rank] = Some(contribution);
                }

                // Summed in rank order so every run produces the same bits.
                for contribution in contributions.into_iter().flatten() {
                    values
                        .iter_mut()
                        .zip(contribution)
                        .for_each(|(acc, v)| *acc += v);
                }

                Self::fan_out(outboxes, bytemuck::cast_slice(values), OP)
            }
            Role::Receiver { inbox, reduce_tx } => {
                reduce_tx
                    .send((self.rank, values.to_vec()))
                    .map_err(|_| CollectiveErr::Disconnected { op: OP })?;

                let bytes = Self::recv_within(inbox, self.timeout, OP).await?;
                if bytes.len() != size_of_val(values) {
                    return Err(CollectiveErr::LengthMismatch {
                        op: OP,
                        expected: size_of_val(values),
                        got: bytes.len(),
                    });
                }

                values.copy_from_slice(&bytemuck::pod_collect_to_vec::<u8, f32>(&bytes));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinSet;

    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_rank() {
        let mut set = JoinSet::new();

        for mut member in LocalGroup::create(4) {
            set.spawn(async move {
                let mut buf = if member.is_sender() {
                    vec![1u8, 2, 3]
                } else {
                    vec![0; 3]
                };

                member.broadcast(&mut buf).await.unwrap();
                buf
            });
        }

        while let Some(buf) = set.join_next().await {
            assert_eq!(buf.unwrap(), vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn all_reduce_sums_in_every_rank() {
        let mut set = JoinSet::new();

        for mut member in LocalGroup::create(3) {
            set.spawn(async move {
                let mut values = vec![member.rank() as f32, 1.0];
                member.all_reduce_sum(&mut values).await.unwrap();
                values
            });
        }

        while let Some(values) = set.join_next().await {
            assert_eq!(values.unwrap(), vec![3.0, 3.0]);
        }
    }

    #[tokio::test]
    async fn short_buffer_is_a_length_mismatch() {
        let mut members = LocalGroup::create(2);
        let mut receiver = members.pop().unwrap();
        let mut sender = members.pop().unwrap();

        sender.broadcast(&mut [1, 2, 3, 4]).await.unwrap();

        let err = receiver.broadcast(&mut [0; 2]).await.unwrap_err();
        assert!(matches!(
            err,
            CollectiveErr::LengthMismatch {
                expected: 2,
                got: 4,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn receiver_times_out_without_sender() {
        let mut members = LocalGroup::with_timeout(2, Duration::from_millis(20));
        let mut receiver = members.pop().unwrap();

        let err = receiver.broadcast(&mut [0; 1]).await.unwrap_err();
        assert!(matches!(err, CollectiveErr::Disconnected { .. } | CollectiveErr::Timeout { .. }));
    }

    #[tokio::test]
    async fn single_member_group_is_a_no_op() {
        let mut member = LocalGroup::create(1).pop().unwrap();
        let mut values = vec![2.5];

        member.barrier().await.unwrap();
        member.broadcast(&mut [7]).await.unwrap();
        member.all_reduce_sum(&mut values).await.unwrap();
        assert_eq!(values, vec![2.5]);
    }
}
