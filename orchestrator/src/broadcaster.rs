use std::collections::BTreeMap;

use comms::{Collective, Tensor, weights};
use log::{debug, info};

use crate::error::{OrchestratorError, Result};

const PROGRESS_EVERY: usize = 10;

/// Pushes named parameters to a group of inference receivers.
pub struct WeightBroadcaster<C> {
    collective: C,
    sent: usize,
}

impl<C: Collective> WeightBroadcaster<C> {
    /// Creates a new `WeightBroadcaster`.
    ///
    /// # Arguments
    /// * `collective` - The weights group, this process must be its sender rank.
    pub fn new(collective: C) -> Result<Self> {
        if !collective.is_sender() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "weights can only be broadcast from rank {}, got rank {}",
                collective.sender_rank(),
                collective.rank()
            )));
        }

        Ok(Self { collective, sent: 0 })
    }

    /// The amount of parameters sent so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub async fn broadcast_parameter(&mut self, name: &str, tensor: &mut Tensor) -> Result<()> {
        weights::send_parameter(&mut self.collective, name, tensor).await?;
        self.sent += 1;
        debug!(name = name, dtype:% = tensor.dtype(), shape:? = tensor.shape(); "parameter broadcast");
        Ok(())
    }

    /// Broadcasts every parameter in name order.
    ///
    /// # Returns
    /// The amount of parameters sent.
    pub async fn broadcast_state_dict(&mut self, params: BTreeMap<String, Tensor>) -> Result<usize> {
        let total = params.len();

        for (i, (name, mut tensor)) in params.into_iter().enumerate() {
            self.broadcast_parameter(&name, &mut tensor).await?;

            if (i + 1) % PROGRESS_EVERY == 0 {
                info!(sent = i + 1, total = total; "broadcasting parameters");
            }
        }

        info!(total = total; "state dict broadcast");
        Ok(total)
    }

    /// Tells every receiver to stop.
    pub async fn broadcast_shutdown(&mut self) -> Result<()> {
        weights::send_shutdown(&mut self.collective).await?;
        info!(sent = self.sent; "receivers shut down");
        Ok(())
    }
}
