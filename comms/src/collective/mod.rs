//! Broadcast, barrier and all-reduce primitives over a fixed group of ranks.

mod error;
mod local;
mod tcp;
mod transport;

pub use error::{CollectiveErr, Result};
pub use local::{LocalGroup, LocalMember};
pub use tcp::TcpGroup;
pub use transport::{Collective, SENDER_RANK};

use crate::{Element, Tensor};

/// Broadcasts the bytes of `tensor` in place from the sender rank.
///
/// Receivers must already hold a tensor of the announced shape and dtype.
pub async fn broadcast_tensor<C: Collective>(collective: &mut C, tensor: &mut Tensor) -> Result<()> {
    collective.broadcast(tensor.as_bytes_mut()).await
}

/// Broadcasts a single plain value in place from the sender rank.
pub async fn broadcast_value<C, T>(collective: &mut C, value: &mut T) -> Result<()>
where
    C: Collective,
    T: Element,
{
    collective.broadcast(bytemuck::bytes_of_mut(value)).await
}
