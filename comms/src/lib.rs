mod align;
pub mod collective;
mod deserialize;
mod dtype;
pub mod header;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod sparse;
pub mod specs;
pub mod store;
mod tensor;
pub mod weights;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::Align4;
pub use collective::{Collective, CollectiveErr, LocalGroup, LocalMember, TcpGroup};
pub use deserialize::Deserialize;
pub use dtype::{Dtype, UnknownDtypeCode};
pub use half;
pub use receiver::FrameReceiver;
pub use sender::FrameSender;
pub use serialize::Serialize;
pub use store::{GetMode, MemoryStore, RendezvousStore, StoreErr, StoreServer, TcpStore};
pub use tensor::{Element, Tensor, TensorErr};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames above this size are refused on both ends.
const MAX_FRAME_LEN: usize = 1 << 34;

/// Splits a connection into the framed halves used by `TcpGroup` and `TcpStore`.
///
/// # Arguments
/// * `rx` - The read half of the connection.
/// * `tx` - The write half of the connection.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
