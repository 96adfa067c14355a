//! Writing half of a framed connection.
//!
//! A frame is a big-endian `LenType` length followed by the serialized
//! message. Tensor payloads are written straight from their buffer after the
//! control bytes, so a broadcast never copies the parameter.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes frames for a `TcpGroup` peer or a `TcpStore` connection.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    /// Length prefix plus control bytes of the frame being written.
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self { tx, head: Vec::new() }
    }

    /// Writes `msg` as one frame and flushes it.
    ///
    /// # Arguments
    /// * `msg` - The message, its payload bytes are borrowed rather than copied.
    ///
    /// # Returns
    /// An `InvalidInput` error if the frame would exceed `MAX_FRAME_LEN`,
    /// otherwise whatever the writer reports.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.head.clear();
        self.head.resize(LEN_TYPE_SIZE, 0);

        let payload = msg.serialize(&mut self.head)?;
        let payload_len = payload.map_or(0, <[u8]>::len);
        let frame_len = self.head.len() - LEN_TYPE_SIZE + payload_len;

        if frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {frame_len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        self.head[..LEN_TYPE_SIZE].copy_from_slice(&(frame_len as LenType).to_be_bytes());
        self.tx.write_all(&self.head).await?;

        if let Some(payload) = payload {
            self.tx.write_all(payload).await?;
        }

        self.tx.flush().await
    }
}
