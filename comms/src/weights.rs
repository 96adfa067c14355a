//! Named tensor transfer: a header broadcast followed by a payload broadcast.

use std::{error::Error, fmt};

use crate::{
    Collective, CollectiveErr, Tensor,
    header::{self, HEADER_BYTES, HeaderErr, NamedTensorHeader},
};

/// What a receiver got from one header and payload pair.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    Parameter {
        name: String,
        tensor: Tensor,
    },
    /// The dtype was not recognised, its payload was drained and dropped.
    Skipped {
        name: String,
        shape: Vec<usize>,
        code: i64,
        discarded: usize,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum WireErr {
    Header(HeaderErr),
    Collective(CollectiveErr),
}

impl fmt::Display for WireErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(e) => write!(f, "{e}"),
            Self::Collective(e) => write!(f, "{e}"),
        }
    }
}

impl Error for WireErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Header(e) => Some(e),
            Self::Collective(e) => Some(e),
        }
    }
}

impl From<HeaderErr> for WireErr {
    fn from(value: HeaderErr) -> Self {
        Self::Header(value)
    }
}

impl From<CollectiveErr> for WireErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

pub type Result<T> = std::result::Result<T, WireErr>;

/// Announces and sends `tensor` under `name` from the sender rank.
pub async fn send_parameter<C: Collective>(collective: &mut C, name: &str, tensor: &mut Tensor) -> Result<()> {
    let slots = header::encode_header(name, tensor.shape(), tensor.dtype(), false)?;
    let mut bytes = header::to_wire_bytes(&slots);

    collective.broadcast(&mut bytes).await?;
    collective.broadcast(tensor.as_bytes_mut()).await?;
    Ok(())
}

/// Sends the shutdown marker, which is not followed by a payload.
pub async fn send_shutdown<C: Collective>(collective: &mut C) -> Result<()> {
    let slots = header::encode_header("", &[], crate::Dtype::F32, true)?;
    let mut bytes = header::to_wire_bytes(&slots);

    collective.broadcast(&mut bytes).await?;
    Ok(())
}

/// Receives the next header and, unless it is a shutdown, its payload.
///
/// # Returns
/// The received parameter, a skip for unknown dtypes, the shutdown marker,
/// or a fatal error.
pub async fn recv_parameter<C: Collective>(collective: &mut C) -> Result<Incoming> {
    let mut bytes = [0; HEADER_BYTES];
    collective.broadcast(&mut bytes).await?;

    match header::decode_header(&header::from_wire_bytes(&bytes)) {
        Ok(NamedTensorHeader::Shutdown) => Ok(Incoming::Shutdown),
        Ok(NamedTensorHeader::Parameter(meta)) => {
            let mut tensor = Tensor::zeros(meta.dtype, &meta.shape);
            collective.broadcast(tensor.as_bytes_mut()).await?;

            Ok(Incoming::Parameter {
                name: meta.name,
                tensor,
            })
        }
        Err(HeaderErr::UnknownDtype { name, shape, code }) => {
            let discarded = collective.discard_broadcast().await?;

            Ok(Incoming::Skipped {
                name,
                shape,
                code,
                discarded,
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dtype, LocalGroup, header::encode_header};

    #[tokio::test]
    async fn parameter_then_shutdown() {
        let mut members = LocalGroup::create(2);
        let mut receiver = members.pop().unwrap();
        let mut sender = members.pop().unwrap();

        let mut tensor = Tensor::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        send_parameter(&mut sender, "layers.0.wq.weight", &mut tensor).await.unwrap();
        send_shutdown(&mut sender).await.unwrap();

        let first = recv_parameter(&mut receiver).await.unwrap();
        assert_eq!(
            first,
            Incoming::Parameter {
                name: "layers.0.wq.weight".into(),
                tensor
            }
        );
        assert_eq!(recv_parameter(&mut receiver).await.unwrap(), Incoming::Shutdown);
    }

    #[tokio::test]
    async fn unknown_dtype_drains_the_payload() {
        let mut members = LocalGroup::create(2);
        let mut receiver = members.pop().unwrap();
        let mut sender = members.pop().unwrap();

        let mut slots = encode_header("odd", &[3], Dtype::F32, false).unwrap();
        slots[2 + 3 + 1 + 1] = 99;
        sender
            .broadcast(&mut header::to_wire_bytes(&slots))
            .await
            .unwrap();
        sender.broadcast(&mut [0; 12]).await.unwrap();

        let mut next = Tensor::from_vec(vec![1], vec![7i64]).unwrap();
        send_parameter(&mut sender, "next", &mut next).await.unwrap();

        assert_eq!(
            recv_parameter(&mut receiver).await.unwrap(),
            Incoming::Skipped {
                name: "odd".into(),
                shape: vec![3],
                code: 99,
                discarded: 12
            }
        );

        match recv_parameter(&mut receiver).await.unwrap() {
            Incoming::Parameter { name, tensor } => {
                assert_eq!(name, "next");
                assert_eq!(tensor.to_vec::<i64>().unwrap(), vec![7]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_names_never_reach_the_wire() {
        let mut sender = LocalGroup::create(1).pop().unwrap();
        let mut tensor = Tensor::zeros(Dtype::F32, &[1]);
        let name = "a".repeat(101);

        let err = send_parameter(&mut sender, &name, &mut tensor).await.unwrap_err();
        assert!(matches!(err, WireErr::Header(HeaderErr::NameTooLong { len: 101 })));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_allocating() {
        let mut members = LocalGroup::create(2);
        let mut receiver = members.pop().unwrap();
        let mut sender = members.pop().unwrap();

        let slots = encode_header("w", &[1 << 40, 1 << 40], Dtype::F32, false).unwrap();
        sender
            .broadcast(&mut header::to_wire_bytes(&slots))
            .await
            .unwrap();

        let err = recv_parameter(&mut receiver).await.unwrap_err();
        assert!(matches!(err, WireErr::Header(HeaderErr::Malformed(_))));
    }
}
