use std::{future::Future, time::Duration};

use futures::future;
use log::{debug, info};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use super::{Collective, CollectiveErr, Result, SENDER_RANK};
use crate::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
    specs::group::{GroupSpec, JoinRequest},
};

const CONNECT_RETRY: Duration = Duration::from_millis(100);

struct Peer {
    rank: usize,
    rx: FrameReceiver<OwnedReadHalf>,
    tx: FrameSender<OwnedWriteHalf>,
    buf: Vec<u32>,
}

impl Peer {
    fn new(rank: usize, stream: TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        let (rx, tx) = crate::channel(rx, tx);

        Self {
            rank,
            rx,
            tx,
            buf: Vec::new(),
        }
    }

    async fn expect_barrier(&mut self) -> Result<()> {
        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Control(Command::Barrier) => Ok(()),
            other => Err(unexpected("barrier", &other)),
        }
    }

    async fn expect_reduce(&mut self, len: usize) -> Result<Vec<f32>> {
        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Data(Payload::Reduce(values)) if values.len() == len => Ok(values.to_vec()),
            Msg::Data(Payload::Reduce(values)) => Err(CollectiveErr::LengthMismatch {
                op: "all_reduce",
                expected: len * size_of::<f32>(),
                got: values.len() * size_of::<f32>(),
            }),
            other => Err(unexpected("all_reduce", &other)),
        }
    }
}

enum Link {
    Sender(Vec<Peer>),
    Receiver(Peer),
}

/// A collective group over TCP in a star topology rooted at the sender rank.
///
/// The sender rank listens on the group address and every other rank
/// connects to it, so each collective costs one round trip per peer.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    link: Link,
}

impl TcpGroup {
    /// Joins the group described by `spec`, binding its address on the sender rank.
    ///
    /// # Arguments
    /// * `spec` - The group join parameters, these must match across every member.
    ///
    /// # Returns
    /// The joined group or an error if the members disagree or the timeout elapses.
    pub async fn join(spec: &GroupSpec) -> Result<Self> {
        if spec.rank == SENDER_RANK {
            let listener = TcpListener::bind(&spec.addr).await?;
            Self::host(listener, spec).await
        } else {
            Self::connect(spec).await
        }
    }

    /// Joins as the sender rank using an already bound `listener`.
    pub async fn host(listener: TcpListener, spec: &GroupSpec) -> Result<Self> {
        spec.validate().map_err(CollectiveErr::JoinMismatch)?;

        let timeout = spec.timeout();
        let peers = within(timeout, "join", Self::accept_peers(listener, spec)).await?;
        info!(rank = spec.rank, world_size = spec.world_size; "hosting collective group");

        Ok(Self {
            rank: spec.rank,
            world_size: spec.world_size,
            timeout,
            link: Link::Sender(peers),
        })
    }

    /// Joins as a non sender rank, retrying the connection until the timeout.
    pub async fn connect(spec: &GroupSpec) -> Result<Self> {
        spec.validate().map_err(CollectiveErr::JoinMismatch)?;

        let timeout = spec.timeout();
        let peer = within(timeout, "join", Self::connect_sender(spec)).await?;
        info!(rank = spec.rank, world_size = spec.world_size; "joined collective group");

        Ok(Self {
            rank: spec.rank,
            world_size: spec.world_size,
            timeout,
            link: Link::Receiver(peer),
        })
    }

    async fn accept_peers(listener: TcpListener, spec: &GroupSpec) -> Result<Vec<Peer>> {
        let mut slots: Vec<Option<Peer>> = (0..spec.world_size).map(|_| None).collect();

        for _ in 1..spec.world_size {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;

            let mut peer = Peer::new(SENDER_RANK, stream);
            let request = match peer.rx.recv_into(&mut peer.buf).await? {
                Msg::Control(Command::Join(request)) => request,
                other => return Err(unexpected("join", &other)),
            };

            let taken = slots.get(request.rank).is_some_and(Option::is_some);
            if let Err(reason) = spec.accepts(&request, taken) {
                let msg = Msg::Err(reason.as_str().into());
                peer.tx.send(&msg).await?;
                return Err(CollectiveErr::JoinMismatch(reason));
            }

            peer.tx.send(&Msg::Control(Command::Joined)).await?;
            debug!(rank = request.rank; "peer joined from {addr}");

            peer.rank = request.rank;
            slots[request.rank] = Some(peer);
        }

        Ok(slots.into_iter().flatten().collect())
    }

    async fn connect_sender(spec: &GroupSpec) -> Result<Peer> {
        let stream = loop {
            match TcpStream::connect(&spec.addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    debug!(rank = spec.rank; "sender not reachable at {}: {e}", spec.addr);
                    time::sleep(CONNECT_RETRY).await;
                }
            }
        };

        stream.set_nodelay(true)?;
        let mut peer = Peer::new(SENDER_RANK, stream);

        let request = Msg::Control(Command::Join(JoinRequest::from(spec)));
        peer.tx.send(&request).await?;

        match peer.rx.recv_into(&mut peer.buf).await? {
            Msg::Control(Command::Joined) => {}
            Msg::Err(reason) => return Err(CollectiveErr::JoinMismatch(reason.into_owned())),
            other => return Err(unexpected("join", &other)),
        }

        Ok(peer)
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&mut self, buf: &mut [u8]) -> Result<()> {
        const OP: &str = "broadcast";

        within(self.timeout, OP, async {
            match &mut self.link {
                Link::Sender(peers) => {
                    let msg = Msg::Data(Payload::Broadcast(buf));
                    future::try_join_all(peers.iter_mut().map(|peer| peer.tx.send(&msg))).await?;
                    Ok(())
                }
                Link::Receiver(peer) => match peer.rx.recv_into(&mut peer.buf).await? {
                    Msg::Data(Payload::Broadcast(bytes)) if bytes.len() == buf.len() => {
                        buf.copy_from_slice(bytes);
                        Ok(())
                    }
                    Msg::Data(Payload::Broadcast(bytes)) => Err(CollectiveErr::LengthMismatch {
                        op: OP,
                        expected: buf.len(),
                        got: bytes.len(),
                    }),
                    other => Err(unexpected(OP, &other)),
                },
            }
        })
        .await
    }

    async fn discard_broadcast(&mut self) -> Result<usize> {
        const OP: &str = "discard_broadcast";

        within(self.timeout, OP, async {
            match &mut self.link {
                Link::Sender(_) => Ok(0),
                Link::Receiver(peer) => match peer.rx.recv_into(&mut peer.buf).await? {
                    Msg::Data(Payload::Broadcast(bytes)) => Ok(bytes.len()),
                    other => Err(unexpected(OP, &other)),
                },
            }
        })
        .await
    }

    async fn barrier(&mut self) -> Result<()> {
        within(self.timeout, "barrier", async {
            let msg = Msg::Control(Command::Barrier);

            match &mut self.link {
                Link::Sender(peers) => {
                    future::try_join_all(peers.iter_mut().map(Peer::expect_barrier)).await?;
                    future::try_join_all(peers.iter_mut().map(|peer| peer.tx.send(&msg))).await?;
                }
                Link::Receiver(peer) => {
                    peer.tx.send(&msg).await?;
                    peer.expect_barrier().await?;
                }
            }

            Ok(())
        })
        .await
    }

    async fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<()> {
        const OP: &str = "all_reduce";

        within(self.timeout, OP, async {
            match &mut self.link {
                Link::Sender(peers) => {
                    let len = values.len();
                    let contributions =
                        future::try_join_all(peers.iter_mut().map(|peer| peer.expect_reduce(len)))
                            .await?;

                    // Peers are kept in rank order so the sum is deterministic.
                    for contribution in contributions {
                        values
                            .iter_mut()
                            .zip(contribution)
                            .for_each(|(acc, v)| *acc += v);
                    }

                    let msg = Msg::Data(Payload::Reduce(values));
                    future::try_join_all(peers.iter_mut().map(|peer| peer.tx.send(&msg))).await?;
                    Ok(())
                }
                Link::Receiver(peer) => {
                    peer.tx.send(&Msg::Data(Payload::Reduce(values))).await?;

                    let total = peer.expect_reduce(values.len()).await?;
                    values.copy_from_slice(&total);
                    Ok(())
                }
            }
        })
        .await
    }
}

async fn within<T>(timeout: Duration, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    time::timeout(timeout, fut)
        .await
        .map_err(|_| CollectiveErr::Timeout { op, after: timeout })?
}

fn unexpected(op: &'static str, msg: &Msg<'_>) -> CollectiveErr {
    let got = match msg {
        Msg::Err(reason) => return CollectiveErr::Remote(reason.to_string()),
        Msg::Control(cmd) => format!("{cmd:?}"),
        Msg::Data(Payload::Broadcast(bytes)) => format!("broadcast of {} bytes", bytes.len()),
        Msg::Data(Payload::Reduce(values)) => format!("reduce of {} values", values.len()),
    };

    CollectiveErr::Unexpected { op, got }
}
