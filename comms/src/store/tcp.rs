use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    task::JoinSet,
    time,
};

use super::{GetMode, MemoryStore, RendezvousStore, Result, StoreErr};
use crate::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg},
};

const CONNECT_RETRY: Duration = Duration::from_millis(100);

struct Conn {
    rx: FrameReceiver<OwnedReadHalf>,
    tx: FrameSender<OwnedWriteHalf>,
    buf: Vec<u32>,
}

/// Client side of a `StoreServer`.
///
/// Requests are serialized over a single connection, a waiting `get`
/// holds the connection until it resolves.
pub struct TcpStore {
    conn: Mutex<Conn>,
}

impl TcpStore {
    /// Connects to the store at `addr`, retrying until `timeout` elapses.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;

        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() >= deadline => return Err(e.into()),
                Err(e) => {
                    debug!("store not reachable at {addr}: {e}");
                    time::sleep(CONNECT_RETRY).await;
                }
            }
        };

        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = crate::channel(rx, tx);

        Ok(Self {
            conn: Mutex::new(Conn {
                rx,
                tx,
                buf: Vec::new(),
            }),
        })
    }

    async fn request(&self, cmd: Command) -> Result<Command> {
        let mut conn = self.conn.lock().await;
        let Conn { rx, tx, buf } = &mut *conn;

        tx.send(&Msg::Control(cmd)).await?;

        match rx.recv_into(buf).await? {
            Msg::Control(reply) => Ok(reply),
            Msg::Err(reason) => Err(StoreErr::Remote(reason.into_owned())),
            Msg::Data(_) => Err(StoreErr::Remote("unexpected data frame".into())),
        }
    }
}

impl RendezvousStore for TcpStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let cmd = Command::Set {
            key: key.to_string(),
            value: value.to_vec(),
        };

        match self.request(cmd).await? {
            Command::Ack => Ok(()),
            other => Err(StoreErr::Remote(format!("expected Ack, got {other:?}"))),
        }
    }

    async fn get(&self, key: &str, mode: GetMode) -> Result<Vec<u8>> {
        let wait_ms = match mode {
            GetMode::NoWait => None,
            GetMode::Wait(timeout) => Some(timeout.as_millis() as u64),
        };

        let cmd = Command::Get {
            key: key.to_string(),
            wait_ms,
        };

        match (self.request(cmd).await?, mode) {
            (Command::Value(Some(value)), _) => Ok(value),
            (Command::Value(None), GetMode::NoWait) => Err(StoreErr::KeyNotFound(key.to_string())),
            (Command::Value(None), GetMode::Wait(_)) => Err(StoreErr::Timeout(vec![key.to_string()])),
            (other, _) => Err(StoreErr::Remote(format!("expected Value, got {other:?}"))),
        }
    }

    async fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        for (i, key) in keys.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self.get(key, GetMode::Wait(remaining)).await {
                Ok(_) => {}
                Err(StoreErr::Timeout(_)) => {
                    let missing = keys[i..].iter().map(|key| key.to_string()).collect();
                    return Err(StoreErr::Timeout(missing));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Serves a `MemoryStore` to `TcpStore` clients.
pub struct StoreServer {
    listener: TcpListener,
    store: MemoryStore,
}

impl StoreServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            store: MemoryStore::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle to the served entries for in-process use.
    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }

    /// Accepts clients until the listener fails.
    pub async fn serve(self) -> io::Result<()> {
        let mut clients = JoinSet::new();
        info!("store serving at {}", self.listener.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            debug!("store client connected from {addr}");

            let store = self.store.clone();
            clients.spawn(async move {
                if let Err(e) = serve_client(store, stream).await {
                    warn!("store client {addr} failed: {e}");
                }
            });

            while clients.try_join_next().is_some() {}
        }
    }
}

async fn serve_client(store: MemoryStore, stream: TcpStream) -> io::Result<()> {
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = crate::channel(rx, tx);
    let mut buf: Vec<u32> = Vec::new();

    loop {
        let cmd = match rx.recv_into(&mut buf).await {
            Ok(Msg::Control(cmd)) => cmd,
            Ok(_) => {
                tx.send(&Msg::Err("expected a control frame".into())).await?;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let reply = match cmd {
            Command::Set { key, value } => {
                store.set(&key, &value).await?;
                Command::Ack
            }
            Command::Get { key, wait_ms } => {
                let mode = wait_ms.map_or(GetMode::NoWait, |ms| GetMode::Wait(Duration::from_millis(ms)));

                match store.get(&key, mode).await {
                    Ok(value) => Command::Value(Some(value)),
                    Err(StoreErr::KeyNotFound(_) | StoreErr::Timeout(_)) => Command::Value(None),
                    Err(e) => return Err(e.into()),
                }
            }
            Command::Disconnect => return Ok(()),
            other => {
                let msg = Msg::Err(format!("unsupported store command {other:?}").into());
                tx.send(&msg).await?;
                continue;
            }
        };

        tx.send(&Msg::Control(reply)).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_round_trips_through_server() {
        let server = StoreServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let local = server.store();
        tokio::spawn(server.serve());

        let client = TcpStore::connect(&addr, Duration::from_secs(5)).await.unwrap();
        client.set("architecture", b"llama").await.unwrap();

        assert_eq!(local.get("architecture", GetMode::NoWait).await.unwrap(), b"llama");
        assert!(matches!(
            client.get("missing", GetMode::NoWait).await,
            Err(StoreErr::KeyNotFound(_))
        ));

        local.set("0", b"{}").await.unwrap();
        let value = client
            .get("0", GetMode::Wait(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(value, b"{}");
    }

    #[tokio::test]
    async fn waiting_get_times_out() {
        let server = StoreServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(server.serve());

        let client = TcpStore::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let err = client
            .wait(&["a", "b"], Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreErr::Timeout(keys) if keys.len() == 2));
    }
}
