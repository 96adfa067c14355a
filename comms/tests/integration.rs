use std::time::Duration;

use comms::{
    Collective, CollectiveErr, Deserialize, Serialize, TcpGroup,
    msg::{Command, Msg, Payload},
    specs::group::GroupSpec,
};
use tokio::{io, net::TcpListener, task::JoinSet};

struct MyStr<'a>(&'a str);

impl<'a> Serialize<'a> for MyStr<'_> {
    fn serialize(&'a self, _buf: &mut Vec<u8>) -> std::io::Result<Option<&'a [u8]>> {
        Ok(Some(self.0.as_bytes()))
    }
}

impl<'a> Deserialize<'a> for MyStr<'a> {
    fn deserialize(buf: &'a [u8]) -> std::io::Result<Self> {
        let s = str::from_utf8(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self(s))
    }
}

#[test]
fn serialize_deserialize() {
    let s = MyStr("Hello, world!");
    let serialized = s.serialize(&mut Vec::new()).unwrap().unwrap();
    let deserialized = MyStr::deserialize(serialized).unwrap();
    assert_eq!(deserialized.0, s.0);
}

#[tokio::test]
async fn send_recv() {
    const SIZE: usize = 128;

    let msg = MyStr("Hello, world!");

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    tx.send(&msg).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let s: MyStr = rx.recv_into(&mut buf).await.unwrap();

    assert_eq!(msg.0, s.0);
}

#[tokio::test]
async fn broadcast_frame_over_duplex() {
    let (one, two) = io::duplex(1024);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    let payload = vec![7u8; 300];
    tx.send(&Msg::Data(Payload::Broadcast(&payload))).await.unwrap();
    tx.send(&Msg::Control(Command::Barrier)).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Broadcast(bytes)) => assert_eq!(bytes, payload.as_slice()),
        other => panic!("unexpected {other:?}"),
    }

    assert!(matches!(
        rx.recv_into(&mut buf).await.unwrap(),
        Msg::Control(Command::Barrier)
    ));
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

#[tokio::test]
async fn tcp_group_runs_every_collective() {
    const WORLD_SIZE: usize = 3;

    let (listener, addr) = bind().await;
    let timeout = Duration::from_secs(10);
    let mut set = JoinSet::new();

    let spec = GroupSpec::new(addr.clone(), WORLD_SIZE, 0).with_timeout(timeout);
    set.spawn(async move {
        let mut group = TcpGroup::host(listener, &spec).await.unwrap();
        run_collectives(&mut group).await
    });

    for rank in 1..WORLD_SIZE {
        let spec = GroupSpec::new(addr.clone(), WORLD_SIZE, rank).with_timeout(timeout);
        set.spawn(async move {
            let mut group = TcpGroup::connect(&spec).await.unwrap();
            run_collectives(&mut group).await
        });
    }

    while let Some(out) = set.join_next().await {
        let (bytes, sum) = out.unwrap();
        assert_eq!(bytes, vec![9, 8, 7, 6]);
        assert_eq!(sum, vec![3.0, 6.0]);
    }
}

async fn run_collectives(group: &mut TcpGroup) -> (Vec<u8>, Vec<f32>) {
    group.barrier().await.unwrap();

    let mut bytes = if group.is_sender() {
        vec![9, 8, 7, 6]
    } else {
        vec![0u8; 4]
    };
    group.broadcast(&mut bytes).await.unwrap();

    let mut sum = vec![1.0, group.rank() as f32 + 1.0];
    group.all_reduce_sum(&mut sum).await.unwrap();
    group.barrier().await.unwrap();

    (bytes, sum)
}

#[tokio::test]
async fn tcp_group_rejects_mismatched_world_size() {
    let (listener, addr) = bind().await;
    let timeout = Duration::from_secs(10);

    let host_spec = GroupSpec::new(addr.clone(), 2, 0).with_timeout(timeout);
    let host = tokio::spawn(async move { TcpGroup::host(listener, &host_spec).await.err() });

    let peer_spec = GroupSpec::new(addr, 3, 1).with_timeout(timeout);
    let peer = TcpGroup::connect(&peer_spec).await.err();

    assert!(matches!(peer, Some(CollectiveErr::JoinMismatch(_))));
    assert!(matches!(host.await.unwrap(), Some(CollectiveErr::JoinMismatch(_))));
}
