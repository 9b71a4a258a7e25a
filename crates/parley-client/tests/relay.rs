//! End-to-end tests: an in-process gateway on loopback with real TCP
//! clients driven through their command channels.
//!
//! Each test reads the `SessionEvent` stream the sessions mirror, which
//! carries the same observations the log lines do.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use parley_client::{ClientConfig, ClientSession, Command, SessionEvent};
use parley_gateway::{Gateway, GatewayConfig};
use parley_transfer::{LossSimulator, TransferSettings};
use parley_types::{ClientId, Frame, FrameType, Status};

const PATIENCE: Duration = Duration::from_secs(10);

struct Peer {
    id: ClientId,
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Peer {
    async fn send(&self, command: Command) {
        self.commands.send(command).await.unwrap();
    }

    /// Events up to and including the first one `pred` accepts.
    async fn until(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        timeout(PATIENCE, async {
            loop {
                let event = self.events.recv().await.expect("session ended");
                let done = pred(&event);
                seen.push(event);
                if done {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out; saw {:?}", seen));
        seen
    }

    /// Whatever arrives within `quiet`.
    async fn drain(&mut self, quiet: Duration) -> Vec<SessionEvent> {
        tokio::time::sleep(quiet).await;
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

async fn spawn_gateway() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Gateway::new(GatewayConfig::default()).run(listener));
    addr
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        server_addr: addr.to_string(),
        ..Default::default()
    }
}

async fn connect(config: ClientConfig) -> Peer {
    let stream = TcpStream::connect(&config.server_addr).await.unwrap();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (commands, command_rx) = mpsc::channel(16);
    let task = tokio::spawn(ClientSession::new(config).with_events(event_tx).run(stream, command_rx));

    let id = timeout(PATIENCE, async {
        loop {
            if let SessionEvent::Assigned(id) = events.recv().await.expect("session ended") {
                return id;
            }
        }
    })
    .await
    .expect("no ID_ASSIGN");

    Peer {
        id,
        commands,
        events,
        task,
    }
}

/// Two started peers, `a` targeting `b`.
async fn pair(a_config: ClientConfig, b_config: ClientConfig) -> (Peer, Peer) {
    let mut a = connect(a_config).await;
    let mut b = connect(b_config).await;
    a.until(|e| *e == SessionEvent::Started).await;
    b.until(|e| *e == SessionEvent::Started).await;
    a.send(Command::Target(b.id)).await;
    (a, b)
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("parley_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("send")).unwrap();
    dir
}

fn file_config(addr: SocketAddr, dir: &Path) -> ClientConfig {
    ClientConfig {
        file_transfer: true,
        send_dir: dir.join("send"),
        recv_dir: dir.join("recv"),
        ..config(addr)
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn lone_client_is_gated() {
    let addr = spawn_gateway().await;
    let mut a = connect(config(addr)).await;
    a.until(|e| *e == SessionEvent::Waiting).await;

    a.send(Command::Target(a.id + 1)).await;
    a.send(Command::Chat("chat anyone there?".into())).await;
    let seen = a.until(|e| *e == SessionEvent::Waiting).await;
    assert!(seen.contains(&SessionEvent::Blocked));
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::ChatSent { .. })));

    // A later peer never sees the refused message.
    let mut b = connect(config(addr)).await;
    b.until(|e| *e == SessionEvent::Started).await;
    let late = b.drain(Duration::from_millis(200)).await;
    assert!(!late.iter().any(|e| matches!(e, SessionEvent::Chat { .. })));
}

#[tokio::test]
async fn second_client_starts_everyone() {
    let addr = spawn_gateway().await;
    let mut a = connect(config(addr)).await;
    let before = a.until(|e| matches!(e, SessionEvent::Peers(_))).await;
    assert!(before.contains(&SessionEvent::Waiting));
    assert!(!before.contains(&SessionEvent::Started));

    let mut b = connect(config(addr)).await;
    a.until(|e| *e == SessionEvent::Started).await;
    let peers = a.until(|e| matches!(e, SessionEvent::Peers(_))).await;
    assert_eq!(peers.last(), Some(&SessionEvent::Peers(vec![a.id, b.id])));
    b.until(|e| *e == SessionEvent::Started).await;

    a.send(Command::Target(b.id)).await;
    a.send(Command::Chat("chat hello".into())).await;
    let got = b.until(|e| matches!(e, SessionEvent::Chat { .. })).await;
    assert_eq!(
        got.last(),
        Some(&SessionEvent::Chat {
            from: a.id,
            text: "chat hello".into()
        })
    );
}

#[tokio::test]
async fn long_chat_is_chunked_and_reassembled() {
    let addr = spawn_gateway().await;
    let small = ClientConfig {
        transfer: TransferSettings {
            max_payload: 64,
            ..Default::default()
        },
        ..config(addr)
    };
    let (mut a, mut b) = pair(small, config(addr)).await;

    let mut line = String::from("chat ");
    while line.len() < 1000 {
        line.push_str("a longer message | with pipes \\ and slashes ");
    }
    a.send(Command::Chat(line.clone())).await;

    let sent = a.until(|e| matches!(e, SessionEvent::ChatSent { .. })).await;
    match sent.last() {
        Some(SessionEvent::ChatSent { chunks }) => assert!(*chunks > 1),
        other => panic!("unexpected {:?}", other),
    }
    let got = b.until(|e| matches!(e, SessionEvent::Chat { .. })).await;
    assert_eq!(
        got.last(),
        Some(&SessionEvent::Chat {
            from: a.id,
            text: line
        })
    );
}

#[tokio::test]
async fn profanity_never_leaves_the_sender() {
    let addr = spawn_gateway().await;
    let (mut a, mut b) = pair(config(addr), config(addr)).await;

    a.send(Command::Chat("chat This is fuck bad".into())).await;
    let seen = a.until(|e| matches!(e, SessionEvent::Alert(_))).await;
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::Alert("Inappropriate language detected".into()))
    );
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::ChatSent { .. })));

    let after = a.drain(Duration::from_millis(200)).await;
    assert!(!after.iter().any(|e| matches!(e, SessionEvent::Alert(_))));
    let leaked = b.drain(Duration::from_millis(50)).await;
    assert!(!leaked.iter().any(|e| matches!(e, SessionEvent::Chat { .. })));
}

#[tokio::test]
async fn file_transfer_without_loss() {
    let addr = spawn_gateway().await;
    let dir = scratch("clean");
    let data = sample(5000);
    std::fs::write(dir.join("send/test_file.txt"), &data).unwrap();

    let (mut a, mut b) = pair(file_config(addr, &dir), file_config(addr, &dir)).await;
    a.send(Command::File("test_file.txt".into())).await;

    let seen = b.until(|e| matches!(e, SessionEvent::Saved { .. })).await;
    let progress: Vec<f64> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 5);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&100.0));
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::RetryRequested { .. })));

    let saved = std::fs::read(dir.join("recv/test_file.txt")).unwrap();
    assert_eq!(saved, data);

    a.until(|e| matches!(e, SessionEvent::Acked { .. })).await;
    let extra = a.drain(Duration::from_millis(300)).await;
    assert!(!extra.iter().any(|e| matches!(e, SessionEvent::Acked { .. })));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn empty_file_transfers() {
    let addr = spawn_gateway().await;
    let dir = scratch("empty");
    std::fs::write(dir.join("send/empty.bin"), b"").unwrap();

    let (mut a, mut b) = pair(file_config(addr, &dir), file_config(addr, &dir)).await;
    a.send(Command::File("empty.bin".into())).await;

    let seen = b.until(|e| matches!(e, SessionEvent::Saved { .. })).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Progress { percent, .. } if *percent == 100.0
    )));
    a.until(|e| matches!(e, SessionEvent::Acked { .. })).await;
    assert!(std::fs::read(dir.join("recv/empty.bin")).unwrap().is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}

fn lossy(addr: SocketAddr, dir: &Path, ceiling: u32, drops: u32) -> ClientConfig {
    ClientConfig {
        transfer: TransferSettings {
            retry_ceiling: ceiling,
            retry_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        simulate_loss: Some(LossSimulator::new(0, drops)),
        ..file_config(addr, dir)
    }
}

#[tokio::test]
async fn lost_first_chunk_is_retried() {
    let addr = spawn_gateway().await;
    let dir = scratch("retry");
    let data = sample(4000);
    std::fs::write(dir.join("send/test_file.txt"), &data).unwrap();

    // Dropped up to one short of the ceiling; still completes.
    let ceiling = 5;
    let (mut a, mut b) = pair(
        lossy(addr, &dir, ceiling, ceiling - 1),
        lossy(addr, &dir, ceiling, 0),
    )
    .await;
    a.send(Command::File("test_file.txt".into())).await;

    let seen = b.until(|e| matches!(e, SessionEvent::Saved { .. })).await;
    let retries: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::RetryRequested { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert!(!retries.is_empty());
    assert!(retries.iter().all(|seq| *seq == 0));
    assert_eq!(std::fs::read(dir.join("recv/test_file.txt")).unwrap(), data);

    let sent = a.until(|e| matches!(e, SessionEvent::Acked { .. })).await;
    assert!(sent.iter().all(|e| match e {
        SessionEvent::Resent { seq, .. } => *seq == 0,
        _ => true,
    }));
    assert!(sent.iter().any(|e| matches!(e, SessionEvent::Resent { .. })));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn retry_ceiling_fails_the_transfer() {
    let addr = spawn_gateway().await;
    let dir = scratch("ceiling");
    std::fs::write(dir.join("send/test_file.txt"), sample(3000)).unwrap();

    let (mut a, mut b) = pair(lossy(addr, &dir, 2, 100), lossy(addr, &dir, 2, 0)).await;
    a.send(Command::File("test_file.txt".into())).await;

    let seen = b
        .until(|e| matches!(e, SessionEvent::ReceiveFailed { .. }))
        .await;
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::Saved { .. })));
    let later = b.drain(Duration::from_millis(300)).await;
    assert!(!later.iter().any(|e| matches!(
        e,
        SessionEvent::Saved { .. } | SessionEvent::RetryRequested { .. }
    )));
    assert!(!dir.join("recv/test_file.txt").exists());

    // Without an ACK the sender gives up too and frees its slot.
    a.until(|e| matches!(e, SessionEvent::SendFailed { .. })).await;

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn departed_client_leaves_the_list() {
    let addr = spawn_gateway().await;
    let (mut a, b) = pair(config(addr), config(addr)).await;
    let c = connect(config(addr)).await;
    let all = SessionEvent::Peers(vec![a.id, b.id, c.id]);
    a.until(|e| *e == all).await;

    c.task.abort();
    let seen = a.until(|e| matches!(e, SessionEvent::Peers(_))).await;
    assert_eq!(seen.last(), Some(&SessionEvent::Peers(vec![a.id, b.id])));

    // Two remain, so nobody is sent back to waiting.
    assert!(!seen.contains(&SessionEvent::Waiting));
}

#[tokio::test]
async fn sender_departure_cancels_inbound_transfer() {
    let addr = spawn_gateway().await;
    let dir = scratch("depart");
    std::fs::write(dir.join("send/test_file.txt"), sample(3000)).unwrap();

    // Every chunk 0 transmission is lost, so the receiver stays mid-transfer.
    let (a, mut b) = pair(lossy(addr, &dir, 50, 1000), lossy(addr, &dir, 50, 0)).await;
    a.send(Command::File("test_file.txt".into())).await;
    b.until(|e| matches!(e, SessionEvent::RetryRequested { .. })).await;

    a.task.abort();
    let seen = b
        .until(|e| matches!(e, SessionEvent::ReceiveFailed { .. }))
        .await;
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::Saved { .. })));

    let later = b.drain(Duration::from_millis(300)).await;
    assert!(!later.iter().any(|e| matches!(e, SessionEvent::RetryRequested { .. })));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn large_transfer_outlives_base_ack_deadline() {
    let addr = spawn_gateway().await;
    let dir = scratch("large");
    let data = sample(128 * 1024);
    std::fs::write(dir.join("send/large.bin"), &data).unwrap();

    // A 2 ms retry budget on the sending side; only the per-chunk allowance
    // and the post-flush start keep the ACK deadline alive.
    let impatient = ClientConfig {
        transfer: TransferSettings {
            file_chunk: 64,
            retry_ceiling: 0,
            retry_timeout: Duration::from_millis(1),
            ..Default::default()
        },
        ..file_config(addr, &dir)
    };
    let (mut a, mut b) = pair(impatient, file_config(addr, &dir)).await;
    a.send(Command::File("large.bin".into())).await;

    b.until(|e| matches!(e, SessionEvent::Saved { .. })).await;
    assert_eq!(std::fs::read(dir.join("recv/large.bin")).unwrap(), data);

    let sent = a
        .until(|e| matches!(e, SessionEvent::Acked { .. } | SessionEvent::SendFailed { .. }))
        .await;
    assert!(matches!(sent.last(), Some(SessionEvent::Acked { .. })), "{:?}", sent.last());

    let _ = std::fs::remove_dir_all(&dir);
}

async fn read_frame(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    pred: impl Fn(&Frame) -> bool,
) -> Frame {
    timeout(PATIENCE, async {
        loop {
            let line = lines.next_line().await.unwrap().expect("connection closed");
            if let Ok(frame) = parley_types::codec::decode(line.as_bytes()) {
                if pred(&frame) {
                    return frame;
                }
            }
        }
    })
    .await
    .expect("frame never arrived")
}

#[tokio::test]
async fn malformed_line_does_not_end_the_connection() {
    let addr = spawn_gateway().await;
    let mut a = connect(config(addr)).await;

    let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut lines = BufReader::new(reader).lines();
    let assigned = read_frame(&mut lines, |f| f.status == Status::IdAssign).await;
    let raw_id: ClientId = assigned.payload_str().parse().unwrap();
    read_frame(&mut lines, |f| f.status == Status::Start).await;
    a.until(|e| *e == SessionEvent::Started).await;

    writer.write_all(b"garbage\n").await.unwrap();
    writer.write_all(b"x|chat|1|2|h\\qi|READY\n").await.unwrap();
    let line = format!("m1_0_1|chat|{}|{}|chat still here|READY\n", raw_id, a.id);
    writer.write_all(line.as_bytes()).await.unwrap();

    let got = a.until(|e| matches!(e, SessionEvent::Chat { .. })).await;
    assert_eq!(
        got.last(),
        Some(&SessionEvent::Chat {
            from: raw_id,
            text: "chat still here".into()
        })
    );

    a.send(Command::Target(raw_id)).await;
    a.send(Command::Chat("chat welcome back".into())).await;
    let reply = read_frame(&mut lines, |f| f.kind == FrameType::Chat).await;
    assert_eq!((reply.src, reply.dst), (a.id, raw_id));
    assert_eq!(reply.payload_str(), "chat welcome back");
}
