//! One peer's connection to the relay.
//!
//! The session owns every piece of client state (readiness, target, chat
//! buffers, file transfers, retry deadlines) and is driven by a single
//! `select!` loop over inbound frames, local commands and expired deadlines.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use parley_transfer::{
    ChatReassembler, ChunkOutcome, InboundFile, OutboundFile, RetryScheduler, SendState, TimerKey,
    TracingLogger, TransferEvent, TransferLog, TransferLogger, parse_chunk_id, parse_done,
    split_chat,
};
use parley_types::{ClientId, Frame, FrameCodec, FrameType, ProtocolError, Status};

use crate::command::Command;
use crate::config::ClientConfig;
use crate::filter::ContentFilter;

/// What a session observed, for embedders and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Assigned(ClientId),
    Waiting,
    Started,
    Peers(Vec<ClientId>),
    Alert(String),
    /// A gated command was refused before leaving the client.
    Blocked,
    ChatSent { chunks: usize },
    Chat { from: ClientId, text: String },
    RetryRequested { filename: String, seq: u32 },
    Resent { filename: String, seq: u32 },
    Progress { filename: String, percent: f64 },
    Saved { filename: String, path: PathBuf },
    ReceiveFailed { filename: String, reason: String },
    Acked { filename: String },
    SendFailed { filename: String, reason: String },
}

type InboundKey = (ClientId, String);

pub struct ClientSession {
    config: ClientConfig,
    filter: ContentFilter,
    logger: Arc<dyn TransferLogger>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,

    id: Option<ClientId>,
    ready: bool,
    peers: Vec<ClientId>,
    target: Option<ClientId>,

    chats: ChatReassembler,
    outbound: Option<OutboundFile>,
    inbound: HashMap<InboundKey, InboundFile>,
    timers: RetryScheduler<TimerKey>,

    /// Frames produced while handling the current event, flushed by `run`.
    pending: Vec<Frame>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        let filter = ContentFilter::new(&config.banned_words);
        Self {
            config,
            filter,
            logger: Arc::new(TracingLogger),
            events: None,
            id: None,
            ready: false,
            peers: Vec::new(),
            target: None,
            chats: ChatReassembler::new(),
            outbound: None,
            inbound: HashMap::new(),
            timers: RetryScheduler::new(),
            pending: Vec::new(),
        }
    }

    /// Mirror observations onto `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drive the session until the server closes the connection. Commands are
    /// optional: once the command channel closes the session keeps serving
    /// inbound traffic.
    pub async fn run(
        mut self,
        stream: TcpStream,
        mut commands: mpsc::Receiver<Command>,
    ) -> anyhow::Result<()> {
        socket2::SockRef::from(&stream).set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let mut frames_in = FramedRead::new(reader, FrameCodec::default());
        let mut frames_out = FramedWrite::new(writer, FrameCodec::default());
        let mut commands_open = true;

        let result = loop {
            tokio::select! {
                item = frames_in.next() => match item {
                    Some(Ok(Ok(frame))) => self.on_frame(frame).await,
                    Some(Ok(Err(e))) => warn!("Malformed frame from server: {}", e),
                    Some(Err(e)) => break Err(e.into()),
                    None => {
                        info!("Server closed the connection");
                        break Ok(());
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => commands_open = false,
                },
                Some(key) = self.timers.expired(), if !self.timers.is_empty() => {
                    self.on_timer(key);
                }
            }

            let mut flushed = Ok(());
            for frame in self.pending.drain(..) {
                if let Err(e) = frames_out.feed(frame).await {
                    flushed = Err(e);
                    break;
                }
            }
            if let Err(e) = flushed.and(frames_out.flush().await) {
                break Err(e.into());
            }
            self.arm_ack_deadline();
        };

        self.shutdown();
        result
    }

    async fn on_command(&mut self, command: Command) {
        if command.is_gated() && !self.ready {
            info!("Interaction blocked until START");
            self.emit(SessionEvent::Blocked);
            if let Some(id) = self.id {
                self.on_frame(Frame::wait(id)).await;
            }
            return;
        }

        match command {
            Command::Ping => debug!("ping"),
            Command::Target(target) => {
                info!("Target set to {}", target);
                self.target = Some(target);
            }
            Command::Chat(line) => self.send_chat(&line).await,
            Command::File(name) => self.send_file(&name).await,
        }
    }

    async fn send_chat(&mut self, line: &str) {
        let (Some(id), Some(target)) = (self.id, self.target) else {
            warn!("No target selected; enter a client id first");
            return;
        };

        if let Err(ProtocolError::ContentBlocked(reason)) = self.filter.check(line) {
            warn!("Chat message blocked locally");
            self.on_frame(Frame::alert(id, reason)).await;
            return;
        }

        let frames = split_chat(id, target, line.as_bytes(), self.config.transfer.max_payload);
        let chunks = frames.len();
        if let Some(first) = frames.first() {
            self.logger.log(TransferLog {
                component: "chat",
                transfer_id: first.id.clone(),
                event: TransferEvent::ChatSent { chunks },
            });
        }
        self.pending.extend(frames);
        self.emit(SessionEvent::ChatSent { chunks });
    }

    async fn send_file(&mut self, name: &str) {
        let (Some(id), Some(target)) = (self.id, self.target) else {
            warn!("No target selected; enter a client id first");
            return;
        };
        if let Some(active) = &self.outbound {
            warn!("Transfer of '{}' still in progress", active.filename());
            return;
        }

        let Some(filename) = base_name(name) else {
            warn!("Invalid file name {:?}", name);
            return;
        };
        let path = self.config.send_dir.join(&filename);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                return;
            }
        };

        let mut outbound = OutboundFile::new(id, target, &filename, &data, self.config.transfer.file_chunk)
            .with_loss(self.config.simulate_loss.clone())
            .with_logger(self.logger.clone());
        if outbound.total_chunks() > self.config.transfer.max_file_chunks {
            warn!(
                "'{}' needs {} chunks, peers accept at most {}",
                filename,
                outbound.total_chunks(),
                self.config.transfer.max_file_chunks
            );
            return;
        }
        self.pending.extend(outbound.start());
        self.outbound = Some(outbound);
    }

    /// Start the ACK deadline once the whole opening burst has been flushed,
    /// so a slow write never counts against the receiver.
    fn arm_ack_deadline(&mut self) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        if outbound.state() != SendState::AwaitingAck {
            return;
        }
        let after = self.config.transfer.ack_timeout(outbound.total_chunks());
        self.timers.schedule_if_idle(
            TimerKey::Ack {
                transfer: outbound.transfer_id().to_string(),
            },
            after,
        );
    }

    async fn on_frame(&mut self, frame: Frame) {
        info!("Received frame: {}", frame);

        match (frame.kind, frame.status) {
            (_, Status::IdAssign) => match frame.payload_str().trim().parse() {
                Ok(id) => {
                    info!("Assigned client ID: {}", id);
                    self.id = Some(id);
                    self.emit(SessionEvent::Assigned(id));
                }
                Err(_) => warn!("Bad ID_ASSIGN payload {:?}", frame.payload_str()),
            },
            (FrameType::System, Status::Wait) => {
                self.ready = false;
                self.emit(SessionEvent::Waiting);
            }
            (FrameType::System, Status::Start) => {
                self.ready = true;
                self.emit(SessionEvent::Started);
            }
            (FrameType::System, Status::List) => self.on_list(frame.list_peers()),
            (_, Status::Alert) => {
                let reason = frame.payload_str().into_owned();
                warn!("Alert: {}", reason);
                self.emit(SessionEvent::Alert(reason));
            }
            (FrameType::Chat, _) => {
                if let Some(message) = self.chats.accept(frame) {
                    let text = message.payload_str().into_owned();
                    info!("[CHAT] Message from {}: {}", message.src, text);
                    self.emit(SessionEvent::Chat {
                        from: message.src,
                        text,
                    });
                }
            }
            (FrameType::File, Status::Incoming) => self.on_incoming(&frame),
            (FrameType::File, Status::Chunk) => self.on_chunk(&frame).await,
            (FrameType::File, Status::Done) => self.on_done(&frame).await,
            (FrameType::File, Status::Retry) => self.on_retry(&frame),
            (FrameType::Ack, Status::Ack) => self.on_ack(&frame),
            _ => debug!("Ignoring frame {}", frame),
        }
    }

    fn on_list(&mut self, peers: Vec<ClientId>) {
        let present: HashSet<ClientId> = peers.iter().copied().collect();
        for gone in self.peers.iter().filter(|p| !present.contains(*p)) {
            self.chats.forget_peer(*gone);
        }

        let departed: Vec<InboundKey> = self
            .inbound
            .keys()
            .filter(|(peer, _)| !present.contains(peer))
            .cloned()
            .collect();
        for key in departed {
            self.fail_inbound(&key, "sender disconnected");
        }

        let target_gone = self
            .outbound
            .as_ref()
            .is_some_and(|o| !present.contains(&o.target()));
        if target_gone {
            self.fail_outbound("receiver disconnected");
        }

        self.peers = peers.clone();
        self.emit(SessionEvent::Peers(peers));
    }

    fn on_incoming(&mut self, frame: &Frame) {
        let Some(id) = self.id else {
            return;
        };
        let key = (frame.src, frame.id.clone());
        if self.inbound.contains_key(&key) {
            debug!("Duplicate announcement for {}", frame.id);
            return;
        }
        let max_chunks = self.config.transfer.max_file_chunks;
        let Some(file) = InboundFile::from_announcement(id, frame, max_chunks) else {
            warn!(
                "Refusing INCOMING {:?}: malformed or over {} chunks",
                frame.payload_str(),
                max_chunks
            );
            return;
        };
        let file = file.with_logger(self.logger.clone());

        let retry_timeout = self.config.transfer.retry_timeout;
        let total = file.total_chunks();
        if total > 0 {
            self.timers.schedule_if_idle(chunk_timer(&key, 0), retry_timeout);
        }
        self.timers.schedule(chunk_timer(&key, total), retry_timeout);
        self.inbound.insert(key, file);
    }

    async fn on_chunk(&mut self, frame: &Frame) {
        let Some((transfer, seq)) = parse_chunk_id(&frame.id) else {
            warn!("Bad chunk id {:?}", frame.id);
            return;
        };
        let key = (frame.src, transfer.to_string());
        let Some(file) = self.inbound.get_mut(&key) else {
            debug!("Chunk for unknown transfer {}", frame.id);
            return;
        };

        let (percent, gaps) = match file.on_chunk(seq, &frame.payload) {
            ChunkOutcome::Accepted { percent, gaps } => (percent, gaps),
            ChunkOutcome::Duplicate => return,
            ChunkOutcome::Rejected => {
                warn!("Rejected chunk #{} of '{}'", seq, file.filename());
                return;
            }
        };
        let filename = file.filename().to_string();
        let total = file.total_chunks();
        let awaiting_done = !file.done_received();

        let retry_timeout = self.config.transfer.retry_timeout;
        self.timers.cancel(&chunk_timer(&key, seq));
        for gap in gaps {
            self.timers.schedule_if_idle(chunk_timer(&key, gap), retry_timeout);
        }
        if awaiting_done {
            self.timers.schedule(chunk_timer(&key, total), retry_timeout);
        }

        self.emit(SessionEvent::Progress { filename, percent });
        self.try_complete(&key).await;
    }

    async fn on_done(&mut self, frame: &Frame) {
        let key = (frame.src, frame.id.clone());
        let Some(file) = self.inbound.get_mut(&key) else {
            debug!("DONE for unknown transfer {}", frame.id);
            return;
        };
        let Some((_, digest)) = parse_done(&frame.payload_str()) else {
            warn!("Bad DONE payload {:?}", frame.payload_str());
            return;
        };
        if !file.on_done(digest) {
            return;
        }

        let total = file.total_chunks();
        let missing = file.missing();
        let empty = total == 0;
        let filename = file.filename().to_string();

        let retry_timeout = self.config.transfer.retry_timeout;
        self.timers.cancel(&chunk_timer(&key, total));
        for seq in missing {
            self.timers.schedule_if_idle(chunk_timer(&key, seq), retry_timeout);
        }
        if empty {
            self.emit(SessionEvent::Progress {
                filename,
                percent: 100.0,
            });
        }
        self.try_complete(&key).await;
    }

    fn on_retry(&mut self, frame: &Frame) {
        let Some((transfer, seq)) = parse_chunk_id(&frame.id) else {
            warn!("Bad retry id {:?}", frame.id);
            return;
        };
        let Some(outbound) = self.outbound.as_mut() else {
            return;
        };
        if outbound.transfer_id() != transfer || outbound.target() != frame.src {
            return;
        }
        let filename = outbound.filename().to_string();
        if let Some(resent) = outbound.on_retry(seq) {
            self.pending.push(resent);
        }
        // The receiver is still working on it; restart the ACK deadline.
        if outbound.state() == SendState::AwaitingAck {
            let after = self.config.transfer.ack_timeout(outbound.total_chunks());
            self.timers.schedule(
                TimerKey::Ack {
                    transfer: transfer.to_string(),
                },
                after,
            );
        }
        if seq < outbound.total_chunks() {
            self.emit(SessionEvent::Resent { filename, seq });
        }
    }

    fn on_ack(&mut self, frame: &Frame) {
        let matches = self
            .outbound
            .as_ref()
            .is_some_and(|o| o.transfer_id() == frame.id && o.target() == frame.src);
        if !matches {
            debug!("Stray ACK {}", frame.id);
            return;
        }
        let Some(mut outbound) = self.outbound.take() else {
            return;
        };
        if outbound.on_ack() {
            self.timers.cancel(&TimerKey::Ack {
                transfer: outbound.transfer_id().to_string(),
            });
            self.emit(SessionEvent::Acked {
                filename: outbound.filename().to_string(),
            });
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Ack { transfer } => {
                let expired = self
                    .outbound
                    .as_ref()
                    .is_some_and(|o| o.transfer_id() == transfer);
                if expired {
                    self.fail_outbound("no ACK before deadline");
                }
            }
            TimerKey::Chunk {
                peer,
                transfer,
                seq,
            } => {
                let key = (peer, transfer);
                let ceiling = self.config.transfer.retry_ceiling;
                let Some(file) = self.inbound.get_mut(&key) else {
                    return;
                };
                if !file.is_missing(seq) {
                    return;
                }
                match file.request_retry(seq, ceiling) {
                    Ok(retry) => {
                        let filename = file.filename().to_string();
                        self.pending.push(retry);
                        self.timers
                            .schedule(chunk_timer(&key, seq), self.config.transfer.retry_timeout);
                        self.emit(SessionEvent::RetryRequested { filename, seq });
                    }
                    Err(e) => {
                        warn!("{}", e);
                        self.fail_inbound(&key, &e.to_string());
                    }
                }
            }
        }
    }

    /// Save, verify and acknowledge once every chunk and DONE are in.
    async fn try_complete(&mut self, key: &InboundKey) {
        if !self.inbound.get(key).is_some_and(InboundFile::is_ready) {
            return;
        }
        let Some(file) = self.inbound.remove(key) else {
            return;
        };
        self.cancel_inbound_timers(key);

        let data = match file.assemble() {
            Ok(data) => data,
            Err(e) => {
                warn!("{}", e);
                file.fail(&e.to_string());
                self.emit(SessionEvent::ReceiveFailed {
                    filename: file.filename().to_string(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        match save(&self.config.recv_dir, file.filename(), &data).await {
            Ok(path) => {
                file.mark_saved();
                self.pending.push(file.ack());
                self.emit(SessionEvent::Saved {
                    filename: file.filename().to_string(),
                    path,
                });
            }
            Err(e) => {
                warn!("Cannot save '{}': {}", file.filename(), e);
                file.fail(&e.to_string());
                self.emit(SessionEvent::ReceiveFailed {
                    filename: file.filename().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn fail_inbound(&mut self, key: &InboundKey, reason: &str) {
        self.cancel_inbound_timers(key);
        if let Some(file) = self.inbound.remove(key) {
            file.fail(reason);
            self.emit(SessionEvent::ReceiveFailed {
                filename: file.filename().to_string(),
                reason: reason.to_string(),
            });
        }
    }

    fn fail_outbound(&mut self, reason: &str) {
        let Some(mut outbound) = self.outbound.take() else {
            return;
        };
        self.timers.cancel(&TimerKey::Ack {
            transfer: outbound.transfer_id().to_string(),
        });
        outbound.fail(reason);
        self.emit(SessionEvent::SendFailed {
            filename: outbound.filename().to_string(),
            reason: reason.to_string(),
        });
    }

    fn cancel_inbound_timers(&mut self, (peer, transfer): &InboundKey) {
        self.timers.cancel_where(|k| {
            matches!(k, TimerKey::Chunk { peer: p, transfer: t, .. } if p == peer && t == transfer)
        });
    }

    /// Drop every transfer and deadline when the connection ends.
    fn shutdown(&mut self) {
        let keys: Vec<InboundKey> = self.inbound.keys().cloned().collect();
        for key in keys {
            self.fail_inbound(&key, "connection closed");
        }
        self.fail_outbound("connection closed");
        self.timers.clear();
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn chunk_timer((peer, transfer): &InboundKey, seq: u32) -> TimerKey {
    TimerKey::Chunk {
        peer: *peer,
        transfer: transfer.clone(),
        seq,
    }
}

/// Final path component only, so a peer cannot write outside the directory.
fn base_name(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(String::from)
}

/// Write to `<name>.part` then rename, so a failed write never looks saved.
async fn save(dir: &Path, filename: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    let name = base_name(filename).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty file name")
    })?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&name);
    let partial = dir.join(format!("{}.part", name));
    tokio::fs::write(&partial, data).await?;
    tokio::fs::rename(&partial, &path).await?;
    Ok(path)
}
