use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use parley_types::{ClientId, Frame};

/// Peers required before chat and file commands are admitted.
pub const MIN_PEERS: usize = 2;

/// Per-client readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Waiting,
    Ready,
}

/// Frames parked once an outbox overflows, at most this many.
const BACKLOG_LIMIT: usize = 1024;

/// Bounded outbound queue feeding one connection's writer task.
///
/// Once a frame has to wait for room, every later frame queues behind it in a
/// per-outbox backlog until a single drain task has flushed it, so a
/// connection always sees frames in the order they were delivered.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
    send_timeout: Duration,
    backlog: Arc<std::sync::Mutex<Backlog>>,
}

#[derive(Debug, Default)]
struct Backlog {
    frames: VecDeque<Frame>,
    draining: bool,
}

impl Backlog {
    fn park(&mut self, frame: Frame) -> bool {
        if self.frames.len() >= BACKLOG_LIMIT {
            warn!("backlog for {} full, dropping frame {}", frame.dst, frame.id);
            return false;
        }
        self.frames.push_back(frame);
        true
    }
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Frame>, send_timeout: Duration) -> Self {
        Self {
            tx,
            send_timeout,
            backlog: Arc::default(),
        }
    }

    /// Enqueue, waiting at most `send_timeout` for room. Behind a backlog the
    /// frame is parked instead.
    pub async fn deliver(&self, frame: Frame) -> bool {
        {
            let mut backlog = self.backlog();
            if backlog.draining {
                return backlog.park(frame);
            }
        }
        self.send_waiting(frame).await
    }

    /// Enqueue without waiting. When the queue is full the frame starts a
    /// backlog drained by a background task, so the caller never blocks.
    pub fn deliver_now(&self, frame: Frame) {
        let mut backlog = self.backlog();
        if backlog.draining {
            backlog.park(frame);
            return;
        }
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!("outbound queue for {} full, deferring frame {}", frame.dst, frame.id);
                backlog.frames.push_back(frame);
                backlog.draining = true;
                drop(backlog);
                self.spawn_drain();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn spawn_drain(&self) {
        let outbox = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = {
                    let mut backlog = outbox.backlog();
                    match backlog.frames.pop_front() {
                        Some(frame) => frame,
                        None => {
                            backlog.draining = false;
                            return;
                        }
                    }
                };
                if !outbox.send_waiting(frame).await && outbox.tx.is_closed() {
                    let mut backlog = outbox.backlog();
                    backlog.frames.clear();
                    backlog.draining = false;
                    return;
                }
            }
        });
    }

    async fn send_waiting(&self, frame: Frame) -> bool {
        match self.tx.send_timeout(frame, self.send_timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(frame)) => {
                warn!("outbound queue for {} stayed full, dropping frame {}", frame.dst, frame.id);
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }

    fn backlog(&self) -> std::sync::MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One connected peer.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub outbox: Outbox,
    pub connected_at: DateTime<Utc>,
    pub readiness: Readiness,
}

/// Owns client id allocation, the connected-peer set and readiness gating.
///
/// Every mutation and the broadcasts it triggers happen under one lock, so a
/// LIST always reflects a fully applied connect or disconnect. Frames are only
/// enqueued while the lock is held; socket writes happen in writer tasks.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<RegistryState>>,
}

struct RegistryState {
    /// Next id to hand out. Never decremented, so ids are never reused.
    next_id: ClientId,
    clients: BTreeMap<ClientId, ClientRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState {
                next_id: 1,
                clients: BTreeMap::new(),
            })),
        }
    }

    /// Admit a new connection: assign its id, update readiness, broadcast LIST.
    pub async fn register(&self, outbox: Outbox) -> ClientId {
        let mut state = self.inner.lock().await;

        let id = state.next_id;
        state.next_id += 1;

        outbox.deliver_now(Frame::id_assign(id));
        state.clients.insert(
            id,
            ClientRecord {
                id,
                outbox,
                connected_at: Utc::now(),
                readiness: Readiness::Waiting,
            },
        );
        info!("Assigned client ID: {} ({} connected)", id, state.clients.len());

        state.update_readiness(Some(id));
        state.broadcast_list();
        id
    }

    /// Drop a connection's record, re-evaluate readiness and tell the survivors.
    pub async fn unregister(&self, id: ClientId) -> Option<ClientRecord> {
        let mut state = self.inner.lock().await;
        let record = state.clients.remove(&id)?;

        let connected_for = Utc::now() - record.connected_at;
        info!(
            "Client {} disconnected after {}s ({} remaining)",
            id,
            connected_for.num_seconds(),
            state.clients.len()
        );

        state.update_readiness(None);
        state.broadcast_list();
        Some(record)
    }

    /// Outbox and readiness of a connected client.
    pub async fn lookup(&self, id: ClientId) -> Option<(Outbox, Readiness)> {
        let state = self.inner.lock().await;
        state
            .clients
            .get(&id)
            .map(|record| (record.outbox.clone(), record.readiness))
    }

    pub async fn readiness(&self, id: ClientId) -> Option<Readiness> {
        self.inner.lock().await.clients.get(&id).map(|r| r.readiness)
    }

}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    /// Move every client to the readiness the current peer count implies and
    /// send WAIT or START to those whose state changed. The newcomer starts as
    /// `Waiting` but always hears one of the two.
    fn update_readiness(&mut self, newcomer: Option<ClientId>) {
        let target = if self.clients.len() >= MIN_PEERS {
            Readiness::Ready
        } else {
            Readiness::Waiting
        };

        for record in self.clients.values_mut() {
            if record.readiness == target && newcomer != Some(record.id) {
                continue;
            }
            record.readiness = target;
            let frame = match target {
                Readiness::Ready => Frame::start(record.id),
                Readiness::Waiting => Frame::wait(record.id),
            };
            debug!("{} -> client {}", frame.status, record.id);
            record.outbox.deliver_now(frame);
        }
    }

    fn broadcast_list(&self) {
        let peers: Vec<ClientId> = self.clients.keys().copied().collect();
        for record in self.clients.values() {
            record.outbox.deliver_now(Frame::list(record.id, &peers));
        }
    }
}
