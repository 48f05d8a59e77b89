//! The protocol engine: accepts connections, classifies them as client- or
//! peer-facing, serves snapshots, and streams log tails.
//!
//! Each connection runs one socket task selecting between inbound frames
//! and a bounded outbound queue, plus (once subscribed) a tailer task
//! feeding that queue. The single process-wide mutex over the store is
//! re-acquired per staged log entry and is never held across a queue send
//! or socket write, so a slow connection stalls only itself. When the
//! socket task exits it drops the queue receiver, which is what tells the
//! tailer to stop.

pub mod messages;
mod peer;

pub use messages::WireMessage;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use gossamer_crdt::{DType, VersionVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{self, Config};
use crate::error::{HubError, ProtocolError};
use crate::store::{LogIterator, LogRecord, Store};

/// Outbound queue depth per connection. A tailer blocks on its own
/// connection's queue when the reader on the other end is slow.
const OUTBOUND_QUEUE: usize = 64;

/// State under the process-wide mutex: the store (with its log), the set
/// of peer addresses with an active outbound subscription, and the RNG
/// feeding pid allocation.
pub(crate) struct Shared {
    pub(crate) store: Store,
    pub(crate) peers: HashSet<String>,
    pub(crate) rng: StdRng,
}

/// One agent: a store, a listener, and the gossip fabric around them.
pub struct Hub {
    pub(crate) agent_id: u32,
    pub(crate) addr: String,
    pub(crate) shared: Mutex<Shared>,
    wakeup: watch::Receiver<u64>,
}

impl Hub {
    /// Boots the agent: resolves its identity, binds the listener, spawns
    /// the accept loop and one outbound subscription per configured peer.
    pub async fn serve(config: Config) -> Result<Arc<Hub>, HubError> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let agent_id = config::resolve_agent_id(&config, &mut rng)?;
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let addr = listener.local_addr()?.to_string();

        let (store, wakeup) = Store::open();
        let hub = Arc::new(Hub {
            agent_id,
            addr,
            shared: Mutex::new(Shared {
                store,
                peers: HashSet::new(),
                rng,
            }),
            wakeup,
        });
        info!(agent_id, addr = %hub.addr, "agent started");

        for peer_addr in config.peer_addrs {
            if !peer_addr.is_empty() {
                tokio::spawn(peer::subscribe_to(Arc::clone(&hub), peer_addr));
            }
        }
        tokio::spawn(accept_loop(Arc::clone(&hub), listener));
        Ok(hub)
    }

    /// This agent's random 32-bit identity.
    #[must_use]
    pub fn agent_id(&self) -> u32 {
        self.agent_id
    }

    /// The bound listen address, `host:port`.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Snapshot of the log head.
    pub async fn head(&self) -> VersionVector {
        self.shared.lock().await.store.log().head().clone()
    }

    /// Blocks until the log holds patches strictly beyond `cursor`. The
    /// mutex must not be held by the caller; it is taken per check, with
    /// the log's watch channel bridging the gap between checks.
    pub(crate) async fn wait(&self, cursor: &VersionVector) {
        let mut rx = self.wakeup.clone();
        loop {
            {
                let shared = self.shared.lock().await;
                if !shared.store.log().head().leq(cursor) {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn accept_loop(hub: Arc<Hub>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                tokio::spawn(handle_conn(Arc::clone(&hub), stream, remote_addr));
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

/// Per-connection state, guarded by the connection's own mutex (never
/// held across an await).
#[derive(Default)]
struct ConnState {
    subscribed: bool,
    /// Set iff this is a peer-facing connection.
    peer_agent_id: Option<u32>,
    /// Local seqs of patches accepted from this connection, in order.
    /// The tailer pops the front to recognize the echo of a client's own
    /// write.
    local_seqs: VecDeque<u32>,
}

struct Conn {
    hub: Arc<Hub>,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<WireMessage>,
    state: StdMutex<ConnState>,
}

/// The socket task: selects between the connection's outbound queue and
/// inbound frames until either side ends. Dropping the queue receiver on
/// exit is what stops the tailer.
async fn handle_conn(hub: Arc<Hub>, stream: TcpStream, remote_addr: SocketAddr) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %remote_addr, error = %e, "websocket handshake failed");
            return;
        }
    };
    debug!(peer = %remote_addr, "connection established");

    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
    let conn = Arc::new(Conn {
        hub,
        remote_addr,
        tx,
        state: StdMutex::new(ConnState::default()),
    });

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                // The queue cannot close while `conn.tx` is alive.
                let Some(msg) = outbound else { break };
                if !send_message(&mut ws, &msg, remote_addr).await {
                    break;
                }
            }
            inbound = ws.next() => {
                let frame = match inbound {
                    Some(Ok(f)) => f,
                    Some(Err(e)) => {
                        debug!(peer = %remote_addr, error = %e, "connection closed");
                        break;
                    }
                    None => {
                        debug!(peer = %remote_addr, "connection closed by peer");
                        break;
                    }
                };
                let text = match frame {
                    Message::Text(t) => t,
                    Message::Close(_) => {
                        debug!(peer = %remote_addr, "close frame received");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => {
                        error!(peer = %remote_addr, frame = ?other, "non-text frame");
                        break;
                    }
                };
                let msg = match serde_json::from_str::<WireMessage>(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        error!(peer = %remote_addr, error = %e, "malformed message");
                        break;
                    }
                };
                if let Err(e) = conn.dispatch(msg).await {
                    error!(peer = %remote_addr, error = %e, "protocol error");
                    break;
                }
            }
        }
    }
    let _ = ws.close(None).await;
}

/// Writes one message. Returns false when the connection is done: a
/// closed transport is a normal way for a connection to end, anything
/// else is reported.
async fn send_message(
    ws: &mut WebSocketStream<TcpStream>,
    msg: &WireMessage,
    remote_addr: SocketAddr,
) -> bool {
    let text = match serde_json::to_string(msg) {
        Ok(t) => t,
        Err(e) => {
            error!(peer = %remote_addr, error = %e, "failed to encode message");
            return false;
        }
    };
    match ws.send(Message::Text(text)).await {
        Ok(()) => true,
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => false,
        Err(e) => {
            error!(peer = %remote_addr, error = %e, "write failed");
            false
        }
    }
}

impl Conn {
    async fn dispatch(self: &Arc<Self>, msg: WireMessage) -> Result<(), ProtocolError> {
        match msg {
            WireMessage::SubscribeC2S => self.subscribe_client().await,
            WireMessage::SubscribeI2R {
                agent_id,
                addr,
                version_vector,
            } => self.subscribe_peer(agent_id, addr, version_vector),
            WireMessage::PatchC2S { key, dtype, patch } => {
                self.client_patch(&key, dtype, &patch).await
            }
            WireMessage::ValueS2C { .. } => Err(ProtocolError::UnexpectedMessage("ValueS2C")),
            WireMessage::ValuesDoneS2C => Err(ProtocolError::UnexpectedMessage("ValuesDoneS2C")),
            WireMessage::PatchS2C { .. } => Err(ProtocolError::UnexpectedMessage("PatchS2C")),
            WireMessage::PatchR2I { .. } => Err(ProtocolError::UnexpectedMessage("PatchR2I")),
        }
    }

    /// Client subscription: snapshot every value and the log head under
    /// one lock acquisition, then stream the snapshot and tail from the
    /// head. The streaming happens on the tailer task so the socket task
    /// stays free to drain the queue.
    async fn subscribe_client(self: &Arc<Self>) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.subscribed {
                return Err(ProtocolError::AlreadySubscribed);
            }
            state.subscribed = true;
        }

        let (values, cursor) = {
            let shared = self.hub.shared.lock().await;
            let mut values = Vec::new();
            for (key, envelope) in shared.store.iter() {
                values.push(WireMessage::ValueS2C {
                    key: key.clone(),
                    dtype: envelope.dtype,
                    value: envelope.value.encode()?,
                });
            }
            (values, shared.store.log().head().clone())
        };
        debug!(peer = %self.remote_addr, values = values.len(), "client subscribed");

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            for msg in values {
                if conn.tx.send(msg).await.is_err() {
                    return;
                }
            }
            if conn.tx.send(WireMessage::ValuesDoneS2C).await.is_err() {
                return;
            }
            conn.tail(cursor).await;
        });
        Ok(())
    }

    /// Peer subscription: record the peer's identity for loop
    /// suppression, dial back so the exchange is bidirectional regardless
    /// of who connected first, and tail from the peer's vector.
    fn subscribe_peer(
        self: &Arc<Self>,
        peer_agent_id: u32,
        peer_addr: String,
        peer_vec: VersionVector,
    ) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.subscribed {
                return Err(ProtocolError::AlreadySubscribed);
            }
            state.subscribed = true;
            state.peer_agent_id = Some(peer_agent_id);
        }
        info!(peer_agent_id, peer = %peer_addr, "peer subscribed");
        tokio::spawn(peer::subscribe_to(Arc::clone(&self.hub), peer_addr));
        tokio::spawn(Arc::clone(self).tail(peer_vec));
        Ok(())
    }

    async fn client_patch(
        &self,
        key: &str,
        dtype: DType,
        patch: &str,
    ) -> Result<(), ProtocolError> {
        if !self.state.lock().unwrap().subscribed {
            return Err(ProtocolError::NotSubscribed);
        }
        let mut shared = self.hub.shared.lock().await;
        let now = Utc::now();
        let Shared { store, rng, .. } = &mut *shared;
        let local_seq = store.apply_client_patch(self.hub.agent_id, key, dtype, patch, now, rng)?;
        // The FIFO entry must exist before the tailer can stage this
        // record, so push it while the hub mutex is still held.
        self.state.lock().unwrap().local_seqs.push_back(local_seq);
        Ok(())
    }

    /// Streams log entries strictly beyond `cursor` until the connection
    /// closes. The mutex is held per `advance` call only.
    async fn tail(self: Arc<Self>, cursor: VersionVector) {
        let mut it = LogIterator::new(cursor);
        loop {
            tokio::select! {
                () = self.hub.wait(it.cursor()) => {}
                () = self.tx.closed() => return,
            }
            loop {
                let rec = {
                    let shared = self.hub.shared.lock().await;
                    it.advance(shared.store.log())
                };
                let Some(rec) = rec else { break };
                if let Some(msg) = self.patch_message(&rec) {
                    if self.tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Renders a staged log entry for this connection's role, or `None`
    /// when loop suppression filters it out.
    fn patch_message(&self, rec: &LogRecord) -> Option<WireMessage> {
        let mut state = self.state.lock().unwrap();
        if let Some(peer_agent_id) = state.peer_agent_id {
            // Never bounce a peer's own patches back to it.
            if rec.agent_id == peer_agent_id {
                return None;
            }
            Some(WireMessage::PatchR2I {
                agent_id: rec.agent_id,
                agent_seq: rec.agent_seq,
                key: rec.entry.key.clone(),
                dtype: rec.entry.dtype,
                patch: rec.entry.patch.clone(),
            })
        } else {
            let is_local = state.local_seqs.front() == Some(&rec.entry.local_seq);
            if is_local {
                state.local_seqs.pop_front();
            }
            Some(WireMessage::PatchS2C {
                agent_id: rec.agent_id,
                is_local,
                key: rec.entry.key.clone(),
                dtype: rec.entry.dtype,
                patch: rec.entry.patch.clone(),
            })
        }
    }
}
