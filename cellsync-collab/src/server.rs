//! WebSocket relay with room-per-document fan-out.
//!
//! ```text
//! Client A ──┐
//!            ├── Room ("notebooks/a") ── yrs Doc (replica) ── BroadcastGroup
//! Client B ──┘                                                  │
//!                                                   ┌───────────┼───────────┐
//!                                                   ▼           ▼           ▼
//!                                                Client A    Client B    Client C
//! ```
//!
//! Each room keeps a replica built from every `Delta` it relays so that a
//! newcomer's `SyncStep1` can be answered with the full missing state, and so
//! that a member whose receiver lagged behind the fan-out can be resent the
//! whole state instead of silently missing deltas. The first `PeerJoined`
//! frame of a connection selects its room; rooms are created on demand. An
//! empty room keeps its replica so reconnecting peers find their edits. With
//! `room_recovery_timeout_ms` set, a room that stays empty that long is
//! evicted.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use cellsync_core::{ActorId, ChangeSet, Collaborator};

use crate::broadcast::BroadcastGroup;
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

/// Sender id the relay uses for frames it originates.
pub fn relay_actor() -> ActorId {
    ActorId::from_uuid(Uuid::nil())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Joins beyond this are refused and the connection closed.
    pub max_peers_per_room: usize,
    /// Frames buffered per member before it starts lagging.
    pub broadcast_capacity: usize,
    /// How long an empty room keeps its replica before eviction. `None`
    /// keeps rooms for the lifetime of the server.
    pub room_recovery_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            room_recovery_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    pub fn room_recovery_timeout(&self) -> Option<Duration> {
        self.room_recovery_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    /// Frames that could not be decoded or applied.
    pub malformed_frames: u64,
    /// Frames skipped by members that fell behind.
    pub lagged_frames: u64,
    /// Full-state resends to members that fell behind.
    pub resyncs: u64,
}

struct DocumentRoom {
    replica: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
    /// Bumped every time the room becomes empty; a pending eviction only
    /// fires if no one joined and left again since it was scheduled.
    vacancies: u64,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            replica: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            vacancies: 0,
        }
    }

    /// Apply every fragment of a change-set in one transaction.
    fn apply(&self, change_set: &ChangeSet) -> Result<(), ProtocolError> {
        let updates = change_set
            .fragments
            .iter()
            .map(|fragment| Update::decode_v1(fragment))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let mut txn = self.replica.transact_mut();
        for update in updates {
            txn.apply_update(update)
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        }
        Ok(())
    }

    fn diff_since(&self, remote: &StateVector) -> Vec<u8> {
        self.replica.transact().encode_state_as_update_v1(remote)
    }
}

struct Shared {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, DocumentRoom>>,
    stats: RwLock<ServerStats>,
}

/// Membership of one connection, set by its first `PeerJoined`.
struct Membership {
    peer: ActorId,
    document: String,
    broadcast: Arc<BroadcastGroup>,
    receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Frames to write back on the connection, plus whether to close it.
#[derive(Default)]
struct Reply {
    frames: Vec<Vec<u8>>,
    close: bool,
}

pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProtocolError> {
        log::info!("relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Members of a room, if it exists.
    pub async fn peers(&self, document: &str) -> Option<Vec<Collaborator>> {
        let broadcast = {
            let rooms = self.shared.rooms.read().await;
            rooms.get(document).map(|room| room.broadcast.clone())?
        };
        Some(broadcast.peers().await)
    }

    /// The room replica's full state as one v1 update.
    pub async fn snapshot(&self, document: &str) -> Option<Vec<u8>> {
        let rooms = self.shared.rooms.read().await;
        rooms
            .get(document)
            .map(|room| room.diff_since(&StateVector::default()))
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), ProtocolError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("websocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<Membership> = None;
        let outcome = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let reply = Self::handle_frame(&shared, &mut membership, bytes, addr).await;
                            for frame in reply.frames {
                                ws_sender.send(Message::Binary(frame.into())).await?;
                            }
                            if reply.close {
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },

                    msg = async {
                        match membership.as_mut() {
                            Some(member) => member.receiver.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match msg {
                        Ok(frame) => {
                            // Don't echo back to the sender.
                            let own = membership.as_ref().map(|m| m.peer);
                            if SyncMessage::decode(&frame).is_ok_and(|m| Some(m.sender()) == own) {
                                continue;
                            }
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("peer at {addr} lagged by {n} frames, resending room state");
                            shared.stats.write().await.lagged_frames += n;
                            let Some(member) = &membership else {
                                continue;
                            };
                            member.broadcast.record_lag(n);
                            let reply = Self::resync(&shared, member).await;
                            for frame in reply.frames {
                                ws_sender.send(Message::Binary(frame.into())).await?;
                            }
                            if reply.close {
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            Ok::<(), ProtocolError>(())
        }
        .await;

        if let Some(member) = membership {
            Self::leave(&shared, member).await;
        }
        shared.stats.write().await.active_connections -= 1;
        outcome
    }

    async fn handle_frame(
        shared: &Shared,
        membership: &mut Option<Membership>,
        bytes: Vec<u8>,
        addr: SocketAddr,
    ) -> Reply {
        {
            let mut s = shared.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }
        let msg = match SyncMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("failed to decode frame from {addr}: {e}");
                shared.stats.write().await.malformed_frames += 1;
                return Reply::default();
            }
        };

        if msg.msg_type == MessageType::PeerJoined {
            return Self::join(shared, membership, msg, bytes).await;
        }
        if msg.msg_type == MessageType::Ping {
            return Self::encoded(SyncMessage::pong(relay_actor()));
        }
        let Some(member) = membership.as_ref() else {
            log::debug!("{:?} from {addr} before joining a room", msg.msg_type);
            return Reply::default();
        };
        if msg.document != member.document {
            log::debug!("frame for {} on a connection joined to {}", msg.document, member.document);
            return Reply::default();
        }

        match msg.msg_type {
            MessageType::Delta => {
                let applied = {
                    let rooms = shared.rooms.read().await;
                    match (rooms.get(&member.document), msg.change_set()) {
                        (Some(room), Ok(change_set)) => room.apply(&change_set),
                        (None, _) => Err(ProtocolError::ConnectionClosed),
                        (_, Err(e)) => Err(e),
                    }
                };
                match applied {
                    Ok(()) => {
                        let receivers = member.broadcast.broadcast_raw(Arc::new(bytes));
                        log::trace!("relayed delta {} of {} to {receivers} members", msg.clock, msg.sender());
                    }
                    Err(e) => {
                        log::warn!("dropping delta from {addr}: {e}");
                        shared.stats.write().await.malformed_frames += 1;
                    }
                }
                Reply::default()
            }
            MessageType::SyncStep1 => {
                let remote = match StateVector::decode_v1(&msg.payload) {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("bad state vector from {addr}: {e}");
                        shared.stats.write().await.malformed_frames += 1;
                        return Reply::default();
                    }
                };
                let diff = {
                    let rooms = shared.rooms.read().await;
                    rooms.get(&member.document).map(|room| room.diff_since(&remote))
                };
                match diff {
                    Some(diff) => Self::encoded(SyncMessage::sync_step2(relay_actor(), &member.document, diff)),
                    None => Reply::default(),
                }
            }
            other => {
                log::debug!("unhandled message type {other:?} from {addr}");
                Reply::default()
            }
        }
    }

    fn encoded(msg: SyncMessage) -> Reply {
        match msg.encode() {
            Ok(frame) => Reply { frames: vec![frame], close: false },
            Err(e) => {
                log::error!("failed to encode {:?}: {e}", msg.msg_type);
                Reply::default()
            }
        }
    }

    async fn join(
        shared: &Shared,
        membership: &mut Option<Membership>,
        msg: SyncMessage,
        frame: Vec<u8>,
    ) -> Reply {
        if let Some(member) = membership.as_ref() {
            log::debug!("{} already joined {}", member.peer, member.document);
            return Reply::default();
        }
        let info = msg
            .collaborator()
            .unwrap_or_else(|_| Collaborator::anonymous(msg.sender()));
        let peer = info.session_id;

        let mut rooms = shared.rooms.write().await;
        let room = rooms
            .entry(msg.document.clone())
            .or_insert_with(|| DocumentRoom::new(shared.config.broadcast_capacity));
        let broadcast = room.broadcast.clone();
        if broadcast.peer_count().await >= shared.config.max_peers_per_room {
            log::warn!("room {} is full, refusing {peer}", msg.document);
            return Reply { frames: Vec::new(), close: true };
        }

        // Announce existing members to the newcomer, then the newcomer to everyone.
        let frames = Self::announce_members(&msg.document, &broadcast).await;
        let receiver = broadcast.add_peer(info.clone()).await;
        broadcast.broadcast_raw(Arc::new(frame));
        let room_count = rooms.len();
        drop(rooms);

        shared.stats.write().await.active_rooms = room_count;
        log::info!("{} ({peer}) joined {}", info.display_name, msg.document);
        *membership = Some(Membership {
            peer,
            document: msg.document,
            broadcast,
            receiver,
        });
        Reply { frames, close: false }
    }

    /// `PeerJoined` frames for every current member of a room.
    async fn announce_members(document: &str, broadcast: &BroadcastGroup) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for existing in broadcast.peers().await {
            match SyncMessage::peer_joined(document, &existing).and_then(|m| m.encode()) {
                Ok(encoded) => frames.push(encoded),
                Err(e) => log::error!("failed to announce {}: {e}", existing.session_id),
            }
        }
        frames
    }

    /// Bring a member that missed fan-out frames back in step: the room's
    /// full state as a `SyncStep2`, then the current membership. Closes the
    /// connection if the room is gone.
    async fn resync(shared: &Shared, member: &Membership) -> Reply {
        let state = {
            let rooms = shared.rooms.read().await;
            rooms
                .get(&member.document)
                .map(|room| room.diff_since(&StateVector::default()))
        };
        let Some(state) = state else {
            log::warn!("room {} vanished under {}, closing", member.document, member.peer);
            return Reply { frames: Vec::new(), close: true };
        };
        let mut reply = Self::encoded(SyncMessage::sync_step2(relay_actor(), &member.document, state));
        if reply.frames.is_empty() {
            reply.close = true;
            return reply;
        }
        reply
            .frames
            .extend(Self::announce_members(&member.document, &member.broadcast).await);
        shared.stats.write().await.resyncs += 1;
        log::debug!("resent state of {} to {}", member.document, member.peer);
        reply
    }

    async fn leave(shared: &Arc<Shared>, member: Membership) {
        let Membership { peer, document, broadcast, receiver } = member;
        drop(receiver);
        broadcast.remove_peer(&peer).await;
        if let Err(e) = broadcast.broadcast(&SyncMessage::peer_left(peer, &document)) {
            log::error!("failed to announce departure of {peer}: {e}");
        }
        log::info!("{peer} left {document}");

        let vacancy = {
            let mut rooms = shared.rooms.write().await;
            match rooms.get_mut(&document) {
                Some(room) if broadcast.peer_count().await == 0 => {
                    room.vacancies += 1;
                    Some(room.vacancies)
                }
                _ => None,
            }
        };
        let Some(vacancy) = vacancy else {
            return;
        };
        match shared.config.room_recovery_timeout() {
            Some(timeout) => {
                log::info!("room {document} is empty, evicting in {timeout:?} unless rejoined");
                tokio::spawn(Self::evict_if_idle(shared.clone(), document, vacancy, timeout));
            }
            None => log::info!("room {document} is empty, keeping its replica"),
        }
    }

    /// Drop a room that has stayed empty since vacancy number `vacancy`.
    async fn evict_if_idle(shared: Arc<Shared>, document: String, vacancy: u64, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        let mut rooms = shared.rooms.write().await;
        let idle = match rooms.get(&document) {
            Some(room) => room.vacancies == vacancy && room.broadcast.peer_count().await == 0,
            None => false,
        };
        if !idle {
            return;
        }
        rooms.remove(&document);
        let room_count = rooms.len();
        drop(rooms);
        shared.stats.write().await.active_rooms = room_count;
        log::info!("room {document} evicted after {timeout:?} without members");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.room_recovery_timeout(), None);

        let parsed: ServerConfig = serde_json::from_str(r#"{"room_recovery_timeout_ms": 120000}"#).unwrap();
        assert_eq!(parsed.room_recovery_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(parsed.max_peers_per_room, 100);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.room_count().await, 0);
        assert!(server.snapshot("nb").await.is_none());
    }

    #[test]
    fn test_room_replica_answers_state_requests() {
        let source = yrs::Doc::new();
        let update = {
            let mut txn = source.transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, "relayed");
            txn.encode_update_v1()
        };
        let room = DocumentRoom::new(8);
        let cs = ChangeSet { actor: ActorId::new(), seq: 1, fragments: vec![update] };
        room.apply(&cs).unwrap();

        let copy = yrs::Doc::new();
        {
            let diff = room.diff_since(&StateVector::default());
            let mut txn = copy.transact_mut();
            txn.apply_update(Update::decode_v1(&diff).unwrap()).unwrap();
        }
        let txn = copy.transact();
        assert_eq!(txn.get_text("t").unwrap().get_string(&txn), "relayed");
    }

    fn shared_with_room(document: &str, room: DocumentRoom) -> Shared {
        Shared {
            config: ServerConfig::default(),
            rooms: RwLock::new(HashMap::from([(document.to_string(), room)])),
            stats: RwLock::new(ServerStats::default()),
        }
    }

    #[tokio::test]
    async fn test_lagging_member_is_resent_full_state() {
        let source = yrs::Doc::new();
        let updates: Vec<Vec<u8>> = ["a", "b", "c"]
            .iter()
            .map(|chunk| {
                let mut txn = source.transact_mut();
                let text = txn.get_or_insert_text("t");
                let len = text.len(&txn);
                text.insert(&mut txn, len, chunk);
                txn.encode_update_v1()
            })
            .collect();
        let room = DocumentRoom::new(1);
        let broadcast = room.broadcast.clone();
        let lagging = Collaborator::anonymous(ActorId::new());
        let other = Collaborator::anonymous(ActorId::new());
        let receiver = broadcast.add_peer(lagging.clone()).await;
        broadcast.add_peer(other.clone()).await;
        for (seq, update) in updates.into_iter().enumerate() {
            let cs = ChangeSet { actor: other.session_id, seq: seq as u64 + 1, fragments: vec![update] };
            room.apply(&cs).unwrap();
        }
        let shared = shared_with_room("nb", room);
        let member = Membership { peer: lagging.session_id, document: "nb".into(), broadcast, receiver };

        let reply = RelayServer::resync(&shared, &member).await;
        assert!(!reply.close);
        let step2 = SyncMessage::decode(&reply.frames[0]).unwrap();
        assert_eq!(step2.msg_type, MessageType::SyncStep2);
        assert_eq!(step2.document, "nb");
        assert_eq!(reply.frames.len(), 3);

        let copy = yrs::Doc::new();
        {
            let mut txn = copy.transact_mut();
            txn.apply_update(Update::decode_v1(&step2.payload).unwrap()).unwrap();
        }
        let txn = copy.transact();
        assert_eq!(txn.get_text("t").unwrap().get_string(&txn), "abc");
        assert_eq!(shared.stats.read().await.resyncs, 1);
    }

    #[tokio::test]
    async fn test_resync_closes_when_room_is_gone() {
        let room = DocumentRoom::new(4);
        let broadcast = room.broadcast.clone();
        let peer = Collaborator::anonymous(ActorId::new());
        let receiver = broadcast.add_peer(peer.clone()).await;
        let shared = shared_with_room("elsewhere", room);
        let member = Membership { peer: peer.session_id, document: "nb".into(), broadcast, receiver };

        let reply = RelayServer::resync(&shared, &member).await;
        assert!(reply.close);
        assert!(reply.frames.is_empty());
        assert_eq!(shared.stats.read().await.resyncs, 0);
    }

    #[test]
    fn test_room_rejects_corrupt_fragment() {
        let room = DocumentRoom::new(8);
        let cs = ChangeSet { actor: ActorId::new(), seq: 1, fragments: vec![vec![0xff; 4]] };
        assert!(matches!(room.apply(&cs), Err(ProtocolError::Deserialization(_))));
    }
}
