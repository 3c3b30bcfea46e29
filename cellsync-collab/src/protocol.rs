//! Binary frame protocol between replicas and the relay.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ document     │ clock    │ payload  │
//! │ varint   │ 16 bytes  │ len ‖ utf-8  │ varint   │ len ‖ .. │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! `Delta` payloads are encoded [`ChangeSet`]s, `SyncStep1` payloads are v1
//! state vectors and `SyncStep2` payloads are v1 updates.

use cellsync_core::{ActorId, ChangeSet, CollabError, Collaborator};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector: "send me what I'm missing"
    SyncStep1 = 1,
    /// Answer to `SyncStep1`, the initial-state sync
    SyncStep2 = 2,
    /// One encoded change-set
    Delta = 3,
    /// Encoded `Collaborator` record
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// One frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Document path the frame belongs to. Empty for heartbeats.
    pub document: String,
    /// Sender's change-set sequence for `Delta`, otherwise 0.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer: ActorId, document: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id: *peer.as_uuid(),
            document: document.to_string(),
            clock,
            payload,
        }
    }

    /// Wrap an outbound change-set.
    pub fn delta(document: &str, change_set: &ChangeSet) -> Result<Self, ProtocolError> {
        let payload = change_set.encode()?;
        Ok(Self::new(MessageType::Delta, change_set.actor, document, change_set.seq, payload))
    }

    pub fn sync_step1(peer: ActorId, document: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer, document, 0, state_vector)
    }

    pub fn sync_step2(peer: ActorId, document: &str, update: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer, document, 0, update)
    }

    pub fn peer_joined(document: &str, collaborator: &Collaborator) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(collaborator, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, collaborator.session_id, document, 0, payload))
    }

    pub fn peer_left(peer: ActorId, document: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer, document, 0, Vec::new())
    }

    pub fn ping(peer: ActorId) -> Self {
        Self::new(MessageType::Ping, peer, "", 0, Vec::new())
    }

    pub fn pong(peer: ActorId) -> Self {
        Self::new(MessageType::Pong, peer, "", 0, Vec::new())
    }

    pub fn sender(&self) -> ActorId {
        ActorId::from_uuid(self.peer_id)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format. Trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes after frame",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }

    /// Parse a `Delta` payload.
    pub fn change_set(&self) -> Result<ChangeSet, ProtocolError> {
        if self.msg_type != MessageType::Delta {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        Ok(ChangeSet::decode(&self.payload)?)
    }

    /// Parse a `PeerJoined` payload.
    pub fn collaborator(&self) -> Result<Collaborator, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Document(#[from] CollabError),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => Self::ConnectionClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}
