//! # cellsync-collab
//!
//! Moves change-sets between [`cellsync_core::ReplicatedDocument`] replicas.
//!
//! ```text
//! ┌──────────────────┐   frames    ┌─────────────┐   frames    ┌──────────────────┐
//! │ SyncChannel      │ ◄─────────► │ RelayServer │ ◄─────────► │ SyncChannel      │
//! │ + Transport      │  WebSocket  │ room replica│  WebSocket  │ + Transport      │
//! └────────┬─────────┘             │ + fan-out   │             └────────┬─────────┘
//!          │                       └─────────────┘                      │
//!          ▼                                                            ▼
//!  ReplicatedDocument                                          ReplicatedDocument
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded `SyncMessage` frames
//! - [`transport`]: the `Transport` trait and an in-memory implementation
//! - [`client`]: WebSocket transport
//! - [`channel`]: per-document send queue and serialized inbound merge
//! - [`broadcast`]: room fan-out with backpressure
//! - [`server`]: the WebSocket relay

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use channel::{ChannelConfig, ChannelStats, OfflineQueue, SyncChannel};
pub use client::WebSocketTransport;
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{relay_actor, RelayServer, ServerConfig, ServerStats};
pub use transport::{ConnectionState, MemoryTransport, Transport};
