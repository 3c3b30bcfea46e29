//! The duplex frame pipe a [`SyncChannel`](crate::channel::SyncChannel) writes to.
//!
//! A transport only sends. Inbound frames arrive on the
//! `mpsc::UnboundedReceiver<Vec<u8>>` handed out alongside it, which keeps the
//! reading side free of any borrow on the transport.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::protocol::ProtocolError;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

pub trait Transport {
    fn state(&self) -> ConnectionState;

    /// Whether `send` may be called now.
    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Hand one frame to the connection. Fails when not ready.
    fn send(&self, frame: Vec<u8>) -> Result<(), ProtocolError>;

    /// Frames accepted by `send` that never reached the wire, oldest first.
    /// Each frame is returned once.
    fn take_unsent(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// In-process transport. Readiness is toggled by whoever holds a clone.
#[derive(Clone)]
pub struct MemoryTransport {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl MemoryTransport {
    /// A connected transport and the receiver of every frame it sends.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outgoing, sent) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let transport = Self {
            outgoing,
            state: Arc::new(state),
        };
        (transport, sent)
    }

    /// Two transports wired back to back. Each side gets its transport and
    /// the receiver of frames sent by the other side.
    pub fn pair() -> (
        (Self, mpsc::UnboundedReceiver<Vec<u8>>),
        (Self, mpsc::UnboundedReceiver<Vec<u8>>),
    ) {
        let (a, sent_by_a) = Self::new();
        let (b, sent_by_b) = Self::new();
        ((a, sent_by_b), (b, sent_by_a))
    }

    pub fn set_state(&self, state: ConnectionState) {
        log::debug!("memory transport {state:?}");
        self.state.send_replace(state);
    }

    pub fn set_ready(&self, ready: bool) {
        self.set_state(if ready {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Transport for MemoryTransport {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_ready() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outgoing
            .send(frame)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
