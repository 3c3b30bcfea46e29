//! WebSocket transport to the relay server.
//!
//! Reader and writer tasks bridge the socket to mpsc channels so the
//! single-threaded document side never touches the socket. A frame only
//! counts as delivered once the socket accepted it: when a write fails or
//! the connection drops, the failed frame and everything still waiting are
//! kept for [`Transport::take_unsent`]. Reconnecting is left to the owner:
//! when the state drops to `Disconnected`, open a new transport and give it
//! to the channel with
//! [`SyncChannel::replace_transport`](crate::channel::SyncChannel::replace_transport).

use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use cellsync_core::ActorId;

use crate::protocol::ProtocolError;
use crate::transport::{ConnectionState, Transport};

type Unsent = Arc<Mutex<VecDeque<Vec<u8>>>>;

pub struct WebSocketTransport {
    url: String,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    state: watch::Receiver<ConnectionState>,
    unsent: Unsent,
}

impl WebSocketTransport {
    /// `{server_url}/{actor_id}/{document_path}`
    pub fn url_for(server_url: &str, actor: ActorId, document: &str) -> String {
        format!(
            "{}/{}/{}",
            server_url.trim_end_matches('/'),
            actor,
            document.trim_start_matches('/')
        )
    }

    /// Connect to the relay on behalf of `actor` for `document`.
    pub async fn connect_document(
        server_url: &str,
        actor: ActorId,
        document: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>), ProtocolError> {
        Self::connect(Self::url_for(server_url, actor, document)).await
    }

    /// Open the socket and spawn the I/O tasks. Returns the transport and
    /// the receiver of inbound binary frames.
    pub async fn connect(
        url: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>), ProtocolError> {
        let url = url.into();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            log::warn!("failed to connect to {url}: {e}");
            ProtocolError::from(e)
        })?;
        log::info!("connected to {url}");

        let (ws_writer, mut ws_reader) = ws_stream.split();
        let (outgoing, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, inbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let state_tx = Arc::new(state_tx);
        state_tx.send_replace(ConnectionState::Connected);

        // Writer task: forward outgoing frames to the socket.
        let unsent = Unsent::default();
        let writer_state = state_tx.clone();
        let writer_unsent = unsent.clone();
        let closed = state.clone();
        tokio::spawn(async move {
            write_frames(ws_writer, out_rx, closed, &writer_unsent).await;
            writer_state.send_replace(ConnectionState::Disconnected);
        });

        // Reader task: forward binary frames to the inbound channel.
        let reader_state = state_tx;
        let peer = url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if in_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("websocket error from {peer}: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            log::info!("connection to {peer} closed");
            reader_state.send_replace(ConnectionState::Disconnected);
        });

        Ok((Self { url, outgoing, state, unsent }, inbound))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Follow connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Forward `frames` to `sink` until the transport is dropped, a write
/// fails or `state` reports the connection gone. Whatever was not written
/// is left in `unsent`, oldest first, and the channel is closed so later
/// sends fail instead of vanishing.
async fn write_frames<S>(
    mut sink: S,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    mut state: watch::Receiver<ConnectionState>,
    unsent: &Mutex<VecDeque<Vec<u8>>>,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut failed = None;
    loop {
        let frame = tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == ConnectionState::Disconnected) => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(Message::Binary(frame.clone().into())).await {
            log::warn!("websocket send failed: {e}");
            failed = Some(frame);
            break;
        }
    }

    frames.close();
    {
        let mut unsent = unsent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unsent.extend(failed);
        while let Ok(frame) = frames.try_recv() {
            unsent.push_back(frame);
        }
        if !unsent.is_empty() {
            log::debug!("{} frames left undelivered", unsent.len());
        }
    }
    let _ = sink.close().await;
}

impl Transport for WebSocketTransport {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn take_unsent(&self) -> Vec<Vec<u8>> {
        let mut unsent = self.unsent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unsent.drain(..).collect()
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
