//! The per-document synchronization channel.
//!
//! ```text
//!   ReplicatedDocument ──take_outbound──▶ OfflineQueue ──flush (when ready)──▶ Transport
//!          ▲                                                                    │
//!          └───── merge_change_set / merge_update ◀── handle_frame ◀── inbound ─┘
//! ```
//!
//! Outbound frames leave strictly in FIFO order and only while the transport
//! is ready; nothing is dropped while it is not. Frames the transport hands
//! back as undelivered go to the front of the queue again. Inbound frames are handled
//! one at a time, each merged completely before the next is looked at.
//! Malformed frames are logged and dropped.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

use cellsync_core::{CollabError, Origin, ReplicatedDocument, StateVector};

use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::transport::Transport;

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Document path; names the relay room.
    pub document: String,
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    /// How often the run loop re-checks transport readiness.
    pub poll_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            document: "default".to_string(),
            server_url: "ws://127.0.0.1:9090".to_string(),
            poll_interval_ms: 100,
        }
    }
}

impl ChannelConfig {
    pub fn for_document(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub change_sets_merged: u64,
    /// Inbound frames that could not be decoded or merged.
    pub dropped_frames: u64,
    /// Sent frames the transport handed back undelivered and that were queued again.
    pub frames_returned: u64,
}

/// Encoded frames waiting for the transport, oldest first.
#[derive(Default)]
pub struct OfflineQueue {
    queue: VecDeque<QueuedFrame>,
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    clock: u64,
    frame: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, clock: u64, frame: Vec<u8>) {
        self.queue.push_back(QueuedFrame {
            clock,
            frame,
            queued_at: Instant::now(),
        });
    }

    fn pop_front(&mut self) -> Option<QueuedFrame> {
        self.queue.pop_front()
    }

    fn requeue(&mut self, frame: QueuedFrame) {
        self.queue.push_front(frame);
    }

    /// Put `frames` back at the front, keeping their order.
    fn requeue_all(&mut self, frames: Vec<(u64, Vec<u8>)>) {
        let queued_at = Instant::now();
        for (clock, frame) in frames.into_iter().rev() {
            self.queue.push_front(QueuedFrame { clock, frame, queued_at });
        }
    }

    /// Drain all queued frames as `(clock, frame)` pairs.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|f| (f.clock, f.frame)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|f| f.frame.len()).sum()
    }

    /// How long the oldest frame has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|f| f.queued_at.elapsed())
    }
}

/// Connects one [`ReplicatedDocument`] to one [`Transport`].
pub struct SyncChannel<T: Transport> {
    doc: ReplicatedDocument,
    transport: T,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    config: ChannelConfig,
    queue: OfflineQueue,
    stats: ChannelStats,
}

impl<T: Transport> SyncChannel<T> {
    /// Create the channel and queue the join announcement and the
    /// initial-state request.
    pub fn new(
        doc: ReplicatedDocument,
        transport: T,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        config: ChannelConfig,
    ) -> Result<Self, ProtocolError> {
        let mut channel = Self {
            doc,
            transport,
            inbound,
            config,
            queue: OfflineQueue::new(),
            stats: ChannelStats::default(),
        };
        for msg in channel.handshake()? {
            channel.enqueue(msg)?;
        }
        log::info!("sync channel for {} opened by {}", channel.config.document, channel.doc.actor());
        Ok(channel)
    }

    /// The join announcement and initial-state request every connection starts with.
    fn handshake(&self) -> Result<[SyncMessage; 2], ProtocolError> {
        let local = self.doc.registry().local();
        let joined = SyncMessage::peer_joined(&self.config.document, &local)?;
        let state_vector = self.doc.state_vector()?.encode_v1();
        let request = SyncMessage::sync_step1(self.doc.actor(), &self.config.document, state_vector);
        Ok([joined, request])
    }

    /// Continue over a new connection after the old one dropped. Frames the
    /// old transport never delivered are queued again ahead of newer ones,
    /// behind a fresh handshake. Returns the old transport.
    pub fn replace_transport(
        &mut self,
        transport: T,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<T, ProtocolError> {
        let handshake = self
            .handshake()?
            .into_iter()
            .map(|msg| Ok((msg.clock, msg.encode()?)))
            .collect::<Result<Vec<_>, ProtocolError>>()?;
        let old = std::mem::replace(&mut self.transport, transport);
        self.inbound = inbound;
        self.requeue_returned(old.take_unsent());
        self.queue.requeue_all(handshake);
        log::info!("sync channel for {} reconnected, {} frames queued", self.config.document, self.queue.len());
        Ok(old)
    }

    /// Queue again frames a transport accepted but could not deliver.
    fn requeue_returned(&mut self, unsent: Vec<Vec<u8>>) {
        if unsent.is_empty() {
            return;
        }
        log::debug!("{} frames came back undelivered, queueing them again", unsent.len());
        self.stats.frames_returned += unsent.len() as u64;
        let frames = unsent
            .into_iter()
            .map(|frame| (SyncMessage::decode(&frame).map_or(0, |m| m.clock), frame))
            .collect();
        self.queue.requeue_all(frames);
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.doc
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Frames waiting for the transport.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    fn enqueue(&mut self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        self.queue.enqueue(msg.clock, frame);
        Ok(())
    }

    /// Move every change-set from the document outbox onto the send queue.
    pub fn collect(&mut self) -> Result<usize, ProtocolError> {
        let frames = self
            .doc
            .take_outbound()
            .iter()
            .map(|cs| {
                let msg = SyncMessage::delta(&self.config.document, cs)?;
                Ok((cs.seq, msg.encode()?))
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;
        let count = frames.len();
        for (clock, frame) in frames {
            self.queue.enqueue(clock, frame);
        }
        if count > 0 {
            log::trace!("collected {count} change-sets, {} frames queued", self.queue.len());
        }
        Ok(count)
    }

    /// Send queued frames in order while the transport is ready, after first
    /// taking back any frames it failed to deliver earlier.
    pub fn flush(&mut self) -> usize {
        self.requeue_returned(self.transport.take_unsent());
        let mut sent = 0;
        while self.transport.is_ready() {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            let len = queued.frame.len() as u64;
            if let Err(e) = self.transport.send(queued.frame.clone()) {
                log::debug!("send failed, keeping {} frames queued: {e}", self.queue.len() + 1);
                self.queue.requeue(queued);
                break;
            }
            self.stats.frames_sent += 1;
            self.stats.bytes_sent += len;
            sent += 1;
        }
        sent
    }

    /// Handle one inbound frame. Failures are counted as dropped frames and
    /// leave the document untouched.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.stats.frames_received += 1;
        self.stats.bytes_received += bytes.len() as u64;
        let outcome = SyncMessage::decode(bytes).and_then(|msg| self.dispatch(msg));
        if let Err(e) = &outcome {
            self.stats.dropped_frames += 1;
            log::warn!("dropping inbound frame ({} bytes): {e}", bytes.len());
        }
        outcome
    }

    fn dispatch(&mut self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let sender = msg.sender();
        if sender == self.doc.actor() {
            return Ok(());
        }
        if !msg.document.is_empty() && msg.document != self.config.document {
            log::debug!("ignoring frame for document {}", msg.document);
            return Ok(());
        }
        match msg.msg_type {
            MessageType::Delta => {
                let change_set = msg.change_set()?;
                let diff = self.doc.merge_change_set(&change_set)?;
                self.stats.change_sets_merged += 1;
                log::trace!("merged change-set {} from {sender}: {} edits", change_set.seq, diff.len());
            }
            MessageType::SyncStep1 => {
                let remote = StateVector::decode_v1(&msg.payload).map_err(CollabError::from)?;
                let update = self.doc.encode_state_as_update(&remote)?;
                let reply = SyncMessage::sync_step2(self.doc.actor(), &self.config.document, update);
                self.enqueue(reply)?;
            }
            MessageType::SyncStep2 => {
                self.doc.merge_update(&msg.payload, Origin::Snapshot)?;
                if !self.doc.is_initialized() {
                    log::info!("initial state of {} received", self.config.document);
                    self.doc.mark_initialized();
                }
            }
            MessageType::PeerJoined => {
                let collaborator = msg.collaborator()?;
                let name = collaborator.display_name.clone();
                if self.doc.registry().set(collaborator) {
                    log::info!("{name} ({sender}) joined {}", self.config.document);
                }
            }
            MessageType::PeerLeft => {
                log::info!("{sender} left {}", self.config.document);
            }
            MessageType::Ping => self.enqueue(SyncMessage::pong(self.doc.actor()))?,
            MessageType::Pong => log::trace!("pong from {sender}"),
        }
        Ok(())
    }

    /// Handle every inbound frame that is already available, without waiting.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(frame) = self.inbound.try_recv() {
            // Failures are already counted and logged.
            let _ = self.handle_frame(&frame);
            handled += 1;
        }
        handled
    }

    /// Wait for the next inbound frame. `None` once the transport is gone.
    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Drive the channel until the inbound side closes or the document is
    /// disposed. Must run on the document's thread.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        let notify = self.doc.outbound_notify();
        let interval = self.config.poll_interval();
        loop {
            self.collect()?;
            self.flush();
            if self.doc.is_disposed() {
                log::info!("document disposed, closing channel for {}", self.config.document);
                return Ok(());
            }
            let inbound = tokio::select! {
                frame = self.inbound.recv() => Some(frame),
                _ = notify.notified() => None,
                _ = tokio::time::sleep(interval) => None,
            };
            match inbound {
                Some(Some(frame)) => {
                    let _ = self.handle_frame(&frame);
                }
                Some(None) => {
                    self.collect()?;
                    self.flush();
                    log::info!("inbound closed for {}", self.config.document);
                    return Ok(());
                }
                None => {}
            }
        }
    }
}
