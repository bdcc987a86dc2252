//! Fan-out of server events to live connections.
//!
//! Each connection owns an unbounded channel drained by its socket task, so a
//! send here never blocks. An event is serialized once and the resulting
//! frame is cloned per destination.
//!
//! A destination whose channel is closed has lost its socket task. It is
//! removed from the group on the spot and queued as *pruned*; the hub drains
//! that queue and finishes the eviction (presence, locks, `userLeft`).

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ConnectionId, ServerEvent};

/// Sending half of one connection's outbound queue.
pub type PeerSink = mpsc::UnboundedSender<Message>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// The set of outbound sinks, keyed by connection.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, PeerSink>,
    pruned: Vec<ConnectionId>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer and return the receiver its socket task drains.
    pub fn add_peer(&mut self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(connection_id, tx);
        rx
    }

    /// Remove a peer. Dropping the sink ends its socket task's queue.
    pub fn remove_peer(&mut self, connection_id: &ConnectionId) -> bool {
        self.peers.remove(connection_id).is_some()
    }

    pub fn has_peer(&self, connection_id: &ConnectionId) -> bool {
        self.peers.contains_key(connection_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Deliver to every peer.
    pub fn broadcast_all(&mut self, event: &ServerEvent) -> usize {
        match Self::frame(event) {
            Some(frame) => self.fan_out(frame, None),
            None => 0,
        }
    }

    /// Deliver to every peer except `excluded` (usually the originator).
    pub fn broadcast_except(&mut self, event: &ServerEvent, excluded: &ConnectionId) -> usize {
        match Self::frame(event) {
            Some(frame) => self.fan_out(frame, Some(excluded)),
            None => 0,
        }
    }

    /// Deliver a pre-built frame to every peer (pings).
    pub fn broadcast_raw(&mut self, frame: Message) -> usize {
        self.fan_out(frame, None)
    }

    /// Deliver to one peer. Returns false if it is gone.
    pub fn send_to(&mut self, connection_id: &ConnectionId, event: &ServerEvent) -> bool {
        match Self::frame(event) {
            Some(frame) => self.send_raw(connection_id, frame),
            None => false,
        }
    }

    /// Deliver a pre-built frame to one peer.
    pub fn send_raw(&mut self, connection_id: &ConnectionId, frame: Message) -> bool {
        let Some(sink) = self.peers.get(connection_id) else {
            return false;
        };
        if sink.send(frame).is_ok() {
            self.messages_sent += 1;
            true
        } else {
            self.prune(*connection_id);
            false
        }
    }

    /// Queue a close frame for a peer and drop its sink.
    ///
    /// The socket task flushes everything queued before the close frame,
    /// then exits.
    pub fn close(&mut self, connection_id: &ConnectionId, frame: Option<CloseFrame>) -> bool {
        match self.peers.remove(connection_id) {
            Some(sink) => {
                let _ = sink.send(Message::Close(frame));
                true
            }
            None => false,
        }
    }

    /// Connections removed because their channel was closed.
    pub fn take_pruned(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.pruned)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.peers.len(),
        }
    }

    fn frame(event: &ServerEvent) -> Option<Message> {
        match event.to_message() {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::error!("Failed to encode outbound event: {e}");
                None
            }
        }
    }

    fn fan_out(&mut self, frame: Message, excluded: Option<&ConnectionId>) -> usize {
        // Snapshot first so pruning cannot disturb the iteration.
        let targets: Vec<(ConnectionId, PeerSink)> = self
            .peers
            .iter()
            .filter(|(id, _)| Some(*id) != excluded)
            .map(|(id, sink)| (*id, sink.clone()))
            .collect();

        let mut delivered = 0;
        for (id, sink) in targets {
            if sink.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                self.prune(id);
            }
        }
        self.messages_sent += delivered as u64;
        delivered
    }

    fn prune(&mut self, connection_id: ConnectionId) {
        if self.peers.remove(&connection_id).is_some() {
            log::debug!("Pruned connection {connection_id} after failed send");
            self.messages_dropped += 1;
            self.pruned.push(connection_id);
        }
    }
}
