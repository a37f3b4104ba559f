//! Acknowledgement and retransmission state of one reliable-UDP connection.
//!
//! The receiving side is an [`AckTracker`]: it remembers the highest id seen
//! from the peer and which of the preceding [`ACK_WINDOW`] ids arrived, which
//! is exactly what the next outgoing header advertises. The sending side is an
//! [`OutstandingTable`] of packets that still wait for such an advertisement.
//!
//! Both are plain data structures driven with explicit timestamps; the
//! network crate keeps them behind separate locks.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::header::{DatagramHeader, ACK_WINDOW, NO_ACK};
use crate::FailPolicy;

/// Outcome of offering a payload-bearing id to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First arrival; deliver the payload
    Fresh,
    /// Already delivered once
    Duplicate,
    /// Older than the window, so a previous delivery can no longer be ruled out
    OutOfWindow,
}

#[derive(Debug, Clone)]
pub struct AckTracker {
    highest_received_id: i32,
    received_ids: BTreeSet<i32>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self {
            highest_received_id: NO_ACK,
            received_ids: BTreeSet::new(),
        }
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest_received_id(&self) -> i32 {
        self.highest_received_id
    }

    pub fn contains(&self, id: i32) -> bool {
        self.received_ids.contains(&id)
    }

    pub fn received_ids(&self) -> impl Iterator<Item = &i32> {
        self.received_ids.iter()
    }

    /// Record that a datagram with `id` arrived, payload or not.
    pub fn observe(&mut self, id: i32) {
        if id > self.highest_received_id {
            self.highest_received_id = id;
            self.prune();
        }
    }

    /// Register a payload-bearing id. Only [`Receipt::Fresh`] ids may be
    /// handed to the application.
    pub fn accept(&mut self, id: i32) -> Receipt {
        self.observe(id);

        if i64::from(id) < self.window_floor() {
            return Receipt::OutOfWindow;
        }
        if !self.received_ids.insert(id) {
            return Receipt::Duplicate;
        }
        Receipt::Fresh
    }

    /// Bitmap for a header whose ack field is the current highest id.
    pub fn ack_bits(&self) -> u32 {
        let high = i64::from(self.highest_received_id);
        self.received_ids
            .iter()
            .filter(|&&id| id != self.highest_received_id)
            .filter_map(|&id| {
                let bit = high - i64::from(id) - 1;
                (0..i64::from(ACK_WINDOW)).contains(&bit).then(|| 1u32 << bit)
            })
            .fold(0, |bits, bit| bits | bit)
    }

    /// Header for an outgoing datagram with sequence id `id`.
    pub fn header_for(&self, id: i32) -> DatagramHeader {
        DatagramHeader::new(id, self.highest_received_id, self.ack_bits())
    }

    /// Lowest id still representable by the bitmap.
    fn window_floor(&self) -> i64 {
        i64::from(self.highest_received_id) - i64::from(ACK_WINDOW)
    }

    fn prune(&mut self) {
        let floor = self.window_floor();
        let before = self.received_ids.len();
        self.received_ids.retain(|&id| i64::from(id) >= floor);
        if self.received_ids.len() != before {
            trace!("pruned {} received ids below {}", before - self.received_ids.len(), floor);
        }
    }
}

/// One datagram as queued for sending: header fixed at queue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub id: i32,
    pub policy: FailPolicy,
    pub payload: Bytes,
    pub header: DatagramHeader,
}

impl OutgoingPacket {
    pub fn new(header: DatagramHeader, policy: FailPolicy, payload: Bytes) -> Self {
        Self {
            id: header.id,
            policy,
            payload,
            header,
        }
    }

    pub fn datagram(&self) -> Bytes {
        self.header.frame(&self.payload)
    }
}

#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    pub packet: OutgoingPacket,
    pub sent_at: Instant,
}

/// Sent packets that have not been acknowledged yet, keyed by id.
#[derive(Debug, Default)]
pub struct OutstandingTable {
    packets: BTreeMap<i32, OutstandingPacket>,
}

impl OutstandingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a packet that was just sent. `Ignore` packets are not kept;
    /// a resend of a tracked id replaces the earlier entry.
    pub fn record(&mut self, packet: OutgoingPacket, sent_at: Instant) -> bool {
        if !packet.policy.is_tracked() {
            return false;
        }
        self.packets.insert(packet.id, OutstandingPacket { packet, sent_at });
        true
    }

    /// Drop every packet confirmed by `header`. Returns how many were removed.
    pub fn acknowledge(&mut self, header: &DatagramHeader) -> usize {
        header
            .acknowledged_ids()
            .filter(|id| self.packets.remove(id).is_some())
            .count()
    }

    /// Packets whose last transmission is at least `resend_interval` old.
    pub fn due_for_resend(&self, now: Instant, resend_interval: Duration) -> Vec<OutgoingPacket> {
        self.packets
            .values()
            .filter(|outstanding| now.saturating_duration_since(outstanding.sent_at) >= resend_interval)
            .map(|outstanding| outstanding.packet.clone())
            .collect()
    }

    pub fn get(&self, id: i32) -> Option<&OutstandingPacket> {
        self.packets.get(&id)
    }

    pub fn contains(&self, id: i32) -> bool {
        self.packets.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<i32> {
        self.packets.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
