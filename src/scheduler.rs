//! Hands outbound packets to whichever links are idle.
//!
//! Every link carries at most one data packet at a time. A link becomes idle
//! again when its send completes; a packet whose send failed goes to the retry
//! set and is sent again, ahead of new packets, on the next idle link.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::SendStatus;
use crate::link::LinkId;
use crate::packet::Packet;

/// What a send completion did to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The packet is finished with; the link may be idle again.
    Done,
    /// The packet went to the retry set.
    Retry,
    /// The packet was not in flight on that link; nothing changed.
    Stale,
}

/// Outbound state of one logical peer.
#[derive(Debug, Default)]
pub struct SendScheduler {
    pending: VecDeque<Packet>,
    retry: BTreeMap<i64, Packet>,
    idle: VecDeque<LinkId>,
    in_flight: HashMap<i64, (LinkId, Packet)>,
    busy: HashMap<LinkId, i64>,
}

impl SendScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a new packet. Returns whether something can be sent now.
    pub fn enqueue(&mut self, packet: Packet) -> bool {
        self.pending.push_back(packet);
        self.has_work()
    }

    /// Marks `link` as ready for one send. Returns false if it already was,
    /// or if it is still carrying a packet.
    pub fn link_ready(&mut self, link: LinkId) -> bool {
        if self.busy.contains_key(&link) || self.idle.contains(&link) {
            return false;
        }
        self.idle.push_back(link);
        true
    }

    /// Whether an idle link and a packet to put on it both exist.
    pub fn has_work(&self) -> bool {
        !self.idle.is_empty() && (!self.retry.is_empty() || !self.pending.is_empty())
    }

    /// Pairs one idle link with one packet, retries first.
    pub fn next_assignment(&mut self) -> Option<(LinkId, Packet)> {
        if !self.has_work() {
            return None;
        }
        let packet = match self.retry.pop_first() {
            Some((_, packet)) => packet,
            None => self.pending.pop_front()?,
        };
        let link = self.idle.pop_front()?;
        self.in_flight.insert(packet.sequence(), (link, packet.clone()));
        self.busy.insert(link, packet.sequence());
        Some((link, packet))
    }

    /// Records the completion of `sequence` on `link`.
    pub fn on_send_complete(&mut self, link: LinkId, sequence: i64, status: SendStatus) -> Completion {
        if !matches!(self.in_flight.get(&sequence), Some((owner, _)) if *owner == link) {
            return Completion::Stale;
        }
        let Some((_, packet)) = self.in_flight.remove(&sequence) else {
            return Completion::Stale;
        };
        self.busy.remove(&link);
        if status.keeps_link() {
            self.idle.push_back(link);
        }
        if status.is_retryable() {
            self.retry.insert(packet.sequence(), packet);
            Completion::Retry
        } else {
            Completion::Done
        }
    }

    /// Forgets `link` and moves the packet it was carrying to the retry set.
    /// Returns the number of packets requeued.
    pub fn link_lost(&mut self, link: LinkId) -> usize {
        self.idle.retain(|l| *l != link);
        let Some(sequence) = self.busy.remove(&link) else {
            return 0;
        };
        match self.in_flight.remove(&sequence) {
            Some((_, packet)) => {
                self.retry.insert(sequence, packet);
                1
            }
            None => 0,
        }
    }

    /// Drops every queued, retried and in-flight packet and every idle link.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.retry.clear();
        self.idle.clear();
        self.in_flight.clear();
        self.busy.clear();
    }

    /// Packets waiting for their first send.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Packets waiting to be sent again.
    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    /// Packets currently on a link.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Links ready for a send.
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Whether `sequence` is waiting in the retry set.
    pub fn is_retrying(&self, sequence: i64) -> bool {
        self.retry.contains_key(&sequence)
    }

    /// Whether `link` is idle.
    pub fn is_idle(&self, link: LinkId) -> bool {
        self.idle.contains(&link)
    }
}
