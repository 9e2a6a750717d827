//! Puts data packets arriving over N links back into the sender's order.

use std::collections::BTreeMap;

use crate::packet::{CONTROL_SEQUENCE, Packet, next_sequence};

/// How inbound data packets are handed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveMode {
    /// Deliver each packet as soon as any link yields it.
    ///
    /// Nothing is tracked, so a packet resent after its link dropped is
    /// delivered twice if the first copy had already arrived.
    Burst,
    /// Deliver packets in strict sequence order.
    #[default]
    Sequential,
}

const SEQUENCE_SPACE: i128 = 1 << 63;

/// True when `sequence` was already passed by a cursor at `expected`.
fn is_behind(sequence: i64, expected: i64) -> bool {
    let distance = (expected as i128 - sequence as i128).rem_euclid(SEQUENCE_SPACE);
    distance > 0 && distance <= SEQUENCE_SPACE / 2
}

/// Per peer reorder buffer.
///
/// The cursor starts at 0, the first sequence a peer issues in a connection
/// epoch, so a packet that overtakes its predecessors waits in the buffer.
#[derive(Debug)]
pub struct Reassembler {
    mode: ReceiveMode,
    next_expected: i64,
    buffer: BTreeMap<i64, Packet>,
}

impl Reassembler {
    /// Creates an empty reassembler.
    pub fn new(mode: ReceiveMode) -> Self {
        Reassembler {
            mode,
            next_expected: 0,
            buffer: BTreeMap::new(),
        }
    }

    /// The receive mode.
    pub fn mode(&self) -> ReceiveMode {
        self.mode
    }

    /// Sequence the next in-order delivery must carry.
    pub fn next_expected(&self) -> i64 {
        self.next_expected
    }

    /// Number of packets waiting for a predecessor.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Accepts one arrival and returns the packets now deliverable, in order.
    pub fn push(&mut self, packet: Packet) -> Vec<Packet> {
        if self.mode == ReceiveMode::Burst || packet.sequence() == CONTROL_SEQUENCE {
            return vec![packet];
        }
        let sequence = packet.sequence();
        if sequence < 0 || is_behind(sequence, self.next_expected) {
            log::debug!(
                "Dropping packet {sequence}, already delivered up to {}",
                self.next_expected
            );
            return Vec::new();
        }
        if self.buffer.contains_key(&sequence) {
            log::debug!("Dropping duplicate of buffered packet {sequence}");
            return Vec::new();
        }
        self.buffer.insert(sequence, packet);

        let mut ready = Vec::new();
        while let Some(next) = self.buffer.remove(&self.next_expected) {
            self.next_expected = next_sequence(self.next_expected);
            ready.push(next);
        }
        ready
    }

    /// Forgets buffered packets and rewinds the cursor for a new epoch.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_expected = 0;
    }

    #[cfg(test)]
    fn starting_at(mode: ReceiveMode, next_expected: i64) -> Self {
        Reassembler {
            mode,
            next_expected,
            buffer: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(r: &mut Reassembler, order: &[i64]) -> Vec<i64> {
        order
            .iter()
            .flat_map(|s| r.push(Packet::data(*s, format!("msg-{s}").as_bytes())))
            .map(|p| p.sequence())
            .collect()
    }

    #[test]
    fn sequential_restores_scrambled_order() {
        let mut r = Reassembler::new(ReceiveMode::Sequential);
        assert_eq!(feed(&mut r, &[2, 0, 4, 1, 3]), vec![0, 1, 2, 3, 4]);
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.next_expected(), 5);
    }

    #[test]
    fn sequential_holds_packets_until_the_gap_closes() {
        let mut r = Reassembler::new(ReceiveMode::Sequential);
        assert!(r.push(Packet::data(1, b"b")).is_empty());
        assert!(r.push(Packet::data(2, b"c")).is_empty());
        assert_eq!(r.buffered(), 2);
        let ready: Vec<Vec<u8>> = r
            .push(Packet::data(0, b"a"))
            .iter()
            .map(Packet::clone_payload)
            .collect();
        assert_eq!(ready, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn burst_keeps_arrival_order() {
        for order in [[2, 0, 4, 1, 3], [4, 3, 2, 1, 0], [0, 1, 2, 3, 4]] {
            let mut r = Reassembler::new(ReceiveMode::Burst);
            assert_eq!(feed(&mut r, &order), order.to_vec());
        }
    }

    #[test]
    fn duplicates_are_delivered_once() {
        let mut r = Reassembler::new(ReceiveMode::Sequential);
        assert_eq!(feed(&mut r, &[1, 1, 0, 0, 1, 2]), vec![0, 1, 2]);
    }

    #[test]
    fn control_sentinel_does_not_move_the_cursor() {
        let mut r = Reassembler::new(ReceiveMode::Sequential);
        let out = r.push(Packet::data(CONTROL_SEQUENCE, b""));
        assert_eq!(out.len(), 1);
        assert_eq!(r.next_expected(), 0);
    }

    #[test]
    fn cursor_wraps_past_max() {
        let mut r = Reassembler::starting_at(ReceiveMode::Sequential, i64::MAX - 1);
        assert_eq!(
            feed(&mut r, &[0, i64::MAX, 1, i64::MAX - 1]),
            vec![i64::MAX - 1, i64::MAX, 0, 1]
        );
        assert_eq!(r.next_expected(), 2);
    }

    #[test]
    fn reset_starts_a_new_epoch() {
        let mut r = Reassembler::new(ReceiveMode::Sequential);
        feed(&mut r, &[0, 1, 3]);
        r.reset();
        assert_eq!(r.buffered(), 0);
        assert_eq!(feed(&mut r, &[0]), vec![0]);
    }
}
