//! Packet framing shared by every message on every link.
//!
//! ```text
//! [sequence: i64 LE (8 bytes)][type: i32 LE (4 bytes)][payload...]
//! ```
//!
//! Control packets (identity exchange, readiness) always carry the reserved
//! sequence `-1`; data packets carry the per-peer sequence used for ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bincode::{Decode, Encode};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 12;

/// Sequence carried by control packets. Never issued to data packets.
pub const CONTROL_SEQUENCE: i64 = -1;

/// Encoded size of an IDENTITY_RESPONSE payload.
pub const IDENTITY_LEN: usize = 20;

/// Kind of a packet on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PacketType {
    /// Server asks a freshly accepted link who it belongs to.
    IdentityRequest = 0,
    /// Link answers with its peer GUID and declared link count.
    IdentityResponse = 1,
    /// The link may now carry data packets.
    Ready = 2,
    /// Application payload.
    Data = 3,
}

impl TryFrom<i32> for PacketType {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(PacketType::IdentityRequest),
            1 => Ok(PacketType::IdentityResponse),
            2 => Ok(PacketType::Ready),
            3 => Ok(PacketType::Data),
            other => Err(Error::MalformedPacket(format!("unknown packet type {other}"))),
        }
    }
}

/// Encodes one frame: header followed by `payload`.
pub fn encode(sequence: i64, kind: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&sequence.to_le_bytes());
    frame.extend_from_slice(&(kind as i32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decodes one frame. The returned payload borrows from `frame`.
pub fn decode(frame: &[u8]) -> Result<(i64, PacketType, &[u8])> {
    if frame.len() < HEADER_LEN {
        return Err(Error::MalformedPacket(format!(
            "frame of {} bytes is shorter than the {HEADER_LEN} byte header",
            frame.len()
        )));
    }
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&frame[0..8]);
    let mut kind_bytes = [0u8; 4];
    kind_bytes.copy_from_slice(&frame[8..HEADER_LEN]);
    let kind = PacketType::try_from(i32::from_le_bytes(kind_bytes))?;
    Ok((i64::from_le_bytes(seq_bytes), kind, &frame[HEADER_LEN..]))
}

/// Returns the sequence issued after `sequence`, wrapping to 0 past `i64::MAX`.
pub fn next_sequence(sequence: i64) -> i64 {
    if sequence >= i64::MAX || sequence < 0 {
        0
    } else {
        sequence + 1
    }
}

/// One immutable wire unit.
///
/// The encoded frame is shared behind an `Arc`, so cloning a packet for a
/// retry or a callback never copies the payload. Equality, ordering and
/// hashing only look at the sequence.
#[derive(Clone)]
pub struct Packet {
    sequence: i64,
    kind: PacketType,
    frame: Arc<Vec<u8>>,
}

impl Packet {
    /// Builds a packet around a copy of `payload`.
    pub fn new(sequence: i64, kind: PacketType, payload: &[u8]) -> Packet {
        Packet {
            sequence,
            kind,
            frame: Arc::new(encode(sequence, kind, payload)),
        }
    }

    /// Builds a data packet.
    pub fn data(sequence: i64, payload: &[u8]) -> Packet {
        Packet::new(sequence, PacketType::Data, payload)
    }

    /// Encodes a data frame ahead of knowing its sequence; see [`Packet::sequenced`].
    pub(crate) fn unsequenced_data(payload: &[u8]) -> Vec<u8> {
        encode(0, PacketType::Data, payload)
    }

    /// Stamps `sequence` into a frame built by [`Packet::unsequenced_data`].
    pub(crate) fn sequenced(mut frame: Vec<u8>, sequence: i64) -> Packet {
        frame[0..8].copy_from_slice(&sequence.to_le_bytes());
        Packet {
            sequence,
            kind: PacketType::Data,
            frame: Arc::new(frame),
        }
    }

    /// Builds an empty control packet (`IdentityRequest` or `Ready`).
    pub fn control(kind: PacketType) -> Packet {
        Packet::new(CONTROL_SEQUENCE, kind, &[])
    }

    /// Builds the IDENTITY_RESPONSE for `identity`.
    pub fn identity_response(identity: &Identity) -> Result<Packet> {
        let payload = identity.encode()?;
        Ok(Packet::new(CONTROL_SEQUENCE, PacketType::IdentityResponse, &payload))
    }

    /// Takes ownership of a received frame without copying it.
    pub fn from_frame(frame: Vec<u8>) -> Result<Packet> {
        let (sequence, kind, _) = decode(&frame)?;
        Ok(Packet {
            sequence,
            kind,
            frame: Arc::new(frame),
        })
    }

    /// The packet sequence.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// The packet type.
    pub fn kind(&self) -> PacketType {
        self.kind
    }

    /// Whether this is an application data packet.
    pub fn is_data(&self) -> bool {
        self.kind == PacketType::Data
    }

    /// The payload, borrowed from the frame.
    pub fn payload(&self) -> &[u8] {
        &self.frame[HEADER_LEN..]
    }

    /// Owned copy of the payload.
    pub fn clone_payload(&self) -> Vec<u8> {
        self.payload().to_vec()
    }

    /// The whole encoded frame, header included.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Size of the payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.frame.len() - HEADER_LEN
    }

    /// Decodes the identity carried by an IDENTITY_RESPONSE.
    pub fn identity(&self) -> Result<Identity> {
        if self.kind != PacketType::IdentityResponse {
            return Err(Error::MalformedPacket(format!(
                "expected an identity response, got {:?}",
                self.kind
            )));
        }
        Identity::decode(self.payload())
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for Packet {}

impl PartialOrd for Packet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Packet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

impl Hash for Packet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sequence.hash(state);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("sequence", &self.sequence)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

/// Who a link belongs to: the logical peer GUID and how many links it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Logical peer GUID shared by all its links.
    pub guid: Uuid,
    /// Number of links the peer declared it will open.
    pub link_count: i32,
}

#[derive(Encode, Decode)]
struct IdentityWire {
    guid: [u8; 16],
    link_count: i32,
}

fn identity_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl Identity {
    /// Creates an identity with a fresh random GUID.
    pub fn generate(link_count: i32) -> Identity {
        Identity {
            guid: Uuid::new_v4(),
            link_count,
        }
    }

    /// Serializes to the 20 byte IDENTITY_RESPONSE payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = IdentityWire {
            guid: self.guid.to_bytes_le(),
            link_count: self.link_count,
        };
        bincode::encode_to_vec(&wire, identity_config())
            .map_err(|e| Error::MalformedPacket(format!("cannot encode identity: {e}")))
    }

    /// Parses an IDENTITY_RESPONSE payload.
    pub fn decode(payload: &[u8]) -> Result<Identity> {
        if payload.len() < IDENTITY_LEN {
            return Err(Error::MalformedPacket(format!(
                "identity payload of {} bytes, expected {IDENTITY_LEN}",
                payload.len()
            )));
        }
        let (wire, _): (IdentityWire, usize) =
            bincode::decode_from_slice(payload, identity_config())
                .map_err(|e| Error::MalformedPacket(format!("cannot decode identity: {e}")))?;
        Ok(Identity {
            guid: Uuid::from_bytes_le(wire.guid),
            link_count: wire.link_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_little_endian_header_then_payload() {
        let frame = encode(0x0102, PacketType::Data, b"abc");
        assert_eq!(frame.len(), HEADER_LEN + 3);
        assert_eq!(&frame[0..8], &0x0102i64.to_le_bytes());
        assert_eq!(&frame[8..12], &3i32.to_le_bytes());
        assert_eq!(&frame[12..], b"abc");
    }

    #[test]
    fn decode_round_trips_each_type() {
        let cases: [(i64, PacketType, &[u8]); 4] = [
            (CONTROL_SEQUENCE, PacketType::IdentityRequest, b""),
            (CONTROL_SEQUENCE, PacketType::Ready, b""),
            (0, PacketType::Data, b"msg-0"),
            (i64::MAX, PacketType::Data, &[0u8, 255, 7]),
        ];
        for (sequence, kind, payload) in cases {
            let frame = encode(sequence, kind, payload);
            let (s, k, p) = decode(&frame).unwrap();
            assert_eq!((s, k, p), (sequence, kind, payload));
        }
    }

    #[test]
    fn short_frames_are_malformed() {
        assert!(matches!(decode(&[0u8; 11]), Err(Error::MalformedPacket(_))));
        assert!(decode(&[0u8; 0]).is_err());
        assert!(Packet::from_frame(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn unknown_type_is_malformed() {
        let mut frame = encode(5, PacketType::Data, b"");
        frame[8..12].copy_from_slice(&9i32.to_le_bytes());
        assert!(matches!(decode(&frame), Err(Error::MalformedPacket(_))));
    }

    #[test]
    fn payload_is_a_view_into_the_frame() {
        let packet = Packet::from_frame(encode(7, PacketType::Data, b"hello")).unwrap();
        assert_eq!(packet.sequence(), 7);
        assert_eq!(packet.payload(), b"hello");
        assert_eq!(packet.payload_len(), 5);
        let copy = packet.clone();
        assert!(std::ptr::eq(copy.payload().as_ptr(), packet.payload().as_ptr()));
    }

    #[test]
    fn packets_compare_by_sequence_only() {
        let a = Packet::data(3, b"one");
        let b = Packet::data(3, b"two");
        let c = Packet::data(4, b"one");
        assert_eq!(a, b);
        assert!(a < c);
        let set: std::collections::HashSet<Packet> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn sequence_wraps_to_zero_not_control() {
        assert_eq!(next_sequence(0), 1);
        assert_eq!(next_sequence(41), 42);
        assert_eq!(next_sequence(i64::MAX), 0);
        assert_ne!(next_sequence(i64::MAX), CONTROL_SEQUENCE);
    }

    #[test]
    fn identity_response_is_twenty_bytes() {
        let identity = Identity::generate(3);
        let bytes = identity.encode().unwrap();
        assert_eq!(bytes.len(), IDENTITY_LEN);
        assert_eq!(&bytes[0..16], &identity.guid.to_bytes_le());
        assert_eq!(&bytes[16..20], &3i32.to_le_bytes());

        let packet = Packet::identity_response(&identity).unwrap();
        assert_eq!(packet.sequence(), CONTROL_SEQUENCE);
        assert_eq!(packet.identity().unwrap(), identity);
    }

    #[test]
    fn truncated_identity_is_rejected() {
        assert!(Identity::decode(&[0u8; 19]).is_err());
        assert!(Packet::data(0, &[0u8; 20]).identity().is_err());
    }

    #[test]
    fn sequencing_a_frame_rewrites_only_its_header() {
        let frame = Packet::unsequenced_data(b"late");
        let packet = Packet::sequenced(frame, 41);
        assert_eq!(packet.frame(), Packet::data(41, b"late").frame());
        assert_eq!(decode(packet.frame()).unwrap(), (41, PacketType::Data, &b"late"[..]));
    }
}
