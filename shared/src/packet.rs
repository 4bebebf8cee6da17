use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level violations. Any of these makes further framing on the
/// offending stream untrustworthy, so the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown packet type in control byte {0:#04x}")]
    UnknownPacketType(u8),
    #[error("packet of {size} bytes exceeds the maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Packet types carried in the low bits of the control byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x03,
    Data = 0x04,
    Kick = 0x05,
}

impl PacketType {
    pub const ALL: [PacketType; 5] = [
        PacketType::Handshake,
        PacketType::HandshakeAck,
        PacketType::Heartbeat,
        PacketType::Data,
        PacketType::Kick,
    ];
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Handshake),
            0x02 => Ok(PacketType::HandshakeAck),
            0x03 => Ok(PacketType::Heartbeat),
            0x04 => Ok(PacketType::Data),
            0x05 => Ok(PacketType::Kick),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(kind: PacketType) -> Self {
        kind as u8
    }
}

/// One framed unit of the wire protocol.
///
/// The length is not stored separately: it is always `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_ordinals_are_contiguous() {
        let ordinals: Vec<u8> = PacketType::ALL.iter().map(|k| u8::from(*k)).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5]);

        for ordinal in ordinals {
            let kind = PacketType::try_from(ordinal).unwrap();
            assert_eq!(u8::from(kind), ordinal);
        }
    }

    #[test]
    fn test_packet_type_out_of_range() {
        assert_eq!(
            PacketType::try_from(0),
            Err(ProtocolError::UnknownPacketType(0))
        );
        assert_eq!(
            PacketType::try_from(6),
            Err(ProtocolError::UnknownPacketType(6))
        );
    }

    #[test]
    fn test_packet_length_tracks_payload() {
        let packet = Packet::new(PacketType::Data, b"hello".to_vec());
        assert_eq!(packet.len(), 5);
        assert!(!packet.is_empty());
        assert!(Packet::new(PacketType::Heartbeat, Vec::new()).is_empty());
    }
}
