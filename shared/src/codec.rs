//! Stream framing for the client and inter-node wire protocol
//!
//! Every frame starts with a control byte. The low three bits carry the
//! packet type and bit 3 selects the width of the length field that follows:
//!
//! ```text
//! byte 0         : type (bits 0..3) | wide-length flag (bit 3)
//! bytes 1..3     : payload length, u16 big-endian   (flag clear)
//! bytes 1..5     : payload length, u32 big-endian   (flag set)
//! bytes N..      : payload
//! ```
//!
//! Control and heartbeat packets therefore cost three header bytes while
//! payloads beyond 64 KiB remain expressible. The decoder is incremental:
//! chunks may split a frame anywhere and the packets produced depend only on
//! the cumulative bytes received.

use crate::packet::{Packet, PacketType, ProtocolError};
use bytes::{Buf, BytesMut};

pub const NARROW_HEADER_LEN: usize = 3;
pub const WIDE_HEADER_LEN: usize = 5;

/// Largest frame (header + payload) a decoder accepts unless configured otherwise.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

const TYPE_MASK: u8 = 0x07;
const WIDE_FLAG: u8 = 0x08;

/// Total frame length for a payload of `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    if payload_len <= u16::MAX as usize {
        NARROW_HEADER_LEN + payload_len
    } else {
        WIDE_HEADER_LEN + payload_len
    }
}

/// Encodes one self-describing frame.
pub fn encode(kind: PacketType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(encoded_len(len));

    if let Ok(narrow) = u16::try_from(len) {
        frame.push(u8::from(kind));
        frame.extend_from_slice(&narrow.to_be_bytes());
    } else {
        let wide = u32::try_from(len).map_err(|_| ProtocolError::PacketTooLarge {
            size: len.saturating_add(WIDE_HEADER_LEN),
            max: u32::MAX as usize,
        })?;
        frame.push(u8::from(kind) | WIDE_FLAG);
        frame.extend_from_slice(&wide.to_be_bytes());
    }

    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encodes a frame from a raw type ordinal, rejecting ordinals outside the
/// legal packet type range.
pub fn encode_raw(kind: u8, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode(PacketType::try_from(kind)?, payload)
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    encode(packet.kind, &packet.payload)
}

/// Packet type of an encoded frame, read from its control byte.
pub fn frame_type(frame: &[u8]) -> Option<PacketType> {
    let control = *frame.first()?;
    if control & !(TYPE_MASK | WIDE_FLAG) != 0 {
        return None;
    }
    PacketType::try_from(control & TYPE_MASK).ok()
}

#[derive(Debug, Clone, Copy)]
struct Header {
    kind: PacketType,
    payload_len: usize,
}

/// Result of feeding one chunk into a [`Decoder`].
///
/// Packets completed before a violation are still returned; `error` reports
/// the violation that stopped decoding.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    pub packets: Vec<Packet>,
    pub error: Option<ProtocolError>,
}

/// Incremental decoder owned by exactly one connection.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_packet_size: usize,
    header: Option<Header>,
    failure: Option<ProtocolError>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_packet_size,
            header: None,
            failure: None,
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Bytes received but not yet part of a completed packet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True once a violation has been seen. A failed decoder never yields
    /// packets again; the connection owning it is expected to close.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Decoded {
        if let Some(failure) = &self.failure {
            return Decoded {
                packets: Vec::new(),
                error: Some(failure.clone()),
            };
        }

        self.buf.extend_from_slice(chunk);
        let mut packets = Vec::new();

        loop {
            let pending = self.header;
            let header = match pending {
                Some(header) => header,
                None => match self.parse_header() {
                    Ok(Some(header)) => {
                        self.header = Some(header);
                        header
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail(e.clone());
                        return Decoded {
                            packets,
                            error: Some(e),
                        };
                    }
                },
            };

            if self.buf.len() < header.payload_len {
                break;
            }

            let payload = self.buf.split_to(header.payload_len).to_vec();
            self.header = None;
            packets.push(Packet {
                kind: header.kind,
                payload,
            });
        }

        Decoded {
            packets,
            error: None,
        }
    }

    /// Consumes a complete header from the buffer, or returns `None` when
    /// more bytes are needed. The type is validated as soon as the control
    /// byte is visible.
    fn parse_header(&mut self) -> Result<Option<Header>, ProtocolError> {
        let Some(&control) = self.buf.first() else {
            return Ok(None);
        };

        if control & !(TYPE_MASK | WIDE_FLAG) != 0 {
            return Err(ProtocolError::UnknownPacketType(control));
        }
        let kind = PacketType::try_from(control & TYPE_MASK)
            .map_err(|_| ProtocolError::UnknownPacketType(control))?;

        let wide = control & WIDE_FLAG != 0;
        let header_len = if wide {
            WIDE_HEADER_LEN
        } else {
            NARROW_HEADER_LEN
        };
        if self.buf.len() < header_len {
            return Ok(None);
        }

        let mut length_field = &self.buf[1..header_len];
        let payload_len = if wide {
            length_field.get_u32() as usize
        } else {
            length_field.get_u16() as usize
        };

        let size = header_len + payload_len;
        if size > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }

        self.buf.advance(header_len);
        Ok(Some(Header { kind, payload_len }))
    }

    fn fail(&mut self, error: ProtocolError) {
        self.buf.clear();
        self.header = None;
        self.failure = Some(error);
    }
}
