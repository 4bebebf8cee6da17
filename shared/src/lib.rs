//! Wire types shared by every process of the cluster: the packet codec, the
//! client message envelope and the inter-node protocol.

pub mod cluster;
pub mod codec;
pub mod message;
pub mod packet;

pub use cluster::{
    CallResult, FailureKind, MemberInfo, NodeMessage, RemoteCall, RemoteFailure,
};
pub use codec::{
    encode, encode_packet, encode_raw, encoded_len, frame_type, Decoded, Decoder, DEFAULT_MAX_PACKET_SIZE,
    NARROW_HEADER_LEN, WIDE_HEADER_LEN,
};
pub use message::{HandshakeRequest, HandshakeResponse, Message, MessageKind};
pub use packet::{Packet, PacketType, ProtocolError};

/// Protocol version announced in handshakes.
pub const PROTOCOL_VERSION: &str = "0.1.0";
