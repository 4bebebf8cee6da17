//! Inter-node protocol spoken over the links between cluster members
//!
//! Node messages are bincode-encoded and carried in `Data` frames of the same
//! codec the client protocol uses.

use crate::codec::encode;
use crate::packet::{PacketType, ProtocolError};
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Descriptor of one cluster peer and the services it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node_id: u64,
    pub service_addr: String,
    /// Present on client-facing nodes.
    pub client_addr: Option<String>,
    pub is_master: bool,
    pub services: Vec<String>,
}

impl MemberInfo {
    pub fn advertises(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

impl fmt::Display for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} at {} (master: {}, services: [{}])",
            self.node_id,
            self.service_addr,
            self.is_master,
            self.services.join(", ")
        )
    }
}

/// A call forwarded from the node that owns the origin session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub call_id: u64,
    pub origin_node: u64,
    pub session_id: u64,
    /// Bound identity of the origin session, 0 when unbound.
    pub uid: i64,
    /// Client message id the origin is answering, 0 for notifies.
    pub mid: u64,
    pub route: String,
    pub payload: Vec<u8>,
    pub wants_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Route,
    Handler,
    Panic,
    Bind { current: i64, requested: i64 },
    InvalidUid(i64),
    SessionClosed(u64),
    Other,
}

/// Failure of a forwarded call, as reported by the node that executed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

pub type CallResult = Result<Option<Vec<u8>>, RemoteFailure>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Service node → master.
    Register { member: MemberInfo },
    /// Master → service node: full membership snapshot.
    RegisterAck { members: Vec<MemberInfo> },
    RegisterRejected { reason: String },
    Unregister { node_id: u64 },
    MemberAdded { member: MemberInfo },
    MemberRemoved { node_id: u64 },
    Heartbeat { node_id: u64 },
    Call(RemoteCall),
    Reply { call_id: u64, result: CallResult },
    /// A complete client frame to relay to a session on the receiving node.
    Push { session_id: u64, frame: Vec<u8> },
    SessionClosed { origin_node: u64, session_id: u64 },
}

impl NodeMessage {
    /// Encodes the message as one `Data` frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = serialize(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        encode(PacketType::Data, &payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        deserialize(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
