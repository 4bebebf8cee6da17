//! Application messages carried inside `Data` packets
//!
//! A message is the unit the session layer dispatches: requests expect a
//! response with the same id, notifies are fire-and-forget, and pushes are
//! server-initiated deliveries such as group broadcasts.

use crate::packet::ProtocolError;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Notify,
    Response,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub id: u64,
    pub route: String,
    pub data: Vec<u8>,
    /// Set on responses that carry an error description instead of a result.
    pub error: bool,
}

impl Message {
    pub fn request(id: u64, route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            route: route.into(),
            data,
            error: false,
        }
    }

    pub fn notify(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Notify,
            id: 0,
            route: route.into(),
            data,
            error: false,
        }
    }

    pub fn response(id: u64, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            route: String::new(),
            data,
            error: false,
        }
    }

    pub fn error_response(id: u64, reason: &str) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            route: String::new(),
            data: reason.as_bytes().to_vec(),
            error: true,
        }
    }

    pub fn push(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Push,
            id: 0,
            route: route.into(),
            data,
            error: false,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serialize(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Decodes and validates the shape of a message.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let message: Message =
            deserialize(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let ok = match self.kind {
            MessageKind::Request => self.id > 0 && !self.route.is_empty(),
            MessageKind::Notify => self.id == 0 && !self.route.is_empty(),
            MessageKind::Response => self.id > 0,
            MessageKind::Push => self.id == 0 && !self.route.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::Malformed(format!(
                "invalid {:?} message (id {}, route `{}`)",
                self.kind, self.id, self.route
            )))
        }
    }

    /// Error text of an error response.
    pub fn error_text(&self) -> Option<String> {
        self.error
            .then(|| String::from_utf8_lossy(&self.data).into_owned())
    }
}

/// Payload of the client's opening `Handshake` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: String,
}

/// Payload of the server's `Handshake` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub session_id: u64,
    pub heartbeat_secs: u64,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serialize(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        deserialize(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

impl HandshakeResponse {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serialize(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        deserialize(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let message = Message::request(7, "Room.Join", b"alice".to_vec());
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.error_text(), None);
    }

    #[test]
    fn test_error_response_text() {
        let message = Message::error_response(3, "no member advertises service `Room`");
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert!(decoded.error);
        assert_eq!(
            decoded.error_text().as_deref(),
            Some("no member advertises service `Room`")
        );
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        let bad_request = Message {
            kind: MessageKind::Request,
            id: 0,
            route: "Room.Join".into(),
            data: Vec::new(),
            error: false,
        };
        assert!(matches!(
            Message::decode(&bad_request.encode().unwrap()),
            Err(ProtocolError::Malformed(_))
        ));

        let bad_notify = Message {
            kind: MessageKind::Notify,
            id: 0,
            route: String::new(),
            data: Vec::new(),
            error: false,
        };
        assert!(Message::decode(&bad_notify.encode().unwrap()).is_err());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            Message::decode(&[0xff, 0xff, 0xff]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_handshake_payloads() {
        let request = HandshakeRequest {
            version: "0.1.0".into(),
        };
        assert_eq!(
            HandshakeRequest::decode(&request.encode().unwrap()).unwrap(),
            request
        );

        let response = HandshakeResponse {
            session_id: 12,
            heartbeat_secs: 10,
        };
        assert_eq!(
            HandshakeResponse::decode(&response.encode().unwrap()).unwrap(),
            response
        );
    }
}
