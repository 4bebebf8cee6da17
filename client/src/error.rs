use shared::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server answered with an error: {0}")]
    Remote(String),

    #[error("`{0}` is not a valid `Service.Method` route")]
    InvalidRoute(String),

    #[error("connection closed")]
    Closed,

    #[error("kicked by the server")]
    Kicked,
}

pub type Result<T> = std::result::Result<T, ClientError>;
