//! Error taxonomy of the runtime
//!
//! Protocol and transport failures close only the connection they occur on.
//! Route and timeout failures are handed back to the caller untouched; the
//! runtime never retries a forwarded call on its own.

use shared::{FailureKind, ProtocolError, RemoteFailure};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session already bound to uid {current}, cannot rebind to {requested}")]
    Bind { current: i64, requested: i64 },

    #[error("uid {0} cannot be bound to a session")]
    InvalidUid(i64),

    #[error("no member advertises service `{0}`")]
    Route(String),

    #[error("`{0}` is not a valid `Service.Method` route")]
    InvalidRoute(String),

    #[error("call to `{route}` timed out after {timeout:?}")]
    Timeout { route: String, timeout: Duration },

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("link to {0} is closed")]
    LinkClosed(String),

    #[error("handler for `{route}` panicked: {message}")]
    HandlerPanic { route: String, message: String },

    #[error("handler for `{route}` failed: {message}")]
    Handler { route: String, message: String },

    #[error("session {0} is closed")]
    SessionClosed(u64),

    #[error("group `{0}` is closed")]
    GroupClosed(String),

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("scheduler is closed")]
    SchedulerClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("registration rejected by master: {0}")]
    Registration(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Converts a failure of a call executed on this node into its wire form.
    pub fn to_remote(&self) -> RemoteFailure {
        let kind = match self {
            Error::Route(_) | Error::InvalidRoute(_) => FailureKind::Route,
            Error::Handler { .. } => FailureKind::Handler,
            Error::HandlerPanic { .. } => FailureKind::Panic,
            Error::Bind { current, requested } => FailureKind::Bind {
                current: *current,
                requested: *requested,
            },
            Error::InvalidUid(uid) => FailureKind::InvalidUid(*uid),
            Error::SessionClosed(id) => FailureKind::SessionClosed(*id),
            _ => FailureKind::Other,
        };
        let message = match self {
            Error::Handler { message, .. } | Error::HandlerPanic { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        };
        RemoteFailure { kind, message }
    }

    /// Rebuilds a typed error from a failure reported by a remote node.
    pub fn from_remote(route: &str, failure: RemoteFailure) -> Self {
        match failure.kind {
            FailureKind::Route => Error::Route(route_service(route).to_string()),
            FailureKind::Handler => Error::Handler {
                route: route.to_string(),
                message: failure.message,
            },
            FailureKind::Panic => Error::HandlerPanic {
                route: route.to_string(),
                message: failure.message,
            },
            FailureKind::Bind { current, requested } => Error::Bind { current, requested },
            FailureKind::InvalidUid(uid) => Error::InvalidUid(uid),
            FailureKind::SessionClosed(id) => Error::SessionClosed(id),
            FailureKind::Other => Error::Handler {
                route: route.to_string(),
                message: failure.message,
            },
        }
    }
}

fn route_service(route: &str) -> &str {
    route.split('.').next().unwrap_or(route)
}
