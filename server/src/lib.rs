//! # Cluster RPC Runtime
//!
//! This library is the server side of a location-transparent messaging and
//! RPC runtime for real-time multi-user backends. Clients connect to gate
//! nodes, bind their connection to an application identity, and call
//! `Service.Method` routes without knowing which process hosts the service.
//!
//! ## Core Responsibilities
//!
//! ### Connection Handling
//! Every client stream is framed by the packet codec from the `shared` crate
//! and served by one task. Packets of one connection are dispatched strictly
//! in arrival order. A protocol violation closes that connection and nothing
//! else.
//!
//! ### Location-Transparent Routing
//! The [`Router`] resolves a route against the local [`Components`] first and
//! otherwise forwards the call to a cluster member advertising the service.
//! Remote handlers run against proxy sessions, so `respond`, `push` and group
//! membership behave the same wherever the handler lives.
//!
//! ### Broadcast Groups
//! A [`Group`] is a named set of sessions. Broadcasts encode once, deliver
//! from a snapshot, and report failing members instead of aborting.
//!
//! ### Cluster Membership
//! One master node keeps the member registry. Service nodes register with
//! it (retrying until it answers), receive the full membership, then follow
//! incremental changes. Heartbeats detect dead members.
//!
//! ## Module Organization
//!
//! - `session`: per-connection state, identity binding, close callbacks
//! - `group`: broadcast sets
//! - `component`: the `Service.Method` handler registry
//! - `router`: local dispatch, forwarding, route strategies, proxy sessions
//! - `connection`: the client protocol state machine
//! - `cluster`: inter-node links, member registry, node lifecycle
//! - `scheduler`: background loop for heartbeats and timeout sweeps
//! - `config`, `error`, `serializer`: ambient plumbing
//!
//! ## Example
//!
//! ```no_run
//! use server::{Component, Node, NodeConfig};
//!
//! # async fn run() -> server::Result<()> {
//! let room = Component::new("Room").method("Join", |session, payload| async move {
//!     session.bind(1001)?;
//!     Ok(Some(payload))
//! });
//!
//! let node = Node::builder(NodeConfig::new("127.0.0.1:3250"))
//!     .register(room)?
//!     .startup()
//!     .await?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod component;
pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod router;
pub mod scheduler;
pub mod serializer;
pub mod session;
pub mod utils;

pub use cluster::{LinkHandler, MemberRegistry, Node, NodeBuilder, NodeLink};
pub use component::{Component, Components, Handler, HandlerError, HandlerResult};
pub use config::NodeConfig;
pub use connection::serve_client;
pub use error::{Error, Result};
pub use group::{BroadcastReport, Group};
pub use router::{FirstAvailable, RandomMember, RouteStrategy, Router, UidHash};
pub use scheduler::{Scheduler, TimerId};
pub use serializer::{BincodeSerializer, JsonSerializer, Serializer};
pub use session::{MemoryOutbound, Outbound, RemoteOrigin, Session, SessionRegistry, SessionState};
