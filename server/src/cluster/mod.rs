//! Cluster membership, inter-node links and node lifecycle.

pub mod link;
pub mod member;
pub mod node;

pub use link::{LinkHandler, NodeLink};
pub use member::MemberRegistry;
pub use node::{MemberHook, Node, NodeBuilder};
