//! Overlay topology and propagation layer for ad-hoc communities.
//!
//! Nodes of a community organize themselves into a spanning tree: each node
//! picks one elder as its parent and relays content to its parent and
//! children. There is no central server and no global coordination.
//!
//! - [`message`] is the `HEADER|community|content` codec and the TCP framing.
//! - [`transport`] holds the one-request-per-connection [`transport::Connection`]
//!   and the accept loop in [`transport::Listener`].
//! - [`broadcast`] floods a message to the local tree neighbors.
//! - [`election`] finds a parent and answers parent requests.
//! - [`departure`] announces our departure and heals after a peer leaves.
//! - [`dispatch`] authenticates and routes inbound messages, then relays them.
//! - [`node`] wires everything together and owns the listener task.
//!
//! Member records live behind the [`membership::MembershipView`] and
//! [`membership::IdentityProvider`] traits; [`membership::InMemoryMembership`]
//! is the bundled implementation.

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod content;
pub mod departure;
pub mod dispatch;
pub mod election;
pub mod error;
pub mod membership;
pub mod message;
pub mod model;
pub mod node;
pub mod transport;

pub use error::{MessageError, OverlayError, StoreError};
pub use message::{Header, Message};
pub use model::{Community, Member, Relationship};
pub use node::Node;
