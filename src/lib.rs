//! dbfed - sharded and replicated query federation over SQL links
//!
//! Plain connections, range-sharded compositions and primary/mirror
//! compositions all implement the same [`engine::Connection`] contract, so
//! callers address any of them by name through a [`engine::LinkRegistry`].

pub mod engine;

pub use engine::{
    Connection, FederationConfig, FederationContext, FederationError, Link, LinkRegistry,
    ReplicatedConnection, ShardedConnection,
};
