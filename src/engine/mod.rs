// dbfed Engine - Core module structure
pub mod adapter;
pub mod cli;
pub mod config;
pub mod connections;
pub mod error;
pub mod federation;
pub mod locks;
pub mod query;
pub mod sharding;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::Connection;
pub use config::{FederationConfig, FederationContext};
pub use connections::{Link, LinkRegistry};
pub use error::{FederationError, Result};
pub use federation::{ReplicatedConnection, ShardedConnection};
