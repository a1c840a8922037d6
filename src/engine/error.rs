//! Federation Error Types

use std::io;
use thiserror::Error;

use super::sharding::ShardId;

/// Broad fault classes, used by callers to decide whether a retry makes sense
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing link, duplicate registration, no strategy, no endpoints
    Configuration,
    /// Query could not be mapped onto shards; input may be corrected and retried
    Routing,
    /// Racing writer or programming defect; never retried
    Consistency,
    /// Operation shape not supported by this connection
    Unsupported,
    /// Resource is busy (e.g. a resync already running)
    State,
    /// Driver, I/O or lock store failure
    Backend,
}

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("link '{0}' not found")]
    LinkNotFound(String),

    #[error("already have '{0}' link")]
    DuplicateLink(String),

    #[error("no default link and requested link name is empty")]
    NoDefaultLink,

    #[error("no sharding strategy for table \"{0}\"")]
    NoStrategy(String),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    #[error("shard {0} already registered")]
    DuplicateShard(ShardId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unable to route query on table \"{0}\"")]
    Unroutable(String),

    #[error("missing sharding key '{key}' in written fields of \"{table}\"")]
    MissingShardingKey { table: String, key: String },

    #[error("no shard for {key}={value}")]
    NoShardForValue { key: String, value: String },

    #[error("{affected} rows affected: racy or insane insert into \"{table}\"")]
    RacyInsert { table: String, affected: u64 },

    #[error("inconsistent aggregation: {0}")]
    AggregateMismatch(String),

    #[error("not possible to return single resource for multiple db requests")]
    SingleResource,

    #[error("feature not implemented: {0}")]
    Unsupported(String),

    #[error("{0} is already being replicated")]
    AlreadyReplicating(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("lock store error: {0}")]
    LockStore(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FederationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LinkNotFound(_)
            | Self::DuplicateLink(_)
            | Self::NoDefaultLink
            | Self::NoStrategy(_)
            | Self::NoEndpoints
            | Self::ShardNotFound(_)
            | Self::DuplicateShard(_)
            | Self::Config(_) => ErrorKind::Configuration,
            Self::Unroutable(_) | Self::MissingShardingKey { .. } | Self::NoShardForValue { .. } => {
                ErrorKind::Routing
            }
            Self::RacyInsert { .. } | Self::AggregateMismatch(_) => ErrorKind::Consistency,
            Self::SingleResource | Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::AlreadyReplicating(_) => ErrorKind::State,
            Self::Connection(_)
            | Self::Query(_)
            | Self::Schema(_)
            | Self::LockStore(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Backend,
        }
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;
