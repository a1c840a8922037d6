//! Multi-connection compositions
//!
//! A composition owns an ordered set of child connections and exposes the
//! same `Connection` contract upward. Lifecycle and transaction calls fan out
//! to every child in registration order; metadata calls go to one default
//! child.

pub mod merge;
pub mod replicated;
pub mod sharded;

pub use replicated::{ReadPolicy, ReplicatedConnection, SyncReport};
pub use sharded::ShardedConnection;

use super::adapter::{AccessMode, Connection, IsolationLevel, SqlDialect, TableSchema};
use super::error::{FederationError, Result};
use super::locks::ScopedLock;

/// Shared behavior of compositions over several connections
pub trait MultiConnection {
    /// Every child, in registration order
    fn endpoints(&self) -> Vec<&dyn Connection>;

    /// Child answering dialect, schema and sequence calls
    fn default_endpoint(&self) -> Result<&dyn Connection>;

    fn table_lock(&self) -> Option<&ScopedLock>;

    fn assert_endpoints(&self) -> Result<()> {
        if self.endpoints().is_empty() {
            return Err(FederationError::NoEndpoints);
        }
        Ok(())
    }

    fn connect_endpoints(&self) -> Result<()> {
        for conn in self.endpoints() {
            if !conn.is_connected() {
                conn.connect()?;
            }
        }
        Ok(())
    }

    fn disconnect_endpoints(&self) -> Result<()> {
        for conn in self.endpoints() {
            if conn.is_connected() {
                conn.disconnect()?;
            }
        }
        if let Some(lock) = self.table_lock() {
            lock.release_held()?;
        }
        Ok(())
    }

    /// `all = false`: any child connected; `all = true`: every child connected
    fn is_connected_where(&self, all: bool) -> bool {
        quantify(self.endpoints(), all, |c| c.is_connected())
    }

    fn in_transaction_where(&self, all: bool) -> bool {
        quantify(self.endpoints(), all, |c| c.in_transaction())
    }

    fn begin_endpoints(&self, level: Option<IsolationLevel>, mode: Option<AccessMode>) -> Result<()> {
        self.assert_endpoints()?;
        for conn in self.endpoints() {
            conn.begin(level, mode)?;
        }
        Ok(())
    }

    /// A failure on one child stops the loop; children already committed stay committed
    fn commit_endpoints(&self) -> Result<()> {
        self.assert_endpoints()?;
        for conn in self.endpoints() {
            conn.commit()?;
        }
        Ok(())
    }

    fn rollback_endpoints(&self) -> Result<()> {
        self.assert_endpoints()?;
        for conn in self.endpoints() {
            conn.rollback()?;
        }
        Ok(())
    }

    fn default_dialect(&self) -> Result<SqlDialect> {
        self.default_endpoint()?.dialect()
    }

    fn default_table_info(&self, table: &str) -> Result<TableSchema> {
        self.default_endpoint()?.table_info(table)
    }

    fn default_sequence(&self, sequence: &str) -> Result<i64> {
        self.default_endpoint()?.obtain_sequence(sequence)
    }
}

/// Any/all quantifier over children. An empty set is never "any" and is
/// vacuously "all".
fn quantify<F>(endpoints: Vec<&dyn Connection>, all: bool, check: F) -> bool
where
    F: Fn(&dyn Connection) -> bool,
{
    if all {
        endpoints.into_iter().all(check)
    } else {
        endpoints.into_iter().any(check)
    }
}
