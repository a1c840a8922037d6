//! Link Registry
//!
//! Name → connection lookup with one designated default. Entries are plain
//! connections or compositions; compositions stay reachable by their concrete
//! type for operator calls like resync.

use std::collections::BTreeMap;

use super::adapter::Connection;
use super::error::{FederationError, Result};
use super::federation::{ReplicatedConnection, ShardedConnection};

/// One registry entry
pub enum Link {
    Single(Box<dyn Connection>),
    Sharded(ShardedConnection),
    Replicated(ReplicatedConnection),
}

impl Link {
    pub fn single(conn: impl Connection + 'static) -> Self {
        Link::Single(Box::new(conn))
    }

    pub fn as_connection(&self) -> &dyn Connection {
        match self {
            Link::Single(conn) => conn.as_ref(),
            Link::Sharded(conn) => conn,
            Link::Replicated(conn) => conn,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Link::Single(_) => "single",
            Link::Sharded(_) => "sharded",
            Link::Replicated(_) => "replicated",
        }
    }
}

impl From<Box<dyn Connection>> for Link {
    fn from(conn: Box<dyn Connection>) -> Self {
        Link::Single(conn)
    }
}

impl From<ShardedConnection> for Link {
    fn from(conn: ShardedConnection) -> Self {
        Link::Sharded(conn)
    }
}

impl From<ReplicatedConnection> for Link {
    fn from(conn: ReplicatedConnection) -> Self {
        Link::Replicated(conn)
    }
}

enum DefaultLink {
    /// Points at a registered name
    Named(String),
    /// Owned by the default slot only
    Owned(Link),
}

#[derive(Default)]
pub struct LinkRegistry {
    links: BTreeMap<String, Link>,
    default: Option<DefaultLink>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, link: impl Into<Link>) -> Result<()> {
        if self.links.contains_key(name) {
            return Err(FederationError::DuplicateLink(name.to_string()));
        }
        let link = link.into();
        tracing::debug!(name, kind = link.kind(), "registered link");
        self.links.insert(name.to_string(), link);
        Ok(())
    }

    /// Remove and hand back a link; a default pointing at it is cleared too
    pub fn unregister(&mut self, name: &str) -> Result<Link> {
        let link = self
            .links
            .remove(name)
            .ok_or_else(|| FederationError::LinkNotFound(name.to_string()))?;
        if matches!(&self.default, Some(DefaultLink::Named(n)) if n == name) {
            self.default = None;
        }
        Ok(link)
    }

    pub fn has(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.links.keys().map(String::as_str).collect()
    }

    pub fn set_default(&mut self, link: impl Into<Link>) {
        self.default = Some(DefaultLink::Owned(link.into()));
    }

    /// Make an already registered link the default
    pub fn set_default_name(&mut self, name: &str) -> Result<()> {
        if !self.links.contains_key(name) {
            return Err(FederationError::LinkNotFound(name.to_string()));
        }
        self.default = Some(DefaultLink::Named(name.to_string()));
        Ok(())
    }

    /// Clear the default slot, returning an owned default link if there was one
    pub fn drop_default(&mut self) -> Option<Link> {
        match self.default.take() {
            Some(DefaultLink::Owned(link)) => Some(link),
            _ => None,
        }
    }

    /// Name of the default link when it is a registered one
    pub fn default_name(&self) -> Option<&str> {
        match &self.default {
            Some(DefaultLink::Named(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn get(&self, name: &str) -> Result<&Link> {
        self.links
            .get(name)
            .ok_or_else(|| FederationError::LinkNotFound(name.to_string()))
    }

    fn default_link(&self) -> Result<&Link> {
        match &self.default {
            Some(DefaultLink::Owned(link)) => Ok(link),
            Some(DefaultLink::Named(name)) => self.get(name),
            None => Err(FederationError::NoDefaultLink),
        }
    }

    /// Look up a link by name (or the default), connecting it first if asked
    pub fn resolve(&self, name: Option<&str>, auto_connect: bool) -> Result<&dyn Connection> {
        let link = match name {
            Some(name) => self.get(name)?,
            None => self.default_link()?,
        };
        let conn = link.as_connection();
        if auto_connect && !conn.is_connected() {
            conn.connect()?;
        }
        Ok(conn)
    }

    pub fn sharded(&self, name: &str) -> Result<&ShardedConnection> {
        match self.get(name)? {
            Link::Sharded(conn) => Ok(conn),
            other => Err(FederationError::Config(format!(
                "link '{}' is {}, not sharded",
                name,
                other.kind()
            ))),
        }
    }

    pub fn replicated(&self, name: &str) -> Result<&ReplicatedConnection> {
        match self.get(name)? {
            Link::Replicated(conn) => Ok(conn),
            other => Err(FederationError::Config(format!(
                "link '{}' is {}, not replicated",
                name,
                other.kind()
            ))),
        }
    }

    /// Disconnect everything, keeping registrations
    pub fn disconnect_all(&self) -> Result<()> {
        for (name, link) in &self.links {
            let conn = link.as_connection();
            if conn.is_connected() {
                tracing::debug!(name = %name, "disconnecting link");
                conn.disconnect()?;
            }
        }
        if let Some(DefaultLink::Owned(link)) = &self.default {
            link.as_connection().disconnect()?;
        }
        Ok(())
    }

    /// Disconnect everything and forget all links
    pub fn shutdown_all(&mut self) -> Result<()> {
        self.disconnect_all()?;
        self.links.clear();
        self.default = None;
        tracing::info!("link registry shut down");
        Ok(())
    }
}
