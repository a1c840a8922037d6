//! Federation Configuration
//! Loads federation.json and builds the link registry from it

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::adapter::sqlite::SqliteConnection;
use super::adapter::Connection;
use super::connections::LinkRegistry;
use super::error::{FederationError, Result};
use super::federation::{ReadPolicy, ReplicatedConnection, ShardedConnection};
use super::locks::{FileLockStore, LockStore, MemoryLockStore, ScopedLock, DEFAULT_TTL};
use super::sharding::{RangeSharding, ShardId, ShardRange};

pub const CONFIG_FILE_NAME: &str = "federation.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub links: BTreeMap<String, LinkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub sharded: Vec<ShardedConfig>,
    #[serde(default)]
    pub replicated: Vec<ReplicatedConfig>,
    #[serde(default)]
    pub locks: LockConfig,
    /// Directory relative paths resolve against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Physical connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LinkConfig {
    Sqlite { path: PathBuf },
    SqliteMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardedConfig {
    pub name: String,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub tables: Vec<ShardedTableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: ShardId,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardedTableConfig {
    pub table: String,
    pub key: String,
    pub ranges: Vec<ShardRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedConfig {
    pub name: String,
    pub primary: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub read_policy: ReadPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_block_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConfig {
    #[serde(flatten)]
    pub backend: LockBackend,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LockBackend {
    Memory,
    File { dir: PathBuf },
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Memory,
            namespace: default_namespace(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_version() -> String {
    "1".to_string()
}

fn default_namespace() -> String {
    "dbfed".to_string()
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}

/// Everything built from one config: the registry plus the shared lock store
pub struct FederationContext {
    pub registry: LinkRegistry,
    pub lock_store: Arc<dyn LockStore>,
    pub lock: ScopedLock,
}

impl FederationContext {
    /// Lock namespace used by the composition registered under `link`
    pub fn table_lock(&self, link: &str) -> ScopedLock {
        self.lock.scoped(&composition_namespace(self.lock.namespace(), link))
    }
}

fn composition_namespace(base: &str, name: &str) -> String {
    format!("{}:{}", base, name)
}

impl FederationConfig {
    /// Explicit path, else ./federation.json, else ~/.dbfed/federation.json
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".dbfed").join(CONFIG_FILE_NAME));
        }
        candidates
            .iter()
            .find(|p| p.exists())
            .cloned()
            .ok_or_else(|| {
                let searched: Vec<String> =
                    candidates.iter().map(|p| p.display().to_string()).collect();
                FederationError::Config(format!("no config file found (searched {})", searched.join(", ")))
            })
    }

    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Err(FederationError::Config(format!(
                "config file not found: {}",
                config_path.display()
            )));
        }
        let content = std::fs::read_to_string(config_path)?;
        let mut config: FederationConfig = serde_json::from_str(&content)?;
        config.base_dir = config_path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Cross-reference checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        // (link, composition) pairs
        let mut claims: Vec<(&str, &str)> = Vec::new();
        for sharded in &self.sharded {
            for shard in &sharded.shards {
                claims.push((shard.link.as_str(), sharded.name.as_str()));
            }
        }
        for replicated in &self.replicated {
            claims.push((replicated.primary.as_str(), replicated.name.as_str()));
            for mirror in &replicated.mirrors {
                claims.push((mirror.as_str(), replicated.name.as_str()));
            }
        }

        let mut used: HashSet<&str> = HashSet::new();
        for (link, owner) in claims {
            if !self.links.contains_key(link) {
                return Err(FederationError::Config(format!(
                    "'{}' refers to unknown link '{}'",
                    owner, link
                )));
            }
            if !used.insert(link) {
                return Err(FederationError::Config(format!(
                    "link '{}' is used by more than one composition",
                    link
                )));
            }
        }

        let mut names: HashSet<&str> = HashSet::new();
        let compositions = self
            .sharded
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.replicated.iter().map(|r| r.name.as_str()));
        for name in compositions {
            if self.links.contains_key(name) || !names.insert(name) {
                return Err(FederationError::DuplicateLink(name.to_string()));
            }
        }

        if let Some(default) = &self.default {
            let known = names.contains(default.as_str())
                || (self.links.contains_key(default) && !used.contains(default.as_str()));
            if !known {
                return Err(FederationError::Config(format!(
                    "default '{}' is not a registered link",
                    default
                )));
            }
        }
        Ok(())
    }

    fn open_link(&self, config: &LinkConfig) -> Box<dyn Connection> {
        match config {
            LinkConfig::Sqlite { path } => Box::new(SqliteConnection::file(&self.resolve_path(path))),
            LinkConfig::SqliteMemory => Box::new(SqliteConnection::memory()),
        }
    }

    /// Build the registry. Links are opened lazily on first resolve.
    pub fn build(&self) -> Result<FederationContext> {
        self.validate()?;

        let lock_store: Arc<dyn LockStore> = match &self.locks.backend {
            LockBackend::Memory => Arc::new(MemoryLockStore::new()),
            LockBackend::File { dir } => Arc::new(FileLockStore::new(&self.resolve_path(dir))),
        };
        let lock = ScopedLock::new(Arc::clone(&lock_store), &self.locks.namespace)
            .with_ttl(Duration::from_secs(self.locks.ttl_secs));

        let mut links: BTreeMap<String, Box<dyn Connection>> = self
            .links
            .iter()
            .map(|(name, cfg)| (name.clone(), self.open_link(cfg)))
            .collect();
        let mut registry = LinkRegistry::new();

        for cfg in &self.sharded {
            let mut sharded = ShardedConnection::new();
            for shard in &cfg.shards {
                sharded.add_shard(shard.id, take_link(&mut links, &shard.link)?)?;
            }
            for table in &cfg.tables {
                let mut strategy = RangeSharding::new(&table.table, &table.key);
                for entry in &table.ranges {
                    sharded.shard(entry.shard)?;
                    strategy.add_range(entry.shard, entry.range)?;
                    if let Some(physical) = &entry.physical_table {
                        strategy = strategy.with_physical_table(entry.shard, physical)?;
                    }
                }
                sharded.set_sharded_table(Box::new(strategy));
            }
            sharded.set_table_lock(lock.scoped(&composition_namespace(lock.namespace(), &cfg.name)));
            registry.register(&cfg.name, sharded)?;
        }

        for cfg in &self.replicated {
            let mut replicated = ReplicatedConnection::new();
            replicated.set_primary(take_link(&mut links, &cfg.primary)?);
            for mirror in &cfg.mirrors {
                replicated.add_mirror(take_link(&mut links, mirror)?);
            }
            replicated.set_read_policy(cfg.read_policy);
            if let Some(size) = cfg.sync_block_size {
                replicated.set_sync_block_size(size);
            }
            replicated.set_table_lock(lock.scoped(&composition_namespace(lock.namespace(), &cfg.name)));
            registry.register(&cfg.name, replicated)?;
        }

        for (name, conn) in links {
            registry.register(&name, conn)?;
        }
        if let Some(default) = &self.default {
            registry.set_default_name(default)?;
        }

        tracing::info!(links = registry.names().len(), "federation config loaded");
        Ok(FederationContext { registry, lock_store, lock })
    }
}

fn take_link(links: &mut BTreeMap<String, Box<dyn Connection>>, name: &str) -> Result<Box<dyn Connection>> {
    links
        .remove(name)
        .ok_or_else(|| FederationError::Config(format!("link '{}' is unknown or already used", name)))
}
