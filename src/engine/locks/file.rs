//! Lock-file store
//!
//! One file per key under a directory. Files are created with `create_new`,
//! which makes the add atomic across processes. An entry is stale once it has
//! expired or its holder process is gone; an unreadable file is stale once it
//! is older than the ttl. Stale files are reclaimed by renaming them to a
//! unique tombstone, so only one contender gets to recreate the lock.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use super::{expiry_after, LockStore};
use crate::engine::error::Result;

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub key: String,
    pub pid: u32,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockEntry {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }

    fn is_stale(&self) -> bool {
        self.is_expired() || !self.is_process_alive()
    }
}

#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key);
        self.dir.join(format!("{}.lock", encoded))
    }

    fn read_entry(path: &Path) -> Option<LockEntry> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    /// Every readable entry currently on disk
    pub fn entries(&self) -> Result<Vec<LockEntry>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "lock").unwrap_or(false) {
                if let Some(info) = Self::read_entry(&path) {
                    out.push(info);
                }
            }
        }
        Ok(out)
    }

    /// Whether the file at `path` may be taken over
    fn is_reclaimable(path: &Path, ttl: Duration) -> bool {
        match Self::read_entry(path) {
            Some(existing) => existing.is_stale(),
            // Unreadable: either mid-write or left behind by a crashed writer
            None => fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .map(|age| age >= ttl)
                .unwrap_or(false),
        }
    }

    /// Move a stale lock file out of the way. Returns false when another
    /// contender got there first.
    fn reclaim(&self, key: &str, path: &Path, ttl: Duration) -> Result<bool> {
        let tombstone = path.with_extension(format!("lock.{}.stale", Uuid::new_v4().simple()));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        // The file may have been replaced by a fresh holder between the check and the rename
        if !Self::is_reclaimable(&tombstone, ttl) {
            tracing::debug!(key, "lock was taken over during reclaim, restoring");
            let restored = fs::hard_link(&tombstone, path);
            fs::remove_file(&tombstone)?;
            return match restored {
                Ok(()) => Ok(false),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            };
        }

        tracing::debug!(key, "reclaimed stale lock file");
        fs::remove_file(&tombstone)?;
        Ok(true)
    }

    fn try_create(&self, path: &Path, entry: &LockEntry) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(serde_json::to_string_pretty(entry)?.as_bytes())?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl LockStore for FileLockStore {
    fn add(&self, key: &str, ttl: Duration) -> Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(key);
        let entry = LockEntry {
            key: key.to_string(),
            pid: std::process::id(),
            owner: Uuid::new_v4(),
            acquired_at: Utc::now(),
            expires_at: expiry_after(ttl)?,
        };

        if self.try_create(&path, &entry)? {
            return Ok(true);
        }

        if !Self::is_reclaimable(&path, ttl) || !self.reclaim(key, &path, ttl)? {
            return Ok(false);
        }
        self.try_create(&path, &entry)
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.lock_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if entry.key.starts_with(prefix) {
                self.delete(&entry.key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
