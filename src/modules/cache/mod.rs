//! Result cache.
//!
//! The orchestrator talks to a [`CacheStore`] with plain get / set-with-expiry
//! calls. Two stores ship with the crate: a process-local [`MemoryCache`] and
//! a file-backed [`RedbCache`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::config::duration_ms;

const TRACKING_PARAMS: &[&str] = &["sp_atk", "xptdk"];

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("product_cache");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub key_prefix: String,
    /// Database file for [`RedbCache`]; in-memory when unset.
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            key_prefix: "product:".into(),
            path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] redb::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Key-value store with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;
}

/// Process-local cache. Expired entries are evicted when read.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Bytes, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }
}

/// File-backed cache on redb. Rows carry their absolute expiry as an 8-byte
/// big-endian unix-millisecond prefix.
#[derive(Clone)]
pub struct RedbCache {
    db: Arc<Database>,
}

impl RedbCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = Database::create(path.as_ref()).map_err(redb::Error::from)?;
        log::debug!("opened cache database at {}", path.as_ref().display());
        Ok(Self { db: Arc::new(db) })
    }

    fn read(db: &Database, key: &str) -> Result<Option<Vec<u8>>, redb::Error> {
        let txn = db.begin_read()?;
        let table = match txn.open_table(ENTRIES) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(table.get(key)?.map(|row| row.value().to_vec()))
    }

    fn write(db: &Database, key: &str, row: &[u8]) -> Result<(), redb::Error> {
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            table.insert(key, row)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedbCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let db = self.db.clone();
        let owned_key = key.to_string();
        let row = tokio::task::spawn_blocking(move || Self::read(&db, &owned_key)).await??;

        let Some(row) = row else {
            return Ok(None);
        };
        if row.len() < 8 {
            log::warn!("dropping truncated cache row for {key}");
            return Ok(None);
        }
        let (expiry, value) = row.split_at(8);
        let mut expiry_bytes = [0u8; 8];
        expiry_bytes.copy_from_slice(expiry);
        if u64::from_be_bytes(expiry_bytes) <= unix_millis_now() {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(value)))
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let ttl_ms = ttl.as_millis().min(u128::from(u64::MAX)) as u64;
        let expires_at = unix_millis_now().saturating_add(ttl_ms);
        let mut row = Vec::with_capacity(8 + value.len());
        row.extend_from_slice(&expires_at.to_be_bytes());
        row.extend_from_slice(&value);

        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::write(&db, &key, &row)).await??;
        Ok(())
    }
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Canonical form of a product URL, so trivially different links share a
/// cache entry.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        normalized.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(path.trim_end_matches('/'));
    }

    // The url crate already lowercases scheme and host.
    normalized.to_string()
}

pub fn cache_key(prefix: &str, url: &Url) -> String {
    format!("{prefix}{}", normalize_url(url))
}

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name)
}
