use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub direct_url: String,
    pub title: String,
    pub source_url: String,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("Could not parse cache file")]
    Parse(#[from] serde_json::Error),
}

/// Resolved URLs keyed by video id, with their expiry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UrlCache {
    entries: HashMap<String, CacheEntry>,
}

impl UrlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a cache file, dropping anything already expired. A missing file
    /// is an empty cache.
    pub async fn load(path: &Path, now: DateTime<Utc>) -> Result<Self, CacheError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };

        let entries: HashMap<String, CacheEntry> = serde_json::from_str(&text)?;
        let total = entries.len();
        let mut cache = Self { entries };
        cache.purge_expired(now);
        debug!(
            "Loaded {} cached URLs from {} ({} expired)",
            cache.len(),
            path.display(),
            total - cache.len()
        );

        Ok(cache)
    }

    /// Writes all usable entries to `path`. When none are left the file is
    /// removed instead. Returns the number of entries written.
    pub async fn save(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let live: BTreeMap<&String, &CacheEntry> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_usable(now))
            .collect();

        if live.is_empty() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Removed empty cache file {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            }
            return Ok(0);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&live)?;
        let temp_path = util::tmp_sibling(path);
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, path).await?;
        info!("Saved {} cached URLs to {}", live.len(), path.display());

        Ok(live.len())
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|entry| entry.is_usable(now))
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(key.into(), entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Folds `other` in. For keys present in both, the entry that expires
    /// last wins.
    pub fn merge(&mut self, other: UrlCache) {
        for (key, entry) in other.entries {
            match self.entries.get(&key) {
                Some(existing) if existing.expires_at >= entry.expires_at => (),
                _ => {
                    self.entries.insert(key, entry);
                }
            }
        }
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_usable(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
