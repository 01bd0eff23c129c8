//! Content Vault: downloaded payloads cached on disk, keyed by fingerprint.
//!
//! The cache is bounded by total size and evicts least-recently-used entries.
//! Access order lives in memory and is seeded from file mtimes when the
//! vault opens, so it survives restarts approximately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<String, Entry>,
    total: u64,
    tick: u64,
}

impl Lru {
    fn touch(&mut self, key: &str) -> bool {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(key) {
            Some(e) => {
                e.last_used = tick;
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, key: &str, size: u64) {
        self.tick += 1;
        let entry = Entry {
            size,
            last_used: self.tick,
        };
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.total -= old.size;
        }
        self.total += size;
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let e = self.entries.remove(key)?;
        self.total -= e.size;
        Some(e)
    }

    /// Keys to drop so the total fits `max`, oldest first, never `keep`.
    fn victims(&mut self, max: u64, keep: &str) -> Vec<String> {
        let mut order: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .map(|(k, e)| (e.last_used, k.clone()))
            .collect();
        order.sort();

        let mut out = Vec::new();
        for (_, key) in order {
            if self.total <= max {
                break;
            }
            self.remove(&key);
            out.push(key);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VaultStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug)]
pub struct ContentVault {
    base_path: PathBuf,
    max_bytes: u64,
    lru: Mutex<Lru>,
}

impl ContentVault {
    /// Open (or create) the cache directory and index its current content.
    pub async fn open(base_path: PathBuf, max_bytes: u64) -> Result<Self> {
        fs::create_dir_all(&base_path).await?;

        let mut found = Vec::new();
        let mut dir = fs::read_dir(&base_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_valid_key(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().ok();
            found.push((mtime, name, meta.len()));
        }
        found.sort();

        let mut lru = Lru::default();
        for (_, name, size) in &found {
            lru.insert(name, *size);
        }

        tracing::info!(
            path = %base_path.display(),
            entries = lru.entries.len(),
            total_bytes = lru.total,
            max_bytes,
            "content vault opened"
        );

        let vault = Self {
            base_path,
            max_bytes,
            lru: Mutex::new(lru),
        };
        vault.evict_over_budget("").await?;
        Ok(vault)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.lru.lock().entries.contains_key(hash)
    }

    pub fn stats(&self) -> VaultStats {
        let lru = self.lru.lock();
        VaultStats {
            entries: lru.entries.len(),
            total_bytes: lru.total,
            max_bytes: self.max_bytes,
        }
    }

    /// Cached bytes for `hash`, marking them recently used.
    pub async fn get(&self, hash: &str) -> Result<Option<Bytes>> {
        if !self.lru.lock().touch(hash) {
            return Ok(None);
        }
        let path = self.payload_path(hash)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Removed behind our back.
                self.lru.lock().remove(hash);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store `data` under `hash` and evict older entries past the budget.
    /// Payloads larger than the whole budget are not cached.
    pub async fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        let path = self.payload_path(hash)?;
        let size = data.len() as u64;
        if size > self.max_bytes {
            tracing::debug!(hash, size, max = self.max_bytes, "payload larger than cache budget, skipped");
            return Ok(());
        }

        let tmp = path.with_extension("part");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        self.lru.lock().insert(hash, size);
        tracing::debug!(hash, size, "payload cached");
        self.evict_over_budget(hash).await
    }

    /// Drop one entry. Returns `true` if it was cached.
    pub async fn remove(&self, hash: &str) -> Result<bool> {
        let path = self.payload_path(hash)?;
        let existed = self.lru.lock().remove(hash).is_some();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }

    async fn evict_over_budget(&self, keep: &str) -> Result<()> {
        let victims = self.lru.lock().victims(self.max_bytes, keep);
        for key in victims {
            let path = self.base_path.join(&key);
            match fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(hash = %key, "evicted cached payload"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Keys are fingerprints, so only lowercase hex is accepted. This also
    /// keeps every path inside the cache directory.
    fn payload_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_key(hash) {
            return Err(EngineError::Precondition(format!(
                "invalid content fingerprint {hash:?}"
            )));
        }
        Ok(self.base_path.join(hash))
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= 128 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ContentVault::open(dir.path().join("payloads"), 1024).await.unwrap();

        vault.put("abc123", b"hello").await.unwrap();
        assert!(vault.contains("abc123"));
        assert_eq!(vault.get("abc123").await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(vault.get("ffff").await.unwrap().is_none());

        assert!(vault.remove("abc123").await.unwrap());
        assert!(!vault.contains("abc123"));
        assert_eq!(vault.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ContentVault::open(dir.path().to_path_buf(), 10).await.unwrap();

        vault.put("aa", b"1234").await.unwrap();
        vault.put("bb", b"1234").await.unwrap();
        // Touch "aa" so "bb" becomes the oldest.
        vault.get("aa").await.unwrap();
        vault.put("cc", b"1234").await.unwrap();

        assert!(vault.contains("aa"));
        assert!(!vault.contains("bb"));
        assert!(vault.contains("cc"));
        assert!(!dir.path().join("bb").exists());
        assert!(vault.stats().total_bytes <= 10);
    }

    #[tokio::test]
    async fn oversized_payload_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ContentVault::open(dir.path().to_path_buf(), 3).await.unwrap();
        vault.put("aa", b"too big").await.unwrap();
        assert!(!vault.contains("aa"));
    }

    #[tokio::test]
    async fn reopen_sees_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = ContentVault::open(dir.path().to_path_buf(), 100).await.unwrap();
            vault.put("0a1b", b"cached").await.unwrap();
        }
        std::fs::write(dir.path().join("not-a-hash.txt"), b"junk").unwrap();

        let vault = ContentVault::open(dir.path().to_path_buf(), 100).await.unwrap();
        assert!(vault.contains("0a1b"));
        assert_eq!(vault.stats().entries, 1);
    }

    #[tokio::test]
    async fn traversal_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let vault = ContentVault::open(dir.path().to_path_buf(), 100).await.unwrap();
        assert!(vault.put("../evil", b"x").await.is_err());
    }
}
