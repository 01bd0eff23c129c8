//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so the engine can start with zero
//! configuration; only the channel ids really need to be set outside of
//! development.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;

use msgtree_shared::constants::APP_NAME;
use msgtree_shared::crypto::KdfParams;
use msgtree_shared::ChannelId;

use crate::retry::RetryPolicy;

const INDEX_FILE: &str = "index.db";
const STAGED_INDEX_FILE: &str = "index.restore.db";
const RESTORE_SCRATCH_FILE: &str = "index.restore.db.part";
const CACHE_DIR: &str = "cache/payloads";
const SECRETS_FILE: &str = "secrets/credentials.enc.json";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of every file the engine persists.
    /// Env: `MSGTREE_DATA_DIR`
    /// Default: platform data dir (e.g. `~/.local/share/msgtree`).
    pub data_dir: PathBuf,

    /// Channel holding the directory/file messages.
    /// Env: `MSGTREE_STORAGE_CHANNEL`
    /// Default: `1` (development only).
    pub storage_channel: ChannelId,

    /// Channel receiving index snapshots.
    /// Env: `MSGTREE_BACKUP_CHANNEL`
    /// Default: `2` (development only).
    pub backup_channel: ChannelId,

    /// Messages fetched per history request; one page is one sync batch.
    /// Env: `MSGTREE_HISTORY_PAGE`
    /// Default: `100`
    pub history_page: usize,

    /// Env: `MSGTREE_RETRY_ATTEMPTS`, `MSGTREE_RETRY_BASE_MS`
    pub retry: RetryPolicy,

    /// Upper bound of the Content Vault.
    /// Env: `MSGTREE_CACHE_MAX_BYTES`
    /// Default: 512 MiB
    pub cache_max_bytes: u64,

    /// Default window of `reconcile_recent`.
    /// Env: `MSGTREE_RECONCILE_LIMIT`
    /// Default: `100`
    pub reconcile_limit: usize,

    /// Period of the automatic backup task, `None` disables it.
    /// Env: `MSGTREE_BACKUP_INTERVAL_MINS` (`0` disables)
    /// Default: 60 minutes
    pub backup_interval: Option<Duration>,

    /// Argon2id costs for the encrypted credential file.
    pub kdf: KdfParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_channel: ChannelId(1),
            backup_channel: ChannelId(2),
            history_page: 100,
            retry: RetryPolicy::default(),
            cache_max_bytes: 512 * 1024 * 1024,
            reconcile_limit: 100,
            backup_interval: Some(Duration::from_secs(60 * 60)),
            kdf: KdfParams::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at an explicit data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("MSGTREE_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(id) = parse_var::<i64>(&lookup, "MSGTREE_STORAGE_CHANNEL") {
            config.storage_channel = ChannelId(id);
        }
        if let Some(id) = parse_var::<i64>(&lookup, "MSGTREE_BACKUP_CHANNEL") {
            config.backup_channel = ChannelId(id);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MSGTREE_HISTORY_PAGE") {
            if n > 0 {
                config.history_page = n;
            } else {
                tracing::warn!("MSGTREE_HISTORY_PAGE must be positive, using default");
            }
        }
        if let Some(n) = parse_var::<u32>(&lookup, "MSGTREE_RETRY_ATTEMPTS") {
            config.retry.attempts = n.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MSGTREE_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_var::<u64>(&lookup, "MSGTREE_CACHE_MAX_BYTES") {
            config.cache_max_bytes = bytes;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MSGTREE_RECONCILE_LIMIT") {
            config.reconcile_limit = n.max(1);
        }
        if let Some(mins) = parse_var::<u64>(&lookup, "MSGTREE_BACKUP_INTERVAL_MINS") {
            config.backup_interval = (mins > 0).then(|| Duration::from_secs(mins * 60));
        }

        if config.storage_channel == config.backup_channel {
            tracing::warn!(
                channel = %config.storage_channel,
                "storage and backup channels are the same; snapshots will share the storage log"
            );
        }

        config
    }

    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }
}

/// Files and directories under the data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub index_db: PathBuf,
    /// Index built by a restore, promoted on the next open.
    pub staged_index_db: PathBuf,
    /// Where a restore builds before it is complete. Never promoted.
    pub restore_scratch_db: PathBuf,
    pub cache_dir: PathBuf,
    pub secrets_file: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            index_db: data_dir.join(INDEX_FILE),
            staged_index_db: data_dir.join(STAGED_INDEX_FILE),
            restore_scratch_db: data_dir.join(RESTORE_SCRATCH_FILE),
            cache_dir: data_dir.join(CACHE_DIR),
            secrets_file: data_dir.join(SECRETS_FILE),
        }
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("org", APP_NAME, APP_NAME)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".").join(APP_NAME))
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid value, using default");
            None
        }
    }
}
