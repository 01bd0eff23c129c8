//! Shared handle on the Local Index.
//!
//! Reads take the connection mutex for the duration of one query. Writers
//! additionally hold the async write gate for their whole
//! validate -> remote -> commit span, so at most one logical writer touches
//! the index at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use msgtree_store::Database;

use crate::config::DataPaths;
use crate::error::Result;

/// Proof that the caller holds the index write gate.
pub struct WriteGuard {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Clone)]
pub struct LocalIndex {
    db: Arc<Mutex<Database>>,
    gate: Arc<AsyncMutex<()>>,
    path: Option<PathBuf>,
}

impl LocalIndex {
    /// Open the live index, promoting a staged restore first if one exists.
    pub fn open(paths: &DataPaths) -> Result<Self> {
        promote_staged(paths)?;
        Self::open_at(&paths.index_db)
    }

    /// Open an index file as-is.
    pub fn open_at(path: &Path) -> Result<Self> {
        let db = Database::open_at(path)?;
        Ok(Self::from_database(db, Some(path.to_path_buf())))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?, None))
    }

    fn from_database(db: Database, path: Option<PathBuf>) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            gate: Arc::new(AsyncMutex::new(())),
            path,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Wait for exclusive write access.
    pub async fn lock_writes(&self) -> WriteGuard {
        WriteGuard {
            _guard: self.gate.clone().lock_owned().await,
        }
    }

    /// Run a read-only closure against the database.
    pub fn read<T>(&self, f: impl FnOnce(&Database) -> msgtree_store::Result<T>) -> Result<T> {
        let db = self.db.lock();
        Ok(f(&*db)?)
    }

    /// Run `f` in one transaction. Requires the write gate.
    pub fn write<T>(
        &self,
        _gate: &WriteGuard,
        f: impl FnOnce(&Database) -> msgtree_store::Result<T>,
    ) -> Result<T> {
        let db = self.db.lock();
        Ok(db.in_transaction(f)?)
    }

    /// Like [`write`](Self::write) for store calls that open their own
    /// transaction (snapshot export/import).
    pub fn write_self_managed<T>(
        &self,
        _gate: &WriteGuard,
        f: impl FnOnce(&Database) -> msgtree_store::Result<T>,
    ) -> Result<T> {
        let db = self.db.lock();
        Ok(f(&*db)?)
    }

    /// Flush pending WAL pages so the file can be moved.
    pub fn checkpoint(&self) -> Result<()> {
        Ok(self.db.lock().checkpoint()?)
    }
}

/// Swap a staged restore in place of the live index file. Must run before
/// the live index is opened. An unfinished restore build is dropped.
pub fn promote_staged(paths: &DataPaths) -> Result<bool> {
    remove_with_sidecars(&paths.restore_scratch_db)?;
    if !paths.staged_index_db.exists() {
        return Ok(false);
    }
    remove_with_sidecars(&paths.index_db)?;
    remove_sidecars(&paths.staged_index_db)?;
    std::fs::rename(&paths.staged_index_db, &paths.index_db)?;
    tracing::info!(path = %paths.index_db.display(), "promoted staged index from restore");
    Ok(true)
}

/// Turn a finished restore build into the staged index. The scratch
/// database must be checkpointed and closed.
pub fn commit_staged(paths: &DataPaths) -> Result<()> {
    remove_with_sidecars(&paths.staged_index_db)?;
    remove_sidecars(&paths.restore_scratch_db)?;
    std::fs::rename(&paths.restore_scratch_db, &paths.staged_index_db)?;
    Ok(())
}

/// Delete a staged index and any unfinished restore build.
pub fn discard_staged(paths: &DataPaths) -> Result<()> {
    remove_with_sidecars(&paths.staged_index_db)?;
    remove_with_sidecars(&paths.restore_scratch_db)
}

fn remove_with_sidecars(path: &Path) -> Result<()> {
    remove_if_exists(path)?;
    remove_sidecars(path)
}

fn remove_sidecars(path: &Path) -> Result<()> {
    for suffix in ["-wal", "-shm"] {
        remove_if_exists(&sidecar(path, suffix))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
