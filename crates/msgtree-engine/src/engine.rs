//! Command facade for the presentation layer.
//!
//! [`Engine`] wires every component to one [`EngineState`] and exposes the
//! commands a UI issues. Each command returns a structured value or an
//! [`EngineError`] whose [`code`](EngineError::code) is stable.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use msgtree_store::{BrokenRecords, DirNode, DirectoryRecord, FileQuery, FileRecord};

use crate::backup::{effective_interval, BackupInfo, BackupManager, RestoreOutcome};
use crate::config::{DataPaths, EngineConfig};
use crate::content_vault::{ContentVault, VaultStats};
use crate::error::{EngineError, Result, VaultError};
use crate::events::{EngineEvent, EventBus};
use crate::index::LocalIndex;
use crate::mutations::MutationPipeline;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::remote::{RemoteClient, RemoteConnector};
use crate::repair::{RepairOutcome, Repairer};
use crate::secrets::{CredentialsStatus, KeychainBackend, LoadOutcome, SecretBundle, SecretVault, StorageMode};
use crate::state::{ChannelStatus, EngineState};
use crate::sync::{SyncEngine, SyncReport};

/// A file row plus whether its payload is in the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    #[serde(flatten)]
    pub record: FileRecord,
    pub cached: bool,
}

pub struct Engine {
    config: EngineConfig,
    paths: DataPaths,
    index: LocalIndex,
    state: Arc<EngineState>,
    vault: Arc<ContentVault>,
    secrets: Arc<SecretVault>,
    sync: SyncEngine,
    mutations: MutationPipeline,
    reconciler: Reconciler,
    repairer: Repairer,
    backups: BackupManager,
}

impl Engine {
    /// Open the index, cache and secret vault under `config.data_dir`.
    pub async fn open(config: EngineConfig, keychain: Arc<dyn KeychainBackend>) -> Result<Self> {
        let paths = config.paths();
        let index = LocalIndex::open(&paths)?;
        let vault = Arc::new(ContentVault::open(paths.cache_dir.clone(), config.cache_max_bytes).await?);
        let secrets = Arc::new(SecretVault::new(paths.secrets_file.clone(), keychain, config.kdf));
        let state = Arc::new(EngineState::new(EventBus::default()));

        tracing::info!(
            data_dir = %config.data_dir.display(),
            storage_channel = %config.storage_channel,
            backup_channel = %config.backup_channel,
            "engine opened"
        );
        Ok(Self::assemble(config, paths, index, state, vault, secrets))
    }

    /// Replace the secret vault (e.g. one with a custom environment lookup).
    pub fn with_secret_vault(mut self, secrets: SecretVault) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }

    fn assemble(
        config: EngineConfig,
        paths: DataPaths,
        index: LocalIndex,
        state: Arc<EngineState>,
        vault: Arc<ContentVault>,
        secrets: Arc<SecretVault>,
    ) -> Self {
        let storage = config.storage_channel;
        let retry = config.retry;
        Self {
            sync: SyncEngine::new(index.clone(), state.clone(), config.history_page, retry),
            mutations: MutationPipeline::new(index.clone(), vault.clone(), storage, retry),
            reconciler: Reconciler::new(index.clone(), state.clone(), storage, retry),
            repairer: Repairer::new(index.clone(), state.clone(), vault.clone(), storage, retry),
            backups: BackupManager::new(
                index.clone(),
                state.clone(),
                paths.clone(),
                storage,
                config.backup_channel,
                config.history_page,
                retry,
            ),
            config,
            paths,
            index,
            state,
            vault,
            secrets,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.state.events().subscribe()
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Use an already connected client.
    pub fn attach_remote(&self, remote: Arc<dyn RemoteClient>) {
        self.state.set_remote(remote);
    }

    /// Build a client from the stored credentials.
    pub async fn connect(&self, connector: &dyn RemoteConnector) -> Result<()> {
        let bundle = match self.secrets.load()? {
            LoadOutcome::Available { bundle, source } => {
                tracing::debug!(?source, "credentials resolved");
                bundle
            }
            LoadOutcome::Locked => return Err(VaultError::Locked.into()),
            LoadOutcome::Absent => return Err(VaultError::Absent.into()),
        };
        let remote = connector.connect(&bundle).await?;
        self.state.set_remote(remote);
        tracing::info!("connected to remote");
        Ok(())
    }

    pub fn disconnect(&self) {
        self.state.disconnect();
    }

    fn live_remote(&self) -> Result<Arc<dyn RemoteClient>> {
        self.state.ensure_live()?;
        self.state.remote()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Directory tree under the synthetic root.
    pub fn tree(&self) -> Result<Vec<DirNode>> {
        self.index.read(|db| db.directory_tree())
    }

    pub fn list_directories(&self) -> Result<Vec<DirectoryRecord>> {
        self.index.read(|db| db.list_directories())
    }

    pub fn list_files(&self, dir_id: &str) -> Result<Vec<FileEntry>> {
        let files = self.index.read(|db| db.list_files_in_dir(dir_id))?;
        Ok(self.with_cache_flags(files))
    }

    pub fn search_files(&self, query: &FileQuery) -> Result<Vec<FileEntry>> {
        let files = self.index.read(|db| db.search_files(query))?;
        Ok(self.with_cache_flags(files))
    }

    pub fn list_broken(&self) -> Result<BrokenRecords> {
        self.index.read(|db| db.list_broken())
    }

    pub fn cache_stats(&self) -> VaultStats {
        self.vault.stats()
    }

    fn with_cache_flags(&self, files: Vec<FileRecord>) -> Vec<FileEntry> {
        files
            .into_iter()
            .map(|record| FileEntry {
                cached: self.vault.contains(&record.content_hash),
                record,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn create_directory(&self, parent_id: Option<&str>, name: &str) -> Result<DirectoryRecord> {
        let remote = self.live_remote()?;
        self.mutations.create_directory(remote.as_ref(), parent_id, name).await
    }

    pub async fn rename_directory(&self, id: &str, name: &str) -> Result<DirectoryRecord> {
        let remote = self.live_remote()?;
        self.mutations.rename_directory(remote.as_ref(), id, name).await
    }

    pub async fn move_directory(&self, id: &str, new_parent: Option<&str>) -> Result<DirectoryRecord> {
        let remote = self.live_remote()?;
        self.mutations.move_directory(remote.as_ref(), id, new_parent).await
    }

    pub async fn delete_directory(&self, id: &str) -> Result<()> {
        let remote = self.live_remote()?;
        self.mutations.delete_directory(remote.as_ref(), id).await
    }

    pub async fn upload_file(&self, dir_id: &str, name: &str, data: Bytes) -> Result<FileRecord> {
        let remote = self.live_remote()?;
        self.mutations.upload_file(remote.as_ref(), dir_id, name, data).await
    }

    pub async fn rename_file(&self, id: &str, name: &str) -> Result<FileRecord> {
        let remote = self.live_remote()?;
        self.mutations.rename_file(remote.as_ref(), id, name).await
    }

    pub async fn move_file(&self, id: &str, dir_id: &str) -> Result<FileRecord> {
        let remote = self.live_remote()?;
        self.mutations.move_file(remote.as_ref(), id, dir_id).await
    }

    pub async fn delete_file(&self, id: &str) -> Result<()> {
        let remote = self.live_remote()?;
        self.mutations.delete_file(remote.as_ref(), id).await
    }

    /// Multi-select delete. Returns how many files were removed.
    pub async fn delete_files(&self, ids: &[String]) -> Result<usize> {
        let remote = self.live_remote()?;
        self.mutations.delete_files(remote.as_ref(), ids).await
    }

    pub async fn download_file(&self, id: &str) -> Result<Bytes> {
        let remote = self.live_remote()?;
        self.mutations.download_file(remote.as_ref(), id).await
    }

    // ------------------------------------------------------------------
    // Sync, reconciliation, repair
    // ------------------------------------------------------------------

    pub async fn sync_now(&self) -> Result<SyncReport> {
        let remote = self.live_remote()?;
        self.sync.pull(remote.as_ref(), self.config.storage_channel).await
    }

    pub async fn full_resync(&self) -> Result<SyncReport> {
        let remote = self.live_remote()?;
        self.sync
            .full_resync(remote.as_ref(), self.config.storage_channel)
            .await
    }

    pub fn sync_status(&self) -> ChannelStatus {
        self.state.status(self.config.storage_channel)
    }

    /// `limit` defaults to the configured reconciliation window.
    pub async fn reconcile_recent(&self, limit: Option<usize>, force: bool) -> Result<ReconcileReport> {
        let remote = self.live_remote()?;
        let limit = limit.unwrap_or(self.config.reconcile_limit);
        self.reconciler.reconcile_recent(remote.as_ref(), limit, force).await
    }

    pub async fn repair_directory(&self, id: &str) -> Result<RepairOutcome> {
        let remote = self.live_remote()?;
        self.repairer.repair_directory(remote.as_ref(), id).await
    }

    pub async fn repair_file(&self, id: &str, replacement: Option<Bytes>) -> Result<RepairOutcome> {
        let remote = self.live_remote()?;
        self.repairer.repair_file(remote.as_ref(), id, replacement).await
    }

    // ------------------------------------------------------------------
    // Backup / restore
    // ------------------------------------------------------------------

    pub async fn create_backup(&self) -> Result<BackupInfo> {
        let remote = self.live_remote()?;
        self.backups.create_backup(remote.as_ref()).await
    }

    pub async fn latest_backup(&self) -> Result<Option<BackupInfo>> {
        let remote = self.state.remote()?;
        self.backups.find_latest_backup(remote.as_ref()).await
    }

    pub async fn restore_from_backup(&self) -> Result<RestoreOutcome> {
        let remote = self.live_remote()?;
        self.backups.restore_from_backup(remote.as_ref()).await
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    /// Validate and store credentials in `mode`. Key derivation for the
    /// encrypted file runs on the blocking pool.
    pub async fn save_credentials(
        &self,
        api_id: i32,
        api_hash: &str,
        client_library_path: Option<String>,
        mode: StorageMode,
        password: Option<String>,
    ) -> Result<CredentialsStatus> {
        let bundle = SecretBundle::normalized(api_id, api_hash, client_library_path)?;
        let password = password.map(Zeroizing::new);
        let secrets = self.secrets.clone();
        blocking(move || secrets.store(&bundle, mode, password.as_ref().map(|p| p.as_str()))).await?;
        tracing::info!(?mode, "credentials saved");
        Ok(self.credentials_changed())
    }

    pub async fn unlock_credentials(&self, password: String) -> Result<CredentialsStatus> {
        let password = Zeroizing::new(password);
        let secrets = self.secrets.clone();
        blocking(move || secrets.unlock(&password).map(drop)).await?;
        Ok(self.credentials_changed())
    }

    pub fn credentials_status(&self) -> CredentialsStatus {
        self.secrets.status()
    }

    /// Wipe credentials from every storage mode and drop the connection.
    pub fn clear_credentials(&self) -> Result<CredentialsStatus> {
        self.secrets.clear()?;
        self.state.disconnect();
        tracing::info!("credentials cleared");
        Ok(self.credentials_changed())
    }

    fn credentials_changed(&self) -> CredentialsStatus {
        let status = self.secrets.status();
        self.state
            .events()
            .emit(EngineEvent::CredentialsChanged { source: status.source });
        status
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, VaultError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(out) => Ok(out?),
        Err(e) => Err(EngineError::Io(std::io::Error::other(e))),
    }
}

/// Periodically back up the index while connected. Returns `None` when the
/// configured interval disables it.
pub fn spawn_auto_backup(engine: Arc<Engine>) -> Option<JoinHandle<()>> {
    let period = effective_interval(engine.config.backup_interval)?;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if engine.state.restart_pending() {
                tracing::debug!("restore pending, automatic backups stopped");
                break;
            }
            if !engine.state.is_connected() {
                continue;
            }
            match engine.create_backup().await {
                Ok(info) => tracing::debug!(seq = info.seq, "automatic backup done"),
                Err(e) => tracing::warn!(error = %e, code = e.code(), "automatic backup failed"),
            }
        }
    }))
}
