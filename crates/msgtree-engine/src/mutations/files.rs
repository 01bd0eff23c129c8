use bytes::Bytes;
use chrono::Utc;

use msgtree_shared::crypto::content_fingerprint;
use msgtree_shared::fsmeta::{self, FileMeta, Tombstone};
use msgtree_shared::types::new_record_id;
use msgtree_store::FileRecord;

use super::{check_name, file_location, MutationPipeline};
use crate::error::{EngineError, Result};
use crate::index::WriteGuard;
use crate::remote::{RemoteClient, RemoteFileRef};
use crate::retry::with_retry;

impl MutationPipeline {
    /// Upload `data` and only then announce it with a metadata message.
    ///
    /// Dropping the future at any point leaves no metadata message behind:
    /// at worst an unreferenced payload on the remote.
    pub async fn upload_file(
        &self,
        remote: &dyn RemoteClient,
        dir_id: &str,
        name: &str,
        data: Bytes,
    ) -> Result<FileRecord> {
        let gate = self.index.lock_writes().await;
        check_name(name)?;
        self.require_dir(dir_id)?;

        let hash = content_fingerprint(&data);
        let size_bytes = data.len() as u64;
        let file_ref = with_retry(&self.retry, "upload_file", || remote.upload_file(data.clone())).await?;
        tracing::debug!(dir_id, hash = %hash, size_bytes, "payload uploaded");

        let id = new_record_id();
        let tag = fsmeta::encode_file(&FileMeta {
            dir_id: dir_id.to_string(),
            file_id: id.clone(),
            name: name.to_string(),
            content_hash: hash.clone(),
        });
        let loc = self.send(remote, &tag, Some(&file_ref)).await?;

        let record = FileRecord {
            id,
            dir_id: dir_id.to_string(),
            name: name.to_string(),
            size_bytes,
            content_hash: hash,
            remote_channel_id: Some(loc.channel),
            remote_message_id: Some(loc.message),
            remote_file_ref: Some(file_ref.0),
            created_at: Utc::now(),
            is_broken: false,
        };
        self.index.write(&gate, |db| db.insert_file(&record))?;
        drop(gate);

        if let Err(e) = self.vault.put(&record.content_hash, &data).await {
            tracing::warn!(file_id = %record.id, error = %e, "could not cache uploaded payload");
        }
        tracing::info!(
            file_id = %record.id,
            dir_id = %record.dir_id,
            message_id = %loc.message,
            size_bytes,
            "file uploaded"
        );
        Ok(record)
    }

    pub async fn rename_file(&self, remote: &dyn RemoteClient, id: &str, new_name: &str) -> Result<FileRecord> {
        let gate = self.index.lock_writes().await;
        check_name(new_name)?;
        let file = self.require_file(id)?;
        let dir_id = file.dir_id.clone();
        self.replace_file(remote, &gate, file, dir_id, new_name.to_string())
            .await
    }

    pub async fn move_file(&self, remote: &dyn RemoteClient, id: &str, new_dir_id: &str) -> Result<FileRecord> {
        let gate = self.index.lock_writes().await;
        let file = self.require_file(id)?;
        self.require_dir(new_dir_id)?;
        let name = file.name.clone();
        self.replace_file(remote, &gate, file, new_dir_id.to_string(), name)
            .await
    }

    async fn replace_file(
        &self,
        remote: &dyn RemoteClient,
        gate: &WriteGuard,
        file: FileRecord,
        dir_id: String,
        name: String,
    ) -> Result<FileRecord> {
        let tag = fsmeta::encode_file(&FileMeta {
            dir_id: dir_id.clone(),
            file_id: file.id.clone(),
            name: name.clone(),
            content_hash: file.content_hash.clone(),
        });
        let before = file_location(&file);
        // A resend has to carry the payload again or the new message would
        // describe a file with no content.
        let file_ref = file.remote_file_ref.clone().map(RemoteFileRef);
        let loc = self
            .edit_or_resend(remote, before, &tag, file_ref.as_ref())
            .await?;

        self.index.write(gate, |db| {
            db.update_file_placement(&file.id, &dir_id, &name)?;
            if before != Some(loc) {
                db.set_file_location(&file.id, loc, None)?;
            }
            Ok(())
        })?;
        tracing::info!(file_id = %file.id, dir_id = %dir_id, message_id = %loc.message, "file updated");

        Ok(FileRecord {
            dir_id,
            name,
            remote_channel_id: Some(loc.channel),
            remote_message_id: Some(loc.message),
            ..file
        })
    }

    pub async fn delete_file(&self, remote: &dyn RemoteClient, id: &str) -> Result<()> {
        let gate = self.index.lock_writes().await;
        let file = self.require_file(id)?;
        let tag = fsmeta::encode_tombstone(&Tombstone::File(file.id.clone()));
        self.write_tombstone(remote, file_location(&file), &tag).await?;

        self.index.write(&gate, |db| db.delete_file(id))?;
        tracing::info!(file_id = %id, "file deleted");
        Ok(())
    }

    /// Delete several files under one write gate. Every id is checked
    /// before anything is sent; each record is removed right after its own
    /// tombstone lands, so a remote failure midway keeps the rest intact.
    pub async fn delete_files(&self, remote: &dyn RemoteClient, ids: &[String]) -> Result<usize> {
        let gate = self.index.lock_writes().await;
        let files = ids
            .iter()
            .map(|id| self.require_file(id))
            .collect::<Result<Vec<_>>>()?;

        for file in &files {
            let tag = fsmeta::encode_tombstone(&Tombstone::File(file.id.clone()));
            self.write_tombstone(remote, file_location(file), &tag).await?;
            self.index.write(&gate, |db| db.delete_file(&file.id))?;
        }
        tracing::info!(count = files.len(), "files deleted");
        Ok(files.len())
    }

    /// Payload of a file, from the Content Vault when possible.
    ///
    /// Downloaded bytes are checked against the stored fingerprint; a
    /// mismatch flags the record broken instead of caching bad content.
    pub async fn download_file(&self, remote: &dyn RemoteClient, id: &str) -> Result<Bytes> {
        let file = self.require_file(id)?;
        if let Some(cached) = self.vault.get(&file.content_hash).await.ok().flatten() {
            tracing::debug!(file_id = %id, "served from cache");
            return Ok(cached);
        }

        let file_ref = file
            .remote_file_ref
            .clone()
            .map(RemoteFileRef)
            .ok_or_else(|| EngineError::Precondition(format!("file {id} has no remote payload")))?;
        let data = with_retry(&self.retry, "download_file", || remote.download_file(&file_ref)).await?;

        let actual = content_fingerprint(&data);
        if actual != file.content_hash {
            let gate = self.index.lock_writes().await;
            self.index.write(&gate, |db| db.set_file_broken(id, true))?;
            tracing::warn!(
                file_id = %id,
                expected = %file.content_hash,
                actual = %actual,
                "downloaded payload does not match its fingerprint"
            );
            return Err(EngineError::Divergence(format!(
                "payload of file {id} hashes to {actual}, expected {}",
                file.content_hash
            )));
        }

        if let Err(e) = self.vault.put(&actual, &data).await {
            tracing::warn!(file_id = %id, error = %e, "could not cache downloaded payload");
        }
        Ok(data)
    }
}
