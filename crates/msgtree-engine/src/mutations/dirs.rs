use chrono::Utc;

use msgtree_shared::constants::ROOT_SENTINEL;
use msgtree_shared::fsmeta::{self, DirMeta, Tombstone};
use msgtree_shared::types::new_record_id;
use msgtree_store::DirectoryRecord;

use super::{check_name, dir_location, MutationPipeline};
use crate::error::{EngineError, Result};
use crate::remote::RemoteClient;

/// `None`, `""` and the root sentinel all mean "top level".
fn normalize_parent(parent: Option<&str>) -> Option<&str> {
    parent.filter(|p| !p.is_empty() && *p != ROOT_SENTINEL)
}

impl MutationPipeline {
    pub async fn create_directory(
        &self,
        remote: &dyn RemoteClient,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<DirectoryRecord> {
        let gate = self.index.lock_writes().await;
        check_name(name)?;
        let parent_id = normalize_parent(parent_id);
        if let Some(parent) = parent_id {
            self.require_dir(parent)?;
        }

        let id = new_record_id();
        let tag = fsmeta::encode_dir(&DirMeta {
            dir_id: id.clone(),
            parent_id: parent_id.map(String::from),
            name: name.to_string(),
        });
        let loc = self.send(remote, &tag, None).await?;

        let record = DirectoryRecord {
            id,
            parent_id: parent_id.map(String::from),
            name: name.to_string(),
            remote_channel_id: Some(loc.channel),
            remote_message_id: Some(loc.message),
            is_broken: false,
            updated_at: Utc::now(),
        };
        self.index.write(&gate, |db| db.insert_directory(&record))?;
        tracing::info!(dir_id = %record.id, message_id = %loc.message, "directory created");
        Ok(record)
    }

    pub async fn rename_directory(
        &self,
        remote: &dyn RemoteClient,
        id: &str,
        new_name: &str,
    ) -> Result<DirectoryRecord> {
        let gate = self.index.lock_writes().await;
        check_name(new_name)?;
        let dir = self.require_dir(id)?;
        let parent = dir.parent_id.clone();
        self.replace_directory(remote, &gate, dir, parent, new_name.to_string())
            .await
    }

    pub async fn move_directory(
        &self,
        remote: &dyn RemoteClient,
        id: &str,
        new_parent: Option<&str>,
    ) -> Result<DirectoryRecord> {
        let gate = self.index.lock_writes().await;
        let dir = self.require_dir(id)?;
        let new_parent = normalize_parent(new_parent);
        if let Some(parent) = new_parent {
            self.require_dir(parent)?;
            if self.index.read(|db| db.is_self_or_ancestor(id, parent))? {
                return Err(EngineError::Precondition(format!(
                    "cannot move directory {id} into itself or one of its descendants"
                )));
            }
        }
        let name = dir.name.clone();
        self.replace_directory(remote, &gate, dir, new_parent.map(String::from), name)
            .await
    }

    /// Shared tail of rename and move: edit the message in place, then
    /// commit the new placement.
    async fn replace_directory(
        &self,
        remote: &dyn RemoteClient,
        gate: &crate::index::WriteGuard,
        dir: DirectoryRecord,
        parent_id: Option<String>,
        name: String,
    ) -> Result<DirectoryRecord> {
        let tag = fsmeta::encode_dir(&DirMeta {
            dir_id: dir.id.clone(),
            parent_id: parent_id.clone(),
            name: name.clone(),
        });
        let before = dir_location(&dir);
        let loc = self.edit_or_resend(remote, before, &tag, None).await?;

        let now = Utc::now();
        self.index.write(gate, |db| {
            db.update_directory_placement(&dir.id, parent_id.as_deref(), &name, now)?;
            if before != Some(loc) {
                db.set_directory_location(&dir.id, loc)?;
            }
            Ok(())
        })?;
        tracing::info!(dir_id = %dir.id, message_id = %loc.message, "directory updated");

        Ok(DirectoryRecord {
            parent_id,
            name,
            remote_channel_id: Some(loc.channel),
            remote_message_id: Some(loc.message),
            updated_at: now,
            ..dir
        })
    }

    /// Delete an empty directory: its message becomes a tombstone, then the
    /// record goes away.
    pub async fn delete_directory(&self, remote: &dyn RemoteClient, id: &str) -> Result<()> {
        let gate = self.index.lock_writes().await;
        let dir = self.require_dir(id)?;
        let (dirs, files) = self.index.read(|db| db.child_counts(id))?;
        if dirs + files > 0 {
            return Err(EngineError::Precondition(format!(
                "directory {id} is not empty ({dirs} directories, {files} files)"
            )));
        }

        let tag = fsmeta::encode_tombstone(&Tombstone::Dir(dir.id.clone()));
        self.write_tombstone(remote, dir_location(&dir), &tag).await?;

        self.index.write(&gate, |db| db.delete_directory(id))?;
        tracing::info!(dir_id = %id, "directory deleted");
        Ok(())
    }
}
