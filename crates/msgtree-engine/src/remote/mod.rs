//! The remote messaging boundary.
//!
//! The engine only ever talks to the remote through [`RemoteClient`]. A real
//! deployment plugs in a messaging-service client; tests use
//! [`memory::MemoryRemote`].

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use msgtree_shared::{ChannelId, MessageId};

use crate::error::RemoteError;
use crate::secrets::SecretBundle;

/// Opaque handle of a payload stored on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteFileRef(pub String);

impl RemoteFileRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub file_ref: RemoteFileRef,
    pub size_bytes: u64,
}

/// One message of a channel as the remote reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: MessageId,
    pub date: DateTime<Utc>,
    pub text: String,
    pub attachment: Option<RemoteAttachment>,
}

/// Operations the engine needs from the messaging service.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Append a message, optionally carrying an uploaded payload.
    async fn send_message(
        &self,
        channel: ChannelId,
        text: &str,
        attachment: Option<&RemoteFileRef>,
    ) -> Result<MessageId, RemoteError>;

    /// Replace the text of an existing message, keeping its id.
    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        text: &str,
    ) -> Result<(), RemoteError>;

    /// Messages with id strictly greater than `after`, oldest first.
    async fn get_history(
        &self,
        channel: ChannelId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, RemoteError>;

    /// The `limit` most recent messages, newest first.
    async fn get_recent(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, RemoteError>;

    async fn upload_file(&self, data: Bytes) -> Result<RemoteFileRef, RemoteError>;

    async fn download_file(&self, file_ref: &RemoteFileRef) -> Result<Bytes, RemoteError>;
}

/// Builds a connected client from credentials.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, secrets: &SecretBundle) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}
