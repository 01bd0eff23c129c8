//! In-process remote with fault injection, used by tests and local
//! development.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use msgtree_shared::{ChannelId, MessageId};

use super::{RemoteAttachment, RemoteClient, RemoteConnector, RemoteFileRef, RemoteMessage};
use crate::error::RemoteError;
use crate::secrets::SecretBundle;

/// Remote operations that can be slowed down or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Send,
    Edit,
    History,
    Recent,
    Upload,
    Download,
}

#[derive(Default)]
struct Channel {
    last_id: i64,
    messages: BTreeMap<MessageId, RemoteMessage>,
}

struct Inner {
    channels: HashMap<ChannelId, Channel>,
    files: HashMap<RemoteFileRef, Bytes>,
    next_file: u64,
    clock: DateTime<Utc>,
    faults: HashMap<RemoteOp, VecDeque<RemoteError>>,
    latency: HashMap<RemoteOp, Duration>,
    calls: HashMap<RemoteOp, usize>,
}

/// Ordered per-channel message logs plus a payload store, all in memory.
///
/// Message ids start at 1 in every channel and only grow. Each appended
/// message is stamped with the internal clock, which then ticks one second,
/// so dates are deterministic.
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let epoch = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            inner: Mutex::new(Inner {
                channels: HashMap::new(),
                files: HashMap::new(),
                next_file: 0,
                clock: epoch,
                faults: HashMap::new(),
                latency: HashMap::new(),
                calls: HashMap::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail_next(&self, op: RemoteOp, times: usize, error: RemoteError) {
        let mut inner = self.inner.lock();
        let queue = inner.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Delay every call of `op` by `latency` before it takes effect.
    pub fn set_latency(&self, op: RemoteOp, latency: Duration) {
        self.inner.lock().latency.insert(op, latency);
    }

    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.lock().clock
    }

    pub fn set_clock(&self, at: DateTime<Utc>) {
        self.inner.lock().clock = at;
    }

    pub fn advance_clock(&self, by: chrono::Duration) {
        let mut inner = self.inner.lock();
        inner.clock += by;
    }

    // ------------------------------------------------------------------
    // Direct manipulation, bypassing faults
    // ------------------------------------------------------------------

    /// Append a message as another writer would.
    pub fn inject(&self, channel: ChannelId, text: &str, attachment: Option<RemoteAttachment>) -> MessageId {
        self.inner.lock().append(channel, text, attachment)
    }

    /// Rewrite a message's text. Returns `false` if it does not exist.
    pub fn overwrite(&self, channel: ChannelId, message: MessageId, text: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .channels
            .get_mut(&channel)
            .and_then(|c| c.messages.get_mut(&message))
        {
            Some(m) => {
                m.text = text.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove a message from the log. Returns `false` if it did not exist.
    pub fn delete_message(&self, channel: ChannelId, message: MessageId) -> bool {
        let mut inner = self.inner.lock();
        inner
            .channels
            .get_mut(&channel)
            .map(|c| c.messages.remove(&message).is_some())
            .unwrap_or(false)
    }

    /// Store a payload directly.
    pub fn put_file(&self, data: Bytes) -> RemoteAttachment {
        let mut inner = self.inner.lock();
        let size_bytes = data.len() as u64;
        RemoteAttachment {
            file_ref: inner.store_file(data),
            size_bytes,
        }
    }

    /// Snapshot of a channel, oldest first.
    pub fn messages(&self, channel: ChannelId) -> Vec<RemoteMessage> {
        self.inner
            .lock()
            .channels
            .get(&channel)
            .map(|c| c.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn file_count(&self) -> usize {
        self.inner.lock().files.len()
    }

    /// Count a call, pop a queued fault if any, and report the latency.
    fn enter(&self, op: RemoteOp) -> Result<Duration, RemoteError> {
        let mut inner = self.inner.lock();
        *inner.calls.entry(op).or_default() += 1;
        if let Some(err) = inner.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(inner.latency.get(&op).copied().unwrap_or_default())
    }

    async fn begin(&self, op: RemoteOp) -> Result<(), RemoteError> {
        let latency = self.enter(op)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

impl Inner {
    fn append(&mut self, channel: ChannelId, text: &str, attachment: Option<RemoteAttachment>) -> MessageId {
        let date = self.clock;
        self.clock += chrono::Duration::seconds(1);
        let ch = self.channels.entry(channel).or_default();
        ch.last_id += 1;
        let id = MessageId(ch.last_id);
        ch.messages.insert(
            id,
            RemoteMessage {
                id,
                date,
                text: text.to_string(),
                attachment,
            },
        );
        id
    }

    fn store_file(&mut self, data: Bytes) -> RemoteFileRef {
        self.next_file += 1;
        let file_ref = RemoteFileRef(format!("mem-file-{}", self.next_file));
        self.files.insert(file_ref.clone(), data);
        file_ref
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn send_message(
        &self,
        channel: ChannelId,
        text: &str,
        attachment: Option<&RemoteFileRef>,
    ) -> Result<MessageId, RemoteError> {
        self.begin(RemoteOp::Send).await?;
        let mut inner = self.inner.lock();
        let attachment = match attachment {
            Some(file_ref) => {
                let data = inner
                    .files
                    .get(file_ref)
                    .ok_or_else(|| RemoteError::FileNotFound(file_ref.0.clone()))?;
                Some(RemoteAttachment {
                    file_ref: file_ref.clone(),
                    size_bytes: data.len() as u64,
                })
            }
            None => None,
        };
        Ok(inner.append(channel, text, attachment))
    }

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        text: &str,
    ) -> Result<(), RemoteError> {
        self.begin(RemoteOp::Edit).await?;
        if self.overwrite(channel, message, text) {
            Ok(())
        } else {
            Err(RemoteError::MessageNotFound { channel, message })
        }
    }

    async fn get_history(
        &self,
        channel: ChannelId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.begin(RemoteOp::History).await?;
        let inner = self.inner.lock();
        Ok(inner
            .channels
            .get(&channel)
            .map(|c| {
                c.messages
                    .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .take(limit)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_recent(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.begin(RemoteOp::Recent).await?;
        let inner = self.inner.lock();
        Ok(inner
            .channels
            .get(&channel)
            .map(|c| c.messages.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn upload_file(&self, data: Bytes) -> Result<RemoteFileRef, RemoteError> {
        self.begin(RemoteOp::Upload).await?;
        Ok(self.inner.lock().store_file(data))
    }

    async fn download_file(&self, file_ref: &RemoteFileRef) -> Result<Bytes, RemoteError> {
        self.begin(RemoteOp::Download).await?;
        self.inner
            .lock()
            .files
            .get(file_ref)
            .cloned()
            .ok_or_else(|| RemoteError::FileNotFound(file_ref.0.clone()))
    }
}

/// Hands out a shared [`MemoryRemote`] when the api id matches.
pub struct MemoryConnector {
    pub remote: Arc<MemoryRemote>,
    pub expected_api_id: i32,
}

#[async_trait]
impl RemoteConnector for MemoryConnector {
    async fn connect(&self, secrets: &SecretBundle) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        if secrets.api_id != self.expected_api_id {
            return Err(RemoteError::Unauthorized);
        }
        Ok(self.remote.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CH: ChannelId = ChannelId(-1);

    #[tokio::test]
    async fn history_is_ascending_after_cursor() {
        let remote = MemoryRemote::new();
        for i in 0..5 {
            remote.send_message(CH, &format!("m{i}"), None).await.unwrap();
        }
        let page = remote.get_history(CH, MessageId(2), 2).await.unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![MessageId(3), MessageId(4)]);

        let recent = remote.get_recent(CH, 2).await.unwrap();
        assert_eq!(recent[0].id, MessageId(5));
        assert!(recent[0].date > recent[1].date);
    }

    #[tokio::test]
    async fn faults_are_consumed_in_order() {
        let remote = MemoryRemote::new();
        remote.fail_next(RemoteOp::Send, 1, RemoteError::Timeout("t".into()));
        assert!(remote.send_message(CH, "x", None).await.is_err());
        assert!(remote.send_message(CH, "x", None).await.is_ok());
        assert_eq!(remote.call_count(RemoteOp::Send), 2);
        assert_eq!(remote.messages(CH).len(), 1);
    }

    #[tokio::test]
    async fn edits_keep_ids_and_missing_messages_error() {
        let remote = MemoryRemote::new();
        let id = remote.send_message(CH, "old", None).await.unwrap();
        remote.edit_message(CH, id, "new").await.unwrap();
        assert_eq!(remote.messages(CH)[0].text, "new");

        assert!(remote.delete_message(CH, id));
        assert!(matches!(
            remote.edit_message(CH, id, "again").await,
            Err(RemoteError::MessageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn attachments_round_trip() {
        let remote = MemoryRemote::new();
        let file_ref = remote.upload_file(Bytes::from_static(b"payload")).await.unwrap();
        let id = remote.send_message(CH, "with file", Some(&file_ref)).await.unwrap();
        let msg = &remote.messages(CH)[0];
        assert_eq!(msg.id, id);
        assert_eq!(msg.attachment.as_ref().unwrap().size_bytes, 7);
        assert_eq!(
            remote.download_file(&file_ref).await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }
}
