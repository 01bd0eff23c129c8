use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a remote channel (one ordered message log).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a message inside a channel. Ids grow monotonically with the
/// channel's sequence, so they double as the sync position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Position before the first message of any channel.
    pub const START: MessageId = MessageId(0);
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fresh opaque identifier for a directory or file record.
pub fn new_record_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_are_single_tokens() {
        let id = new_record_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains(char::is_whitespace));
        assert_ne!(id, new_record_id());
    }

    #[test]
    fn message_ids_order_by_sequence() {
        assert!(MessageId(3) > MessageId(2));
        assert_eq!(MessageId::START, MessageId::default());
    }
}
