use serde::{Deserialize, Serialize};
use thiserror::Error;

use msgtree_shared::{ChannelId, CodecError, CryptoError, MessageId};
use msgtree_store::StoreError;

/// Failures at the remote client boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote call timed out: {0}")]
    Timeout(String),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Message {message} not found in channel {channel}")]
    MessageNotFound {
        channel: ChannelId,
        message: MessageId,
    },

    #[error("Remote file not found: {0}")]
    FileNotFound(String),

    #[error("Remote rejected the request: {0}")]
    Rejected(String),

    #[error("Remote refused the credentials")]
    Unauthorized,
}

impl RemoteError {
    /// Whether the call may succeed if simply tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Timeout(_) | RemoteError::Unavailable(_))
    }
}

/// Failures of the Secret Vault.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Credentials are locked; a password is required")]
    Locked,

    #[error("No credentials configured")]
    Absent,

    #[error("Wrong password")]
    WrongPassword,

    #[error("A password is required for encrypted storage")]
    PasswordRequired,

    #[error("OS keychain unavailable: {0}")]
    KeychainUnavailable(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Credential file is corrupt: {0}")]
    Corrupt(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure taxonomy surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientRemote,
    Protocol,
    Divergence,
    Precondition,
    Vault,
    NotFound,
    Storage,
    State,
}

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Remote unavailable after {attempts} attempts: {source}")]
    RemoteUnavailable { attempts: u32, source: RemoteError },

    #[error(transparent)]
    Remote(RemoteError),

    #[error("Not connected to the remote")]
    NotConnected,

    #[error("Malformed metadata: {0}")]
    Protocol(#[from] CodecError),

    #[error("Content diverges from the index: {0}")]
    Divergence(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Reconciliation needs a completed sync first")]
    SyncRequiredFirst,

    #[error("A source file is required to repair {file_id}")]
    NeedSourceFile { file_id: String },

    #[error("Replacement content does not match: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Restart required to finish a restore")]
    RestartRequired,

    #[error("Backup error: {0}")]
    Backup(String),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Index error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::RemoteUnavailable { .. } => ErrorKind::TransientRemote,
            EngineError::Remote(e) => match e {
                RemoteError::Timeout(_) | RemoteError::Unavailable(_) => ErrorKind::TransientRemote,
                RemoteError::MessageNotFound { .. } | RemoteError::FileNotFound(_) => {
                    ErrorKind::NotFound
                }
                RemoteError::Rejected(_) => ErrorKind::Precondition,
                RemoteError::Unauthorized => ErrorKind::Vault,
            },
            EngineError::NotConnected | EngineError::RestartRequired => ErrorKind::State,
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Divergence(_) | EngineError::HashMismatch { .. } => ErrorKind::Divergence,
            EngineError::Precondition(_)
            | EngineError::InvalidName(_)
            | EngineError::SyncRequiredFirst
            | EngineError::NeedSourceFile { .. } => ErrorKind::Precondition,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Vault(_) => ErrorKind::Vault,
            EngineError::Store(StoreError::NotFound) => ErrorKind::NotFound,
            EngineError::Store(_) | EngineError::Io(_) | EngineError::Backup(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Stable reason string for the presentation layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::RemoteUnavailable { .. } => "REMOTE_UNAVAILABLE",
            EngineError::Remote(e) => match e {
                RemoteError::Timeout(_) | RemoteError::Unavailable(_) => "REMOTE_UNAVAILABLE",
                RemoteError::MessageNotFound { .. } => "REMOTE_MESSAGE_NOT_FOUND",
                RemoteError::FileNotFound(_) => "REMOTE_FILE_NOT_FOUND",
                RemoteError::Rejected(_) => "REMOTE_REJECTED",
                RemoteError::Unauthorized => "REMOTE_UNAUTHORIZED",
            },
            EngineError::NotConnected => "NOT_CONNECTED",
            EngineError::Protocol(_) => "PROTOCOL_ERROR",
            EngineError::Divergence(_) => "DIVERGENCE",
            EngineError::Precondition(_) => "PRECONDITION_FAILED",
            EngineError::InvalidName(_) => "INVALID_NAME",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::SyncRequiredFirst => "SYNC_REQUIRED_FIRST",
            EngineError::NeedSourceFile { .. } => "NEED_SOURCE_FILE",
            EngineError::HashMismatch { .. } => "HASH_MISMATCH",
            EngineError::RestartRequired => "RESTART_REQUIRED",
            EngineError::Backup(_) => "BACKUP_FAILED",
            EngineError::Vault(e) => match e {
                VaultError::Locked => "VAULT_LOCKED",
                VaultError::Absent => "CREDENTIALS_MISSING",
                VaultError::WrongPassword => "WRONG_PASSWORD",
                VaultError::PasswordRequired => "PASSWORD_REQUIRED",
                VaultError::KeychainUnavailable(_) => "KEYCHAIN_UNAVAILABLE",
                VaultError::InvalidCredentials(_) => "INVALID_CREDENTIALS",
                VaultError::Corrupt(_) => "VAULT_CORRUPT",
                VaultError::Crypto(_) | VaultError::Io(_) => "VAULT_IO",
            },
            EngineError::Store(StoreError::NotFound) => "NOT_FOUND",
            EngineError::Store(_) => "INDEX_ERROR",
            EngineError::Io(_) => "IO_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientRemote
    }

    pub fn to_failure(&self) -> CommandFailure {
        CommandFailure {
            code: self.code().to_string(),
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

impl From<RemoteError> for EngineError {
    fn from(e: RemoteError) -> Self {
        EngineError::Remote(e)
    }
}

/// Serializable failure handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

pub type Result<T> = std::result::Result<T, EngineError>;
