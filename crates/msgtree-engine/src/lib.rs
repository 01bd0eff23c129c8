//! msgtree engine: keeps a local index of a directory tree consistent with
//! the metadata messages of a remote channel.
//!
//! Start with [`Engine`]; the components it wires together are usable on
//! their own as well (tests do that).

pub mod backup;
pub mod config;
pub mod content_vault;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod logging;
pub mod mutations;
pub mod reconcile;
pub mod remote;
pub mod repair;
pub mod retry;
pub mod secrets;
pub mod state;
pub mod sync;

pub use backup::{BackupInfo, RestoreMode, RestoreOutcome};
pub use config::{DataPaths, EngineConfig};
pub use engine::{spawn_auto_backup, Engine, FileEntry};
pub use error::{CommandFailure, EngineError, ErrorKind, RemoteError, Result, VaultError};
pub use events::EngineEvent;
pub use reconcile::ReconcileReport;
pub use repair::RepairOutcome;
pub use secrets::{CredentialSource, CredentialsStatus, StorageMode};
pub use state::{ChannelStatus, SyncPhase};
pub use sync::SyncReport;
