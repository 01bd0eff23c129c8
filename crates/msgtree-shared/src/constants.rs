/// Application name
pub const APP_NAME: &str = "msgtree";

/// First token of every fsmeta tag line
pub const PROTOCOL_MARKER: &str = "#ocltg";

/// Schema version this build writes and understands
pub const SCHEMA_VERSION: u32 = 1;

/// Marker token of backup snapshot captions (lives in the backup channel)
pub const BACKUP_MARKER: &str = "#backup";

/// Parent value encoding "no parent" in directory tags
pub const ROOT_SENTINEL: &str = "ROOT";

/// Name given to directories that are referenced by a tag before their own
/// tag has been ingested
pub const PLACEHOLDER_DIR_NAME: &str = "Unknown folder";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Salt size for password based key derivation
pub const KDF_SALT_SIZE: usize = 16;

/// Upper bounds accepted for Argon2 costs read back from disk (1 GiB)
pub const KDF_MAX_MEMORY_KIB: u32 = 1024 * 1024;
pub const KDF_MAX_ITERATIONS: u32 = 10;
pub const KDF_MAX_PARALLELISM: u32 = 16;

/// Number of hex characters of the BLAKE3 digest kept as content fingerprint
pub const FINGERPRINT_HEX_LEN: usize = 16;

/// Keychain service / account used for the credential bundle
pub const KEYCHAIN_SERVICE: &str = "msgtree";
pub const KEYCHAIN_ACCOUNT: &str = "remote_api";
