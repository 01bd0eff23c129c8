//! Secret Vault for the remote API credentials.
//!
//! Exactly one storage mode is active at a time:
//! - OS keychain (no password at unlock),
//! - a password-encrypted file (Argon2id + XChaCha20-Poly1305),
//! - session only (memory, gone on exit).
//!
//! [`SecretVault::load`] resolves session, keychain, environment and the
//! encrypted file in that order, and reports `Locked` rather than failing
//! when only the encrypted file is there.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use msgtree_shared::constants::{KEYCHAIN_ACCOUNT, KEYCHAIN_SERVICE};
use msgtree_shared::crypto::{self, KdfParams};
use msgtree_shared::CryptoError;

use crate::error::VaultError;

const FILE_FORMAT_VERSION: u8 = 1;
const ENV_API_ID: &str = "MSGTREE_API_ID";
const ENV_API_HASH: &str = "MSGTREE_API_HASH";

type Result<T> = std::result::Result<T, VaultError>;

/// Credentials of the remote messaging API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBundle {
    pub api_id: i32,
    pub api_hash: String,
    /// Path of the native client library, when not bundled.
    pub client_library_path: Option<String>,
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("client_library_path", &self.client_library_path)
            .finish()
    }
}

impl SecretBundle {
    /// Trim and check the fields.
    pub fn normalized(
        api_id: i32,
        api_hash: &str,
        client_library_path: Option<String>,
    ) -> Result<Self> {
        if api_id <= 0 {
            return Err(VaultError::InvalidCredentials("api id must be positive".into()));
        }
        let api_hash = api_hash.trim();
        if api_hash.is_empty() {
            return Err(VaultError::InvalidCredentials("api hash is empty".into()));
        }
        Ok(Self {
            api_id,
            api_hash: api_hash.to_string(),
            client_library_path: client_library_path.filter(|p| !p.trim().is_empty()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Keychain,
    EncryptedFile,
    SessionOnly,
}

/// Where the active credentials came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Session,
    Keychain,
    Environment,
    EncryptedFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Available {
        bundle: SecretBundle,
        source: CredentialSource,
    },
    /// An encrypted bundle exists but has not been unlocked this session.
    Locked,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialsStatus {
    pub source: Option<CredentialSource>,
    pub keychain_available: bool,
    pub encrypted_file_present: bool,
    pub locked: bool,
}

// ---------------------------------------------------------------------------
// Keychain backends
// ---------------------------------------------------------------------------

/// Minimal keychain surface, one secret slot.
pub trait KeychainBackend: Send + Sync {
    fn get(&self) -> Result<Option<String>>;
    fn set(&self, secret: &str) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

/// The platform keychain through `keyring`.
pub struct OsKeychain {
    service: String,
    account: String,
}

impl Default for OsKeychain {
    fn default() -> Self {
        Self::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT)
    }
}

impl OsKeychain {
    pub fn new(service: &str, account: &str) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| VaultError::KeychainUnavailable(e.to_string()))
    }
}

impl KeychainBackend for OsKeychain {
    fn get(&self) -> Result<Option<String>> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(VaultError::KeychainUnavailable(e.to_string())),
        }
    }

    fn set(&self, secret: &str) -> Result<()> {
        self.entry()?
            .set_password(secret)
            .map_err(|e| VaultError::KeychainUnavailable(e.to_string()))
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(VaultError::KeychainUnavailable(e.to_string())),
        }
    }
}

/// In-memory keychain for tests and headless hosts.
#[derive(Default)]
pub struct MemoryKeychain {
    slot: Mutex<Option<String>>,
    unavailable: bool,
}

impl MemoryKeychain {
    /// A keychain that fails every call, like a locked-down desktop session.
    pub fn unavailable() -> Self {
        Self {
            slot: Mutex::new(None),
            unavailable: true,
        }
    }

    fn check(&self) -> Result<()> {
        if self.unavailable {
            return Err(VaultError::KeychainUnavailable("no keychain service".into()));
        }
        Ok(())
    }
}

impl KeychainBackend for MemoryKeychain {
    fn get(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.slot.lock().clone())
    }

    fn set(&self, secret: &str) -> Result<()> {
        self.check()?;
        *self.slot.lock() = Some(secret.to_string());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.check()?;
        *self.slot.lock() = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encrypted file format
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct EncryptedFile {
    v: u8,
    kdf: KdfParams,
    salt: String,
    /// base64(nonce || ciphertext)
    ciphertext: String,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct SecretVault {
    file_path: PathBuf,
    keychain: Arc<dyn KeychainBackend>,
    kdf: KdfParams,
    env: EnvLookup,
    session: Mutex<Option<SecretBundle>>,
    unlocked: Mutex<Option<SecretBundle>>,
}

impl SecretVault {
    pub fn new(file_path: PathBuf, keychain: Arc<dyn KeychainBackend>, kdf: KdfParams) -> Self {
        Self {
            file_path,
            keychain,
            kdf,
            env: Arc::new(|key: &str| std::env::var(key).ok()),
            session: Mutex::new(None),
            unlocked: Mutex::new(None),
        }
    }

    /// Replace the environment lookup (tests).
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Persist `bundle` with `mode` and clear every other mode.
    pub fn store(&self, bundle: &SecretBundle, mode: StorageMode, password: Option<&str>) -> Result<()> {
        let bundle = SecretBundle::normalized(
            bundle.api_id,
            &bundle.api_hash,
            bundle.client_library_path.clone(),
        )?;

        match mode {
            StorageMode::Keychain => {
                let json = Zeroizing::new(
                    serde_json::to_string(&bundle).map_err(|e| VaultError::Corrupt(e.to_string()))?,
                );
                self.keychain.set(&json)?;
                self.remove_file()?;
                *self.unlocked.lock() = None;
            }
            StorageMode::EncryptedFile => {
                let password = password
                    .filter(|p| !p.trim().is_empty())
                    .ok_or(VaultError::PasswordRequired)?;
                self.write_encrypted(&bundle, password)?;
                self.forget_keychain();
                *self.unlocked.lock() = Some(bundle.clone());
            }
            StorageMode::SessionOnly => {
                self.remove_file()?;
                self.forget_keychain();
                *self.unlocked.lock() = None;
            }
        }

        *self.session.lock() = match mode {
            StorageMode::SessionOnly => Some(bundle),
            _ => None,
        };
        tracing::info!(?mode, "credentials stored");
        Ok(())
    }

    /// Resolve the active credentials without prompting.
    pub fn load(&self) -> Result<LoadOutcome> {
        if let Some(bundle) = self.session.lock().clone() {
            return Ok(available(bundle, CredentialSource::Session));
        }

        match self.keychain.get() {
            Ok(Some(json)) => {
                let json = Zeroizing::new(json);
                let bundle: SecretBundle = serde_json::from_str(&json)
                    .map_err(|e| VaultError::Corrupt(format!("keychain entry: {e}")))?;
                return Ok(available(bundle, CredentialSource::Keychain));
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "keychain lookup skipped"),
        }

        if let Some(bundle) = self.env_bundle() {
            return Ok(available(bundle, CredentialSource::Environment));
        }

        if self.file_path.exists() {
            return Ok(match self.unlocked.lock().clone() {
                Some(bundle) => available(bundle, CredentialSource::EncryptedFile),
                None => LoadOutcome::Locked,
            });
        }

        Ok(LoadOutcome::Absent)
    }

    /// Decrypt the credential file with `password` and keep the result for
    /// this session.
    pub fn unlock(&self, password: &str) -> Result<SecretBundle> {
        let raw = match std::fs::read(&self.file_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(VaultError::Absent),
            Err(e) => return Err(e.into()),
        };
        let file: EncryptedFile =
            serde_json::from_slice(&raw).map_err(|e| VaultError::Corrupt(e.to_string()))?;
        if file.v != FILE_FORMAT_VERSION {
            return Err(VaultError::Corrupt(format!("unsupported file version {}", file.v)));
        }
        if !file.kdf.within_limits() {
            return Err(VaultError::Corrupt(format!("implausible key derivation costs {:?}", file.kdf)));
        }
        let salt = BASE64
            .decode(&file.salt)
            .map_err(|e| VaultError::Corrupt(e.to_string()))?;
        let sealed = BASE64
            .decode(&file.ciphertext)
            .map_err(|e| VaultError::Corrupt(e.to_string()))?;

        let key = crypto::derive_key_from_password(password.as_bytes(), &salt, &file.kdf)?;
        let plain = Zeroizing::new(crypto::decrypt(&key, &sealed).map_err(|e| match e {
            CryptoError::DecryptionFailed => VaultError::WrongPassword,
            other => VaultError::Crypto(other),
        })?);
        let bundle: SecretBundle =
            serde_json::from_slice(&plain).map_err(|e| VaultError::Corrupt(e.to_string()))?;

        *self.unlocked.lock() = Some(bundle.clone());
        tracing::info!("credential file unlocked");
        Ok(bundle)
    }

    pub fn status(&self) -> CredentialsStatus {
        let keychain_available = self.keychain.get().is_ok();
        let encrypted_file_present = self.file_path.exists();
        let (source, locked) = match self.load() {
            Ok(LoadOutcome::Available { source, .. }) => (Some(source), false),
            Ok(LoadOutcome::Locked) => (None, true),
            Ok(LoadOutcome::Absent) | Err(_) => (None, false),
        };
        CredentialsStatus {
            source,
            keychain_available,
            encrypted_file_present,
            locked,
        }
    }

    /// Wipe credentials from every storage mode.
    pub fn clear(&self) -> Result<()> {
        *self.session.lock() = None;
        *self.unlocked.lock() = None;
        self.forget_keychain();
        self.remove_file()?;
        tracing::info!("credentials cleared");
        Ok(())
    }

    fn env_bundle(&self) -> Option<SecretBundle> {
        let api_id = (self.env)(ENV_API_ID)?.trim().parse::<i32>().ok()?;
        let api_hash = (self.env)(ENV_API_HASH)?;
        SecretBundle::normalized(api_id, &api_hash, None).ok()
    }

    fn forget_keychain(&self) {
        if let Err(e) = self.keychain.delete() {
            tracing::warn!(error = %e, "could not clear keychain entry");
        }
    }

    fn remove_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_encrypted(&self, bundle: &SecretBundle, password: &str) -> Result<()> {
        let salt = crypto::generate_salt();
        let key = crypto::derive_key_from_password(password.as_bytes(), &salt, &self.kdf)?;
        let plain = Zeroizing::new(
            serde_json::to_vec(bundle).map_err(|e| VaultError::Corrupt(e.to_string()))?,
        );
        let sealed = crypto::encrypt(&key, &plain)?;

        let file = EncryptedFile {
            v: FILE_FORMAT_VERSION,
            kdf: self.kdf,
            salt: BASE64.encode(salt),
            ciphertext: BASE64.encode(sealed),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| VaultError::Corrupt(e.to_string()))?;
        write_atomic(&self.file_path, &json)
    }
}

fn available(bundle: SecretBundle, source: CredentialSource) -> LoadOutcome {
    LoadOutcome::Available { bundle, source }
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn vault(dir: &Path, keychain: Arc<dyn KeychainBackend>) -> SecretVault {
        SecretVault::new(dir.join("secrets").join("credentials.enc.json"), keychain, cheap_kdf())
            .with_env(|_| None)
    }

    fn bundle() -> SecretBundle {
        SecretBundle::normalized(12345, " 0123abcd ", None).unwrap()
    }

    #[test]
    fn tampered_kdf_costs_are_rejected_before_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path(), Arc::new(MemoryKeychain::unavailable()));
        v.store(&bundle(), StorageMode::EncryptedFile, Some("pw")).unwrap();

        let path = dir.path().join("secrets").join("credentials.enc.json");
        let mut file: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        file["kdf"]["memory_kib"] = serde_json::json!(u32::MAX);
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        let v = vault(dir.path(), Arc::new(MemoryKeychain::unavailable()));
        assert!(matches!(v.unlock("pw"), Err(VaultError::Corrupt(_))));
    }

    #[test]
    fn validation() {
        assert_eq!(bundle().api_hash, "0123abcd");
        assert!(SecretBundle::normalized(0, "x", None).is_err());
        assert!(SecretBundle::normalized(1, "   ", None).is_err());
        assert!(!format!("{:?}", bundle()).contains("0123abcd"));
    }

    #[test]
    fn encrypted_file_locks_until_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path(), Arc::new(MemoryKeychain::unavailable()));
        v.store(&bundle(), StorageMode::EncryptedFile, Some("pw")).unwrap();

        // A fresh process sees only the file.
        let v = vault(dir.path(), Arc::new(MemoryKeychain::unavailable()));
        assert_eq!(v.load().unwrap(), LoadOutcome::Locked);
        assert!(v.status().locked);

        assert!(matches!(v.unlock("nope"), Err(VaultError::WrongPassword)));
        assert_eq!(v.unlock("pw").unwrap(), bundle());
        assert!(matches!(
            v.load().unwrap(),
            LoadOutcome::Available {
                source: CredentialSource::EncryptedFile,
                ..
            }
        ));
    }

    #[test]
    fn file_is_not_plaintext_and_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path(), Arc::new(MemoryKeychain::default()));
        v.store(&bundle(), StorageMode::EncryptedFile, Some("pw")).unwrap();

        let raw = std::fs::read_to_string(v.file_path()).unwrap();
        assert!(!raw.contains("0123abcd"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(v.file_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path(), Arc::new(MemoryKeychain::default()));
        v.store(&bundle(), StorageMode::EncryptedFile, Some("pw")).unwrap();

        let mut file: EncryptedFile =
            serde_json::from_slice(&std::fs::read(v.file_path()).unwrap()).unwrap();
        let mut sealed = BASE64.decode(&file.ciphertext).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        file.ciphertext = BASE64.encode(sealed);
        std::fs::write(v.file_path(), serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(v.unlock("pw").is_err());
    }

    #[test]
    fn one_mode_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = Arc::new(MemoryKeychain::default());
        let v = vault(dir.path(), keychain.clone());

        v.store(&bundle(), StorageMode::EncryptedFile, Some("pw")).unwrap();
        v.store(&bundle(), StorageMode::Keychain, None).unwrap();
        assert!(!v.file_path().exists());
        assert!(matches!(
            v.load().unwrap(),
            LoadOutcome::Available {
                source: CredentialSource::Keychain,
                ..
            }
        ));

        v.store(&bundle(), StorageMode::SessionOnly, None).unwrap();
        assert_eq!(keychain.get().unwrap(), None);
        assert!(matches!(
            v.load().unwrap(),
            LoadOutcome::Available {
                source: CredentialSource::Session,
                ..
            }
        ));

        v.clear().unwrap();
        assert_eq!(v.load().unwrap(), LoadOutcome::Absent);
    }

    #[test]
    fn password_required_for_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path(), Arc::new(MemoryKeychain::default()));
        assert!(matches!(
            v.store(&bundle(), StorageMode::EncryptedFile, Some("  ")),
            Err(VaultError::PasswordRequired)
        ));
    }

    #[test]
    fn keychain_failure_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path(), Arc::new(MemoryKeychain::unavailable()));
        assert!(matches!(
            v.store(&bundle(), StorageMode::Keychain, None),
            Err(VaultError::KeychainUnavailable(_))
        ));
        assert!(!v.status().keychain_available);
    }

    #[test]
    fn environment_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path(), Arc::new(MemoryKeychain::default())).with_env(|key| match key {
            "MSGTREE_API_ID" => Some("77".into()),
            "MSGTREE_API_HASH" => Some("feed".into()),
            _ => None,
        });
        match v.load().unwrap() {
            LoadOutcome::Available { bundle, source } => {
                assert_eq!(source, CredentialSource::Environment);
                assert_eq!(bundle.api_id, 77);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
