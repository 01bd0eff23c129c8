use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Why a text line could not be turned into a tag record.
///
/// `NotTagged` and `UnsupportedVersion` mean "not for us"; everything else
/// means the line claims to be a current-version tag but is broken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("not an fsmeta tag")]
    NotTagged,

    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(String),

    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    #[error("missing field: {0}")]
    Missing(&'static str),

    #[error("invalid value for field {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

impl CodecError {
    /// True when the line is simply not something this client understands,
    /// as opposed to a damaged tag.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, CodecError::NotTagged | CodecError::UnsupportedVersion(_))
    }
}
