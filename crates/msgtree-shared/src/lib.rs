//! Types shared by every msgtree crate: the fsmeta tag codec, identifier
//! newtypes, protocol constants and the symmetric crypto helpers used by the
//! secret vault.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod fsmeta;
pub mod types;

pub use error::{CodecError, CryptoError};
pub use types::{ChannelId, MessageId};
