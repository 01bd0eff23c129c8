//! fsmeta: the tag line attached to every storage-channel message.
//!
//! ```text
//! #ocltg #v1 #dir  d=<dirId> p=<ROOT|parentId> name=<name>
//! #ocltg #v1 #file d=<dirId> f=<fileId> n=<name> h=<fingerprint>
//! #ocltg #v1 #rm   d=<dirId>            (directory tombstone)
//! #ocltg #v1 #rm   f=<fileId>           (file tombstone)
//! #ocltg #backup #v1 seq=<n> ts=<unix> last=<messageId>
//! ```
//!
//! Names are escaped so they stay one token: `\` becomes `\\`, `_` becomes
//! `\_` and a space becomes `_`. Trailing tokens that are not `key=value`
//! pairs are ignored, so newer writers can append hashtags.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants::{BACKUP_MARKER, PROTOCOL_MARKER, ROOT_SENTINEL, SCHEMA_VERSION};
use crate::error::CodecError;
use crate::types::MessageId;

const KIND_DIR: &str = "#dir";
const KIND_FILE: &str = "#file";
const KIND_REMOVED: &str = "#rm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
    pub dir_id: String,
    /// `None` for a root-level directory.
    pub parent_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub dir_id: String,
    pub file_id: String,
    pub name: String,
    pub content_hash: String,
}

/// Marker left in place of a deleted record's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tombstone {
    Dir(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagRecord {
    Dir(DirMeta),
    File(FileMeta),
    Removed(Tombstone),
}

/// Caption of a backup snapshot message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTag {
    pub seq: u64,
    /// Unix seconds at which the snapshot was taken.
    pub taken_at: i64,
    /// Last storage-channel message the snapshot had ingested.
    pub last_message_id: MessageId,
}

fn header() -> String {
    format!("{PROTOCOL_MARKER} #v{SCHEMA_VERSION}")
}

pub fn encode_dir(m: &DirMeta) -> String {
    let parent = m.parent_id.as_deref().unwrap_or(ROOT_SENTINEL);
    format!(
        "{} {KIND_DIR} d={} p={} name={}",
        header(),
        m.dir_id,
        parent,
        escape_name(&m.name)
    )
}

pub fn encode_file(m: &FileMeta) -> String {
    format!(
        "{} {KIND_FILE} d={} f={} n={} h={}",
        header(),
        m.dir_id,
        m.file_id,
        escape_name(&m.name),
        m.content_hash
    )
}

pub fn encode_tombstone(t: &Tombstone) -> String {
    match t {
        Tombstone::Dir(id) => format!("{} {KIND_REMOVED} d={id}", header()),
        Tombstone::File(id) => format!("{} {KIND_REMOVED} f={id}", header()),
    }
}

pub fn encode(record: &TagRecord) -> String {
    match record {
        TagRecord::Dir(m) => encode_dir(m),
        TagRecord::File(m) => encode_file(m),
        TagRecord::Removed(t) => encode_tombstone(t),
    }
}

/// Lenient decode: anything that is not a valid current-version tag yields
/// `None`.
pub fn decode(text: &str) -> Option<TagRecord> {
    parse(text).ok()
}

/// Strict parse that reports why a line was rejected.
pub fn parse(text: &str) -> Result<TagRecord, CodecError> {
    let mut tokens = text.split_whitespace();
    if tokens.next() != Some(PROTOCOL_MARKER) {
        return Err(CodecError::NotTagged);
    }
    let version = tokens.next().ok_or(CodecError::NotTagged)?;
    let version_num = parse_version(version).ok_or(CodecError::NotTagged)?;
    if version_num != SCHEMA_VERSION {
        return Err(CodecError::UnsupportedVersion(version.to_string()));
    }
    let kind = tokens.next().ok_or(CodecError::Missing("kind"))?;
    let fields = kv_map(tokens);

    match kind {
        KIND_DIR => {
            let dir_id = id_field(&fields, "d")?;
            let parent = required(&fields, "p")?;
            let parent_id = if parent == ROOT_SENTINEL {
                None
            } else {
                Some(id_field(&fields, "p")?)
            };
            if parent_id.as_deref() == Some(dir_id.as_str()) {
                return Err(CodecError::Invalid {
                    field: "p",
                    value: parent.to_string(),
                });
            }
            let name = name_field(&fields, "name")?;
            Ok(TagRecord::Dir(DirMeta {
                dir_id,
                parent_id,
                name,
            }))
        }
        KIND_FILE => Ok(TagRecord::File(FileMeta {
            dir_id: id_field(&fields, "d")?,
            file_id: id_field(&fields, "f")?,
            name: name_field(&fields, "n")?,
            content_hash: required(&fields, "h")?.to_string(),
        })),
        KIND_REMOVED => match (fields.get("d"), fields.get("f")) {
            (Some(_), None) => Ok(TagRecord::Removed(Tombstone::Dir(id_field(&fields, "d")?))),
            (None, Some(_)) => Ok(TagRecord::Removed(Tombstone::File(id_field(&fields, "f")?))),
            (None, None) => Err(CodecError::Missing("d|f")),
            (Some(_), Some(_)) => Err(CodecError::Invalid {
                field: "d|f",
                value: "both".to_string(),
            }),
        },
        other => Err(CodecError::UnknownKind(other.to_string())),
    }
}

pub fn encode_backup(tag: &BackupTag) -> String {
    format!(
        "{PROTOCOL_MARKER} {BACKUP_MARKER} #v{SCHEMA_VERSION} seq={} ts={} last={}",
        tag.seq, tag.taken_at, tag.last_message_id
    )
}

pub fn parse_backup(text: &str) -> Result<BackupTag, CodecError> {
    let mut tokens = text.split_whitespace();
    if tokens.next() != Some(PROTOCOL_MARKER) || tokens.next() != Some(BACKUP_MARKER) {
        return Err(CodecError::NotTagged);
    }
    let version = tokens.next().ok_or(CodecError::NotTagged)?;
    if parse_version(version) != Some(SCHEMA_VERSION) {
        return Err(CodecError::UnsupportedVersion(version.to_string()));
    }
    let fields = kv_map(tokens);
    Ok(BackupTag {
        seq: number_field(&fields, "seq")?,
        taken_at: number_field(&fields, "ts")?,
        last_message_id: MessageId(number_field(&fields, "last")?),
    })
}

/// Rules a record name must satisfy to survive the tag format.
pub fn validate_name(name: &str) -> Result<(), CodecError> {
    let invalid = || CodecError::Invalid {
        field: "name",
        value: name.to_string(),
    };
    if name.is_empty() || name.trim() != name {
        return Err(invalid());
    }
    if name
        .chars()
        .any(|c| c == '/' || c.is_control() || (c.is_whitespace() && c != ' '))
    {
        return Err(invalid());
    }
    Ok(())
}

fn parse_version(token: &str) -> Option<u32> {
    token.strip_prefix("#v")?.parse().ok()
}

fn kv_map<'a>(tokens: impl Iterator<Item = &'a str>) -> HashMap<&'a str, &'a str> {
    tokens.filter_map(|t| t.split_once('=')).collect()
}

fn required<'a>(fields: &HashMap<&str, &'a str>, key: &'static str) -> Result<&'a str, CodecError> {
    match fields.get(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CodecError::Missing(key)),
    }
}

fn id_field(fields: &HashMap<&str, &str>, key: &'static str) -> Result<String, CodecError> {
    let value = required(fields, key)?;
    if value == ROOT_SENTINEL || value.contains('=') {
        return Err(CodecError::Invalid {
            field: key,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn name_field(fields: &HashMap<&str, &str>, key: &'static str) -> Result<String, CodecError> {
    let raw = required(fields, key)?;
    let name = unescape_name(raw);
    validate_name(&name)?;
    Ok(name)
}

fn number_field<T: std::str::FromStr>(
    fields: &HashMap<&str, &str>,
    key: &'static str,
) -> Result<T, CodecError> {
    let raw = required(fields, key)?;
    raw.parse().map_err(|_| CodecError::Invalid {
        field: key,
        value: raw.to_string(),
    })
}

fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '_' => out.push_str("\\_"),
            ' ' => out.push('_'),
            other => out.push(other),
        }
    }
    out
}

fn unescape_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '_' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}
