//! Nostr event model, kind classification, and the binary store record.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};

/// Kind reserved for NIP-09 deletion events.
pub const KIND_DELETION: u16 = 5;
/// Kind reserved for NIP-42 authentication events.
pub const KIND_AUTH: u16 = 22242;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// The tag key (first element), empty when the tag has no fields.
    pub fn key(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// The tag value (second element), if present.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// A tag is indexable when its key is a single byte.
    pub fn is_indexable(&self) -> bool {
        self.key().len() == 1
    }
}

/// Core nostr event persisted in the store and served to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Event {
    /// Event identifier (hex of the canonical SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation, seconds.
    pub created_at: i64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Write-rule classes for event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Stored as written, never overwritten.
    Regular,
    /// At most one surviving event per `(pubkey, kind)`.
    Replaceable,
    /// At most one surviving event per `(pubkey, kind, d-tag)`.
    ParamReplaceable,
    /// Fanned out to live subscribers, never persisted.
    Ephemeral,
}

/// Classify a kind number into its write-rule class.
pub fn kind_class(kind: u16) -> KindClass {
    match kind {
        0 | 3 | 10000..=19999 => KindClass::Replaceable,
        20000..=29999 => KindClass::Ephemeral,
        30000..=39999 => KindClass::ParamReplaceable,
        _ => KindClass::Regular,
    }
}

impl Event {
    pub fn class(&self) -> KindClass {
        kind_class(self.kind)
    }

    pub fn is_deletion(&self) -> bool {
        self.kind == KIND_DELETION
    }

    /// First `d` tag value; parameterized-replaceable events with no `d`
    /// tag use the empty string.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.key() == "d")
            .and_then(Tag::value)
            .unwrap_or("")
    }

    /// Values of every tag whose key equals `key`.
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.key() == key)
            .filter_map(Tag::value)
    }

    pub fn id_bytes(&self) -> Result<[u8; 32], CodecError> {
        codec::decode_hex::<32>(&self.id, "id")
    }

    pub fn pubkey_bytes(&self) -> Result<[u8; 32], CodecError> {
        codec::decode_hex::<32>(&self.pubkey, "pubkey")
    }

    pub fn sig_bytes(&self) -> Result<[u8; 64], CodecError> {
        codec::decode_hex::<64>(&self.sig, "sig")
    }

    /// Encode the compact binary record stored under the event's serial:
    /// id(32) pubkey(32) varint(created_at) varint(kind) varint(ntags)
    /// { varint(nfields) { varint(len) bytes } } varint(len) content sig(64).
    pub fn to_record(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(160 + self.content.len());
        out.extend_from_slice(&self.id_bytes()?);
        out.extend_from_slice(&self.pubkey_bytes()?);
        codec::write_varint(&mut out, self.created_at as u64);
        codec::write_varint(&mut out, u64::from(self.kind));
        codec::write_varint(&mut out, self.tags.len() as u64);
        for Tag(fields) in &self.tags {
            codec::write_varint(&mut out, fields.len() as u64);
            for field in fields {
                codec::write_varint(&mut out, field.len() as u64);
                out.extend_from_slice(field.as_bytes());
            }
        }
        codec::write_varint(&mut out, self.content.len() as u64);
        out.extend_from_slice(self.content.as_bytes());
        out.extend_from_slice(&self.sig_bytes()?);
        Ok(out)
    }

    /// Decode a binary record written by [`Event::to_record`].
    pub fn from_record(buf: &[u8]) -> Result<Event, CodecError> {
        let mut pos = 0usize;
        let take = |buf: &[u8], pos: &mut usize, n: usize| -> Result<Vec<u8>, CodecError> {
            let end = pos.checked_add(n).ok_or(CodecError::Truncated)?;
            let slice = buf.get(*pos..end).ok_or(CodecError::Truncated)?;
            *pos = end;
            Ok(slice.to_vec())
        };
        let id = hex::encode(take(buf, &mut pos, 32)?);
        let pubkey = hex::encode(take(buf, &mut pos, 32)?);
        let created_at = codec::read_varint(buf, &mut pos)? as i64;
        let kind = u16::try_from(codec::read_varint(buf, &mut pos)?)
            .map_err(|_| CodecError::FieldOutOfRange("kind"))?;
        let ntags = codec::read_varint(buf, &mut pos)?;
        let mut tags = Vec::with_capacity(ntags.min(64) as usize);
        for _ in 0..ntags {
            let nfields = codec::read_varint(buf, &mut pos)?;
            let mut fields = Vec::with_capacity(nfields.min(16) as usize);
            for _ in 0..nfields {
                let len = codec::read_varint(buf, &mut pos)? as usize;
                let raw = take(buf, &mut pos, len)?;
                fields.push(String::from_utf8(raw).map_err(|_| CodecError::Truncated)?);
            }
            tags.push(Tag(fields));
        }
        let clen = codec::read_varint(buf, &mut pos)? as usize;
        let content =
            String::from_utf8(take(buf, &mut pos, clen)?).map_err(|_| CodecError::Truncated)?;
        let sig = hex::encode(take(buf, &mut pos, 64)?);
        if pos != buf.len() {
            return Err(CodecError::Truncated);
        }
        Ok(Event {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        })
    }
}
