//! NIP-01 wire codec: string escaping, canonical hashing, envelope framing.

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::event::{Event, Tag};
use crate::filter::Filter;

/// Errors produced while decoding wire frames or binary records.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
    #[error("unknown envelope label `{0}`")]
    UnknownEnvelope(String),
    #[error("field `{0}` out of range")]
    FieldOutOfRange(&'static str),
    #[error("invalid hex in `{0}`")]
    InvalidHex(&'static str),
    #[error("invalid length for `{field}`: expected {expected}, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("truncated binary record")]
    Truncated,
}

/// Envelopes a client may send over the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEnvelope {
    Event(Event),
    Req { sub: String, filters: Vec<Filter> },
    Count { sub: String, filters: Vec<Filter> },
    Close { sub: String },
    Auth(Event),
}

/// Append `s` to `out` with NIP-01 escaping: `\"`, `\\`, the short escapes
/// for BS/TAB/LF/FF/CR, `\uXXXX` for the remaining C0 controls, everything
/// else untouched.
pub fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{0c}' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            '\u{00}'..='\u{1f}' => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            _ => out.push(c),
        }
    }
}

fn quote_into(out: &mut String, s: &str) {
    out.push('"');
    escape_into(out, s);
    out.push('"');
}

fn tags_into(out: &mut String, tags: &[Tag]) {
    out.push('[');
    for (i, Tag(fields)) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, field) in fields.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            quote_into(out, field);
        }
        out.push(']');
    }
    out.push(']');
}

/// The canonical form `[0,pubkey,created_at,kind,tags,content]` an event id
/// commits to. Shares the escape path with the wire writer so both ends
/// hash identical bytes.
pub fn canonical(ev: &Event) -> String {
    let mut out = String::with_capacity(128 + ev.content.len());
    out.push_str("[0,");
    quote_into(&mut out, &ev.pubkey);
    out.push(',');
    out.push_str(&ev.created_at.to_string());
    out.push(',');
    out.push_str(&ev.kind.to_string());
    out.push(',');
    tags_into(&mut out, &ev.tags);
    out.push(',');
    quote_into(&mut out, &ev.content);
    out.push(']');
    out
}

/// SHA-256 of the canonical form.
pub fn event_id(ev: &Event) -> [u8; 32] {
    Sha256::digest(canonical(ev).as_bytes()).into()
}

/// Hex-encoded canonical hash.
pub fn event_id_hex(ev: &Event) -> String {
    hex::encode(event_id(ev))
}

/// Minified event JSON produced through the same escape path as the
/// canonical form.
pub fn event_json(ev: &Event) -> String {
    let mut out = String::with_capacity(256 + ev.content.len());
    out.push_str("{\"id\":");
    quote_into(&mut out, &ev.id);
    out.push_str(",\"pubkey\":");
    quote_into(&mut out, &ev.pubkey);
    out.push_str(",\"created_at\":");
    out.push_str(&ev.created_at.to_string());
    out.push_str(",\"kind\":");
    out.push_str(&ev.kind.to_string());
    out.push_str(",\"tags\":");
    tags_into(&mut out, &ev.tags);
    out.push_str(",\"content\":");
    quote_into(&mut out, &ev.content);
    out.push_str(",\"sig\":");
    quote_into(&mut out, &ev.sig);
    out.push('}');
    out
}

fn hex_str<'a>(
    v: &'a Value,
    field: &'static str,
    len: usize,
) -> Result<&'a str, CodecError> {
    let s = v
        .as_str()
        .ok_or(CodecError::MalformedJson(format!("`{field}` is not a string")))?;
    if s.len() != len {
        return Err(CodecError::InvalidLength {
            field,
            expected: len,
            got: s.len(),
        });
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(CodecError::InvalidHex(field));
    }
    Ok(s)
}

/// Decode an event object, rejecting unknown fields and out-of-range values.
pub fn event_from_value(v: &Value) -> Result<Event, CodecError> {
    let obj = v
        .as_object()
        .ok_or_else(|| CodecError::MalformedJson("event is not an object".into()))?;
    for key in obj.keys() {
        match key.as_str() {
            "id" | "pubkey" | "created_at" | "kind" | "tags" | "content" | "sig" => {}
            other => {
                return Err(CodecError::MalformedJson(format!(
                    "unexpected event field `{other}`"
                )))
            }
        }
    }
    let missing =
        |f: &'static str| CodecError::MalformedJson(format!("missing event field `{f}`"));
    let id = hex_str(obj.get("id").ok_or_else(|| missing("id"))?, "id", 64)?;
    let pubkey = hex_str(
        obj.get("pubkey").ok_or_else(|| missing("pubkey"))?,
        "pubkey",
        64,
    )?;
    let created_at = obj
        .get("created_at")
        .ok_or_else(|| missing("created_at"))?
        .as_i64()
        .ok_or(CodecError::FieldOutOfRange("created_at"))?;
    let kind = obj
        .get("kind")
        .ok_or_else(|| missing("kind"))?
        .as_u64()
        .filter(|k| *k <= u16::MAX as u64)
        .ok_or(CodecError::FieldOutOfRange("kind"))? as u16;
    let raw_tags = obj
        .get("tags")
        .ok_or_else(|| missing("tags"))?
        .as_array()
        .ok_or_else(|| CodecError::MalformedJson("`tags` is not an array".into()))?;
    let mut tags = Vec::with_capacity(raw_tags.len());
    for raw in raw_tags {
        let fields = raw
            .as_array()
            .ok_or_else(|| CodecError::MalformedJson("tag is not an array".into()))?;
        if fields.is_empty() {
            return Err(CodecError::FieldOutOfRange("tags"));
        }
        let mut tag = Vec::with_capacity(fields.len());
        for f in fields {
            tag.push(
                f.as_str()
                    .ok_or_else(|| {
                        CodecError::MalformedJson("tag element is not a string".into())
                    })?
                    .to_string(),
            );
        }
        tags.push(Tag(tag));
    }
    let content = obj
        .get("content")
        .ok_or_else(|| missing("content"))?
        .as_str()
        .ok_or_else(|| CodecError::MalformedJson("`content` is not a string".into()))?
        .to_string();
    let sig = hex_str(obj.get("sig").ok_or_else(|| missing("sig"))?, "sig", 128)?;
    Ok(Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content,
        sig: sig.to_string(),
    })
}

/// Label-dispatched parse of a client frame.
pub fn parse_client_envelope(text: &str) -> Result<ClientEnvelope, CodecError> {
    let v: Value =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedJson(e.to_string()))?;
    let arr = v
        .as_array()
        .ok_or_else(|| CodecError::MalformedJson("envelope is not an array".into()))?;
    let label = arr
        .first()
        .and_then(|l| l.as_str())
        .ok_or_else(|| CodecError::MalformedJson("envelope has no label".into()))?;
    let sub_at = |i: usize| -> Result<String, CodecError> {
        arr.get(i)
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .ok_or_else(|| CodecError::MalformedJson("missing subscription id".into()))
    };
    match label {
        "EVENT" => {
            if arr.len() != 2 {
                return Err(CodecError::MalformedJson(
                    "EVENT envelope takes exactly one event".into(),
                ));
            }
            Ok(ClientEnvelope::Event(event_from_value(&arr[1])?))
        }
        "AUTH" => {
            if arr.len() != 2 {
                return Err(CodecError::MalformedJson(
                    "AUTH envelope takes exactly one event".into(),
                ));
            }
            Ok(ClientEnvelope::Auth(event_from_value(&arr[1])?))
        }
        "REQ" | "COUNT" => {
            // An empty filter set parses; the subscription layer answers
            // it with a CLOSED frame.
            let sub = sub_at(1)?;
            let mut filters = Vec::with_capacity(arr.len() - 2);
            for f in &arr[2..] {
                filters.push(Filter::from_value(f)?);
            }
            if label == "REQ" {
                Ok(ClientEnvelope::Req { sub, filters })
            } else {
                Ok(ClientEnvelope::Count { sub, filters })
            }
        }
        "CLOSE" => {
            if arr.len() != 2 {
                return Err(CodecError::MalformedJson(
                    "CLOSE envelope takes exactly one subscription id".into(),
                ));
            }
            Ok(ClientEnvelope::Close { sub: sub_at(1)? })
        }
        other => Err(CodecError::UnknownEnvelope(other.to_string())),
    }
}

fn frame2(label: &str, a: &str) -> String {
    let mut out = String::new();
    out.push_str("[\"");
    out.push_str(label);
    out.push_str("\",");
    quote_into(&mut out, a);
    out.push(']');
    out
}

/// `["EVENT",sub,{…}]`
pub fn event_frame(sub: &str, ev: &Event) -> String {
    let mut out = String::with_capacity(256 + ev.content.len());
    out.push_str("[\"EVENT\",");
    quote_into(&mut out, sub);
    out.push(',');
    out.push_str(&event_json(ev));
    out.push(']');
    out
}

/// `["OK",id,bool,msg]`
pub fn ok_frame(id: &str, accepted: bool, msg: &str) -> String {
    let mut out = String::new();
    out.push_str("[\"OK\",");
    quote_into(&mut out, id);
    out.push(',');
    out.push_str(if accepted { "true" } else { "false" });
    out.push(',');
    quote_into(&mut out, msg);
    out.push(']');
    out
}

pub fn eose_frame(sub: &str) -> String {
    frame2("EOSE", sub)
}

pub fn notice_frame(msg: &str) -> String {
    frame2("NOTICE", msg)
}

pub fn auth_frame(challenge: &str) -> String {
    frame2("AUTH", challenge)
}

/// `["CLOSED",sub,msg]`
pub fn closed_frame(sub: &str, msg: &str) -> String {
    let mut out = String::new();
    out.push_str("[\"CLOSED\",");
    quote_into(&mut out, sub);
    out.push(',');
    quote_into(&mut out, msg);
    out.push(']');
    out
}

/// `["COUNT",sub,{"count":n}]`
pub fn count_frame(sub: &str, count: u64) -> String {
    let mut out = String::new();
    out.push_str("[\"COUNT\",");
    quote_into(&mut out, sub);
    out.push_str(",{\"count\":");
    out.push_str(&count.to_string());
    out.push_str("}]");
    out
}

/// Unsigned LEB128 used by the binary event record.
pub fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode an unsigned LEB128 value at `*pos`, advancing it.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(CodecError::Truncated)?;
        *pos += 1;
        if shift >= 64 {
            return Err(CodecError::Truncated);
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

/// Decode a fixed-width hex field.
pub fn decode_hex<const N: usize>(
    s: &str,
    field: &'static str,
) -> Result<[u8; N], CodecError> {
    let bytes = hex::decode(s).map_err(|_| CodecError::InvalidHex(field))?;
    bytes.try_into().map_err(|_| CodecError::InvalidLength {
        field,
        expected: N * 2,
        got: s.len(),
    })
}
