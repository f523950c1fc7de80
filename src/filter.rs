//! Nostr filters: parsing from REQ payloads and in-memory matching.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::codec::CodecError;
use crate::event::Event;

/// A conjunctive event predicate. Every non-empty option must admit an
/// event for it to match; a REQ carrying several filters matches their
/// disjunction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Hex id prefixes (bytewise, so even-length).
    pub ids: Vec<String>,
    /// Hex pubkey prefixes.
    pub authors: Vec<String>,
    pub kinds: Vec<u16>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<i64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<i64>,
    /// Cap on returned events, newest first.
    pub limit: Option<usize>,
    /// Indexable tag predicates keyed by single-letter tag name.
    pub tags: BTreeMap<char, Vec<String>>,
}

fn hex_prefixes(v: &Value, field: &'static str) -> Result<Vec<String>, CodecError> {
    let arr = v
        .as_array()
        .ok_or_else(|| CodecError::MalformedJson(format!("`{field}` is not an array")))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| CodecError::MalformedJson(format!("`{field}` entry not a string")))?;
        if s.is_empty() || s.len() > 64 || s.len() % 2 != 0 {
            return Err(CodecError::InvalidLength {
                field,
                expected: 64,
                got: s.len(),
            });
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(CodecError::InvalidHex(field));
        }
        out.push(s.to_string());
    }
    Ok(out)
}

impl Filter {
    /// Parse one filter object from a REQ/COUNT envelope. Unknown
    /// non-tag options are ignored; malformed values in recognised
    /// options are rejected.
    pub fn from_value(v: &Value) -> Result<Filter, CodecError> {
        let obj = v
            .as_object()
            .ok_or_else(|| CodecError::MalformedJson("filter is not an object".into()))?;
        let mut f = Filter::default();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => f.ids = hex_prefixes(val, "ids")?,
                "authors" => f.authors = hex_prefixes(val, "authors")?,
                "kinds" => {
                    let arr = val.as_array().ok_or_else(|| {
                        CodecError::MalformedJson("`kinds` is not an array".into())
                    })?;
                    for k in arr {
                        let k = k
                            .as_u64()
                            .filter(|k| *k <= u16::MAX as u64)
                            .ok_or(CodecError::FieldOutOfRange("kinds"))?;
                        f.kinds.push(k as u16);
                    }
                }
                "since" => {
                    f.since =
                        Some(val.as_i64().ok_or(CodecError::FieldOutOfRange("since"))?)
                }
                "until" => {
                    f.until =
                        Some(val.as_i64().ok_or(CodecError::FieldOutOfRange("until"))?)
                }
                "limit" => {
                    let limit =
                        val.as_u64().ok_or(CodecError::FieldOutOfRange("limit"))?;
                    f.limit = Some(limit as usize);
                }
                tag if tag.starts_with('#') => {
                    let mut letters = tag.chars().skip(1);
                    let letter = letters.next().ok_or_else(|| {
                        CodecError::MalformedJson("empty tag filter name".into())
                    })?;
                    if letters.next().is_some() {
                        return Err(CodecError::MalformedJson(format!(
                            "tag filter `{tag}` is not single-letter"
                        )));
                    }
                    let arr = val.as_array().ok_or_else(|| {
                        CodecError::MalformedJson(format!("`{tag}` is not an array"))
                    })?;
                    let mut values = Vec::with_capacity(arr.len());
                    for item in arr {
                        values.push(
                            item.as_str()
                                .ok_or_else(|| {
                                    CodecError::MalformedJson(format!(
                                        "`{tag}` entry not a string"
                                    ))
                                })?
                                .to_string(),
                        );
                    }
                    f.tags.insert(letter, values);
                }
                other => {
                    tracing::debug!(option = other, "ignoring unknown filter option");
                }
            }
        }
        Ok(f)
    }

    /// Whether this filter admits the event.
    pub fn matches(&self, ev: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|p| ev.id.starts_with(p.as_str())) {
            return false;
        }
        if !self.authors.is_empty()
            && !self.authors.iter().any(|p| ev.pubkey.starts_with(p.as_str()))
        {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&ev.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (letter, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            let key = letter.to_string();
            let hit = ev
                .tag_values(&key)
                .any(|v| values.iter().any(|want| want == v));
            if !hit {
                return false;
            }
        }
        true
    }

    /// True when the filter pins explicit ids, so it can never match more
    /// events than it names.
    pub fn is_ids_only(&self) -> bool {
        !self.ids.is_empty()
    }
}

/// Disjunction over a REQ's filter set.
pub fn match_any(filters: &[Filter], ev: &Event) -> bool {
    filters.iter().any(|f| f.matches(ev))
}
