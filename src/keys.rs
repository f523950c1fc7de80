//! Store keyspace: fixed-width composite keys for the secondary indexes.
//!
//! Integer fields are big-endian so bytewise key order equals numeric
//! order; timestamps are sign-biased so signed values sort correctly.

use sha2::{Digest, Sha256};

/// Serials are 40-bit so secondary keys stay compact.
pub const SERIAL_MAX: u64 = (1 << 40) - 1;

/// Encode a serial as 5 big-endian bytes.
pub fn serial_bytes(serial: u64) -> [u8; 5] {
    let b = serial.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

/// Decode a 5-byte serial.
pub fn serial_from(b: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out[3..].copy_from_slice(&b[..5]);
    u64::from_be_bytes(out)
}

/// Sign-biased big-endian timestamp encoding.
pub fn ts_bytes(ts: i64) -> [u8; 8] {
    ((ts as u64) ^ (1 << 63)).to_be_bytes()
}

/// Decode a sign-biased timestamp.
pub fn ts_from(b: &[u8]) -> i64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&b[..8]);
    (u64::from_be_bytes(arr) ^ (1 << 63)) as i64
}

/// First 8 bytes of a pubkey given at least 16 hex chars. Pubkeys are
/// themselves hashes, so truncation is collision-tolerated and the
/// post-fetch re-check disambiguates.
pub fn pubkey_hash8(pubkey_hex: &str) -> Option<[u8; 8]> {
    if pubkey_hex.len() < 16 {
        return None;
    }
    let bytes = hex::decode(&pubkey_hex[..16]).ok()?;
    bytes.try_into().ok()
}

/// First 8 bytes of SHA-256 of a tag value. Bounds key widths for
/// arbitrarily long values; exact matching is re-checked after fetch.
pub fn value_hash8(value: &str) -> [u8; 8] {
    let digest = Sha256::digest(value.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// `pkh8(8) ‖ ts(8) ‖ serial(5)`
pub fn author_key(ph8: &[u8; 8], ts: i64, serial: u64) -> [u8; 21] {
    let mut k = [0u8; 21];
    k[..8].copy_from_slice(ph8);
    k[8..16].copy_from_slice(&ts_bytes(ts));
    k[16..].copy_from_slice(&serial_bytes(serial));
    k
}

/// `kind(2) ‖ ts(8) ‖ serial(5)`
pub fn kind_key(kind: u16, ts: i64, serial: u64) -> [u8; 15] {
    let mut k = [0u8; 15];
    k[..2].copy_from_slice(&kind.to_be_bytes());
    k[2..10].copy_from_slice(&ts_bytes(ts));
    k[10..].copy_from_slice(&serial_bytes(serial));
    k
}

/// `pkh8(8) ‖ kind(2) ‖ ts(8) ‖ serial(5)`
pub fn author_kind_key(ph8: &[u8; 8], kind: u16, ts: i64, serial: u64) -> [u8; 23] {
    let mut k = [0u8; 23];
    k[..8].copy_from_slice(ph8);
    k[8..10].copy_from_slice(&kind.to_be_bytes());
    k[10..18].copy_from_slice(&ts_bytes(ts));
    k[18..].copy_from_slice(&serial_bytes(serial));
    k
}

/// `letter(1) ‖ vh8(8) ‖ ts(8) ‖ serial(5)`
pub fn tag_key(letter: u8, vh8: &[u8; 8], ts: i64, serial: u64) -> [u8; 22] {
    let mut k = [0u8; 22];
    k[0] = letter;
    k[1..9].copy_from_slice(vh8);
    k[9..17].copy_from_slice(&ts_bytes(ts));
    k[17..].copy_from_slice(&serial_bytes(serial));
    k
}

/// `ts(8) ‖ serial(5)`
pub fn time_key(ts: i64, serial: u64) -> [u8; 13] {
    let mut k = [0u8; 13];
    k[..8].copy_from_slice(&ts_bytes(ts));
    k[8..].copy_from_slice(&serial_bytes(serial));
    k
}

/// `pkh8(8) ‖ kind(2)`
pub fn replaceable_key(ph8: &[u8; 8], kind: u16) -> [u8; 10] {
    let mut k = [0u8; 10];
    k[..8].copy_from_slice(ph8);
    k[8..].copy_from_slice(&kind.to_be_bytes());
    k
}

/// `pkh8(8) ‖ kind(2) ‖ dh8(8)`
pub fn param_replaceable_key(ph8: &[u8; 8], kind: u16, dh8: &[u8; 8]) -> [u8; 18] {
    let mut k = [0u8; 18];
    k[..8].copy_from_slice(ph8);
    k[8..10].copy_from_slice(&kind.to_be_bytes());
    k[10..].copy_from_slice(dh8);
    k
}

/// Inclusive scan bounds for a prefix with a trailing `ts ‖ serial`
/// tuple, folding `since`/`until` into the key range.
pub fn scan_bounds(
    prefix: &[u8],
    since: Option<i64>,
    until: Option<i64>,
) -> (Vec<u8>, Vec<u8>) {
    let mut lo = prefix.to_vec();
    lo.extend_from_slice(&ts_bytes(since.unwrap_or(i64::MIN)));
    lo.extend_from_slice(&[0u8; 5]);
    let mut hi = prefix.to_vec();
    hi.extend_from_slice(&ts_bytes(until.unwrap_or(i64::MAX)));
    hi.extend_from_slice(&[0xff; 5]);
    (lo, hi)
}

/// Extract the `(ts, serial)` suffix of a composite index key.
pub fn ts_serial_suffix(key: &[u8]) -> (i64, u64) {
    let n = key.len();
    (ts_from(&key[n - 13..n - 5]), serial_from(&key[n - 5..]))
}

/// Inclusive bounds covering every fixed-width key starting with
/// `prefix`, padded out to `width` bytes.
pub fn prefix_bounds(prefix: &[u8], width: usize) -> (Vec<u8>, Vec<u8>) {
    let mut lo = prefix.to_vec();
    lo.resize(width, 0x00);
    let mut hi = prefix.to_vec();
    hi.resize(width, 0xff);
    (lo, hi)
}
