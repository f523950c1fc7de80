//! NIP-42 challenge/response authentication and read/write gating.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use thiserror::Error;

use crate::codec;
use crate::event::{Event, KIND_AUTH};
use crate::signer::Signer;

/// Accepted clock skew on the auth event's timestamp.
const MAX_SKEW_SECS: i64 = 600;

/// Kinds only the author or a tagged recipient may read back.
const PRIVILEGED_KINDS: [u16; 2] = [4, 1059];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("wrong event kind")]
    WrongKind,
    #[error("missing or mismatched challenge")]
    ChallengeMismatch,
    #[error("relay tag does not name this relay")]
    RelayMismatch,
    #[error("auth event timestamp outside the accepted window")]
    Stale,
    #[error("event id is computed incorrectly")]
    BadId,
    #[error("signature is invalid")]
    BadSignature,
}

/// 32 random bytes, hex encoded, for the `AUTH` challenge.
pub fn new_challenge() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn urls_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
}

/// Validate a client `["AUTH",event]` response against the outstanding
/// challenge. Returns the authenticated pubkey (hex).
pub fn validate_auth(
    ev: &Event,
    challenge: &str,
    relay_url: Option<&str>,
    signer: &dyn Signer,
) -> Result<String, AuthError> {
    if ev.kind != KIND_AUTH {
        return Err(AuthError::WrongKind);
    }
    if !ev.tag_values("challenge").any(|c| c == challenge) {
        return Err(AuthError::ChallengeMismatch);
    }
    if let Some(url) = relay_url {
        if !ev.tag_values("relay").any(|r| urls_equal(r, url)) {
            return Err(AuthError::RelayMismatch);
        }
    }
    if (now() - ev.created_at).abs() > MAX_SKEW_SECS {
        return Err(AuthError::Stale);
    }
    let id = codec::event_id(ev);
    if hex::encode(id) != ev.id {
        return Err(AuthError::BadId);
    }
    let pubkey = ev.pubkey_bytes().map_err(|_| AuthError::BadId)?;
    let sig = ev.sig_bytes().map_err(|_| AuthError::BadSignature)?;
    if !signer.verify(&pubkey, &id, &sig) {
        return Err(AuthError::BadSignature);
    }
    Ok(ev.pubkey.clone())
}

/// Read gating for privileged kinds: only the author or a `p`-tagged
/// recipient may fetch them when auth is enabled.
pub fn can_read(authed_pubkey: Option<&str>, ev: &Event) -> bool {
    if !PRIVILEGED_KINDS.contains(&ev.kind) {
        return true;
    }
    let Some(reader) = authed_pubkey else {
        return false;
    };
    reader == ev.pubkey || ev.tag_values("p").any(|p| p == reader)
}

/// Write gating against the configured allow-list; an empty list leaves
/// the relay open.
pub fn can_write(write_allow: &[String], pubkey: &str) -> bool {
    write_allow.is_empty() || write_allow.iter().any(|p| p == pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::signer::default_signer;

    fn auth_event(
        challenge: &str,
        relay: &str,
        created_at: i64,
    ) -> (Event, std::sync::Arc<dyn Signer>) {
        let signer = default_signer();
        let (sec, pubkey) = signer.generate().unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey),
            created_at,
            kind: KIND_AUTH,
            tags: vec![
                Tag(vec!["relay".into(), relay.into()]),
                Tag(vec!["challenge".into(), challenge.into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let id = codec::event_id(&ev);
        ev.id = hex::encode(id);
        ev.sig = hex::encode(signer.sign(&sec, &id).unwrap());
        (ev, signer)
    }

    #[test]
    fn challenge_is_random_hex() {
        let a = new_challenge();
        let b = new_challenge();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn accepts_valid_auth() {
        let challenge = new_challenge();
        let (ev, signer) = auth_event(&challenge, "wss://relay.example/", now());
        let pubkey = validate_auth(
            &ev,
            &challenge,
            Some("wss://relay.example"),
            signer.as_ref(),
        )
        .unwrap();
        assert_eq!(pubkey, ev.pubkey);
    }

    #[test]
    fn rejects_mismatches() {
        let challenge = new_challenge();
        let (ev, signer) = auth_event(&challenge, "wss://relay.example", now());

        assert!(matches!(
            validate_auth(&ev, "other", None, signer.as_ref()),
            Err(AuthError::ChallengeMismatch)
        ));
        assert!(matches!(
            validate_auth(&ev, &challenge, Some("wss://else.example"), signer.as_ref()),
            Err(AuthError::RelayMismatch)
        ));

        let (stale, signer) = auth_event(&challenge, "r", now() - 2 * MAX_SKEW_SECS);
        assert!(matches!(
            validate_auth(&stale, &challenge, None, signer.as_ref()),
            Err(AuthError::Stale)
        ));

        let (mut wrong_kind, signer) = auth_event(&challenge, "r", now());
        wrong_kind.kind = 1;
        assert!(matches!(
            validate_auth(&wrong_kind, &challenge, None, signer.as_ref()),
            Err(AuthError::WrongKind)
        ));

        let (mut forged, signer) = auth_event(&challenge, "r", now());
        forged.sig = "00".repeat(64);
        assert!(matches!(
            validate_auth(&forged, &challenge, None, signer.as_ref()),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn privileged_read_gating() {
        let author = "aa".repeat(32);
        let peer = "bb".repeat(32);
        let dm = Event {
            id: "00".repeat(32),
            pubkey: author.clone(),
            created_at: 0,
            kind: 4,
            tags: vec![Tag(vec!["p".into(), peer.clone()])],
            content: String::new(),
            sig: "00".repeat(64),
        };
        assert!(can_read(Some(&author), &dm));
        assert!(can_read(Some(&peer), &dm));
        assert!(!can_read(Some(&"cc".repeat(32)), &dm));
        assert!(!can_read(None, &dm));
        let note = Event { kind: 1, ..dm };
        assert!(can_read(None, &note));
    }

    #[test]
    fn write_allow_list() {
        let allow = vec!["aa".repeat(32)];
        assert!(can_write(&[], "anything"));
        assert!(can_write(&allow, &"aa".repeat(32)));
        assert!(!can_write(&allow, &"bb".repeat(32)));
    }
}
