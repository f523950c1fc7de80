//! Event ingest pipeline: validate, apply write policy, persist, fan out.

use tracing::{debug, error, info};

use crate::auth;
use crate::codec;
use crate::event::{kind_class, Event, KindClass, KIND_DELETION};
use crate::server::AppState;
use crate::storage::SaveOutcome;
use crate::ws::ConnCtx;

fn is_hex64(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Handle an incoming `["EVENT",…]` frame end to end.
pub async fn handle_event(state: &AppState, conn: &mut ConnCtx, ev: Event) {
    if codec::event_id_hex(&ev) != ev.id {
        conn.send(codec::ok_frame(&ev.id, false, "invalid: id mismatch")).await;
        return;
    }
    let (Ok(id), Ok(pubkey), Ok(sig)) = (ev.id_bytes(), ev.pubkey_bytes(), ev.sig_bytes())
    else {
        conn.send(codec::ok_frame(&ev.id, false, "invalid: malformed hex field")).await;
        return;
    };
    if !state.signer.verify(&pubkey, &id, &sig) {
        conn.send(codec::ok_frame(&ev.id, false, "invalid: bad signature")).await;
        return;
    }
    if state.cfg.auth_required {
        let authed_as_author = conn.authed_pubkey.as_deref() == Some(ev.pubkey.as_str());
        if !authed_as_author {
            conn.request_auth().await;
            conn.send(codec::ok_frame(
                &ev.id,
                false,
                "auth-required: publishing requires authentication as the event author",
            ))
            .await;
            return;
        }
    }
    if !auth::can_write(&state.cfg.write_allow, &ev.pubkey) {
        conn.send(codec::ok_frame(
            &ev.id,
            false,
            "blocked: pubkey not permitted to publish here",
        ))
        .await;
        return;
    }
    if ev.is_deletion() {
        handle_deletion(state, conn, ev).await;
        return;
    }
    match state.store.is_deleted(&ev.id) {
        Ok(true) => {
            conn.send(codec::ok_frame(&ev.id, false, "blocked: event previously deleted"))
                .await;
            return;
        }
        Ok(false) => {}
        Err(e) => {
            error!(error = %e, "deletion marker lookup failed");
            conn.send(codec::ok_frame(&ev.id, false, "error: transient, retry")).await;
            return;
        }
    }
    persist_and_publish(state, conn, ev).await;
}

/// Store the event and fan it out; ephemeral kinds skip the store but
/// still reach live subscribers.
async fn persist_and_publish(state: &AppState, conn: &mut ConnCtx, ev: Event) {
    match state.store.save(&ev) {
        Ok(SaveOutcome::Saved) | Ok(SaveOutcome::Ephemeral) => {
            debug!(id = %ev.id, kind = ev.kind, "event accepted");
            conn.send(codec::ok_frame(&ev.id, true, "")).await;
            state.publisher.publish(&ev);
        }
        Ok(SaveOutcome::Duplicate) => {
            conn.send(codec::ok_frame(&ev.id, true, "duplicate: event already stored"))
                .await;
        }
        Ok(SaveOutcome::Older) => {
            conn.send(codec::ok_frame(
                &ev.id,
                false,
                "invalid: a newer replaceable event exists",
            ))
            .await;
        }
        Err(e) if e.is_transient() => {
            error!(error = %e, "store write failed");
            conn.send(codec::ok_frame(&ev.id, false, "error: transient, retry")).await;
        }
        Err(e) => {
            error!(error = %e, "store rejected event");
            conn.send(codec::ok_frame(&ev.id, false, "error: could not store event"))
                .await;
        }
    }
}

/// Apply a kind-5 deletion: `e` tags name ids, `a` tags name
/// parameterized-replaceable coordinates. The deletion itself persists as
/// a regular event afterwards.
async fn handle_deletion(state: &AppState, conn: &mut ConnCtx, ev: Event) {
    let mut found = 0usize;
    let mut blocked = 0usize;

    let e_targets: Vec<String> = ev.tag_values("e").map(str::to_string).collect();
    for target in e_targets {
        if !is_hex64(&target) {
            conn.send(codec::ok_frame(&ev.id, false, "invalid: bad event id in e tag"))
                .await;
            return;
        }
        if target == ev.id {
            conn.send(codec::ok_frame(
                &ev.id,
                false,
                "blocked: deletion event cannot reference its own id",
            ))
            .await;
            return;
        }
        let referenced = match state.store.get_by_id(&target) {
            Ok(referenced) => referenced,
            Err(e) => {
                error!(error = %e, "referenced event lookup failed");
                conn.send(codec::ok_frame(&ev.id, false, "error: transient, retry")).await;
                return;
            }
        };
        let Some(referenced) = referenced else { continue };
        found += 1;
        if referenced.pubkey != ev.pubkey {
            blocked += 1;
            continue;
        }
        if referenced.created_at > ev.created_at {
            debug!(target = %target, "not deleting, target is newer than the deletion");
            continue;
        }
        if let Err(e) = state
            .store
            .mark_deleted(&target, &ev.pubkey)
            .and_then(|_| state.store.delete_event(&target).map(|_| ()))
        {
            error!(error = %e, "delete failed");
            conn.send(codec::ok_frame(&ev.id, false, "error: transient, retry")).await;
            return;
        }
        info!(target = %target, author = %ev.pubkey, "event deleted");
    }

    let a_targets: Vec<String> = ev.tag_values("a").map(str::to_string).collect();
    for coord in a_targets {
        let parts: Vec<&str> = coord.splitn(3, ':').collect();
        if parts.len() != 3 {
            conn.send(codec::ok_frame(&ev.id, false, "invalid: malformed a tag")).await;
            return;
        }
        let Ok(kind) = parts[0].parse::<u16>() else {
            conn.send(codec::ok_frame(&ev.id, false, "invalid: bad kind in a tag")).await;
            return;
        };
        if !is_hex64(parts[1]) {
            conn.send(codec::ok_frame(&ev.id, false, "invalid: bad pubkey in a tag")).await;
            return;
        }
        if kind == KIND_DELETION {
            conn.send(codec::ok_frame(
                &ev.id,
                false,
                "blocked: deletion events cannot be deleted",
            ))
            .await;
            return;
        }
        if kind_class(kind) != KindClass::ParamReplaceable {
            conn.send(codec::ok_frame(
                &ev.id,
                false,
                "invalid: a tag must name a parameterized replaceable kind",
            ))
            .await;
            return;
        }
        if parts[1] != ev.pubkey {
            conn.send(codec::ok_frame(
                &ev.id,
                false,
                "blocked: cannot delete events of another author",
            ))
            .await;
            return;
        }
        let filter = crate::filter::Filter {
            authors: vec![ev.pubkey.clone()],
            kinds: vec![kind],
            ..Default::default()
        };
        let candidates = match state.store.query(&filter) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "coordinate lookup failed");
                conn.send(codec::ok_frame(&ev.id, false, "error: transient, retry")).await;
                return;
            }
        };
        found += 1;
        for target in candidates {
            if target.d_tag() != parts[2] {
                continue;
            }
            if target.created_at > ev.created_at {
                continue;
            }
            if let Err(e) = state.store.delete_event(&target.id) {
                error!(error = %e, "coordinate delete failed");
                conn.send(codec::ok_frame(&ev.id, false, "error: transient, retry")).await;
                return;
            }
            info!(target = %target.id, coordinate = %coord, "event deleted by coordinate");
        }
    }

    if found > 0 && blocked == found {
        conn.send(codec::ok_frame(
            &ev.id,
            false,
            "blocked: cannot delete events of another author",
        ))
        .await;
        return;
    }

    persist_and_publish(state, conn, ev).await;
}
