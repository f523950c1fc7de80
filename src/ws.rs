//! Per-connection WebSocket processing: one reader, one writer, envelope
//! dispatch. The writer task is the only place that touches the socket
//! sink; handlers enqueue frames on a bounded channel in order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::auth;
use crate::codec::{self, ClientEnvelope};
use crate::filter::Filter;
use crate::ingest;
use crate::server::AppState;

/// Per-connection handler state: the writer queue plus auth progress.
pub struct ConnCtx {
    pub id: u64,
    tx: mpsc::Sender<String>,
    pub authed_pubkey: Option<String>,
    pub challenge: Option<String>,
}

impl ConnCtx {
    /// Enqueue a frame for the writer task, preserving handler order.
    /// Returns false when the connection is gone.
    pub async fn send(&self, frame: String) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Send the AUTH challenge, once per connection.
    pub async fn request_auth(&mut self) {
        if self.challenge.is_none() {
            let challenge = auth::new_challenge();
            self.send(codec::auth_frame(&challenge)).await;
            self.challenge = Some(challenge);
        }
    }
}

/// Drive one accepted WebSocket until it closes.
pub async fn process(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = state.next_conn_id();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.cfg.queue_capacity);
    let kick = Arc::new(Notify::new());
    state.publisher.register(conn_id, tx.clone(), kick.clone());
    debug!(conn_id, "connection open");

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = kick.notified() => {
                    let _ = sink
                        .send(Message::Text(codec::notice_frame("overload")))
                        .await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = ConnCtx {
        id: conn_id,
        tx,
        authed_pubkey: None,
        challenge: None,
    };
    let idle = state.cfg.idle_timeout_secs;
    loop {
        let next = if idle > 0 {
            match tokio::time::timeout(Duration::from_secs(idle), stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!(conn_id, "idle timeout");
                    break;
                }
            }
        } else {
            stream.next().await
        };
        let Some(Ok(msg)) = next else { break };
        match msg {
            Message::Text(text) => dispatch(&state, &mut conn, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.publisher.remove(conn_id);
    drop(conn);
    let _ = writer.await;
    debug!(conn_id, "connection closed");
}

async fn dispatch(state: &Arc<AppState>, conn: &mut ConnCtx, text: &str) {
    match codec::parse_client_envelope(text) {
        Ok(ClientEnvelope::Event(ev)) => ingest::handle_event(state, conn, ev).await,
        Ok(ClientEnvelope::Req { sub, filters }) => {
            handle_req(state, conn, sub, filters).await
        }
        Ok(ClientEnvelope::Count { sub, filters }) => {
            handle_count(state, conn, sub, filters).await
        }
        Ok(ClientEnvelope::Close { sub }) => {
            state.publisher.unsubscribe(conn.id, &sub);
            debug!(conn_id = conn.id, sub, "subscription closed");
        }
        Ok(ClientEnvelope::Auth(ev)) => handle_auth(state, conn, ev).await,
        Err(e) => {
            conn.send(codec::notice_frame(&format!("invalid: {e}"))).await;
        }
    }
}

/// Shared REQ/COUNT admission: subscription id sanity and auth gating.
/// Returns false after answering with a CLOSED frame.
async fn admit_sub(state: &AppState, conn: &mut ConnCtx, sub: &str, filters: &[Filter]) -> bool {
    if sub.is_empty() || sub.len() > 64 {
        conn.send(codec::closed_frame(sub, "invalid: bad subscription id")).await;
        return false;
    }
    if filters.is_empty() {
        conn.send(codec::closed_frame(sub, "invalid: empty filter")).await;
        return false;
    }
    if state.cfg.auth_required && conn.authed_pubkey.is_none() {
        conn.request_auth().await;
        conn.send(codec::closed_frame(sub, "auth-required: subscriptions require authentication"))
            .await;
        return false;
    }
    true
}

async fn handle_req(state: &AppState, conn: &mut ConnCtx, sub: String, filters: Vec<Filter>) {
    if !admit_sub(state, conn, &sub, &filters).await {
        return;
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut satisfied = Vec::with_capacity(filters.len());
    for filter in &filters {
        if filter.limit == Some(0) {
            // Contributes no historic results but may still go live.
            satisfied.push(false);
            continue;
        }
        match state.store.query(filter) {
            Ok(events) => {
                let matched = events.len();
                for ev in events {
                    if state.cfg.auth_required
                        && !auth::can_read(conn.authed_pubkey.as_deref(), &ev)
                    {
                        continue;
                    }
                    if seen.insert(ev.id.clone())
                        && !conn.send(codec::event_frame(&sub, &ev)).await
                    {
                        return;
                    }
                }
                // An ids-only filter that yielded every named id is spent.
                satisfied.push(filter.is_ids_only() && matched >= filter.ids.len());
            }
            Err(e) => {
                error!(error = %e, "query failed");
                let msg = if e.is_transient() {
                    "error: transient, retry"
                } else {
                    "error: could not query store"
                };
                conn.send(codec::closed_frame(&sub, msg)).await;
                return;
            }
        }
    }
    conn.send(codec::eose_frame(&sub)).await;
    if satisfied.iter().all(|s| *s) {
        // No future event can match a fully-answered ids-only REQ.
        conn.send(codec::closed_frame(&sub, "")).await;
    } else {
        state.publisher.subscribe(conn.id, &sub, filters);
    }
}

async fn handle_count(state: &AppState, conn: &mut ConnCtx, sub: String, filters: Vec<Filter>) {
    if !admit_sub(state, conn, &sub, &filters).await {
        return;
    }
    // Single-filter counts skip materialising events; multi-filter
    // disjunctions de-duplicate by id.
    let count = if filters.len() == 1 && !state.cfg.auth_required {
        match state.store.count(&filters[0]) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "count failed");
                conn.send(codec::closed_frame(&sub, "error: transient, retry")).await;
                return;
            }
        }
    } else {
        let mut seen: HashSet<String> = HashSet::new();
        for filter in &filters {
            let unbounded = Filter { limit: None, ..filter.clone() };
            match state.store.query(&unbounded) {
                Ok(events) => {
                    for ev in events {
                        if state.cfg.auth_required
                            && !auth::can_read(conn.authed_pubkey.as_deref(), &ev)
                        {
                            continue;
                        }
                        seen.insert(ev.id);
                    }
                }
                Err(e) => {
                    error!(error = %e, "count query failed");
                    conn.send(codec::closed_frame(&sub, "error: transient, retry")).await;
                    return;
                }
            }
        }
        seen.len() as u64
    };
    conn.send(codec::count_frame(&sub, count)).await;
}

async fn handle_auth(state: &AppState, conn: &mut ConnCtx, ev: crate::event::Event) {
    let Some(challenge) = conn.challenge.clone() else {
        conn.send(codec::ok_frame(&ev.id, false, "invalid: no auth challenge outstanding"))
            .await;
        return;
    };
    match auth::validate_auth(
        &ev,
        &challenge,
        state.cfg.relay_url.as_deref(),
        state.signer.as_ref(),
    ) {
        Ok(pubkey) => {
            info!(conn_id = conn.id, pubkey = %pubkey, "client authenticated");
            conn.authed_pubkey = Some(pubkey);
            conn.send(codec::ok_frame(&ev.id, true, "")).await;
        }
        Err(e) => {
            conn.send(codec::ok_frame(&ev.id, false, &format!("auth-required: {e}")))
                .await;
        }
    }
}
