//! HTTP surface on a single port: WebSocket upgrades, NIP-11 relay
//! information, and a health check.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::publish::Publisher;
use crate::signer::Signer;
use crate::storage::Store;
use crate::ws;

/// Everything a connection handler needs, created once at startup and
/// passed explicitly; there are no ambient singletons.
pub struct AppState {
    pub store: Store,
    pub publisher: Arc<Publisher>,
    pub signer: Arc<dyn Signer>,
    pub cfg: Arc<Settings>,
    next_conn: AtomicU64,
}

impl AppState {
    pub fn new(
        store: Store,
        publisher: Arc<Publisher>,
        signer: Arc<dyn Signer>,
        cfg: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            publisher,
            signer,
            cfg,
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub supported_nips: Vec<u16>,
    pub software: String,
    pub version: String,
    pub limitation: Limitation,
}

#[derive(Serialize, Deserialize)]
pub struct Limitation {
    pub auth_required: bool,
    pub max_subid_length: u16,
}

fn relay_info(cfg: &Settings) -> RelayInfo {
    RelayInfo {
        name: cfg.relay_name.clone(),
        description: cfg.relay_description.clone(),
        supported_nips: vec![1, 9, 11, 42, 45],
        software: "rostr".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        limitation: Limitation {
            auth_required: cfg.auth_required,
            max_subid_length: 64,
        },
    }
}

/// Serve the relay until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = router(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Routes: `/` is both the WebSocket endpoint and the NIP-11 document.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health { status: "ok".to_string() })
}

/// Upgrade to WebSocket when requested; otherwise answer with the NIP-11
/// document for `Accept: application/nostr+json` or a plain banner.
async fn root(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Some(upgrade) = ws {
        return upgrade
            .on_upgrade(move |socket| ws::process(socket, state))
            .into_response();
    }
    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/nostr+json"))
        .unwrap_or(false);
    if wants_info {
        (
            [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
            Json(relay_info(&state.cfg)),
        )
            .into_response()
    } else {
        format!("{}: nostr relay, connect with a websocket\n", state.cfg.relay_name)
            .into_response()
    }
}
