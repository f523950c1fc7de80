//! Live subscription registry and event fan-out.
//!
//! The registry maps connection ids to their writer queue handles, never
//! to the connections themselves; the connection layer registers on
//! accept and unregisters on teardown. Delivery never blocks the write
//! path: a full queue kicks the slowest consumer instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::codec;
use crate::event::Event;
use crate::filter::{match_any, Filter};

struct Subscription {
    id: String,
    filters: Vec<Filter>,
}

struct ConnEntry {
    tx: mpsc::Sender<String>,
    kick: Arc<Notify>,
    /// Insertion order is the delivery evaluation order.
    subs: Vec<Subscription>,
}

/// Fan-out hub shared between the ingest pipeline and all connections.
#[derive(Default)]
pub struct Publisher {
    conns: Mutex<HashMap<u64, ConnEntry>>,
}

impl Publisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection's writer queue. `kick` is signalled when the
    /// connection is dropped for falling behind.
    pub fn register(&self, conn_id: u64, tx: mpsc::Sender<String>, kick: Arc<Notify>) {
        let mut conns = self.conns.lock().expect("publisher lock");
        conns.insert(conn_id, ConnEntry { tx, kick, subs: Vec::new() });
    }

    /// Enter the live phase for a subscription. Reusing a subscription id
    /// replaces its filters in place.
    pub fn subscribe(&self, conn_id: u64, sub_id: &str, filters: Vec<Filter>) {
        let mut conns = self.conns.lock().expect("publisher lock");
        let Some(entry) = conns.get_mut(&conn_id) else {
            return;
        };
        if let Some(existing) = entry.subs.iter_mut().find(|s| s.id == sub_id) {
            existing.filters = filters;
        } else {
            entry.subs.push(Subscription { id: sub_id.to_string(), filters });
        }
        debug!(conn_id, sub_id, "subscription live");
    }

    /// Drop one subscription. Idempotent.
    pub fn unsubscribe(&self, conn_id: u64, sub_id: &str) {
        let mut conns = self.conns.lock().expect("publisher lock");
        if let Some(entry) = conns.get_mut(&conn_id) {
            entry.subs.retain(|s| s.id != sub_id);
        }
    }

    /// Drop a connection and everything it subscribed to.
    pub fn remove(&self, conn_id: u64) {
        let mut conns = self.conns.lock().expect("publisher lock");
        conns.remove(&conn_id);
    }

    /// Number of live subscriptions held for a connection.
    pub fn subscription_count(&self, conn_id: u64) -> usize {
        let conns = self.conns.lock().expect("publisher lock");
        conns.get(&conn_id).map(|e| e.subs.len()).unwrap_or(0)
    }

    /// Deliver an event to every matching live subscription. Uses
    /// `try_send` so a stalled connection never blocks the caller; on a
    /// full queue the connection is kicked and unregistered.
    pub fn publish(&self, ev: &Event) {
        let mut conns = self.conns.lock().expect("publisher lock");
        let mut dropped = Vec::new();
        for (&conn_id, entry) in conns.iter() {
            'subs: for sub in &entry.subs {
                if !match_any(&sub.filters, ev) {
                    continue;
                }
                match entry.tx.try_send(codec::event_frame(&sub.id, ev)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(conn_id, "delivery queue full, dropping subscriber");
                        entry.kick.notify_one();
                        dropped.push(conn_id);
                        break 'subs;
                    }
                    Err(TrySendError::Closed(_)) => {
                        dropped.push(conn_id);
                        break 'subs;
                    }
                }
            }
        }
        for conn_id in dropped {
            conns.remove(&conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn ev(kind: u16, ts: i64) -> Event {
        Event {
            id: format!("{:02x}", ts as u8).repeat(32),
            pubkey: "ab".repeat(32),
            created_at: ts,
            kind,
            tags: vec![Tag(vec!["t".into(), "x".into()])],
            content: String::new(),
            sig: "00".repeat(64),
        }
    }

    fn kind_filter(kind: u16) -> Vec<Filter> {
        vec![Filter { kinds: vec![kind], ..Filter::default() }]
    }

    #[tokio::test]
    async fn delivers_to_matching_subscriptions() {
        let publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(8);
        publisher.register(1, tx, Arc::new(Notify::new()));
        publisher.subscribe(1, "a", kind_filter(1));
        publisher.subscribe(1, "b", kind_filter(2));
        publisher.publish(&ev(1, 10));
        let frame = rx.recv().await.unwrap();
        assert!(frame.starts_with("[\"EVENT\",\"a\","));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delivery() {
        let publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(8);
        publisher.register(1, tx, Arc::new(Notify::new()));
        publisher.subscribe(1, "a", kind_filter(1));
        publisher.unsubscribe(1, "a");
        publisher.unsubscribe(1, "a");
        publisher.publish(&ev(1, 10));
        assert!(rx.try_recv().is_err());
        assert_eq!(publisher.subscription_count(1), 0);
    }

    #[tokio::test]
    async fn resubscribe_replaces_filters() {
        let publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(8);
        publisher.register(1, tx, Arc::new(Notify::new()));
        publisher.subscribe(1, "a", kind_filter(1));
        publisher.subscribe(1, "a", kind_filter(2));
        assert_eq!(publisher.subscription_count(1), 1);
        publisher.publish(&ev(1, 10));
        assert!(rx.try_recv().is_err());
        publisher.publish(&ev(2, 11));
        assert!(rx.recv().await.unwrap().contains("\"a\""));
    }

    #[tokio::test]
    async fn full_queue_kicks_connection() {
        let publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(1);
        let kick = Arc::new(Notify::new());
        publisher.register(1, tx, kick.clone());
        publisher.subscribe(1, "a", kind_filter(1));
        let kicked = {
            let kick = kick.clone();
            tokio::spawn(async move { kick.notified().await })
        };
        publisher.publish(&ev(1, 1));
        publisher.publish(&ev(1, 2));
        kicked.await.unwrap();
        assert_eq!(publisher.subscription_count(1), 0);
        // the frame that fit is still there for the writer to drain
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn per_connection_delivery_order_is_insertion_order() {
        let publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(8);
        publisher.register(1, tx, Arc::new(Notify::new()));
        publisher.subscribe(1, "first", kind_filter(1));
        publisher.subscribe(1, "second", kind_filter(1));
        publisher.publish(&ev(1, 10));
        assert!(rx.recv().await.unwrap().contains("\"first\""));
        assert!(rx.recv().await.unwrap().contains("\"second\""));
    }
}
