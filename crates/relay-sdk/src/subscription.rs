//! C4 — the per-connection subscription table, shared by every connection
//! task and the dispatch core. `DashMap` gives per-key (per-connection)
//! locking, which is the right tradeoff for a high-read, moderate-write
//! table (§5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nostr_sdk::prelude::{Event, Filter};
use tokio::sync::{mpsc, Notify};

use crate::wire::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    pub fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A live REQ. `cancel` is the cancellation handle §4.4 requires: fired by
/// `remove`/`remove_all`, observed cooperatively by any long-running
/// handler working on behalf of this subscription.
#[derive(Clone)]
pub struct Subscription {
    pub filters: Arc<Vec<Filter>>,
    pub cancel: Arc<Notify>,
}

impl Subscription {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters: Arc::new(filters), cancel: Arc::new(Notify::new()) }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.match_event(event))
    }
}

struct ConnEntry {
    sender: mpsc::UnboundedSender<ServerMessage>,
    subs: DashMap<String, Subscription>,
}

/// Per-connection set of live subscriptions, wrapped in a process-wide
/// `conn -> per-conn table` map (§4.3).
#[derive(Clone, Default)]
pub struct SubscriptionTable {
    conns: Arc<DashMap<ConnId, ConnEntry>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound channel. Must happen before any
    /// `set` call for that connection.
    pub fn register_conn(&self, conn: ConnId, sender: mpsc::UnboundedSender<ServerMessage>) {
        self.conns.insert(conn, ConnEntry { sender, subs: DashMap::new() });
    }

    /// Insert or overwrite a subscription for `conn`. Overwriting an
    /// existing `sub_id` cancels the one it replaces.
    pub fn set(&self, conn: ConnId, sub_id: impl Into<String>, filters: Vec<Filter>) -> Subscription {
        let subscription = Subscription::new(filters);
        if let Some(entry) = self.conns.get(&conn) {
            let sub_id = sub_id.into();
            if let Some((_, old)) = entry.subs.remove(&sub_id) {
                old.cancel.notify_waiters();
            }
            entry.subs.insert(sub_id, subscription.clone());
        }
        subscription
    }

    /// Drop one subscription and fire its cancellation handle. Drops the
    /// connection entry entirely once it has no subscriptions left.
    pub fn remove(&self, conn: ConnId, sub_id: &str) {
        let mut drop_conn = false;
        if let Some(entry) = self.conns.get(&conn) {
            if let Some((_, sub)) = entry.subs.remove(sub_id) {
                sub.cancel.notify_waiters();
            }
            drop_conn = entry.subs.is_empty();
        }
        if drop_conn {
            self.conns.remove(&conn);
        }
    }

    /// Drop everything for a connection (on disconnect).
    pub fn remove_all(&self, conn: ConnId) {
        if let Some((_, entry)) = self.conns.remove(&conn) {
            for sub in entry.subs.iter() {
                sub.cancel.notify_waiters();
            }
        }
    }

    /// Fan an accepted event out to every live subscription whose filters
    /// match it. Matching is synchronous; a send failure (dead connection)
    /// is logged and does not halt the scan (§4.3).
    pub fn notify(&self, event: &Event) {
        for conn in self.conns.iter() {
            for sub in conn.subs.iter() {
                if sub.matches(event) {
                    let message = ServerMessage::Event {
                        sub_id: sub.key().clone(),
                        event: Box::new(event.clone()),
                    };
                    if conn.sender.send(message).is_err() {
                        log::warn!("dropped EVENT fan-out to closed connection {:?}", conn.key());
                    }
                }
            }
        }
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }
}
