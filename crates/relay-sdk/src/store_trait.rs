//! Traits abstracting the persistence the core calls but never implements
//! itself (event store, stats store, address pool, wallet, blob store).
//!
//! This mirrors the dependency-inversion pattern used elsewhere in this
//! codebase to keep a core crate from depending on a concrete storage
//! backend: the core only ever sees these traits, and a separate crate
//! provides an implementation.

use nostr_sdk::prelude::{Event, EventId, Filter};

use crate::error::StoreError;

/// Event persistence and lookup. Implementations are free to choose their
/// own concurrency discipline; the core assumes each call is independently
/// consistent (§5 shared-resource policy).
pub trait EventStore: Send + Sync + 'static {
    fn store_event(&self, event: &Event) -> Result<(), StoreError>;
    fn delete_event(&self, id: &EventId) -> Result<(), StoreError>;
    fn query_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError>;
}

/// Binary attachments referenced by events, out of scope beyond this call.
pub trait BlobStore: Send + Sync + 'static {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Per-subject bookkeeping that is not itself an event: credit balance,
/// allowed-list membership, and the relay owner. `StatsStore` is the
/// source of truth the allocation engine (C7) and admission filter (C8)
/// read and mutate outside of allocation-record writes.
pub trait StatsStore: Send + Sync + 'static {
    /// Read of the subject's current credit balance, in sats. Not itself a
    /// basis for a later write: a caller that reads here and writes via
    /// `update_subscriber_credit`/`update_subscriber_credit_with` later is
    /// not protected against a concurrent update landing in between.
    fn get_subscriber_credit(&self, pubkey_hex: &str) -> Result<u64, StoreError>;

    /// Unconditional write of the subject's credit row. Only safe to use
    /// when the new value does not depend on the row's current value; a
    /// read-then-decide-then-write needs `update_subscriber_credit_with`
    /// instead so the decision is made under the row's lock (§5).
    fn update_subscriber_credit(&self, pubkey_hex: &str, credit_sats: u64) -> Result<(), StoreError>;

    /// Atomic read-modify-write: `f` is called with the row's current value
    /// while the row is locked, and its return value becomes the new one.
    /// Implementations must hold the row's lock for the full call to `f` so
    /// concurrent updates to the same subject's credit cannot interleave a
    /// read and a write (§5, credit-conservation under concurrent
    /// payments). Returns the value written.
    fn update_subscriber_credit_with(
        &self,
        pubkey_hex: &str,
        f: &mut dyn FnMut(u64) -> u64,
    ) -> Result<u64, StoreError>;

    fn get_relay_owner(&self) -> Result<Option<String>, StoreError>;

    /// `(can_read, can_write)` membership of the pubkey in the respective
    /// allowed lists.
    fn is_user_in_allowed_lists(&self, pubkey_hex: &str) -> Result<(bool, bool), StoreError>;

    /// Record that a subject now holds a non-free tier; used for reporting
    /// only, never read back by the core.
    fn mark_paid_subscriber(&self, pubkey_hex: &str, tier_name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStatus {
    Available,
    Allocated,
    Used,
}

#[derive(Debug, Clone)]
pub struct AddressPoolEntry {
    pub index: u64,
    pub address: String,
    pub wallet_name: String,
    pub status: AddressStatus,
    pub allocated_at: Option<i64>,
    pub npub: Option<String>,
}

/// Bitcoin address pool backing `subscription`-mode allocation (§4.6.7).
pub trait AddressPool: Send + Sync + 'static {
    fn available_count(&self) -> Result<u64, StoreError>;

    /// Reserve one `available` address for `npub`, transitioning it to
    /// `allocated`. Fails if none are available.
    fn allocate_for(&self, npub: &str) -> Result<AddressPoolEntry, StoreError>;

    fn mark_used(&self, address: &str) -> Result<(), StoreError>;
}

/// The wallet's "request N new addresses" / "health" surface. Everything
/// else about the wallet is out of scope.
pub trait WalletService: Send + Sync + 'static {
    fn request_addresses(&self, count: u64) -> Result<(), StoreError>;
    fn health(&self) -> Result<bool, StoreError>;
}
