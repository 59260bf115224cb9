//! In-memory store doubles used by this crate's own tests and exported
//! (behind the `testing` feature) for downstream integration tests, the
//! same way the source this crate is grounded on keeps lightweight fakes
//! alongside its real store for exercising business logic without I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use nostr_sdk::prelude::{Event, EventId, Filter};

use crate::error::StoreError;
use crate::store_trait::{AddressPool, AddressPoolEntry, AddressStatus, EventStore, StatsStore, WalletService};

#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<HashMap<EventId, Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStore for InMemoryEventStore {
    fn store_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.lock().unwrap().insert(event.id, event.clone());
        Ok(())
    }

    fn delete_event(&self, id: &EventId) -> Result<(), StoreError> {
        self.events.lock().unwrap().remove(id);
        Ok(())
    }

    fn query_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let events = self.events.lock().unwrap();
        Ok(events.values().filter(|e| filter.match_event(e)).cloned().collect())
    }
}

#[derive(Default)]
struct StatsState {
    credit: HashMap<String, u64>,
    owner: Option<String>,
    allowed_read: HashMap<String, bool>,
    allowed_write: HashMap<String, bool>,
    paid_subscribers: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryStatsStore {
    state: Mutex<StatsState>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, pubkey_hex: impl Into<String>) {
        self.state.lock().unwrap().owner = Some(pubkey_hex.into());
    }

    pub fn allow_write(&self, pubkey_hex: impl Into<String>) {
        self.state.lock().unwrap().allowed_write.insert(pubkey_hex.into(), true);
    }

    pub fn allow_read(&self, pubkey_hex: impl Into<String>) {
        self.state.lock().unwrap().allowed_read.insert(pubkey_hex.into(), true);
    }

    pub fn paid_tier_of(&self, pubkey_hex: &str) -> Option<String> {
        self.state.lock().unwrap().paid_subscribers.get(pubkey_hex).cloned()
    }
}

impl StatsStore for InMemoryStatsStore {
    fn get_subscriber_credit(&self, pubkey_hex: &str) -> Result<u64, StoreError> {
        Ok(self.state.lock().unwrap().credit.get(pubkey_hex).copied().unwrap_or(0))
    }

    fn update_subscriber_credit(&self, pubkey_hex: &str, credit_sats: u64) -> Result<(), StoreError> {
        self.state.lock().unwrap().credit.insert(pubkey_hex.to_string(), credit_sats);
        Ok(())
    }

    fn update_subscriber_credit_with(
        &self,
        pubkey_hex: &str,
        f: &mut dyn FnMut(u64) -> u64,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let current = state.credit.get(pubkey_hex).copied().unwrap_or(0);
        let new_value = f(current);
        state.credit.insert(pubkey_hex.to_string(), new_value);
        Ok(new_value)
    }

    fn get_relay_owner(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().unwrap().owner.clone())
    }

    fn is_user_in_allowed_lists(&self, pubkey_hex: &str) -> Result<(bool, bool), StoreError> {
        let state = self.state.lock().unwrap();
        let read = state.allowed_read.get(pubkey_hex).copied().unwrap_or(false);
        let write = state.allowed_write.get(pubkey_hex).copied().unwrap_or(false);
        Ok((read, write))
    }

    fn mark_paid_subscriber(&self, pubkey_hex: &str, tier_name: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .paid_subscribers
            .insert(pubkey_hex.to_string(), tier_name.to_string());
        Ok(())
    }
}

struct PoolEntry {
    entry: AddressPoolEntry,
}

#[derive(Default)]
pub struct InMemoryAddressPool {
    entries: Mutex<Vec<PoolEntry>>,
}

impl InMemoryAddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `count` fresh `available` addresses, the way a wallet top-up
    /// would after `WalletService::request_addresses`.
    pub fn seed(&self, count: u64, wallet_name: &str) {
        let mut entries = self.entries.lock().unwrap();
        let start = entries.len() as u64;
        for i in 0..count {
            let index = start + i;
            entries.push(PoolEntry {
                entry: AddressPoolEntry {
                    index,
                    address: format!("bcrt1qtest{index}"),
                    wallet_name: wallet_name.to_string(),
                    status: AddressStatus::Available,
                    allocated_at: None,
                    npub: None,
                },
            });
        }
    }
}

impl AddressPool for InMemoryAddressPool {
    fn available_count(&self) -> Result<u64, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().filter(|e| e.entry.status == AddressStatus::Available).count() as u64)
    }

    fn allocate_for(&self, npub: &str) -> Result<AddressPoolEntry, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let slot = entries
            .iter_mut()
            .find(|e| e.entry.status == AddressStatus::Available)
            .ok_or(StoreError::NotFound)?;
        slot.entry.status = AddressStatus::Allocated;
        slot.entry.npub = Some(npub.to_string());
        slot.entry.allocated_at = Some(0);
        Ok(slot.entry.clone())
    }

    fn mark_used(&self, address: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let slot = entries
            .iter_mut()
            .find(|e| e.entry.address == address)
            .ok_or(StoreError::NotFound)?;
        slot.entry.status = AddressStatus::Used;
        Ok(())
    }
}

/// A wallet double that always succeeds and reports healthy; set
/// `unhealthy` to exercise the degraded path.
#[derive(Default)]
pub struct InMemoryWalletService {
    pub unhealthy: std::sync::atomic::AtomicBool,
}

impl InMemoryWalletService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletService for InMemoryWalletService {
    fn request_addresses(&self, _count: u64) -> Result<(), StoreError> {
        Ok(())
    }

    fn health(&self) -> Result<bool, StoreError> {
        Ok(!self.unhealthy.load(std::sync::atomic::Ordering::Relaxed))
    }
}
