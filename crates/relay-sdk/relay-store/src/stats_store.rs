use std::sync::Mutex;

use dashmap::DashMap;
use relay_sdk::error::StoreError;
use relay_sdk::store_trait::StatsStore;

/// Credit rows are individually mutexed (not just `DashMap`-sharded) per
/// §5's atomic-read-modify-write requirement on a subject's credit row.
/// `DashMap`'s per-shard lock alone isn't enough: it protects each map
/// operation but not a sequence of them, so callers that need an atomic
/// decision (this subject's new credit depends on its current credit) go
/// through `update_subscriber_credit_with`, which holds the row's own
/// `Mutex` for the whole read-decide-write.
#[derive(Default)]
pub struct MemoryStatsStore {
    credit: DashMap<String, Mutex<u64>>,
    owner: Mutex<Option<String>>,
    allowed_read: DashMap<String, ()>,
    allowed_write: DashMap<String, ()>,
    paid_subscribers: DashMap<String, String>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, pubkey_hex: impl Into<String>) {
        *self.owner.lock().unwrap() = Some(pubkey_hex.into());
    }

    pub fn set_allowed_read(&self, pubkey_hex: impl Into<String>, allowed: bool) {
        let key = pubkey_hex.into();
        if allowed {
            self.allowed_read.insert(key, ());
        } else {
            self.allowed_read.remove(&key);
        }
    }

    pub fn set_allowed_write(&self, pubkey_hex: impl Into<String>, allowed: bool) {
        let key = pubkey_hex.into();
        if allowed {
            self.allowed_write.insert(key, ());
        } else {
            self.allowed_write.remove(&key);
        }
    }
}

impl StatsStore for MemoryStatsStore {
    fn get_subscriber_credit(&self, pubkey_hex: &str) -> Result<u64, StoreError> {
        Ok(self.credit.get(pubkey_hex).map(|row| *row.lock().unwrap()).unwrap_or(0))
    }

    fn update_subscriber_credit(&self, pubkey_hex: &str, credit_sats: u64) -> Result<(), StoreError> {
        let row = self.credit.entry(pubkey_hex.to_string()).or_insert_with(|| Mutex::new(0));
        *row.lock().unwrap() = credit_sats;
        Ok(())
    }

    fn update_subscriber_credit_with(
        &self,
        pubkey_hex: &str,
        f: &mut dyn FnMut(u64) -> u64,
    ) -> Result<u64, StoreError> {
        let row = self.credit.entry(pubkey_hex.to_string()).or_insert_with(|| Mutex::new(0));
        let mut guard = row.lock().unwrap();
        *guard = f(*guard);
        Ok(*guard)
    }

    fn get_relay_owner(&self) -> Result<Option<String>, StoreError> {
        Ok(self.owner.lock().unwrap().clone())
    }

    fn is_user_in_allowed_lists(&self, pubkey_hex: &str) -> Result<(bool, bool), StoreError> {
        Ok((self.allowed_read.contains_key(pubkey_hex), self.allowed_write.contains_key(pubkey_hex)))
    }

    fn mark_paid_subscriber(&self, pubkey_hex: &str, tier_name: &str) -> Result<(), StoreError> {
        self.paid_subscribers.insert(pubkey_hex.to_string(), tier_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_round_trips() {
        let stats = MemoryStatsStore::new();
        stats.update_subscriber_credit("abc", 500).unwrap();
        assert_eq!(stats.get_subscriber_credit("abc").unwrap(), 500);
    }

    #[test]
    fn owner_and_allowed_lists() {
        let stats = MemoryStatsStore::new();
        stats.set_owner("abc");
        assert_eq!(stats.get_relay_owner().unwrap().as_deref(), Some("abc"));

        stats.set_allowed_write("def", true);
        let (read, write) = stats.is_user_in_allowed_lists("def").unwrap();
        assert!(!read);
        assert!(write);
    }
}
