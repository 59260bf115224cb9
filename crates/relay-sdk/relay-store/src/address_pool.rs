use dashmap::DashMap;
use relay_sdk::error::StoreError;
use relay_sdk::store_trait::{AddressPool, AddressPoolEntry, AddressStatus};

/// `DashMap`-backed Bitcoin address pool, keyed by pool index. Allocation
/// scans for the lowest-index `Available` entry; fine for the pool sizes
/// §4.6.7 describes (tens to low hundreds of addresses per headroom top-up).
#[derive(Default)]
pub struct MemoryAddressPool {
    entries: DashMap<u64, AddressPoolEntry>,
}

impl MemoryAddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `count` fresh `available` addresses under `wallet_name`, as a
    /// wallet top-up would after `WalletService::request_addresses`.
    pub fn seed(&self, count: u64, wallet_name: &str) {
        let start = self.entries.len() as u64;
        for i in 0..count {
            let index = start + i;
            self.entries.insert(
                index,
                AddressPoolEntry {
                    index,
                    address: format!("bc1qtest{index}"),
                    wallet_name: wallet_name.to_string(),
                    status: AddressStatus::Available,
                    allocated_at: None,
                    npub: None,
                },
            );
        }
    }
}

impl AddressPool for MemoryAddressPool {
    fn available_count(&self) -> Result<u64, StoreError> {
        Ok(self.entries.iter().filter(|e| e.status == AddressStatus::Available).count() as u64)
    }

    fn allocate_for(&self, npub: &str) -> Result<AddressPoolEntry, StoreError> {
        let mut slot = self
            .entries
            .iter_mut()
            .find(|e| e.status == AddressStatus::Available)
            .ok_or(StoreError::NotFound)?;
        slot.status = AddressStatus::Allocated;
        slot.npub = Some(npub.to_string());
        slot.allocated_at = Some(chrono::Utc::now().timestamp());
        Ok(slot.clone())
    }

    fn mark_used(&self, address: &str) -> Result<(), StoreError> {
        let mut slot = self
            .entries
            .iter_mut()
            .find(|e| e.address == address)
            .ok_or(StoreError::NotFound)?;
        slot.status = AddressStatus::Used;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_and_allocate() {
        let pool = MemoryAddressPool::new();
        pool.seed(3, "hot");
        assert_eq!(pool.available_count().unwrap(), 3);

        let entry = pool.allocate_for("npub1abc").unwrap();
        assert_eq!(pool.available_count().unwrap(), 2);

        pool.mark_used(&entry.address).unwrap();
        assert_eq!(pool.available_count().unwrap(), 2);
    }

    #[test]
    fn allocate_fails_when_exhausted() {
        let pool = MemoryAddressPool::new();
        assert!(pool.allocate_for("npub1abc").is_err());
    }
}
