use dashmap::DashMap;
use relay_sdk::error::StoreError;
use relay_sdk::store_trait::BlobStore;

/// `DashMap`-backed blob store. Blobs are never written through this trait
/// (§1 non-goals exclude attachment upload); this only serves reads against
/// whatever a caller seeds via `put`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.insert(key.into(), bytes);
    }
}

impl BlobStore for MemoryBlobStore {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.get(key).map(|b| b.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get() {
        let store = MemoryBlobStore::new();
        store.put("k", vec![1, 2, 3]);
        assert_eq!(store.get_blob("k").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.get_blob("missing").unwrap(), None);
    }
}
