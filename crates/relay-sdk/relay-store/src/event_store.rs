use dashmap::DashMap;
use nostr_sdk::prelude::{Event, EventId, Filter};
use relay_sdk::error::StoreError;
use relay_sdk::store_trait::EventStore;

/// `DashMap`-backed event store: sharded-lock concurrency, linear-scan
/// filter matching. Fine for a single node's working set; not meant to
/// scale to a durable multi-relay archive.
#[derive(Default)]
pub struct MemoryEventStore {
    events: DashMap<EventId, Event>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventStore for MemoryEventStore {
    fn store_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.insert(event.id, event.clone());
        Ok(())
    }

    fn delete_event(&self, id: &EventId) -> Result<(), StoreError> {
        self.events.remove(id);
        Ok(())
    }

    fn query_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        Ok(self.events.iter().filter(|entry| filter.match_event(entry.value())).map(|e| e.value().clone()).collect())
    }
}
