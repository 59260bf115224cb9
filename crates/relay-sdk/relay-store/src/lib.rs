//! Reference in-memory implementation of the `relay-sdk` persistence
//! traits, for single-node operation and tests. Not a durable engine —
//! durability is explicitly out of scope (§1 non-goals).

mod address_pool;
mod blob_store;
mod event_store;
mod stats_store;
mod wallet;

pub use address_pool::MemoryAddressPool;
pub use blob_store::MemoryBlobStore;
pub use event_store::MemoryEventStore;
pub use stats_store::MemoryStatsStore;
pub use wallet::LoggingWalletService;
