//! Core of a Nostr relay with a tiered storage-subscription layer.
//!
//! This crate owns the connection state machine, the event dispatch and
//! subscription fan-out core, and the allocation engine that turns a
//! relay-signed event into a per-subject storage quota. Persistence is a
//! set of traits (`store_trait`); `relay-store` is this crate's reference
//! in-memory implementation.

pub mod admission;
pub mod allocation;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod kinds;
pub mod registry;
pub mod session;
pub mod store_trait;
pub mod subscription;
pub mod validator;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{Config, RelayMode, RelaySettings};
pub use dispatch::DispatchCore;
pub use error::RelayError;
pub use registry::{KindRegistry, KindRegistryBuilder};
pub use session::Session;
pub use subscription::{ConnId, SubscriptionTable};
