//! Kind-specific handling beyond the plain `EventStore::store_event` path:
//! replaceable/addressable kinds (§4.5 step 4-5), the repository-permission
//! family (§4.7), and cascade-delete (§4.5).

pub mod cascade_delete;
pub mod permission;
pub mod replaceable;
