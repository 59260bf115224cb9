//! C8 — per-write authorization. Runs after signature validation, before
//! the kind handler. Never stores state; it is a predicate on current
//! state (config + allocation + allowed lists + owner).

use nostr_sdk::prelude::{Keys, PublicKey};

use crate::allocation::record::{allocation_for, AllocationSnapshot};
use crate::config::RelayMode;
use crate::error::{AdmissionError, StoreError};
use crate::store_trait::{EventStore, StatsStore};

pub fn check_admission(
    signer: &PublicKey,
    mode: RelayMode,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    stats: &dyn StatsStore,
) -> Result<(), AdmissionError> {
    let signer_hex = signer.to_hex();
    match mode {
        RelayMode::Public => Ok(()),
        RelayMode::OnlyMe => {
            let owner = stats.get_relay_owner().map_err(store_err)?;
            if owner.as_deref() == Some(signer_hex.as_str()) {
                Ok(())
            } else {
                Err(AdmissionError::NotOwner)
            }
        }
        RelayMode::InviteOnly => {
            let (_read, write) = stats.is_user_in_allowed_lists(&signer_hex).map_err(store_err)?;
            if write {
                Ok(())
            } else {
                Err(AdmissionError::NotAllowed)
            }
        }
        RelayMode::Subscription => {
            let snapshot =
                allocation_for(&signer_hex, allocation_kind, relay_keys, events).map_err(store_err)?;
            match snapshot {
                Some(AllocationSnapshot { storage, .. }) if storage.has_room() => Ok(()),
                _ => Err(AdmissionError::QuotaExhausted),
            }
        }
    }
}

fn store_err(_: StoreError) -> AdmissionError {
    // A backend failure while checking admission is treated the same as
    // "not eligible": admission never stores state, and the caller already
    // logs the underlying StoreError where it is produced.
    AdmissionError::QuotaExhausted
}
