//! C7 — the allocation engine. Owns the allocation-record lifecycle:
//! initialization, tier selection, payment processing, the credit cascade,
//! address-pool provisioning, and reconciliation.

pub mod address_pool;
pub mod payment;
pub mod reconcile;
pub mod record;
pub mod tiers;

use nostr_sdk::prelude::Keys;

use crate::config::RelaySettings;
use crate::error::AllocationError;
use crate::store_trait::{AddressPool, EventStore, WalletService};
use record::{create_if_not_exists, AllocationSnapshot, Storage, SubscriptionStatus};

/// §4.6.1: bring a newly-seen subject into the allocation system. A no-op
/// if a record already exists.
pub async fn initialize(
    subject_hex: &str,
    now: i64,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    pool: &dyn AddressPool,
    wallet: &dyn WalletService,
    settings: &RelaySettings,
) -> Result<(), AllocationError> {
    address_pool::ensure_sufficient(1, pool, wallet).await?;

    let npub = nostr_sdk::prelude::PublicKey::from_hex(subject_hex)
        .ok()
        .and_then(|pk| pk.to_bech32().ok())
        .unwrap_or_else(|| subject_hex.to_string());
    let entry = pool.allocate_for(&npub)?;

    let tier = tiers::select_tier(subject_hex, None, settings).unwrap_or_else(tiers::synthetic_free_tier);
    let total_bytes = if tier.unlimited { record::MAX_BYTES } else { tier.monthly_limit_bytes };
    let expiration = record::add_months(now, 1);

    let snapshot = AllocationSnapshot {
        subject_pubkey: subject_hex.to_string(),
        status: SubscriptionStatus::Active,
        relay_bitcoin_address: entry.address,
        relay_identity_key: relay_keys.public_key().to_hex(),
        storage: Storage { used_bytes: 0, total_bytes, unlimited: tier.unlimited, updated_at: now },
        relay_mode: settings.mode,
        credit_sats: 0,
        active_subscription: Some(record::ActiveSubscription { tier_name: tier.name, expiration_unix: expiration }),
    };

    create_if_not_exists(&snapshot, allocation_kind, relay_keys, events)?;
    Ok(())
}
