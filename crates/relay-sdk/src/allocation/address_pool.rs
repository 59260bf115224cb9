//! Bitcoin address pool management (§4.6.7). Provisioning is driven by the
//! stats store's notion of "available count" rather than a lock: the pool
//! is the source of truth, so no mutex is needed around the polling loop
//! (§5 "Shared-resource policy").

use std::time::Duration;

use nostr_sdk::prelude::Keys;

use crate::allocation::record::{create_or_update, find_allocation_events, parse_allocation_event};
use crate::error::AllocationError;
use crate::store_trait::{AddressPool, EventStore, WalletService};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_POLLS: u32 = 30;
const MAX_WAIT: Duration = Duration::from_secs(5 * 60);

fn headroom_target(needed: u64) -> u64 {
    needed + std::cmp::max(50, (needed as f64 * 0.2) as u64)
}

/// Poll the address pool until it holds at least `headroom_target(needed)`
/// available addresses, requesting more from the wallet as needed.
pub async fn ensure_sufficient(
    needed: u64,
    pool: &dyn AddressPool,
    wallet: &dyn WalletService,
) -> Result<(), AllocationError> {
    let target = headroom_target(needed);
    let deadline = tokio::time::Instant::now() + MAX_WAIT;

    for _ in 0..MAX_POLLS {
        let available = pool.available_count()?;
        if available >= target {
            return Ok(());
        }
        let deficit = target - available;
        wallet
            .request_addresses(deficit)
            .map_err(|e| AllocationError::WalletUnreachable(e.to_string()))?;

        if tokio::time::Instant::now() >= deadline {
            return Err(AllocationError::AddressPoolTimeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(AllocationError::AddressPoolTimeout)
}

/// Backfill `relay_bitcoin_address` for every allocation record that was
/// created without one. Only meaningful in `subscription` mode.
pub async fn allocate_for_existing_users(
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    pool: &dyn AddressPool,
    wallet: &dyn WalletService,
) -> Result<u64, AllocationError> {
    use nostr_sdk::prelude::{Filter, Kind};

    let filter = Filter::new().kind(Kind::Custom(allocation_kind)).author(relay_keys.public_key());
    let candidates = events.query_events(&filter)?;

    let missing: Vec<_> = candidates
        .iter()
        .filter_map(parse_allocation_event)
        .filter(|snapshot| snapshot.relay_bitcoin_address.is_empty())
        .collect();

    if missing.is_empty() {
        return Ok(0);
    }

    ensure_sufficient(missing.len() as u64, pool, wallet).await?;

    let mut updated = 0;
    for mut snapshot in missing {
        let npub = nostr_sdk::prelude::PublicKey::from_hex(&snapshot.subject_pubkey)
            .ok()
            .and_then(|pk| pk.to_bech32().ok())
            .unwrap_or_else(|| snapshot.subject_pubkey.clone());
        let entry = pool.allocate_for(&npub)?;
        snapshot.relay_bitcoin_address = entry.address;
        create_or_update(&snapshot, allocation_kind, relay_keys, events)?;
        updated += 1;
    }
    let _ = find_allocation_events(relay_keys.public_key().to_hex().as_str(), allocation_kind, relay_keys, events);
    Ok(updated)
}
