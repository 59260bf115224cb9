//! Reconciliation (§4.6.8, §4.6.9) and the daily free-tier renewal
//! (§4.6.10). The debounce timer and the renewal loop are the two
//! process-wide background tasks this crate owns outside of connection
//! handling.

use std::time::Duration;

use nostr_sdk::prelude::{Filter, Keys, Kind};
use tokio::sync::mpsc;

use crate::allocation::record::{
    allocation_for, create_or_update, parse_allocation_event, ActiveSubscription, AllocationSnapshot,
    SubscriptionStatus, MAX_BYTES,
};
use crate::allocation::{address_pool, tiers};
use crate::config::{Config, RelayMode, RelaySettings};
use crate::error::{AllocationError, StoreError};
use crate::store_trait::{AddressPool, EventStore, StatsStore, WalletService};

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);
const BATCH_SIZE: usize = 50;

pub enum ReconcileOutcome {
    Delete,
    Unchanged,
    Rewrite(Box<AllocationSnapshot>),
}

/// §4.6.9: classify a single record against the current settings and either
/// flag it for deletion, leave it alone, or return the record it should
/// become.
pub fn process_single(
    snapshot: &AllocationSnapshot,
    is_owner: bool,
    settings: &RelaySettings,
    now: i64,
) -> ReconcileOutcome {
    let old = snapshot.relay_mode;
    let new = settings.mode;

    if matches!(new, RelayMode::OnlyMe) && !is_owner {
        return ReconcileOutcome::Delete;
    }
    if matches!(new, RelayMode::InviteOnly) {
        let allowed = settings.allowed_read.contains(&snapshot.subject_pubkey)
            || settings.allowed_write.contains(&snapshot.subject_pubkey);
        if !allowed {
            return ReconcileOutcome::Delete;
        }
    }

    let current_tier_obj = snapshot
        .active_subscription
        .as_ref()
        .and_then(|a| settings.tier_by_name(&a.tier_name));
    let expected_tier = tiers::select_tier(&snapshot.subject_pubkey, current_tier_obj, settings);

    let mut next = snapshot.clone();
    next.relay_mode = new;

    if matches!(new, RelayMode::OnlyMe) {
        next.storage.unlimited = true;
        next.storage.total_bytes = MAX_BYTES;
        next.storage.updated_at = now;
    } else if matches!(old, RelayMode::OnlyMe) {
        next.storage.unlimited = false;
        if let Some(tier) = &expected_tier {
            next.storage.total_bytes = tier.monthly_limit_bytes;
        }
        next.storage.updated_at = now;
    } else if old.is_free() && new.is_free() {
        match &expected_tier {
            Some(tier) => {
                next.storage.total_bytes = tier.monthly_limit_bytes;
                next.active_subscription = Some(ActiveSubscription {
                    tier_name: tier.name.clone(),
                    expiration_unix: snapshot.active_subscription.as_ref().map(|a| a.expiration_unix).unwrap_or(now),
                });
            }
            None => next.active_subscription = None,
        }
        next.storage.updated_at = now;
    } else if old.is_free() && new.is_paid() {
        return ReconcileOutcome::Unchanged;
    } else if old.is_paid() && new.is_free() {
        if let Some(tier) = &expected_tier {
            next.storage.total_bytes = tier.monthly_limit_bytes;
        }
        next.storage.updated_at = now;
    } else if let Some(tier) = &expected_tier {
        next.storage.total_bytes = tier.monthly_limit_bytes;
        next.storage.updated_at = now;
    }

    let tier_changed = next.active_subscription.as_ref().map(|a| &a.tier_name)
        != snapshot.active_subscription.as_ref().map(|a| &a.tier_name);
    let bytes_changed =
        next.storage.total_bytes != snapshot.storage.total_bytes || next.storage.unlimited != snapshot.storage.unlimited;
    let status_mismatch = snapshot.status == SubscriptionStatus::Inactive && next.storage.total_bytes > 0;
    let mode_mismatch = snapshot.relay_mode != new;

    if tier_changed || bytes_changed || status_mismatch || mode_mismatch {
        if status_mismatch {
            next.status = SubscriptionStatus::Active;
        }
        ReconcileOutcome::Rewrite(Box::new(next))
    } else {
        ReconcileOutcome::Unchanged
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub scanned: usize,
    pub rewritten: usize,
    pub deleted: usize,
}

/// §4.6.8: scan every allocation record and apply `process_single`, in
/// chunks of `BATCH_SIZE`. `EventStore` exposes no pagination token, so the
/// "batches of 50" framing is implemented as chunking the full result set
/// rather than repeated bounded queries.
pub async fn run_batch_reconciliation(
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    pool: &dyn AddressPool,
    wallet: &dyn WalletService,
    settings: &RelaySettings,
    now: i64,
) -> Result<ReconcileStats, AllocationError> {
    let filter = Filter::new().kind(Kind::Custom(allocation_kind)).author(relay_keys.public_key());
    let records: Vec<AllocationSnapshot> = events.query_events(&filter)?.iter().filter_map(parse_allocation_event).collect();

    let mut stats = ReconcileStats::default();
    for batch in records.chunks(BATCH_SIZE) {
        stats.scanned += batch.len();
        for record in batch {
            let is_owner = settings.is_owner(&record.subject_pubkey);
            match process_single(record, is_owner, settings, now) {
                ReconcileOutcome::Delete => {
                    for event in events.query_events(&filter)? {
                        if let Some(parsed) = parse_allocation_event(&event) {
                            if parsed.subject_pubkey == record.subject_pubkey {
                                events.delete_event(&event.id)?;
                            }
                        }
                    }
                    stats.deleted += 1;
                }
                ReconcileOutcome::Rewrite(next) => {
                    create_or_update(&next, allocation_kind, relay_keys, events)?;
                    stats.rewritten += 1;
                }
                ReconcileOutcome::Unchanged => {}
            }
        }
    }

    if matches!(settings.mode, RelayMode::Subscription) {
        address_pool::allocate_for_existing_users(allocation_kind, relay_keys, events, pool, wallet).await?;
    }

    Ok(stats)
}

/// A handle the rest of the process uses to request a reconciliation pass.
/// Repeated triggers within `DEBOUNCE_WINDOW` reset the timer rather than
/// queuing extra passes — this is the sliding-window debounce §4.6.8 calls
/// for.
#[derive(Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::UnboundedSender<()>,
}

impl ReconcileTrigger {
    pub fn fire(&self) {
        let _ = self.tx.send(());
    }
}

/// Spawn the debounce loop. Runs until the process shuts down; at most one
/// reconciliation pass runs at a time (§5).
#[allow(clippy::too_many_arguments)]
pub fn spawn_debounced_reconciler(
    allocation_kind: u16,
    relay_keys: Keys,
    events: std::sync::Arc<dyn EventStore>,
    pool: std::sync::Arc<dyn AddressPool>,
    wallet: std::sync::Arc<dyn WalletService>,
    config: Config,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> ReconcileTrigger {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                received = rx.recv() => {
                    if received.is_none() {
                        return;
                    }
                    // Drain further triggers until the window passes quietly.
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(DEBOUNCE_WINDOW) => break,
                            more = rx.recv() => {
                                if more.is_none() {
                                    return;
                                }
                            }
                        }
                    }
                    let settings = config.current();
                    let now = chrono::Utc::now().timestamp();
                    if let Err(err) =
                        run_batch_reconciliation(allocation_kind, &relay_keys, events.as_ref(), pool.as_ref(), wallet.as_ref(), &settings, now)
                            .await
                    {
                        log::error!("reconciliation pass failed: {err}");
                    }
                }
            }
        }
    });

    ReconcileTrigger { tx }
}

/// §4.6.10: background loop firing at 00:01 local time daily, resetting
/// free-tier storage for expired records.
pub async fn run_daily_renewal(
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    settings: &RelaySettings,
    now: i64,
) -> Result<usize, StoreError> {
    if !settings.mode.is_free() {
        return Ok(0);
    }
    let filter = Filter::new().kind(Kind::Custom(allocation_kind)).author(relay_keys.public_key());
    let records: Vec<AllocationSnapshot> = events.query_events(&filter)?.iter().filter_map(parse_allocation_event).collect();

    let mut renewed = 0;
    for mut record in records {
        let Some(active) = &record.active_subscription else { continue };
        let tier = settings.tier_by_name(&active.tier_name);
        let is_free_tier = tier.map(|t| t.is_free()).unwrap_or(false);
        if !is_free_tier || active.expiration_unix > now {
            continue;
        }
        record.storage.used_bytes = 0;
        record.storage.updated_at = now;
        let expiration = crate::allocation::record::add_months(now, 1);
        record.active_subscription = Some(ActiveSubscription { tier_name: active.tier_name.clone(), expiration_unix: expiration });
        create_or_update(&record, allocation_kind, relay_keys, events)?;
        renewed += 1;
    }
    Ok(renewed)
}

/// Sleep until the next 00:01 local time, the cadence the renewal loop
/// runs on. Exposed so `main` can drive the loop without duplicating the
/// time math.
pub fn duration_until_next_renewal(now_local: chrono::DateTime<chrono::Local>) -> Duration {
    use chrono::Timelike;
    let today_renewal = now_local
        .date_naive()
        .and_hms_opt(0, 1, 0)
        .and_then(|naive| naive.and_local_timezone(chrono::Local).single());
    let next = match today_renewal {
        Some(t) if t > now_local => t,
        _ => {
            let tomorrow = now_local.date_naive() + chrono::Duration::days(1);
            tomorrow
                .and_hms_opt(0, 1, 0)
                .and_then(|naive| naive.and_local_timezone(chrono::Local).single())
                .unwrap_or(now_local)
        }
    };
    let secs = (next - now_local).num_seconds().max(1) as u64;
    let _ = now_local.second();
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::record::Storage;
    use crate::config::Tier;
    use crate::testing::InMemoryEventStore;

    fn settings_with_mode(mode: RelayMode) -> RelaySettings {
        RelaySettings { mode, ..RelaySettings::default() }
    }

    #[test]
    fn only_me_deletes_non_owner_records() {
        let settings = settings_with_mode(RelayMode::OnlyMe);
        let snapshot = AllocationSnapshot {
            subject_pubkey: "abc".into(),
            status: SubscriptionStatus::Active,
            relay_bitcoin_address: String::new(),
            relay_identity_key: "r".into(),
            storage: Storage::zero(0),
            relay_mode: RelayMode::Public,
            credit_sats: 0,
            active_subscription: None,
        };
        assert!(matches!(process_single(&snapshot, false, &settings, 0), ReconcileOutcome::Delete));
    }

    #[test]
    fn only_me_owner_gets_unlimited_storage() {
        let settings = settings_with_mode(RelayMode::OnlyMe);
        let snapshot = AllocationSnapshot {
            subject_pubkey: "abc".into(),
            status: SubscriptionStatus::Active,
            relay_bitcoin_address: String::new(),
            relay_identity_key: "r".into(),
            storage: Storage::zero(0),
            relay_mode: RelayMode::Public,
            credit_sats: 0,
            active_subscription: None,
        };
        match process_single(&snapshot, true, &settings, 100) {
            ReconcileOutcome::Rewrite(next) => assert!(next.storage.unlimited),
            _ => panic!("expected a rewrite"),
        }
    }

    #[test]
    fn free_to_paid_keeps_current_allocation() {
        let mut settings = settings_with_mode(RelayMode::Subscription);
        settings.tiers.push(Tier { name: "bronze".into(), price_sats: 1000, monthly_limit_bytes: 5, unlimited: false });
        let snapshot = AllocationSnapshot {
            subject_pubkey: "abc".into(),
            status: SubscriptionStatus::Active,
            relay_bitcoin_address: String::new(),
            relay_identity_key: "r".into(),
            storage: Storage { used_bytes: 0, total_bytes: 100, unlimited: false, updated_at: 0 },
            relay_mode: RelayMode::Public,
            credit_sats: 0,
            active_subscription: None,
        };
        assert!(matches!(process_single(&snapshot, false, &settings, 0), ReconcileOutcome::Unchanged));
    }

    #[tokio::test]
    async fn daily_renewal_skipped_in_subscription_mode() {
        let events = InMemoryEventStore::new();
        let relay_keys = Keys::generate();
        let settings = settings_with_mode(RelayMode::Subscription);
        let renewed = run_daily_renewal(11888, &relay_keys, &events, &settings, 0).await.unwrap();
        assert_eq!(renewed, 0);
    }
}
