//! Payment processing and the credit cascade (§4.6.3, §4.6.4, §4.6.6).

use nostr_sdk::prelude::Keys;

use crate::allocation::record::{
    add_months, allocation_for, create_or_update, ActiveSubscription, AllocationSnapshot, Storage, MAX_BYTES,
};
use crate::config::{RelaySettings, Tier};
use crate::error::AllocationError;
use crate::store_trait::{EventStore, StatsStore};

fn per_period_bytes(tier: &Tier) -> u64 {
    if tier.unlimited {
        MAX_BYTES
    } else {
        tier.monthly_limit_bytes
    }
}

/// The highest-priced tier whose `price_sats <= amount`; `None` if even the
/// cheapest paid tier is unaffordable.
fn find_matching_tier(amount: u64, settings: &RelaySettings) -> Option<Tier> {
    settings
        .paid_tiers_desc()
        .into_iter()
        .find(|t| t.price_sats <= amount && t.is_valid())
        .cloned()
}

fn extend_expiration(current_active: Option<&ActiveSubscription>, now: i64, periods: u32) -> i64 {
    let base = match current_active {
        Some(active) if active.expiration_unix > now => active.expiration_unix,
        _ => now,
    };
    add_months(base, periods)
}

fn accumulate(storage: &mut Storage, added_bytes: u64, now: i64, unlimited: bool) {
    if unlimited {
        storage.unlimited = true;
        storage.total_bytes = MAX_BYTES;
    } else if !storage.unlimited {
        storage.total_bytes = storage.total_bytes.saturating_add(added_bytes);
    }
    storage.updated_at = now;
}

/// `process_payment`: the entry point a wallet-settlement handler calls once
/// an on-chain payment for `subject_hex` confirms.
pub fn process_payment(
    subject_hex: &str,
    _tx_id: &str,
    amount_sats: u64,
    now: i64,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    stats: &dyn StatsStore,
    settings: &RelaySettings,
) -> Result<(), AllocationError> {
    if amount_sats == 0 {
        return Err(AllocationError::NonPositivePayment);
    }

    let mut snapshot = allocation_for(subject_hex, allocation_kind, relay_keys, events)?
        .ok_or(crate::error::StoreError::NotFound)?;

    let highest = match settings.paid_tiers_desc().into_iter().next() {
        Some(t) => t.clone(),
        None => return Err(AllocationError::NoTierAvailable),
    };

    // Resolve this payment's total and the credit row's post-payment value
    // in one critical section: the closure sees the subject's real-time
    // balance and decides the new one atomically, so a concurrent payment
    // on the same subject can't read the same starting balance twice (§5).
    let mut total = 0u64;
    let mut matched_tier: Option<Tier> = None;
    stats.update_subscriber_credit_with(subject_hex, &mut |existing| {
        total = amount_sats + existing;
        if total > highest.price_sats {
            0
        } else {
            matched_tier = find_matching_tier(total, settings);
            match &matched_tier {
                Some(tier) => total - tier.price_sats,
                None => total,
            }
        }
    })?;

    if total > highest.price_sats {
        return high_tier_path(&mut snapshot, &highest, total, now, allocation_kind, relay_keys, events, stats, settings);
    }

    let Some(tier) = matched_tier else {
        // No tier affordable even with the pre-existing credit: bank the new
        // payment as credit, leave the rest of the record untouched.
        snapshot.credit_sats = total;
        create_or_update(&snapshot, allocation_kind, relay_keys, events)?;
        return Ok(());
    };

    accumulate(&mut snapshot.storage, per_period_bytes(&tier), now, tier.unlimited);
    let expiration = extend_expiration(snapshot.active_subscription.as_ref(), now, 1);
    snapshot.active_subscription = Some(ActiveSubscription { tier_name: tier.name.clone(), expiration_unix: expiration });
    snapshot.credit_sats = total - tier.price_sats;
    create_or_update(&snapshot, allocation_kind, relay_keys, events)?;
    stats.mark_paid_subscriber(subject_hex, &tier.name)?;

    if snapshot.credit_sats > 0 {
        apply_credit_cascade(subject_hex, now, allocation_kind, relay_keys, events, stats, settings)?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn high_tier_path(
    snapshot: &mut AllocationSnapshot,
    highest: &Tier,
    amount: u64,
    now: i64,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    stats: &dyn StatsStore,
    settings: &RelaySettings,
) -> Result<(), AllocationError> {
    let periods = std::cmp::max(1, amount / highest.price_sats) as u32;
    let mut remainder = amount % highest.price_sats;

    accumulate(&mut snapshot.storage, per_period_bytes(highest).saturating_mul(periods as u64), now, highest.unlimited);
    let expiration = extend_expiration(snapshot.active_subscription.as_ref(), now, periods);
    snapshot.active_subscription = Some(ActiveSubscription { tier_name: highest.name.clone(), expiration_unix: expiration });

    let mut other_tiers: Vec<Tier> = settings
        .paid_tiers_desc()
        .into_iter()
        .filter(|t| t.name != highest.name)
        .cloned()
        .collect();
    other_tiers.sort_by(|a, b| b.price_sats.cmp(&a.price_sats));
    let cheapest = other_tiers.iter().map(|t| t.price_sats).min().unwrap_or(u64::MAX);

    for tier in &other_tiers {
        if remainder < cheapest {
            break;
        }
        if tier.price_sats <= remainder {
            remainder -= tier.price_sats;
            accumulate(&mut snapshot.storage, per_period_bytes(tier), now, tier.unlimited);
        }
    }

    // Fold this path's leftover into the credit row atomically rather than
    // overwriting it, since a concurrent payment for the same subject may
    // have banked its own residue into the row in the meantime (§5).
    let new_credit = stats.update_subscriber_credit_with(&snapshot.subject_pubkey, &mut |existing| existing + remainder)?;
    snapshot.credit_sats = new_credit;
    create_or_update(snapshot, allocation_kind, relay_keys, events)?;
    stats.mark_paid_subscriber(&snapshot.subject_pubkey, &highest.name)?;

    if new_credit > 0 {
        apply_credit_cascade(&snapshot.subject_pubkey, now, allocation_kind, relay_keys, events, stats, settings)?;
    }

    Ok(())
}

/// `check_and_apply_credit` (§4.6.6): recursively spend down a subject's
/// banked credit against whatever tier it can now afford.
pub fn apply_credit_cascade(
    subject_hex: &str,
    now: i64,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
    stats: &dyn StatsStore,
    settings: &RelaySettings,
) -> Result<(), AllocationError> {
    loop {
        // Decide whether a tier is affordable and consume its price from the
        // credit row in one atomic step, so two concurrent cascades for the
        // same subject can't both grant a tier off the same starting credit.
        let mut granted: Option<Tier> = None;
        let mut remaining = 0u64;
        stats.update_subscriber_credit_with(subject_hex, &mut |credit| match find_matching_tier(credit, settings) {
            Some(tier) => {
                remaining = credit - tier.price_sats;
                granted = Some(tier);
                remaining
            }
            None => {
                remaining = credit;
                credit
            }
        })?;

        let Some(tier) = granted else {
            return Ok(());
        };

        let mut snapshot = allocation_for(subject_hex, allocation_kind, relay_keys, events)?
            .ok_or(crate::error::StoreError::NotFound)?;

        accumulate(&mut snapshot.storage, per_period_bytes(&tier), now, tier.unlimited);
        let expiration = extend_expiration(snapshot.active_subscription.as_ref(), now, 1);
        snapshot.active_subscription =
            Some(ActiveSubscription { tier_name: tier.name.clone(), expiration_unix: expiration });
        snapshot.credit_sats = remaining;
        create_or_update(&snapshot, allocation_kind, relay_keys, events)?;
        stats.mark_paid_subscriber(subject_hex, &tier.name)?;

        if remaining == 0 {
            return Ok(());
        }
    }
}
