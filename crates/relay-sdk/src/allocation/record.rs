//! Allocation record shape, tag encoding, and the write protocol shared by
//! every C7 entry point (§3 "Allocation record", §4.6.5).

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::RelayMode;
use crate::error::StoreError;
use crate::store_trait::EventStore;

pub const STORAGE_UNLIMITED: &str = "unlimited";
/// Sentinel "total bytes" standing in for an unlimited quota (§4.6.4).
pub const MAX_BYTES: u64 = u64::MAX;

pub const TAG_SUBSCRIPTION_DURATION: &str = "subscription_duration";
pub const TAG_SUBSCRIPTION_STATUS: &str = "subscription_status";
pub const TAG_RELAY_BITCOIN_ADDRESS: &str = "relay_bitcoin_address";
pub const TAG_RELAY_DHT_KEY: &str = "relay_dht_key";
pub const TAG_STORAGE: &str = "storage";
pub const TAG_RELAY_MODE: &str = "relay_mode";
pub const TAG_CREDIT: &str = "credit";
pub const TAG_ACTIVE_SUBSCRIPTION: &str = "active_subscription";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

impl SubscriptionStatus {
    fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "inactive" => Some(SubscriptionStatus::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub unlimited: bool,
    pub updated_at: i64,
}

impl Storage {
    pub fn zero(updated_at: i64) -> Self {
        Self { used_bytes: 0, total_bytes: 0, unlimited: false, updated_at }
    }

    pub fn has_room(&self) -> bool {
        self.unlimited || self.used_bytes < self.total_bytes
    }

    fn total_str(&self) -> String {
        if self.unlimited {
            STORAGE_UNLIMITED.to_string()
        } else {
            self.total_bytes.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    pub tier_name: String,
    pub expiration_unix: i64,
}

/// In-memory view of an allocation record, independent of its event
/// encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSnapshot {
    pub subject_pubkey: String,
    pub status: SubscriptionStatus,
    pub relay_bitcoin_address: String,
    pub relay_identity_key: String,
    pub storage: Storage,
    pub relay_mode: RelayMode,
    pub credit_sats: u64,
    pub active_subscription: Option<ActiveSubscription>,
}

fn tag_values(event: &Event, key: &str) -> Option<Vec<String>> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        if slice.first().map(|s| s.as_str()) == Some(key) {
            Some(slice.to_vec())
        } else {
            None
        }
    })
}

/// Build the ordered tag list for an allocation event (§6 wire format).
pub fn build_tags(snapshot: &AllocationSnapshot) -> Vec<Tag> {
    let mut tags = vec![
        Tag::custom(TagKind::custom(TAG_SUBSCRIPTION_DURATION), vec!["1 month".to_string()]),
        Tag::public_key(
            PublicKey::from_hex(&snapshot.subject_pubkey).expect("subject pubkey must be valid hex"),
        ),
        Tag::custom(TagKind::custom(TAG_SUBSCRIPTION_STATUS), vec![snapshot.status.as_str().to_string()]),
        Tag::custom(TagKind::custom(TAG_RELAY_BITCOIN_ADDRESS), vec![snapshot.relay_bitcoin_address.clone()]),
        Tag::custom(TagKind::custom(TAG_RELAY_DHT_KEY), vec![snapshot.relay_identity_key.clone()]),
        Tag::custom(
            TagKind::custom(TAG_STORAGE),
            vec![
                snapshot.storage.used_bytes.to_string(),
                snapshot.storage.total_str(),
                snapshot.storage.updated_at.to_string(),
            ],
        ),
        Tag::custom(TagKind::custom(TAG_RELAY_MODE), vec![mode_str(snapshot.relay_mode).to_string()]),
    ];
    if snapshot.credit_sats > 0 {
        tags.push(Tag::custom(TagKind::custom(TAG_CREDIT), vec![snapshot.credit_sats.to_string()]));
    }
    if let Some(active) = &snapshot.active_subscription {
        tags.push(Tag::custom(
            TagKind::custom(TAG_ACTIVE_SUBSCRIPTION),
            vec![active.tier_name.clone(), active.expiration_unix.to_string()],
        ));
    }
    tags
}

fn mode_str(mode: RelayMode) -> &'static str {
    match mode {
        RelayMode::Public => "public",
        RelayMode::Subscription => "subscription",
        RelayMode::InviteOnly => "invite-only",
        RelayMode::OnlyMe => "only-me",
    }
}

fn parse_mode(s: &str) -> Option<RelayMode> {
    match s {
        "public" => Some(RelayMode::Public),
        "subscription" => Some(RelayMode::Subscription),
        "invite-only" => Some(RelayMode::InviteOnly),
        "only-me" => Some(RelayMode::OnlyMe),
        _ => None,
    }
}

/// Reconstruct a snapshot from a stored allocation event.
pub fn parse_allocation_event(event: &Event) -> Option<AllocationSnapshot> {
    let p = tag_values(event, "p")?;
    let subject_pubkey = p.get(1)?.clone();

    let status = tag_values(event, TAG_SUBSCRIPTION_STATUS)
        .and_then(|v| v.get(1).and_then(|s| SubscriptionStatus::parse(s)))
        .unwrap_or(SubscriptionStatus::Inactive);

    let relay_bitcoin_address = tag_values(event, TAG_RELAY_BITCOIN_ADDRESS)
        .and_then(|v| v.get(1).cloned())
        .unwrap_or_default();

    let relay_identity_key = tag_values(event, TAG_RELAY_DHT_KEY)
        .and_then(|v| v.get(1).cloned())
        .unwrap_or_default();

    let storage_tag = tag_values(event, TAG_STORAGE)?;
    let used_bytes: u64 = storage_tag.get(1)?.parse().ok()?;
    let total_raw = storage_tag.get(2)?;
    let (unlimited, total_bytes) = if total_raw == STORAGE_UNLIMITED {
        (true, MAX_BYTES)
    } else {
        (false, total_raw.parse().ok()?)
    };
    let updated_at: i64 = storage_tag.get(3)?.parse().ok()?;
    let storage = Storage { used_bytes, total_bytes, unlimited, updated_at };

    let relay_mode = tag_values(event, TAG_RELAY_MODE)
        .and_then(|v| v.get(1).and_then(|s| parse_mode(s)))?;

    let credit_sats = tag_values(event, TAG_CREDIT)
        .and_then(|v| v.get(1).and_then(|s| s.parse().ok()))
        .unwrap_or(0);

    let active_subscription = tag_values(event, TAG_ACTIVE_SUBSCRIPTION).and_then(|v| {
        Some(ActiveSubscription { tier_name: v.get(1)?.clone(), expiration_unix: v.get(2)?.parse().ok()? })
    });

    Some(AllocationSnapshot {
        subject_pubkey,
        status,
        relay_bitcoin_address,
        relay_identity_key,
        storage,
        relay_mode,
        credit_sats,
        active_subscription,
    })
}

/// Add `months` calendar months to a unix timestamp (§4.6.3 expiration
/// extension). Falls back to the input unchanged on an out-of-range date,
/// which should not occur for any timestamp this crate produces.
pub fn add_months(unix_ts: i64, months: u32) -> i64 {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_opt(unix_ts, 0)
        .single()
        .and_then(|dt| dt.checked_add_months(chrono::Months::new(months)))
        .map(|dt| dt.timestamp())
        .unwrap_or(unix_ts)
}

/// Query prior allocation events for `subject_hex`, checking both the hex
/// and bech32 forms of the pubkey (§3, §9 "Pubkey normalization").
pub fn find_allocation_events(
    subject_hex: &str,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
) -> Result<Vec<Event>, StoreError> {
    let subject_bech32 = PublicKey::from_hex(subject_hex).ok().and_then(|pk| pk.to_bech32().ok());
    let filter = Filter::new().kind(Kind::Custom(allocation_kind)).author(relay_keys.public_key());
    let candidates = events.query_events(&filter)?;
    let matches = candidates
        .into_iter()
        .filter(|event| {
            tag_values(event, "p")
                .and_then(|v| v.get(1).cloned())
                .map(|subject| subject == subject_hex || Some(subject.as_str()) == subject_bech32.as_deref())
                .unwrap_or(false)
        })
        .collect();
    Ok(matches)
}

pub fn allocation_for(
    subject_hex: &str,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
) -> Result<Option<AllocationSnapshot>, StoreError> {
    let existing = find_allocation_events(subject_hex, allocation_kind, relay_keys, events)?;
    Ok(existing.iter().find_map(parse_allocation_event))
}

fn build_event(snapshot: &AllocationSnapshot, allocation_kind: u16, relay_keys: &Keys) -> Event {
    let tags = build_tags(snapshot);
    EventBuilder::new(Kind::Custom(allocation_kind), "")
        .tags(tags)
        .sign_with_keys(relay_keys)
        .expect("signing an allocation event with the relay's own key cannot fail")
}

/// `create_or_update`: delete every existing record for the subject (both
/// pubkey forms), then store a freshly signed replacement (§4.6.5).
pub fn create_or_update(
    snapshot: &AllocationSnapshot,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
) -> Result<Event, StoreError> {
    let existing = find_allocation_events(&snapshot.subject_pubkey, allocation_kind, relay_keys, events)?;
    for event in &existing {
        events.delete_event(&event.id)?;
    }
    let event = build_event(snapshot, allocation_kind, relay_keys);
    events.store_event(&event)?;
    Ok(event)
}

/// `create_if_not_exists`: identical to `create_or_update` except it
/// returns early if a record already exists.
pub fn create_if_not_exists(
    snapshot: &AllocationSnapshot,
    allocation_kind: u16,
    relay_keys: &Keys,
    events: &dyn EventStore,
) -> Result<Option<Event>, StoreError> {
    let existing = find_allocation_events(&snapshot.subject_pubkey, allocation_kind, relay_keys, events)?;
    if !existing.is_empty() {
        return Ok(None);
    }
    let event = build_event(snapshot, allocation_kind, relay_keys);
    events.store_event(&event)?;
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryEventStore;

    fn sample_snapshot(subject: &str) -> AllocationSnapshot {
        AllocationSnapshot {
            subject_pubkey: subject.to_string(),
            status: SubscriptionStatus::Active,
            relay_bitcoin_address: String::new(),
            relay_identity_key: "relaykey".into(),
            storage: Storage { used_bytes: 0, total_bytes: 100, unlimited: false, updated_at: 1000 },
            relay_mode: RelayMode::Public,
            credit_sats: 0,
            active_subscription: None,
        }
    }

    #[test]
    fn build_and_parse_round_trip() {
        let keys = Keys::generate();
        let subject = Keys::generate().public_key().to_hex();
        let snapshot = sample_snapshot(&subject);
        let tags = build_tags(&snapshot);
        let event = EventBuilder::new(Kind::Custom(11888), "").tags(tags).sign_with_keys(&keys).unwrap();
        let parsed = parse_allocation_event(&event).unwrap();
        assert_eq!(parsed.subject_pubkey, subject);
        assert_eq!(parsed.storage.total_bytes, 100);
        assert!(!parsed.storage.unlimited);
        assert_eq!(parsed.relay_mode, RelayMode::Public);
    }

    #[test]
    fn unlimited_storage_round_trips() {
        let mut snapshot = sample_snapshot(&Keys::generate().public_key().to_hex());
        snapshot.storage = Storage { used_bytes: 5, total_bytes: MAX_BYTES, unlimited: true, updated_at: 1 };
        let keys = Keys::generate();
        let tags = build_tags(&snapshot);
        let event = EventBuilder::new(Kind::Custom(11888), "").tags(tags).sign_with_keys(&keys).unwrap();
        let parsed = parse_allocation_event(&event).unwrap();
        assert!(parsed.storage.unlimited);
        assert!(parsed.storage.has_room());
    }

    #[test]
    fn credit_tag_omitted_when_zero() {
        let snapshot = sample_snapshot(&Keys::generate().public_key().to_hex());
        let tags = build_tags(&snapshot);
        assert!(tags.iter().all(|t| t.as_slice().first().map(|s| s.as_str()) != Some(TAG_CREDIT)));
    }

    #[test]
    fn create_or_update_replaces_prior_record() {
        let store = InMemoryEventStore::new();
        let relay_keys = Keys::generate();
        let subject = Keys::generate().public_key().to_hex();

        let first = sample_snapshot(&subject);
        let first_event = create_or_update(&first, 11888, &relay_keys, &store).unwrap();

        let mut second = sample_snapshot(&subject);
        second.storage.total_bytes = 500;
        create_or_update(&second, 11888, &relay_keys, &store).unwrap();

        let remaining = find_allocation_events(&subject, 11888, &relay_keys, &store).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].id, first_event.id);
        let parsed = parse_allocation_event(&remaining[0]).unwrap();
        assert_eq!(parsed.storage.total_bytes, 500);
    }

    #[test]
    fn create_if_not_exists_is_a_noop_when_present() {
        let store = InMemoryEventStore::new();
        let relay_keys = Keys::generate();
        let subject = Keys::generate().public_key().to_hex();
        let snapshot = sample_snapshot(&subject);

        assert!(create_if_not_exists(&snapshot, 11888, &relay_keys, &store).unwrap().is_some());
        assert!(create_if_not_exists(&snapshot, 11888, &relay_keys, &store).unwrap().is_none());
        assert_eq!(find_allocation_events(&subject, 11888, &relay_keys, &store).unwrap().len(), 1);
    }
}
