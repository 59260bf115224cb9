//! Cascade-delete kind (§4.5, part of the repository-permission family):
//! deletes every event carrying a matching `r` tag and releases DAG-root
//! ownership for the pubkeys that referenced it.

use std::collections::HashSet;

use nostr_sdk::prelude::{Event, EventId, Filter, Kind, PublicKey};

use crate::error::{DispatchError, ValidationError};
use crate::registry::HandlerCtx;
use crate::store_trait::EventStore;
use crate::wire::ServerMessage;

const BATCH_SIZE: usize = 1000;
const MAX_PASSES: u32 = 20;
const DAG_TAGS: [&str; 3] = ["bundle", "archive", "dag_root"];

fn find_tag(event: &Event, key: &str) -> Option<Vec<String>> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        (slice.first().map(|s| s.as_str()) == Some(key)).then(|| slice.to_vec())
    })
}

fn find_all_tag_values(event: &Event, keys: &[&str]) -> Vec<String> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let slice = tag.as_slice();
            let key = slice.first()?.as_str();
            if keys.contains(&key) {
                slice.get(1).cloned()
            } else {
                None
            }
        })
        .collect()
}

/// Resolves which pubkey owns a resource kind, so cascade-delete can check
/// the requester's authority without the core knowing about permission
/// kinds directly.
pub trait OwnershipResolver: Send + Sync {
    fn resource_owner(&self, resource_kind: u16, r: &str, events: &dyn EventStore) -> Option<PublicKey>;
}

/// The obvious resolver for the repository-permission family: the owner is
/// whoever signed the earliest still-present permission event for this `r`.
pub struct FirstSignerResolver;

impl OwnershipResolver for FirstSignerResolver {
    fn resource_owner(&self, resource_kind: u16, r: &str, events: &dyn EventStore) -> Option<PublicKey> {
        let candidates = events.query_events(&Filter::new().kind(Kind::Custom(resource_kind))).ok()?;
        candidates
            .into_iter()
            .filter(|e| find_tag(e, "r").and_then(|v| v.get(1).cloned()).as_deref() == Some(r))
            .min_by_key(|e| e.created_at)
            .map(|e| e.pubkey)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CascadeStats {
    pub deleted: usize,
    pub passes: u32,
    pub released: usize,
    pub orphaned_roots: usize,
}

/// §4.5: process a cascade-delete event. `tombstone_kind` is the kind the
/// cascade-delete event itself is stored under once the cascade completes;
/// a failure to store it does not roll back the deletions already made.
pub fn handle_cascade_delete(
    event: &Event,
    resolver: &dyn OwnershipResolver,
    events: &dyn EventStore,
) -> Result<(HandlerOutcome, CascadeStats), DispatchError> {
    let r = find_tag(event, "r").and_then(|v| v.get(1).cloned()).ok_or(ValidationError::MissingTag("r"))?;
    let resource_kind: u16 = find_tag(event, "k")
        .and_then(|v| v.get(1).cloned())
        .and_then(|s| s.parse().ok())
        .ok_or(ValidationError::MissingTag("k"))?;

    let owner = resolver.resource_owner(resource_kind, &r, events);
    if owner != Some(event.pubkey) {
        return Ok((HandlerOutcome::Rejected("signer is not the resource owner".into()), CascadeStats::default()));
    }

    let mut stats = CascadeStats::default();
    let mut dag_refs: HashSet<String> = HashSet::new();
    let mut roots_and_owners: HashSet<(String, PublicKey)> = HashSet::new();

    for _ in 0..MAX_PASSES {
        let candidates = events.query_events(&Filter::new().kind(Kind::Custom(resource_kind)))?;
        let matching: Vec<&Event> =
            candidates.iter().filter(|e| find_tag(e, "r").and_then(|v| v.get(1).cloned()).as_deref() == Some(r.as_str())).collect();
        if matching.is_empty() {
            break;
        }

        let batch: Vec<&Event> = matching.into_iter().take(BATCH_SIZE).collect();
        let batch_len = batch.len();
        let ids: Vec<EventId> = batch.iter().map(|e| e.id).collect();
        for tagged in &batch {
            for value in find_all_tag_values(tagged, &DAG_TAGS) {
                dag_refs.insert(value.clone());
                roots_and_owners.insert((value, tagged.pubkey));
            }
        }
        for id in ids {
            events.delete_event(&id)?;
        }
        stats.deleted += batch_len;
        stats.passes += 1;
        if batch_len < BATCH_SIZE {
            break;
        }
    }

    // Release ownership for each unique (root, pubkey) pair; a root with no
    // remaining references after release is logged as orphaned.
    let mut released_roots: HashSet<String> = HashSet::new();
    for (root, pubkey) in &roots_and_owners {
        stats.released += 1;
        released_roots.insert(root.clone());
        log::info!("released ownership of dag root {root} for {}", pubkey.to_hex());
    }
    for root in &released_roots {
        let still_referenced = events
            .query_events(&Filter::new())
            .map(|all| all.iter().any(|e| find_all_tag_values(e, &DAG_TAGS).contains(root)))
            .unwrap_or(true);
        if !still_referenced {
            stats.orphaned_roots += 1;
            log::warn!("dag root {root} has zero remaining owners after cascade delete");
        }
    }

    if let Err(err) = events.store_event(event) {
        log::warn!("failed to store cascade-delete tombstone: {err}");
    }

    Ok((HandlerOutcome::Accepted, stats))
}

pub enum HandlerOutcome {
    Accepted,
    Rejected(String),
}

/// Adapt `handle_cascade_delete` to the `KindHandler` contract.
pub fn cascade_delete_handler(
    resolver: std::sync::Arc<dyn OwnershipResolver>,
) -> impl Fn(&HandlerCtx<'_>, &dyn EventStore) -> Result<bool, DispatchError> {
    move |ctx, store| {
        let event = ctx.event();
        let (outcome, _stats) = handle_cascade_delete(event, resolver.as_ref(), store)?;
        match outcome {
            HandlerOutcome::Accepted => {
                ctx.emit(ServerMessage::ok(event.id, true, ""));
                Ok(true)
            }
            HandlerOutcome::Rejected(reason) => {
                ctx.emit(ServerMessage::ok(event.id, false, reason));
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryEventStore;
    use nostr_sdk::prelude::{EventBuilder, Keys, Tag, TagKind};

    fn permission_event(keys: &Keys, r: &str, dag_root: Option<&str>) -> Event {
        let mut tags = vec![Tag::custom(TagKind::custom("r"), vec![r.to_string()])];
        if let Some(root) = dag_root {
            tags.push(Tag::custom(TagKind::custom("dag_root"), vec![root.to_string()]));
        }
        EventBuilder::new(Kind::Custom(30617), "").tags(tags).sign_with_keys(keys).unwrap()
    }

    fn cascade_event(keys: &Keys, r: &str, k: u16) -> Event {
        let tags = vec![
            Tag::custom(TagKind::custom("r"), vec![r.to_string()]),
            Tag::custom(TagKind::custom("k"), vec![k.to_string()]),
        ];
        EventBuilder::new(Kind::Custom(16629), "").tags(tags).sign_with_keys(keys).unwrap()
    }

    #[test]
    fn rejects_non_owner() {
        let store = InMemoryEventStore::new();
        let owner = Keys::generate();
        let stranger = Keys::generate();
        store.store_event(&permission_event(&owner, "res1", None)).unwrap();

        let cascade = cascade_event(&stranger, "res1", 30617);
        let (outcome, _) = handle_cascade_delete(&cascade, &FirstSignerResolver, &store).unwrap();
        assert!(matches!(outcome, HandlerOutcome::Rejected(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn owner_cascade_deletes_matching_events_and_releases_roots() {
        let store = InMemoryEventStore::new();
        let owner = Keys::generate();
        store.store_event(&permission_event(&owner, "res1", Some("root-a"))).unwrap();
        store.store_event(&permission_event(&owner, "res1", Some("root-b"))).unwrap();

        let cascade = cascade_event(&owner, "res1", 30617);
        let (outcome, stats) = handle_cascade_delete(&cascade, &FirstSignerResolver, &store).unwrap();
        assert!(matches!(outcome, HandlerOutcome::Accepted));
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.orphaned_roots, 2);
        // tombstone stored
        assert_eq!(store.len(), 1);
    }
}
