//! Parameterized-addressable repository-permission kind (§4.7). Addressed
//! by an `r` tag instead of the usual `(author, kind, d-tag)` triple, with
//! org-ownership authorization layered on top of plain per-signer updates.

use nostr_sdk::prelude::{Event, Filter, Kind, PublicKey};

use crate::error::{DispatchError, ValidationError};
use crate::registry::HandlerCtx;
use crate::store_trait::EventStore;
use crate::wire::ServerMessage;

/// `a` tag reference to an org-owned `d`-tagged resource: `kind:owner:d_tag`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrgRef {
    pub kind: u16,
    pub owner: PublicKey,
    pub d_tag: String,
}

impl OrgRef {
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let kind: u16 = parts.next()?.parse().ok()?;
        let owner = PublicKey::from_hex(parts.next()?).ok()?;
        let d_tag = parts.next()?.to_string();
        Some(OrgRef { kind, owner, d_tag })
    }
}

#[derive(Debug, Clone)]
pub struct RepoTags {
    pub r: String,
    pub n: String,
    pub clone_url: String,
    pub relay_url: String,
    pub permissions: Vec<(PublicKey, String)>,
    pub a: Option<OrgRef>,
}

const VALID_LEVELS: [&str; 3] = ["maintainer", "write", "triage"];

fn find_tag<'a>(event: &'a Event, key: &str) -> Option<Vec<String>> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        (slice.first().map(|s| s.as_str()) == Some(key)).then(|| slice.to_vec())
    })
}

fn find_all_tags<'a>(event: &'a Event, key: &str) -> Vec<Vec<String>> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let slice = tag.as_slice();
            (slice.first().map(|s| s.as_str()) == Some(key)).then(|| slice.to_vec())
        })
        .collect()
}

pub fn parse_repo_tags(event: &Event) -> Result<RepoTags, ValidationError> {
    let r = find_tag(event, "r").and_then(|v| v.get(1).cloned()).ok_or(ValidationError::MissingTag("r"))?;
    let n = find_tag(event, "n").and_then(|v| v.get(1).cloned()).ok_or(ValidationError::MissingTag("n"))?;
    let clone_url =
        find_tag(event, "clone").and_then(|v| v.get(1).cloned()).ok_or(ValidationError::MissingTag("clone"))?;
    let relay_url =
        find_tag(event, "relay").and_then(|v| v.get(1).cloned()).ok_or(ValidationError::MissingTag("relay"))?;

    let p_tags = find_all_tags(event, "p");
    if p_tags.is_empty() {
        return Err(ValidationError::MissingTag("p"));
    }
    let mut permissions = Vec::new();
    for p in p_tags {
        let pubkey = p
            .get(1)
            .and_then(|s| PublicKey::from_hex(s).ok())
            .ok_or_else(|| ValidationError::Malformed("p tag pubkey".into()))?;
        let level = p.get(2).cloned().unwrap_or_default();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(ValidationError::Malformed(format!("invalid permission level {level}")));
        }
        permissions.push((pubkey, level));
    }

    let a = find_tag(event, "a").and_then(|v| v.get(1).and_then(|raw| OrgRef::parse(raw)));

    Ok(RepoTags { r, n, clone_url, relay_url, permissions, a })
}

/// Cross-tag consistency (§4.7, §6): `clone` must reference the same
/// resource id and name as `r`/`n`, and `relay` must be a websocket URL.
pub fn cross_validate(tags: &RepoTags, signer: &PublicKey) -> Result<(), ValidationError> {
    if !tags.relay_url.starts_with("ws://") && !tags.relay_url.starts_with("wss://") {
        return Err(ValidationError::Malformed("relay tag must be a ws(s):// URL".into()));
    }
    if !tags.clone_url.starts_with("nestr://") {
        return Err(ValidationError::Malformed("clone tag must be a nestr:// URL".into()));
    }
    let query = tags.clone_url.split_once('?').map(|(_, q)| q).unwrap_or("");
    let params: std::collections::HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();
    if params.get("id") != Some(&tags.r.as_str()) {
        return Err(ValidationError::Malformed("clone id does not match r tag".into()));
    }
    if params.get("repo_name") != Some(&tags.n.as_str()) {
        return Err(ValidationError::Malformed("clone repo_name does not match n tag".into()));
    }
    let expected_author = tags.a.as_ref().map(|a| a.owner.to_hex()).unwrap_or_else(|| signer.to_hex());
    if let Some(repo_author) = params.get("repo_author") {
        if *repo_author != expected_author && *repo_author != signer.to_hex() {
            return Err(ValidationError::Malformed("clone repo_author does not match signer or a tag owner".into()));
        }
    }
    Ok(())
}

/// A holder of an un-deleted invitation from the org owner, whose
/// acceptance event (authored by the candidate, `status=accepted`) is
/// also still present.
fn is_verified_member(
    org: &OrgRef,
    candidate: &PublicKey,
    invitation_kind: u16,
    acceptance_kind: u16,
    events: &dyn EventStore,
) -> Result<bool, DispatchError> {
    if candidate == &org.owner {
        return Ok(true);
    }
    let a_value = format!("{}:{}:{}", org.kind, org.owner.to_hex(), org.d_tag);

    let invitations = events.query_events(&Filter::new().kind(Kind::Custom(invitation_kind)).author(org.owner))?;
    let invited = invitations.iter().any(|inv| {
        find_tag(inv, "a").and_then(|v| v.get(1).cloned()).as_deref() == Some(a_value.as_str())
            && find_all_tags(inv, "p").iter().any(|p| p.get(1).map(|s| s.as_str()) == Some(candidate.to_hex().as_str()))
    });
    if !invited {
        return Ok(false);
    }

    let acceptances = events.query_events(&Filter::new().kind(Kind::Custom(acceptance_kind)).author(*candidate))?;
    let accepted = acceptances.iter().any(|acc| {
        find_tag(acc, "a").and_then(|v| v.get(1).cloned()).as_deref() == Some(a_value.as_str())
            && find_tag(acc, "status").and_then(|v| v.get(1).cloned()).as_deref() == Some("accepted")
    });
    Ok(accepted)
}

/// Build a handler closure for the repository-permission kind. `invitation_kind`
/// and `acceptance_kind` parameterize the "verified member" check (§4.7); they
/// are operator-configured the same way `allocation_kind` is.
pub fn handle_permission_event(
    invitation_kind: u16,
    acceptance_kind: u16,
) -> impl Fn(&HandlerCtx<'_>, &dyn EventStore) -> Result<bool, DispatchError> {
    move |ctx, store| {
        let event = ctx.event();
        let tags = parse_repo_tags(event).map_err(DispatchError::from)?;
        cross_validate(&tags, &event.pubkey).map_err(DispatchError::from)?;

        let existing = store.query_events(&Filter::new())?;
        let prior: Vec<&Event> = existing
            .iter()
            .filter(|e| find_tag(e, "r").and_then(|v| v.get(1).cloned()).as_deref() == Some(tags.r.as_str()))
            .collect();

        let authorized = if prior.is_empty() {
            true
        } else {
            match &tags.a {
                None => prior.iter().all(|p| p.pubkey == event.pubkey),
                Some(org) => {
                    event.pubkey == org.owner
                        || (prior.iter().all(|p| p.pubkey != org.owner)
                            && is_verified_member(org, &event.pubkey, invitation_kind, acceptance_kind, store)?)
                }
            }
        };

        if !authorized {
            ctx.emit(ServerMessage::ok(event.id, false, "not authorized to update this resource"));
            return Ok(false);
        }

        for old in &prior {
            store.delete_event(&old.id)?;
        }
        store.store_event(event)?;
        ctx.emit(ServerMessage::ok(event.id, true, ""));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryEventStore;
    use nostr_sdk::prelude::{EventBuilder, Keys, Tag, TagKind};

    fn repo_event(keys: &Keys, r: &str, n: &str, a: Option<&str>) -> Event {
        let mut tags = vec![
            Tag::custom(TagKind::custom("r"), vec![r.to_string()]),
            Tag::custom(TagKind::custom("n"), vec![n.to_string()]),
            Tag::custom(
                TagKind::custom("clone"),
                vec![format!("nestr://host/repo?id={r}&repo_author={}&repo_name={n}", keys.public_key().to_hex())],
            ),
            Tag::custom(TagKind::custom("relay"), vec!["wss://relay.example".to_string()]),
            Tag::custom(TagKind::custom("p"), vec![keys.public_key().to_hex(), "maintainer".to_string()]),
        ];
        if let Some(a) = a {
            tags.push(Tag::custom(TagKind::custom("a"), vec![a.to_string()]));
        }
        EventBuilder::new(Kind::Custom(30617), "").tags(tags).sign_with_keys(keys).unwrap()
    }

    #[test]
    fn new_resource_is_always_accepted() {
        let store = InMemoryEventStore::new();
        let keys = Keys::generate();
        let event = repo_event(&keys, "resource-1", "repo", None);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = HandlerCtx::new(&event, tx);
        let handler = handle_permission_event(30610, 30611);
        assert!(handler(&ctx, &store).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn personal_resource_update_requires_original_signer() {
        let store = InMemoryEventStore::new();
        let owner = Keys::generate();
        let stranger = Keys::generate();
        let first = repo_event(&owner, "resource-1", "repo", None);
        store.store_event(&first).unwrap();

        let update = repo_event(&stranger, "resource-1", "repo", None);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = HandlerCtx::new(&update, tx);
        let handler = handle_permission_event(30610, 30611);
        assert!(!handler(&ctx, &store).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rejects_missing_required_tag() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::Custom(30617), "").sign_with_keys(&keys).unwrap();
        assert!(matches!(parse_repo_tags(&event), Err(ValidationError::MissingTag("r"))));
    }

    fn org_invitation(owner: &Keys, candidate: &Keys, a_value: &str) -> Event {
        let tags = vec![
            Tag::custom(TagKind::custom("a"), vec![a_value.to_string()]),
            Tag::custom(TagKind::custom("p"), vec![candidate.public_key().to_hex()]),
        ];
        EventBuilder::new(Kind::Custom(30610), "").tags(tags).sign_with_keys(owner).unwrap()
    }

    fn org_acceptance(candidate: &Keys, a_value: &str) -> Event {
        let tags = vec![
            Tag::custom(TagKind::custom("a"), vec![a_value.to_string()]),
            Tag::custom(TagKind::custom("status"), vec!["accepted".to_string()]),
        ];
        EventBuilder::new(Kind::Custom(30611), "").tags(tags).sign_with_keys(candidate).unwrap()
    }

    /// First org event (personal -> org migration) must still require a
    /// verified member; an unvouched signer cannot hijack the resource
    /// just because the org owner never touched it.
    #[test]
    fn migration_to_org_rejects_unverified_signer() {
        let store = InMemoryEventStore::new();
        let owner = Keys::generate();
        let org_owner = Keys::generate();
        let stranger = Keys::generate();
        let a_value = format!("30617:{}:org-d", org_owner.public_key().to_hex());

        let first = repo_event(&owner, "resource-1", "repo", None);
        store.store_event(&first).unwrap();

        let migrate = repo_event(&stranger, "resource-1", "repo", Some(&a_value));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = HandlerCtx::new(&migrate, tx);
        let handler = handle_permission_event(30610, 30611);
        assert!(!handler(&ctx, &store).unwrap());
        assert_eq!(store.len(), 1);
    }

    /// Same migration, but the signer is a verified org member (invited by
    /// the org owner and accepted) — authorized.
    #[test]
    fn migration_to_org_allows_verified_member() {
        let store = InMemoryEventStore::new();
        let owner = Keys::generate();
        let org_owner = Keys::generate();
        let member = Keys::generate();
        let a_value = format!("30617:{}:org-d", org_owner.public_key().to_hex());

        let first = repo_event(&owner, "resource-1", "repo", None);
        store.store_event(&first).unwrap();
        store.store_event(&org_invitation(&org_owner, &member, &a_value)).unwrap();
        store.store_event(&org_acceptance(&member, &a_value)).unwrap();

        let migrate = repo_event(&member, "resource-1", "repo", Some(&a_value));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = HandlerCtx::new(&migrate, tx);
        let handler = handle_permission_event(30610, 30611);
        assert!(handler(&ctx, &store).unwrap());
        assert_eq!(store.len(), 1);
    }
}
