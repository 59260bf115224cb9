//! Replaceable-kind handling (§4.5 step 4): kind 0, kind 3, the
//! 10000-19999 range, and the 30000-39999 range keyed additionally by a
//! `d` tag.

use nostr_sdk::prelude::{Event, Filter, Kind};

use crate::error::DispatchError;
use crate::registry::HandlerCtx;
use crate::store_trait::EventStore;
use crate::wire::ServerMessage;

pub fn is_replaceable(kind: Kind) -> bool {
    let k = kind.as_u16();
    k == 0 || k == 3 || (10_000..20_000).contains(&k)
}

pub fn is_parameterized_addressable(kind: Kind) -> bool {
    (30_000..40_000).contains(&kind.as_u16())
}

fn d_tag(event: &Event) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        (slice.first().map(|s| s.as_str()) == Some("d")).then(|| slice.get(1).cloned().unwrap_or_default())
    })
}

/// Delete every prior event sharing `(author, kind[, d])` with `event`,
/// then persist it. Used for both replaceable and parameterized-addressable
/// kinds — the only difference is whether `d` participates in the key.
pub fn replace_and_store(event: &Event, events: &dyn EventStore) -> Result<(), DispatchError> {
    let filter = Filter::new().kind(event.kind).author(event.pubkey);
    let prior = events.query_events(&filter)?;
    let target_d = if is_parameterized_addressable(event.kind) { d_tag(event) } else { None };

    for old in prior {
        if old.id == event.id {
            continue;
        }
        if is_parameterized_addressable(event.kind) {
            if d_tag(&old) == target_d {
                events.delete_event(&old.id)?;
            }
        } else {
            events.delete_event(&old.id)?;
        }
    }
    events.store_event(event)?;
    Ok(())
}

/// A minimal handler for plain replaceable/addressable kinds that carry no
/// kind-specific validation beyond §4.2/§4.3: replace and store, report OK.
pub fn handle_replaceable(ctx: &HandlerCtx<'_>, events: &dyn EventStore) -> Result<bool, DispatchError> {
    let event = ctx.event();
    replace_and_store(event, events)?;
    ctx.emit(ServerMessage::ok(event.id, true, ""));
    Ok(true)
}
