//! C6 — routes a validated event to its kind handler, then fans stored
//! events out to matching subscribers (§4.5).

use nostr_sdk::prelude::{Event, Keys};
use tokio::sync::mpsc;

use crate::admission::check_admission;
use crate::config::Config;
use crate::error::DispatchError;
use crate::registry::{HandlerCtx, KindRegistry};
use crate::store_trait::{EventStore, StatsStore};
use crate::subscription::SubscriptionTable;
use crate::validator;
use crate::wire::ServerMessage;

#[derive(Clone)]
pub struct DispatchCore {
    registry: KindRegistry,
    subs: SubscriptionTable,
    config: Config,
    relay_keys: Keys,
}

impl DispatchCore {
    pub fn new(registry: KindRegistry, subs: SubscriptionTable, config: Config, relay_keys: Keys) -> Self {
        Self { registry, subs, config, relay_keys }
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subs
    }

    /// Run the full per-kind handler contract (§4.5 steps 1-7) for one
    /// inbound EVENT frame. Never returns an error for a plain rejection —
    /// those are reported to the caller through `out` as an `OK` frame;
    /// only infrastructure failures (store errors, missing handler) come
    /// back as `Err`.
    pub fn dispatch_event(
        &self,
        event: Event,
        out: mpsc::UnboundedSender<ServerMessage>,
        events: &dyn EventStore,
        stats: &dyn StatsStore,
    ) -> Result<(), DispatchError> {
        if let Err(err) = validator::validate(&event, None) {
            let _ = out.send(ServerMessage::ok(event.id, false, err.to_string()));
            return Ok(());
        }

        let settings = self.config.current();
        if let Err(err) = validator::check_kind_allowed(event.kind, &settings.kind_whitelist) {
            let _ = out.send(ServerMessage::ok(event.id, false, err.to_string()));
            return Ok(());
        }

        if let Err(err) = check_admission(&event.pubkey, settings.mode, settings.allocation_kind, &self.relay_keys, events, stats) {
            let _ = out.send(ServerMessage::ok(event.id, false, err.to_string()));
            return Ok(());
        }

        let handler = match self.registry.get_for_kind(event.kind, settings.unlimited_kind_mode) {
            Some(handler) => handler,
            None => {
                let _ = out.send(ServerMessage::notice(format!("no handler registered for kind {}", event.kind.as_u16())));
                return Err(DispatchError::NoHandler(event.kind.as_u16()));
            }
        };

        let ctx = HandlerCtx::new(&event, out);
        let accepted = handler.handle(&ctx, events)?;
        if accepted {
            self.subs.notify(&event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelaySettings;
    use crate::registry::KindRegistry;
    use crate::testing::{InMemoryEventStore, InMemoryStatsStore};
    use nostr_sdk::prelude::{EventBuilder, Kind};

    fn core(registry: KindRegistry) -> DispatchCore {
        let config = Config::new(RelaySettings::default());
        DispatchCore::new(registry, SubscriptionTable::new(), config, Keys::generate())
    }

    #[test]
    fn unregistered_kind_reports_no_handler() {
        let registry = KindRegistry::builder().build();
        let dispatch = core(registry);
        let events = InMemoryEventStore::new();
        let stats = InMemoryStatsStore::new();
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::TextNote, "hi").sign_with_keys(&keys).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = dispatch.dispatch_event(event, tx, &events, &stats);
        assert!(matches!(result, Err(DispatchError::NoHandler(_))));
    }

    #[test]
    fn accepted_event_is_stored_and_fanned_out() {
        let registry = KindRegistry::builder()
            .register_kind(Kind::TextNote, |ctx: &HandlerCtx<'_>, store: &dyn EventStore| {
                store.store_event(ctx.event())?;
                Ok(true)
            })
            .unwrap()
            .build();
        let dispatch = core(registry);
        let events = InMemoryEventStore::new();
        let stats = InMemoryStatsStore::new();
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::TextNote, "hi").sign_with_keys(&keys).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        dispatch.dispatch_event(event, tx, &events, &stats).unwrap();
        assert_eq!(events.len(), 1);
    }
}
