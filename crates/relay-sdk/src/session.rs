//! C5 — the per-connection state machine (§4.4). One instance is driven by
//! the WebSocket read loop in the transport binary; this module holds the
//! state and transition logic so it is testable without a socket.

use nostr_sdk::prelude::{Event, Filter};
use rand::RngCore;
use tokio::sync::mpsc;

use crate::dispatch::DispatchCore;
use crate::error::DispatchError;
use crate::store_trait::{EventStore, StatsStore};
use crate::subscription::ConnId;
use crate::validator::{self, AUTH_KIND};
use crate::wire::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Challenged,
    Authenticated,
}

fn random_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A REQ or COUNT frame parked while the connection is unauthenticated,
/// drained once AUTH succeeds.
enum PendingRequest {
    Req(String, Vec<Filter>),
    Count(String, Vec<Filter>),
}

/// Per-connection session state. Not `Clone` — exactly one task owns it,
/// the "single logical task is the sole mutator" rule from §5.
pub struct Session {
    pub conn: ConnId,
    pub state: SessionState,
    pub challenge: String,
    pending_req: Option<PendingRequest>,
    registered: bool,
}

impl Session {
    pub fn new(conn: ConnId) -> Self {
        Self { conn, state: SessionState::Fresh, challenge: random_challenge(), pending_req: None, registered: false }
    }

    /// Handle one parsed client frame. Returns nothing — all effects go
    /// through `out` and the shared dispatch/subscription state.
    pub fn handle_message(
        &mut self,
        message: ClientMessage,
        dispatch: &DispatchCore,
        out: &mpsc::UnboundedSender<ServerMessage>,
        events: &dyn EventStore,
        stats: &dyn StatsStore,
    ) -> Result<(), DispatchError> {
        if !self.registered {
            dispatch.subscriptions().register_conn(self.conn, out.clone());
            self.registered = true;
        }
        match message {
            ClientMessage::Event(event) => self.handle_event(*event, dispatch, out, events, stats),
            ClientMessage::Req { sub_id, filters } => self.handle_req(sub_id, filters, dispatch, out),
            ClientMessage::Close { sub_id } => self.handle_close(sub_id, dispatch, out),
            ClientMessage::Auth(event) => self.handle_auth(*event, dispatch, out),
            ClientMessage::Count { sub_id, filters } => self.handle_count(sub_id, filters, out),
        }
    }

    fn handle_event(
        &mut self,
        event: Event,
        dispatch: &DispatchCore,
        out: &mpsc::UnboundedSender<ServerMessage>,
        events: &dyn EventStore,
        stats: &dyn StatsStore,
    ) -> Result<(), DispatchError> {
        // EVENT handling never requires authentication (§4.4): events are
        // themselves signed, admission is checked independently.
        dispatch.dispatch_event(event, out.clone(), events, stats)
    }

    fn handle_req(
        &mut self,
        sub_id: String,
        filters: Vec<Filter>,
        dispatch: &DispatchCore,
        out: &mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<(), DispatchError> {
        match self.state {
            SessionState::Fresh => {
                self.pending_req = Some(PendingRequest::Req(sub_id, filters));
                self.state = SessionState::Challenged;
                let _ = out.send(ServerMessage::Auth { challenge: self.challenge.clone() });
                Ok(())
            }
            SessionState::Challenged => {
                // A second REQ/COUNT while still challenged simply replaces
                // the pending one; only the most recent is drained on auth.
                self.pending_req = Some(PendingRequest::Req(sub_id, filters));
                Ok(())
            }
            SessionState::Authenticated => {
                dispatch.subscriptions().set(self.conn, sub_id.clone(), filters);
                let _ = out.send(ServerMessage::Eose { sub_id });
                Ok(())
            }
        }
    }

    /// COUNT is gated by the same fresh/challenged/authenticated state
    /// machine as REQ (§4.4); only the authenticated-path result differs,
    /// since no `count_events` store method exists to answer it.
    fn handle_count(
        &mut self,
        sub_id: String,
        filters: Vec<Filter>,
        out: &mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<(), DispatchError> {
        match self.state {
            SessionState::Fresh => {
                self.pending_req = Some(PendingRequest::Count(sub_id, filters));
                self.state = SessionState::Challenged;
                let _ = out.send(ServerMessage::Auth { challenge: self.challenge.clone() });
                Ok(())
            }
            SessionState::Challenged => {
                self.pending_req = Some(PendingRequest::Count(sub_id, filters));
                Ok(())
            }
            SessionState::Authenticated => {
                let _ = out.send(ServerMessage::notice("COUNT is not supported by this relay"));
                Ok(())
            }
        }
    }

    fn handle_close(
        &mut self,
        sub_id: String,
        dispatch: &DispatchCore,
        out: &mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<(), DispatchError> {
        dispatch.subscriptions().remove(self.conn, &sub_id);
        let _ = out.send(ServerMessage::Closed { sub_id, message: "Subscription closed successfully.".into() });
        Ok(())
    }

    fn handle_auth(
        &mut self,
        event: Event,
        dispatch: &DispatchCore,
        out: &mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<(), DispatchError> {
        let reason = self.validate_auth_event(&event);
        match reason {
            Ok(()) => {
                self.state = SessionState::Authenticated;
                let _ = out.send(ServerMessage::ok(event.id, true, ""));
                if let Some(pending) = self.pending_req.take() {
                    match pending {
                        PendingRequest::Req(sub_id, filters) => {
                            dispatch.subscriptions().set(self.conn, sub_id.clone(), filters);
                            let _ = out.send(ServerMessage::Eose { sub_id });
                        }
                        PendingRequest::Count(..) => {
                            let _ = out.send(ServerMessage::notice("COUNT is not supported by this relay"));
                        }
                    }
                }
                Ok(())
            }
            Err(reason) => {
                let _ = out.send(ServerMessage::ok(event.id, false, reason));
                Ok(())
            }
        }
    }

    fn validate_auth_event(&self, event: &Event) -> Result<(), String> {
        use nostr_sdk::prelude::Kind;

        validator::validate(event, Some(Kind::Custom(AUTH_KIND))).map_err(|e| e.to_string())?;

        let has_relay_tag = find_tag(event, "relay").is_some();
        if !has_relay_tag {
            return Err("auth event missing relay tag".into());
        }
        let challenge = find_tag(event, "challenge").and_then(|v| v.get(1).cloned());
        if challenge.as_deref() != Some(self.challenge.as_str()) {
            return Err("auth event challenge does not match".into());
        }
        Ok(())
    }
}

fn find_tag(event: &Event, key: &str) -> Option<Vec<String>> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        (slice.first().map(|s| s.as_str()) == Some(key)).then(|| slice.to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RelaySettings};
    use crate::registry::{HandlerCtx, KindRegistry};
    use crate::subscription::SubscriptionTable;
    use crate::testing::{InMemoryEventStore, InMemoryStatsStore};
    use nostr_sdk::prelude::{EventBuilder, Keys, Kind, Tag, TagKind};

    fn dispatch_core() -> DispatchCore {
        let registry = KindRegistry::builder()
            .register_kind(Kind::TextNote, |ctx: &HandlerCtx<'_>, store: &dyn EventStore| {
                store.store_event(ctx.event())?;
                Ok(true)
            })
            .unwrap()
            .build();
        DispatchCore::new(registry, SubscriptionTable::new(), Config::new(RelaySettings::default()), Keys::generate())
    }

    #[test]
    fn req_while_fresh_triggers_challenge() {
        let dispatch = dispatch_core();
        let mut session = Session::new(ConnId::next());
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .handle_message(ClientMessage::Req { sub_id: "s1".into(), filters: vec![] }, &dispatch, &tx, &InMemoryEventStore::new(), &InMemoryStatsStore::new())
            .unwrap();
        assert_eq!(session.state, SessionState::Challenged);
        match rx.try_recv().unwrap() {
            ServerMessage::Auth { challenge } => assert_eq!(challenge, session.challenge),
            _ => panic!("expected AUTH challenge"),
        }
    }

    #[test]
    fn valid_auth_drains_pending_req_and_authenticates() {
        let dispatch = dispatch_core();
        let mut session = Session::new(ConnId::next());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = InMemoryEventStore::new();
        let stats = InMemoryStatsStore::new();

        session
            .handle_message(ClientMessage::Req { sub_id: "s1".into(), filters: vec![Filter::new().kind(Kind::TextNote)] }, &dispatch, &tx, &events, &stats)
            .unwrap();
        let _ = rx.try_recv(); // AUTH challenge

        let relay_keys = Keys::generate();
        let auth_event = EventBuilder::new(Kind::Custom(AUTH_KIND), "")
            .tags(vec![
                Tag::custom(TagKind::custom("relay"), vec!["wss://relay.example".to_string()]),
                Tag::custom(TagKind::custom("challenge"), vec![session.challenge.clone()]),
            ])
            .sign_with_keys(&relay_keys)
            .unwrap();

        session.handle_message(ClientMessage::Auth(Box::new(auth_event)), &dispatch, &tx, &events, &stats).unwrap();
        assert_eq!(session.state, SessionState::Authenticated);

        let ok = rx.try_recv().unwrap();
        assert!(matches!(ok, ServerMessage::Ok { accepted: true, .. }));
        let eose = rx.try_recv().unwrap();
        assert!(matches!(eose, ServerMessage::Eose { sub_id } if sub_id == "s1"));
        assert_eq!(dispatch.subscriptions().conn_count(), 1);
    }

    #[test]
    fn auth_with_wrong_challenge_is_rejected_and_stays_challenged() {
        let dispatch = dispatch_core();
        let mut session = Session::new(ConnId::next());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = InMemoryEventStore::new();
        let stats = InMemoryStatsStore::new();
        session
            .handle_message(ClientMessage::Req { sub_id: "s1".into(), filters: vec![] }, &dispatch, &tx, &events, &stats)
            .unwrap();
        let _ = rx.try_recv();

        let keys = Keys::generate();
        let auth_event = EventBuilder::new(Kind::Custom(AUTH_KIND), "")
            .tags(vec![
                Tag::custom(TagKind::custom("relay"), vec!["wss://relay.example".to_string()]),
                Tag::custom(TagKind::custom("challenge"), vec!["wrong".to_string()]),
            ])
            .sign_with_keys(&keys)
            .unwrap();
        session.handle_message(ClientMessage::Auth(Box::new(auth_event)), &dispatch, &tx, &events, &stats).unwrap();
        assert_eq!(session.state, SessionState::Challenged);
        match rx.try_recv().unwrap() {
            ServerMessage::Ok { accepted, .. } => assert!(!accepted),
            _ => panic!("expected OK false"),
        }
    }

    #[test]
    fn count_while_fresh_triggers_challenge_like_req() {
        let dispatch = dispatch_core();
        let mut session = Session::new(ConnId::next());
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .handle_message(ClientMessage::Count { sub_id: "s1".into(), filters: vec![] }, &dispatch, &tx, &InMemoryEventStore::new(), &InMemoryStatsStore::new())
            .unwrap();
        assert_eq!(session.state, SessionState::Challenged);
        match rx.try_recv().unwrap() {
            ServerMessage::Auth { challenge } => assert_eq!(challenge, session.challenge),
            _ => panic!("expected AUTH challenge"),
        }
    }

    #[test]
    fn pending_count_drains_to_notice_after_auth() {
        let dispatch = dispatch_core();
        let mut session = Session::new(ConnId::next());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = InMemoryEventStore::new();
        let stats = InMemoryStatsStore::new();

        session
            .handle_message(ClientMessage::Count { sub_id: "s1".into(), filters: vec![] }, &dispatch, &tx, &events, &stats)
            .unwrap();
        let _ = rx.try_recv(); // AUTH challenge

        let relay_keys = Keys::generate();
        let auth_event = EventBuilder::new(Kind::Custom(AUTH_KIND), "")
            .tags(vec![
                Tag::custom(TagKind::custom("relay"), vec!["wss://relay.example".to_string()]),
                Tag::custom(TagKind::custom("challenge"), vec![session.challenge.clone()]),
            ])
            .sign_with_keys(&relay_keys)
            .unwrap();

        session.handle_message(ClientMessage::Auth(Box::new(auth_event)), &dispatch, &tx, &events, &stats).unwrap();
        assert_eq!(session.state, SessionState::Authenticated);

        let ok = rx.try_recv().unwrap();
        assert!(matches!(ok, ServerMessage::Ok { accepted: true, .. }));
        match rx.try_recv().unwrap() {
            ServerMessage::Notice { .. } => {}
            other => panic!("expected NOTICE for drained COUNT, got {other:?}"),
        }
    }

    #[test]
    fn close_removes_subscription_and_emits_closed() {
        let dispatch = dispatch_core();
        let conn = ConnId::next();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch.subscriptions().register_conn(conn, tx.clone());
        dispatch.subscriptions().set(conn, "s1", vec![]);

        let mut session =
            Session { conn, state: SessionState::Authenticated, challenge: "x".into(), pending_req: None, registered: true };
        session.handle_close("s1".into(), &dispatch, &tx).unwrap();
        assert_eq!(dispatch.subscriptions().conn_count(), 0);
        match rx.try_recv().unwrap() {
            ServerMessage::Closed { sub_id, .. } => assert_eq!(sub_id, "s1"),
            _ => panic!("expected CLOSED"),
        }
    }
}
