//! C3 — the single pure function every inbound event passes through before
//! any kind-specific handling.

use nostr_sdk::prelude::{Event, Kind, Timestamp};

use crate::error::ValidationError;

/// Events may not claim a `created_at` more than this far in the future.
pub const MAX_FUTURE_SKEW_SECS: i64 = 2;

/// `created_at` before this is rejected regardless of kind (2019-01-01 UTC).
pub const MIN_CREATED_AT: i64 = 1_546_300_800;

/// NIP-42 authentication event kind; gets a wider, symmetric time window.
pub const AUTH_KIND: u16 = 22242;
pub const AUTH_WINDOW_SECS: i64 = 600;

/// Validate signature, optional expected kind, and the time-skew window.
/// This recomputes the event id and re-verifies the signature independently
/// of whatever the caller already checked (defense in depth, §4.4).
pub fn validate(event: &Event, expected_kind: Option<Kind>) -> Result<(), ValidationError> {
    if let Some(expected) = expected_kind {
        if event.kind != expected {
            return Err(ValidationError::InvalidKind {
                expected: expected.as_u16(),
                actual: event.kind.as_u16(),
            });
        }
    }
    check_time_window(event)?;
    event.verify().map_err(|_| ValidationError::BadSignature)?;
    Ok(())
}

fn check_time_window(event: &Event) -> Result<(), ValidationError> {
    let now = Timestamp::now().as_u64() as i64;
    let created = event.created_at.as_u64() as i64;
    let (min, max) = if event.kind.as_u16() == AUTH_KIND {
        (now - AUTH_WINDOW_SECS, now + AUTH_WINDOW_SECS)
    } else {
        (MIN_CREATED_AT, now + MAX_FUTURE_SKEW_SECS)
    };
    if created < min || created > max {
        return Err(ValidationError::BadTime(created));
    }
    Ok(())
}

/// Kind-allow check: an empty whitelist means "accept any kind".
pub fn check_kind_allowed(kind: Kind, whitelist: &[u16]) -> Result<(), ValidationError> {
    if whitelist.is_empty() {
        return Ok(());
    }
    let k = kind.as_u16();
    if whitelist.contains(&k) {
        Ok(())
    } else {
        Err(ValidationError::KindNotAllowed(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::*;

    fn signed_event(kind: Kind, created_at: Timestamp) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(kind, "hello")
            .custom_created_at(created_at)
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn accepts_fresh_event() {
        let event = signed_event(Kind::TextNote, Timestamp::now());
        assert!(validate(&event, None).is_ok());
    }

    #[test]
    fn rejects_event_too_far_in_future() {
        let future = Timestamp::from(Timestamp::now().as_u64() + 60);
        let event = signed_event(Kind::TextNote, future);
        assert!(matches!(validate(&event, None), Err(ValidationError::BadTime(_))));
    }

    #[test]
    fn rejects_event_before_genesis() {
        let event = signed_event(Kind::TextNote, Timestamp::from(1_000));
        assert!(matches!(validate(&event, None), Err(ValidationError::BadTime(_))));
    }

    #[test]
    fn auth_kind_gets_a_ten_minute_window() {
        let nine_min_ago = Timestamp::from(Timestamp::now().as_u64() - 9 * 60);
        let event = signed_event(Kind::Custom(AUTH_KIND), nine_min_ago);
        assert!(validate(&event, Some(Kind::Custom(AUTH_KIND))).is_ok());
    }

    #[test]
    fn rejects_mismatched_expected_kind() {
        let event = signed_event(Kind::TextNote, Timestamp::now());
        assert!(matches!(
            validate(&event, Some(Kind::Metadata)),
            Err(ValidationError::InvalidKind { .. })
        ));
    }

    #[test]
    fn empty_whitelist_allows_anything() {
        assert!(check_kind_allowed(Kind::TextNote, &[]).is_ok());
    }

    #[test]
    fn nonempty_whitelist_enforced() {
        assert!(check_kind_allowed(Kind::TextNote, &[0, 3]).is_err());
        assert!(check_kind_allowed(Kind::Metadata, &[0, 3]).is_ok());
    }
}
