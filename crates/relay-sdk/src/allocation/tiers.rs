//! Tier selection (§4.6.2) — pure function of subject, prior tier, and the
//! current settings snapshot. Never touches storage.

use crate::config::{RelayMode, RelaySettings, Tier};

const SYNTHETIC_FREE_BYTES: u64 = 100 * 1024 * 1024;

/// The tier handed to a subject who matches no configured free tier: a
/// 100 MiB "Basic Free" plan, same as a fresh config ships with.
pub fn synthetic_free_tier() -> Tier {
    Tier { name: "Basic Free".into(), price_sats: 0, monthly_limit_bytes: SYNTHETIC_FREE_BYTES, unlimited: false }
}

fn in_allowed_list(pubkey_hex: &str, settings: &RelaySettings) -> bool {
    settings.allowed_read.contains(pubkey_hex) || settings.allowed_write.contains(pubkey_hex)
}

/// Select the tier a subject should hold right now. `current_tier` is the
/// tier named by their existing allocation record, if any.
pub fn select_tier(pubkey_hex: &str, current_tier: Option<&Tier>, settings: &RelaySettings) -> Option<Tier> {
    match settings.mode {
        RelayMode::Public | RelayMode::Subscription => {
            Some(settings.free_tier().cloned().unwrap_or_else(synthetic_free_tier))
        }
        RelayMode::InviteOnly => {
            let override_name = settings.allowed_users.get(pubkey_hex).and_then(|e| e.tier_name.as_deref());
            if let Some(name) = override_name {
                if let Some(tier) = settings.tier_by_name(name) {
                    return Some(tier.clone());
                }
            }
            if in_allowed_list(pubkey_hex, settings) {
                settings.tiers.first().cloned()
            } else {
                None
            }
        }
        RelayMode::OnlyMe => current_tier
            .cloned()
            .or_else(|| settings.tiers.first().cloned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllowedUserEntry;

    fn settings_with_mode(mode: RelayMode) -> RelaySettings {
        RelaySettings { mode, ..RelaySettings::default() }
    }

    #[test]
    fn public_mode_falls_back_to_synthetic_free_tier_when_none_configured() {
        let mut settings = settings_with_mode(RelayMode::Public);
        settings.tiers.clear();
        let tier = select_tier("abc", None, &settings).unwrap();
        assert_eq!(tier.name, "Basic Free");
    }

    #[test]
    fn invite_only_prefers_explicit_override() {
        let mut settings = settings_with_mode(RelayMode::InviteOnly);
        settings.tiers.push(Tier { name: "gold".into(), price_sats: 1000, monthly_limit_bytes: 10, unlimited: false });
        settings
            .allowed_users
            .insert("abc".into(), AllowedUserEntry { tier_name: Some("gold".into()) });
        let tier = select_tier("abc", None, &settings).unwrap();
        assert_eq!(tier.name, "gold");
    }

    #[test]
    fn invite_only_rejects_unlisted_pubkey() {
        let settings = settings_with_mode(RelayMode::InviteOnly);
        assert!(select_tier("stranger", None, &settings).is_none());
    }

    #[test]
    fn invite_only_allowed_list_gets_first_tier() {
        let mut settings = settings_with_mode(RelayMode::InviteOnly);
        settings.allowed_write.insert("abc".into());
        let tier = select_tier("abc", None, &settings).unwrap();
        assert_eq!(tier.name, settings.tiers[0].name);
    }

    #[test]
    fn only_me_keeps_current_tier() {
        let settings = settings_with_mode(RelayMode::OnlyMe);
        let current = Tier { name: "whatever".into(), price_sats: 0, monthly_limit_bytes: 1, unlimited: false };
        let tier = select_tier("abc", Some(&current), &settings).unwrap();
        assert_eq!(tier.name, "whatever");
    }

    #[test]
    fn only_me_falls_back_to_first_configured_tier() {
        let settings = settings_with_mode(RelayMode::OnlyMe);
        let tier = select_tier("abc", None, &settings).unwrap();
        assert_eq!(tier.name, settings.tiers[0].name);
    }
}
