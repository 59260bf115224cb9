//! C1 — read-only projection of operator settings, with change notification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// The admission policy the relay currently runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMode {
    Public,
    Subscription,
    InviteOnly,
    OnlyMe,
}

impl RelayMode {
    pub fn is_free(self) -> bool {
        matches!(self, RelayMode::Public | RelayMode::InviteOnly | RelayMode::OnlyMe)
    }

    pub fn is_paid(self) -> bool {
        matches!(self, RelayMode::Subscription)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub price_sats: u64,
    pub monthly_limit_bytes: u64,
    #[serde(default)]
    pub unlimited: bool,
}

impl Tier {
    pub fn is_valid(&self) -> bool {
        self.monthly_limit_bytes > 0 || self.unlimited
    }

    pub fn is_free(&self) -> bool {
        self.price_sats == 0
    }
}

/// Per-pubkey override consulted under `invite-only` mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowedUserEntry {
    #[serde(default)]
    pub tier_name: Option<String>,
}

/// Nostr event kind reserved for the relay-signed allocation record.
///
/// The source this spec was distilled from used kind 888 in some places and
/// kind 11888 in others. We treat it as an operator-configured constant
/// instead of guessing; `DEFAULT_ALLOCATION_KIND` is only the out-of-the-box
/// default for a fresh config file.
pub const DEFAULT_ALLOCATION_KIND: u16 = 11888;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub contact: String,
    pub software: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Default for RelayInfo {
    fn default() -> Self {
        Self {
            name: "relayd".into(),
            description: String::new(),
            pubkey: String::new(),
            contact: String::new(),
            software: "relayd".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            icon: None,
        }
    }
}

/// Snapshot of operator settings. Deserialized from the on-disk config file
/// at startup and replaced wholesale on every admin-side change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    pub mode: RelayMode,
    pub tiers: Vec<Tier>,
    #[serde(default)]
    pub kind_whitelist: Vec<u16>,
    #[serde(default = "default_allocation_kind")]
    pub allocation_kind: u16,
    /// When set, every kind routes through the registry's `"universal"`
    /// handler instead of its own `kind/<n>` entry — an open-relay mode
    /// for operators who don't want to register a handler per kind (§4.4
    /// "route by mode").
    #[serde(default)]
    pub unlimited_kind_mode: bool,
    #[serde(default)]
    pub allowed_read: HashSet<String>,
    #[serde(default)]
    pub allowed_write: HashSet<String>,
    #[serde(default)]
    pub allowed_users: HashMap<String, AllowedUserEntry>,
    #[serde(default)]
    pub owner_pubkey: Option<String>,
    pub relay_identity_key: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub info: RelayInfo,
    /// Unix timestamp of the last settings change, surfaced so the
    /// reconciliation debounce (§4.6.8) can tell whether it is stale.
    #[serde(default)]
    pub updated_at: i64,
}

fn default_allocation_kind() -> u16 {
    DEFAULT_ALLOCATION_KIND
}

fn default_bind_addr() -> String {
    "0.0.0.0:7000".into()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            mode: RelayMode::Public,
            tiers: vec![Tier {
                name: "free".into(),
                price_sats: 0,
                monthly_limit_bytes: 100 * 1024 * 1024,
                unlimited: false,
            }],
            kind_whitelist: Vec::new(),
            allocation_kind: DEFAULT_ALLOCATION_KIND,
            unlimited_kind_mode: false,
            allowed_read: HashSet::new(),
            allowed_write: HashSet::new(),
            allowed_users: HashMap::new(),
            owner_pubkey: None,
            relay_identity_key: String::new(),
            bind_addr: default_bind_addr(),
            info: RelayInfo::default(),
            updated_at: 0,
        }
    }
}

impl RelaySettings {
    /// Tiers with `price_sats > 0`, ordered highest price first (the order
    /// cascades and the high-tier payment path walk use).
    pub fn paid_tiers_desc(&self) -> Vec<&Tier> {
        let mut tiers: Vec<&Tier> = self.tiers.iter().filter(|t| !t.is_free()).collect();
        tiers.sort_by(|a, b| b.price_sats.cmp(&a.price_sats));
        tiers
    }

    pub fn free_tier(&self) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.is_free())
    }

    pub fn tier_by_name(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    pub fn is_owner(&self, pubkey_hex: &str) -> bool {
        self.owner_pubkey.as_deref() == Some(pubkey_hex)
    }
}

/// Read-only, change-watchable view over the current settings. Readers
/// never block: `current()` clones an `Arc`, never taking the writer lock.
#[derive(Clone)]
pub struct Config {
    rx: watch::Receiver<Arc<RelaySettings>>,
    tx: Arc<watch::Sender<Arc<RelaySettings>>>,
}

impl Config {
    pub fn new(settings: RelaySettings) -> Self {
        let (tx, rx) = watch::channel(Arc::new(settings));
        Self { rx, tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<RelaySettings> {
        self.rx.borrow().clone()
    }

    /// Replace the settings wholesale. Triggers every outstanding
    /// `watch()` receiver, which is what the reconciliation debounce
    /// listens on.
    pub fn update(&self, mut settings: RelaySettings) {
        settings.updated_at = chrono::Utc::now().timestamp();
        let _ = self.tx.send(Arc::new(settings));
    }

    pub fn watch(&self) -> watch::Receiver<Arc<RelaySettings>> {
        self.rx.clone()
    }
}
