//! Entry point for `relayd`: loads operator settings, wires up the C1-C8
//! components, binds the HTTP/WS listener, and runs until shutdown.

mod http;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use nostr_sdk::prelude::{Keys, SecretKey};
use relay_sdk::allocation::reconcile::{duration_until_next_renewal, run_daily_renewal, spawn_debounced_reconciler};
use relay_sdk::config::{Config, RelaySettings};
use relay_sdk::kinds::{cascade_delete, permission, replaceable};
use relay_sdk::registry::KindRegistry;
use relay_sdk::subscription::SubscriptionTable;
use relay_sdk::store_trait::{AddressPool, EventStore, StatsStore, WalletService};
use relay_sdk::DispatchCore;
use relay_store::{LoggingWalletService, MemoryAddressPool, MemoryBlobStore, MemoryEventStore, MemoryStatsStore};
use tower_http::cors::CorsLayer;

const INVITATION_KIND: u16 = 30610;
const ACCEPTANCE_KIND: u16 = 30611;
const CASCADE_DELETE_KIND: u16 = 16629;
const REPO_PERMISSION_KIND: u16 = 30617;

fn load_settings(path: &PathBuf) -> RelaySettings {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read config file {}: {err}", path.display()));
    serde_json::from_str(&raw).unwrap_or_else(|err| panic!("failed to parse config file {}: {err}", path.display()))
}

fn load_relay_keys(settings: &RelaySettings) -> Keys {
    let secret_key = SecretKey::from_hex(settings.relay_identity_key.trim())
        .unwrap_or_else(|err| panic!("relay_identity_key is not a valid secret key: {err}"));
    Keys::new(secret_key)
}

fn build_registry(registry: relay_sdk::registry::KindRegistryBuilder) -> KindRegistry {
    let resolver: Arc<dyn cascade_delete::OwnershipResolver> = Arc::new(cascade_delete::FirstSignerResolver);
    registry
        .register_kind(nostr_sdk::prelude::Kind::Custom(REPO_PERMISSION_KIND), permission::handle_permission_event(INVITATION_KIND, ACCEPTANCE_KIND))
        .expect("repository-permission handler registered once")
        .register_kind(nostr_sdk::prelude::Kind::Custom(CASCADE_DELETE_KIND), cascade_delete::cascade_delete_handler(resolver))
        .expect("cascade-delete handler registered once")
        .register_universal(replaceable::handle_replaceable)
        .expect("universal handler registered once")
        .build()
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mut config_path = PathBuf::from("./relay.json");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(value) = args.next() {
                config_path = PathBuf::from(value);
            }
        }
    }

    let settings = load_settings(&config_path);
    let relay_keys = load_relay_keys(&settings);
    let bind_addr = settings.bind_addr.clone();
    log::info!("loaded config from {}, relay pubkey {}", config_path.display(), relay_keys.public_key());

    let config = Config::new(settings);

    let events: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let stats: Arc<dyn StatsStore> = Arc::new(MemoryStatsStore::new());
    let pool: Arc<dyn AddressPool> = Arc::new(MemoryAddressPool::new());
    let wallet: Arc<dyn WalletService> = Arc::new(LoggingWalletService::new());
    let _blobs = Arc::new(MemoryBlobStore::new());

    let registry = build_registry(KindRegistry::builder());
    let subs = SubscriptionTable::new();
    let dispatch = DispatchCore::new(registry, subs, config.clone(), relay_keys.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reconcile_trigger = spawn_debounced_reconciler(
        config.current().allocation_kind,
        relay_keys.clone(),
        events.clone(),
        pool.clone(),
        wallet.clone(),
        config.clone(),
        shutdown_rx.clone(),
    );
    {
        let mut config_rx = config.watch();
        let trigger = reconcile_trigger.clone();
        tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                trigger.fire();
            }
        });
    }

    let renewal_handle = {
        let config = config.clone();
        let relay_keys = relay_keys.clone();
        let events = events.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let sleep = duration_until_next_renewal(chrono::Local::now());
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {
                        let settings = config.current();
                        let now = chrono::Utc::now().timestamp();
                        match run_daily_renewal(settings.allocation_kind, &relay_keys, events.as_ref(), &settings, now).await {
                            Ok(renewed) => log::info!("daily renewal reset {renewed} free-tier record(s)"),
                            Err(err) => log::error!("daily renewal pass failed: {err}"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    };

    let state = ws::AppState { config: config.clone(), dispatch, events, stats };
    let app = Router::new()
        .route("/", get(http::root))
        .route("/ws", get(ws::ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {bind_addr}: {err}"));
    log::info!("listening on {bind_addr}");

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        log::error!("server loop exited with error: {err}");
    }

    let _ = shutdown_tx.send(true);
    let _ = renewal_handle.await;
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown signal received"),
        Err(err) => log::error!("failed to install ctrl-c handler: {err}"),
    }
}
