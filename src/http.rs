//! C1's public face: NIP-11 relay info on plain HTTP `GET /`.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Serialize;

use crate::ws::AppState;

#[derive(Serialize)]
struct RelayInfoDoc {
    name: String,
    description: String,
    pubkey: String,
    contact: String,
    supported_nips: Vec<u16>,
    software: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

const SUPPORTED_NIPS: [u16; 3] = [1, 11, 42];

pub async fn root(headers: HeaderMap, State(state): State<AppState>) -> impl IntoResponse {
    let wants_nip11 = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/nostr+json"))
        .unwrap_or(false);

    if !wants_nip11 {
        return (StatusCode::OK, "this is a nostr relay, speak websocket").into_response();
    }

    let settings = state.config.current();
    let doc = RelayInfoDoc {
        name: settings.info.name.clone(),
        description: settings.info.description.clone(),
        pubkey: settings.info.pubkey.clone(),
        contact: settings.info.contact.clone(),
        supported_nips: SUPPORTED_NIPS.to_vec(),
        software: settings.info.software.clone(),
        version: settings.info.version.clone(),
        icon: settings.info.icon.clone(),
    };
    Json(doc).into_response()
}
