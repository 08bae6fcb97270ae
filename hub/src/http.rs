//! HTTP API surface and WebSocket upgrade entrypoint (spec §6). Router shape
//! and constant-time bearer check are generalized from the pack's
//! `validate_bearer`/`constant_time_eq` helper to a per-user lookup, since
//! the hub serves multiple operators rather than one shared static token.

use std::sync::Arc;

use axum::Extension;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use beszel_core::{AlertRule, SystemId, UserId};

use crate::db::RecordStore;
use crate::error::HubError;
use crate::manager::SystemManager;

pub struct HubState {
    pub manager: Arc<SystemManager>,
    pub store: Arc<dyn RecordStore>,
    pub disable_password_auth: bool,
    pub csp: Option<String>,
}

pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/api/beszel/agent-connect", get(agent_connect))
        .route("/api/beszel/getkey", get(get_key))
        .route("/api/beszel/first-run", get(first_run))
        .route("/api/beszel/user-alerts", post(create_user_alerts).delete(delete_user_alerts))
        .route("/api/beszel/systemd/info", get(systemd_info))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer auth, exempt for the agent WS upgrade (agents authenticate via the
/// fingerprint protocol instead, spec §4.4) and `first-run`.
async fn auth_layer(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    mut req: axum::extract::Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if state.disable_password_auth || path == "/api/beszel/agent-connect" || path == "/api/beszel/first-run" {
        return next.run(req).await;
    }
    match validate_bearer(&headers, state.store.as_ref()).await {
        Ok(user_id) => {
            req.extensions_mut().insert(user_id);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Constant-time-compares the bearer header against every known user's
/// stored token (spec §6), returning the matching caller's id.
async fn validate_bearer(headers: &HeaderMap, store: &dyn RecordStore) -> Result<UserId, HubError> {
    let header = headers.get("authorization").and_then(|v| v.to_str().ok()).ok_or(HubError::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(HubError::Unauthorized)?;
    if token.is_empty() {
        return Err(HubError::Unauthorized);
    }
    let candidates = store.list_user_tokens().await.map_err(HubError::Persistence)?;
    candidates
        .into_iter()
        .find(|(_, stored)| constant_time_eq(stored, token))
        .map(|(user_id, _)| user_id)
        .ok_or(HubError::Unauthorized)
}

#[derive(Deserialize)]
struct AgentConnectQuery {
    system: SystemId,
}

async fn agent_connect(
    State(state): State<Arc<HubState>>,
    Query(query): Query<AgentConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let manager = Arc::clone(&state.manager);
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = manager.handle_ws_upgrade(query.system, socket).await {
            tracing::warn!(%err, system_id = %query.system, "agent connection rejected");
        }
    })
}

#[derive(Serialize)]
struct GetKeyResponse {
    key: String,
}

async fn get_key(State(state): State<Arc<HubState>>) -> Json<GetKeyResponse> {
    Json(GetKeyResponse { key: state.manager.ssh_identity().authorized_key_line() })
}

#[derive(Serialize)]
struct FirstRunResponse {
    #[serde(rename = "firstRun")]
    first_run: bool,
}

async fn first_run(State(state): State<Arc<HubState>>) -> Result<Json<FirstRunResponse>, HubError> {
    let systems = state.store.list_systems().await.map_err(HubError::Persistence)?;
    Ok(Json(FirstRunResponse { first_run: systems.is_empty() }))
}

#[derive(Deserialize)]
struct UserAlertsCreateRequest {
    name: String,
    value: f64,
    min: i64,
    systems: Vec<SystemId>,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn create_user_alerts(
    State(state): State<Arc<HubState>>,
    caller: Option<Extension<UserId>>,
    Json(req): Json<UserAlertsCreateRequest>,
) -> Result<Json<SuccessResponse>, HubError> {
    if req.systems.is_empty() {
        return Err(HubError::BadRequest("systems must not be empty".into()));
    }
    let caller_id: Option<UserId> = caller.map(|Extension(id)| id);
    for system_id in &req.systems {
        let system = state
            .store
            .get_system(*system_id)
            .await
            .map_err(HubError::Persistence)?
            .ok_or(HubError::NotFound)?;
        if let Some(caller_id) = caller_id {
            if caller_id != system.user_id {
                return Err(HubError::Unauthorized);
            }
        }

        let existing = state.store.list_alert_rules(*system_id).await.map_err(HubError::Persistence)?;
        if !req.overwrite && existing.iter().any(|r| r.name == req.name) {
            continue;
        }

        let rule = AlertRule {
            id: Uuid::new_v4(),
            system_id: *system_id,
            user_id: system.user_id,
            name: req.name.clone(),
            descriptor: None,
            threshold: req.value,
            min_duration_minutes: req.min,
            enabled: true,
            triggered: false,
        };
        state.store.upsert_alert_rule(&rule).await.map_err(HubError::Persistence)?;
    }
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Deserialize)]
struct UserAlertsDeleteRequest {
    name: String,
    systems: Vec<SystemId>,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    count: usize,
}

async fn delete_user_alerts(
    State(state): State<Arc<HubState>>,
    caller: Option<Extension<UserId>>,
    Json(req): Json<UserAlertsDeleteRequest>,
) -> Result<Json<DeleteResponse>, HubError> {
    let caller_id: Option<UserId> = caller.map(|Extension(id)| id);
    let mut count = 0;
    for system_id in &req.systems {
        let system = state
            .store
            .get_system(*system_id)
            .await
            .map_err(HubError::Persistence)?
            .ok_or(HubError::NotFound)?;
        if let Some(caller_id) = caller_id {
            if caller_id != system.user_id {
                return Err(HubError::Unauthorized);
            }
        }
        count += state.store.delete_alert_rules(*system_id, &req.name).await.map_err(HubError::Persistence)? as usize;
    }
    Ok(Json(DeleteResponse { success: true, count }))
}

#[derive(Deserialize)]
struct SystemdInfoQuery {
    system: SystemId,
    service: String,
}

#[derive(Serialize)]
struct SystemdInfoResponse {
    details: serde_json::Value,
}

async fn systemd_info(
    State(state): State<Arc<HubState>>,
    Query(query): Query<SystemdInfoQuery>,
) -> Result<Json<SystemdInfoResponse>, HubError> {
    let key = beszel_core::fnv32(format!("{}||{}", query.system, query.service).as_bytes());
    let details = state.store.get_systemd_service(key).await.map_err(HubError::Persistence)?.ok_or(HubError::NotFound)?;
    Ok(Json(SystemdInfoResponse { details }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq("abc", "ab"));
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
    }

    #[tokio::test]
    async fn validate_bearer_requires_well_formed_header() {
        let store = InMemoryStore::new();
        let headers = HeaderMap::new();
        assert!(validate_bearer(&headers, &store).await.is_err());
    }

    #[tokio::test]
    async fn validate_bearer_matches_stored_token_and_rejects_others() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        store.seed_user_token(user_id, "tok123");

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok123".parse().unwrap());
        assert_eq!(validate_bearer(&headers, &store).await.unwrap(), user_id);

        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(validate_bearer(&headers, &store).await.is_err());
    }
}
