use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use ferry_shared::ServerEvent;
use ferry_store::{AuthorProfile, BlockedAuthor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::db::SharedDatabase;
use crate::error::ServerError;
use crate::hub::HubHandle;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::ws::ws_handler;

const DEFAULT_NOTICE_LIMIT: u32 = 50;
const MAX_NOTICE_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub db: SharedDatabase,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/internal/events", post(publish_event))
        .route(
            "/internal/blocklist",
            get(list_blocked).post(block_author).delete(unblock_author),
        )
        .route("/internal/authors/:author_id", get(author_profile))
        .route("/internal/notifications/:uid", get(notifications))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online: usize,
    connections: usize,
    records: u64,
}

#[derive(Deserialize)]
struct BlockRequest {
    author_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct UnblockRequest {
    author_id: String,
}

#[derive(Deserialize)]
struct NoticeQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NoticeResponse {
    id: i64,
    kind: &'static str,
    record_id: String,
    from_uid: String,
    from_name: String,
    created_at: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(
    State(state): State<AppState>,
) -> Result<Json<ServerInfoResponse>, ServerError> {
    let stats = state.hub.stats().await?;
    let records = state.db.call(|db| db.count_records()).await?;
    Ok(Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online: stats.online,
        connections: stats.connections,
        records,
    }))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Internal API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

/// Hand one event from a collaborator (reactions, edits, deletes) to the
/// hub for fan-out to every connection.
async fn publish_event(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let event = ServerEvent::from_value(body)?;
    let kind = event.kind();
    state.hub.publish(event).await?;

    info!(kind = kind.tag(), "Published collaborator event");
    Ok(Json(json!({ "published": true, "type": kind.tag() })))
}

async fn list_blocked(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<BlockedAuthor>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let blocked = state.db.call(|db| db.blocked_authors()).await?;
    Ok(Json(blocked))
}

async fn block_author(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<BlockedAuthor>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let author_id = req.author_id.trim().to_string();
    if author_id.is_empty() {
        return Err(ServerError::BadRequest("author_id must not be empty".into()));
    }

    let reason = req.reason;
    let blocked = state
        .db
        .call(move |db| db.block_author(&author_id, reason.as_deref()))
        .await?;
    Ok(Json(blocked))
}

async fn unblock_author(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UnblockRequest>,
) -> Result<Json<Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let author_id = req.author_id;
    let removed = state
        .db
        .call(move |db| db.unblock_author(&author_id))
        .await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn author_profile(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(author_id): Path<String>,
) -> Result<Json<AuthorProfile>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let profile = state.db.call(move |db| db.get_author(&author_id)).await?;
    Ok(Json(profile))
}

async fn notifications(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<NoticeQuery>,
) -> Result<Json<Vec<NoticeResponse>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_NOTICE_LIMIT)
        .clamp(1, MAX_NOTICE_LIMIT);

    let stored = state
        .db
        .call(move |db| db.notifications_for(&uid, limit))
        .await?;

    Ok(Json(
        stored
            .into_iter()
            .map(|s| NoticeResponse {
                id: s.id,
                kind: s.notice.kind.as_str(),
                record_id: s.notice.record_id.as_str().to_string(),
                from_uid: s.notice.from_uid,
                from_name: s.notice.from_name,
                created_at: s.created_at.to_rfc3339(),
            })
            .collect(),
    ))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
