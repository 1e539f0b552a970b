use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::chainlog;
use crate::metrics::{self, INGEST_EVENTS, POLICY_QUERIES};
use crate::policy::{IngestOutcome, PolicyEngine};
use crate::store::Store;

/// Shared state for the policy core server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PolicyEngine>,
    pub store: Store,
}

/// Assemble the policy core router: ingest plane, policy plane, chain
/// analytics, and the standard probes.
pub fn core_router(state: AppState) -> Router {
    Router::new()
        .route("/ingest/event", post(ingest_event))
        .route("/ingest/edge", post(ingest_edge))
        .route("/ingest/prefetch", post(ingest_prefetch))
        .route("/policy/next", get(policy_next))
        .route("/api/top/bigrams", get(top_bigrams))
        .route("/api/top/trigrams", get(top_trigrams))
        .route("/api/users/{user}/bigrams", get(user_bigrams))
        .route("/api/users/{user}/trigrams", get(user_trigrams))
        .route("/health", get(health))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Ingest plane
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EventIngest {
    pub service: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub user_key: Option<String>,
    pub from_path: String,
    pub to_path: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub status: Option<u16>,
    #[serde(default)]
    #[allow(dead_code)]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct EdgeIngest {
    pub src_service: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub user_key: Option<String>,
    pub src_path: String,
    pub dst_service: String,
    pub dst_path: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub status: Option<u16>,
    #[serde(default)]
    #[allow(dead_code)]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct IngestReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<bool>,
}

impl IngestReply {
    fn from_outcome(kind: &'static str, outcome: IngestOutcome) -> Json<Self> {
        let skipped = outcome == IngestOutcome::Skipped;
        INGEST_EVENTS
            .with_label_values(&[kind, if skipped { "skipped" } else { "recorded" }])
            .inc();
        Json(Self {
            ok: true,
            skipped: skipped.then_some(true),
        })
    }
}

fn bad_request(detail: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail })))
}

fn validate_path(p: &str) -> bool {
    !p.is_empty() && p.starts_with('/')
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(body): Json<EventIngest>,
) -> impl IntoResponse {
    if body.service.is_empty() {
        return bad_request("service is required").into_response();
    }
    if !validate_path(&body.from_path) || !validate_path(&body.to_path) {
        return bad_request("paths must be absolute").into_response();
    }

    let outcome = state
        .engine
        .ingest_intra(&body.service, &body.from_path, &body.to_path)
        .await;
    IngestReply::from_outcome("event", outcome).into_response()
}

async fn ingest_edge(
    State(state): State<AppState>,
    Json(body): Json<EdgeIngest>,
) -> impl IntoResponse {
    if body.src_service.is_empty() || body.dst_service.is_empty() {
        return bad_request("src_service and dst_service are required").into_response();
    }
    if !validate_path(&body.src_path) || !validate_path(&body.dst_path) {
        return bad_request("paths must be absolute").into_response();
    }

    let outcome = state
        .engine
        .ingest_cross(
            &body.src_service,
            &body.src_path,
            &body.dst_service,
            &body.dst_path,
        )
        .await;
    IngestReply::from_outcome("edge", outcome).into_response()
}

async fn ingest_prefetch(
    State(state): State<AppState>,
    Json(body): Json<EdgeIngest>,
) -> impl IntoResponse {
    if body.src_service.is_empty() || body.dst_service.is_empty() {
        return bad_request("src_service and dst_service are required").into_response();
    }
    if !validate_path(&body.src_path) || !validate_path(&body.dst_path) {
        return bad_request("paths must be absolute").into_response();
    }

    let outcome = state
        .engine
        .ingest_attempt(
            &body.src_service,
            &body.src_path,
            &body.dst_service,
            &body.dst_path,
        )
        .await;
    IngestReply::from_outcome("prefetch", outcome).into_response()
}

// ---------------------------------------------------------------------------
// Policy plane
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PolicyQuery {
    pub service: String,
    pub path: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub user_key: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    3
}

async fn policy_next(
    State(state): State<AppState>,
    Query(q): Query<PolicyQuery>,
) -> impl IntoResponse {
    if q.service.is_empty() || !validate_path(&q.path) {
        return bad_request("service and an absolute path are required").into_response();
    }

    POLICY_QUERIES.with_label_values(&[&q.service]).inc();
    let resp = state.engine.next(&q.service, &q.path, q.limit).await;
    Json(resp).into_response()
}

// ---------------------------------------------------------------------------
// Chain analytics (JSON only; the HTML dashboard is not part of this server)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    #[serde(default = "default_top_limit")]
    pub limit: usize,
}

fn default_top_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
struct ChainItem {
    seq: String,
    count: i64,
}

async fn top_zset(store: &Store, key: String, limit: usize) -> Json<serde_json::Value> {
    let items: Vec<ChainItem> = store
        .zset_top(&key, limit)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(seq, count)| ChainItem { seq, count })
        .collect();
    Json(json!({ "key": key, "items": items }))
}

async fn top_bigrams(State(state): State<AppState>, Query(q): Query<TopQuery>) -> impl IntoResponse {
    top_zset(&state.store, chainlog::k_top2_global(), q.limit).await
}

async fn top_trigrams(
    State(state): State<AppState>,
    Query(q): Query<TopQuery>,
) -> impl IntoResponse {
    top_zset(&state.store, chainlog::k_top3_global(), q.limit).await
}

async fn user_bigrams(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(q): Query<TopQuery>,
) -> impl IntoResponse {
    top_zset(&state.store, chainlog::k_top2_user(&user), q.limit).await
}

async fn user_trigrams(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(q): Query<TopQuery>,
) -> impl IntoResponse {
    top_zset(&state.store, chainlog::k_top3_user(&user), q.limit).await
}
