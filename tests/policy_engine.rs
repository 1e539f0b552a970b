//! Integration tests for the policy core HTTP surface: ingest plane,
//! next-path ranking, and the chain analytics endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use anticip8::chainlog;
use anticip8::config::PolicyConfig;
use anticip8::policy::PolicyEngine;
use anticip8::server::{core_router, AppState};
use anticip8::store::Store;

fn build_core(store: Store) -> Router {
    let engine = Arc::new(PolicyEngine::new(store.clone(), PolicyConfig::default()));
    core_router(AppState { engine, store })
}

async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn learn_then_predict() {
    let app = build_core(Store::memory());

    for _ in 0..3 {
        let (status, body) = post_json(
            &app,
            "/ingest/event",
            json!({
                "service": "svc_s",
                "user_key": "u1",
                "from_path": "/a",
                "to_path": "/b",
                "status": 200,
                "latency_ms": 42
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert!(body.get("skipped").is_none());
    }

    let (status, body) = get_json(&app, "/policy/next?service=svc_s&path=/a&limit=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_prefetch"], 2);
    assert_eq!(body["max_prefetch_time_ms"], 120);

    let top = &body["next_paths"][0];
    assert_eq!(top["service"], "svc_s");
    assert_eq!(top["path"], "/b");
    assert!(top["score"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn normalization_generalizes_across_ids() {
    let app = build_core(Store::memory());

    let (status, _) = post_json(
        &app,
        "/ingest/event",
        json!({
            "service": "svc_s",
            "from_path": "/orders/42/",
            "to_path": "/orders/42/items"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get_json(&app, "/policy/next?service=svc_s&path=/orders/7").await;
    let paths: Vec<&str> = body["next_paths"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["path"].as_str().unwrap())
        .collect();
    assert!(paths.contains(&"/orders/{id}/items"), "got {paths:?}");
}

#[tokio::test]
async fn noise_paths_are_skipped_everywhere() {
    let app = build_core(Store::memory());

    let (status, body) = post_json(
        &app,
        "/ingest/event",
        json!({
            "service": "svc_s",
            "from_path": "/metrics",
            "to_path": "/a"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["skipped"], true);

    let (status, body) = get_json(&app, "/policy/next?service=svc_s&path=/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_prefetch"], 0);
    assert!(body["next_paths"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn cross_service_edges_feed_prediction() {
    let app = build_core(Store::memory());

    for _ in 0..2 {
        let (status, body) = post_json(
            &app,
            "/ingest/edge",
            json!({
                "src_service": "orders-api",
                "src_path": "/orders/5",
                "dst_service": "options-api",
                "dst_path": "/order-options/5",
                "status": 200,
                "latency_ms": 10
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    let (_, body) = get_json(&app, "/policy/next?service=orders-api&path=/orders/9").await;
    let top = &body["next_paths"][0];
    assert_eq!(top["service"], "options-api");
    assert_eq!(top["path"], "/order-options/{id}");
}

#[tokio::test]
async fn prefetch_attempts_are_segregated_from_scoring() {
    let app = build_core(Store::memory());

    let (status, body) = post_json(
        &app,
        "/ingest/prefetch",
        json!({
            "src_service": "svc_s",
            "src_path": "/a",
            "dst_service": "svc_p",
            "dst_path": "/guessed",
            "status": 200,
            "latency_ms": 5
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // Attempts are a weak signal and excluded from scoring by default.
    let (_, body) = get_json(&app, "/policy/next?service=svc_s&path=/a").await;
    assert!(body["next_paths"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn bad_ingest_input_is_rejected_without_state_change() {
    let app = build_core(Store::memory());

    let (status, _) = post_json(
        &app,
        "/ingest/event",
        json!({ "service": "", "from_path": "/a", "to_path": "/b" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &app,
        "/ingest/event",
        json!({ "service": "svc_s", "from_path": "relative", "to_path": "/b" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Missing fields entirely: the JSON extractor rejects before the handler.
    let (status, _) = post_json(&app, "/ingest/event", json!({ "service": "svc_s" })).await;
    assert!(status.is_client_error());

    let (_, body) = get_json(&app, "/policy/next?service=svc_s&path=/a").await;
    assert!(body["next_paths"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn policy_next_requires_service_and_path() {
    let app = build_core(Store::memory());

    let (status, _) = get_json(&app, "/policy/next?service=&path=/a").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(&app, "/policy/next?service=svc_s&path=notapath").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn repeated_ingests_keep_counts_monotone() {
    let store = Store::memory();
    let app = build_core(store.clone());

    let mut last_total = 0i64;
    for round in 1..=4 {
        post_json(
            &app,
            "/ingest/event",
            json!({ "service": "svc_s", "from_path": "/a", "to_path": "/b" }),
        )
        .await;

        let counts = store.hash_counts("trans:svc_s:/a").await.unwrap();
        let total: i64 = counts.values().sum();
        assert!(total >= round, "round {round}: total {total}");
        assert!(total >= last_total, "counts must be nondecreasing");
        last_total = total;
    }
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let app = build_core(Store::memory());

    let (status, _) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    // Touch at least one series so the exposition is non-trivial.
    post_json(
        &app,
        "/ingest/event",
        json!({ "service": "svc_m", "from_path": "/a", "to_path": "/b" }),
    )
    .await;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("anticip8_"));
}

#[tokio::test]
async fn chain_analytics_expose_top_sequences() {
    let store = Store::memory();
    let app = build_core(store.clone());

    let ttl = Duration::from_secs(3600);
    chainlog::log_step(&store, "svc_s", "u9", "/a", ttl, true, true).await;
    chainlog::log_step(&store, "svc_s", "u9", "/b", ttl, true, true).await;
    chainlog::log_step(&store, "svc_s", "u9", "/c", ttl, true, true).await;

    let (status, body) = get_json(&app, "/api/top/bigrams?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let seqs: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["seq"].as_str().unwrap())
        .collect();
    assert!(seqs.contains(&"svc_s|/a -> svc_s|/b"));
    assert!(seqs.contains(&"svc_s|/b -> svc_s|/c"));

    let (_, body) = get_json(&app, "/api/top/trigrams?limit=10").await;
    assert_eq!(body["items"][0]["seq"], "svc_s|/a -> svc_s|/b -> svc_s|/c");
    assert_eq!(body["items"][0]["count"], 1);

    let (_, body) = get_json(&app, "/api/users/u9/bigrams?limit=10").await;
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (_, body) = get_json(&app, "/api/users/nobody/bigrams?limit=10").await;
    assert!(body["items"].as_array().unwrap().is_empty());
}
