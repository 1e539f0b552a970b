//! Demo backend service wrapped by the anticip8 orchestrator.
//!
//! A handful of latency-simulating endpoints, the response cache in front of
//! the expensive ones, and a registered internal warmer so same-service
//! speculation runs without an HTTP loopback.
//!
//! ```bash
//! # against a local core + redis
//! cargo run --bin anticip8-demo -- --port 8001
//!
//! # self-contained (in-process store)
//! cargo run --bin anticip8-demo -- --port 8001 --memory-store
//! ```

use anyhow::Result;
use axum::{
    extract::{Path, State},
    middleware::from_fn_with_state,
    response::Json,
    routing::get,
    Router,
};
use clap::Parser;
use rand::Rng;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anticip8::cache::{CacheRequest, CacheSpec, ResponseCache};
use anticip8::config::{build_http_client, SidecarConfig};
use anticip8::metrics::metrics_handler;
use anticip8::orchestrator::{self, Orchestrator, Warmer, WarmerCtx};
use anticip8::store::Store;
use futures::future::BoxFuture;

#[derive(Parser)]
#[command(name = "anticip8-demo")]
#[command(about = "Demo service fronted by the anticip8 prefetch orchestrator", long_about = None)]
struct Cli {
    /// Server host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Shared state store URL
    #[arg(
        long,
        env = "ANTICIP8_REDIS_URL",
        default_value = "redis://127.0.0.1:6379/0"
    )]
    redis_url: String,

    /// Use the in-process store instead of redis
    #[arg(long, default_value = "false")]
    memory_store: bool,
}

#[derive(Clone)]
struct DemoState {
    cache: ResponseCache,
}

async fn jitter(min_ms: u64, max_ms: u64) {
    let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn options_payload(order_id: &str) -> Value {
    json!({ "order_id": order_id, "options": ["A", "B", "C"] })
}

fn options_spec() -> CacheSpec {
    CacheSpec::new("options", Duration::from_secs(60))
}

async fn orders() -> Json<Value> {
    jitter(15, 30).await;
    let items: Vec<Value> = (1..=20)
        .map(|i| json!({ "id": i, "title": format!("Order {i}") }))
        .collect();
    Json(json!(items))
}

async fn order(Path(order_id): Path<u64>) -> Json<Value> {
    jitter(20, 40).await;
    Json(json!({
        "id": order_id,
        "items": rand::thread_rng().gen_range(1..=5),
    }))
}

async fn order_options(State(state): State<DemoState>, Path(order_id): Path<u64>) -> Json<Value> {
    let id = order_id.to_string();
    let req = CacheRequest::get(&format!("/order-options/{id}")).route_param("order_id", &id);
    let value = state
        .cache
        .get_or_compute(&options_spec(), &req, || async {
            jitter(120, 200).await;
            options_payload(&id)
        })
        .await;
    Json(value)
}

async fn pricing(State(state): State<DemoState>, Path(order_id): Path<u64>) -> Json<Value> {
    let id = order_id.to_string();
    let spec = CacheSpec::new("pricing", Duration::from_secs(60));
    let req = CacheRequest::get(&format!("/orders/{id}/pricing")).route_param("order_id", &id);
    let value = state
        .cache
        .get_or_compute(&spec, &req, || async {
            jitter(90, 180).await;
            json!({
                "order_id": id,
                "total": (rand::thread_rng().gen_range(1000..50000) as f64) / 100.0,
                "currency": "EUR",
            })
        })
        .await;
    Json(value)
}

async fn contacts() -> Json<Value> {
    jitter(40, 90).await;
    Json(json!([
        { "id": 1, "name": "Neo" },
        { "id": 2, "name": "Trinity" },
    ]))
}

async fn whoami() -> Json<Value> {
    Json(json!({
        "service": std::env::var("SERVICE_NAME").unwrap_or_else(|_| "options-api".into()),
        "core": std::env::var("ANTICIP8_CORE_URL").ok(),
    }))
}

/// Warm `/order-options/{id}` straight into the response cache: same payload,
/// same canonical key, no loopback request.
fn register_warmers(orch: &Orchestrator, cache: ResponseCache) {
    let warmer: Warmer = Arc::new(move |ctx: WarmerCtx| {
        let cache = cache.clone();
        let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async move {
            let id = ctx
                .id
                .ok_or_else(|| anyhow::anyhow!("warmer needs an order id"))?;
            let req =
                CacheRequest::get(&format!("/order-options/{id}")).route_param("order_id", &id);
            cache.warm(&options_spec(), &req, &options_payload(&id)).await;
            Ok(())
        });
        fut
    });
    orch.warmers.register("/order-options/{id}", warmer);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anticip8=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = SidecarConfig::from_env()?;

    let store = if cli.memory_store {
        tracing::warn!("using in-process store; state dies with this process");
        Store::memory()
    } else {
        Store::connect(&cli.redis_url).await?
    };

    let http = build_http_client()?;
    let cache = ResponseCache::new(store.clone(), &cfg.service_name);
    tracing::info!(
        service = %cfg.service_name,
        core = %cfg.core_url,
        prefetch = cfg.prefetch_enabled,
        "sidecar configured"
    );

    let orch = Arc::new(Orchestrator::new(cfg, store, http)?);
    register_warmers(&orch, cache.clone());

    let state = DemoState { cache };
    let app = Router::new()
        .route("/orders", get(orders))
        .route("/orders/{order_id}", get(order))
        .route("/orders/{order_id}/pricing", get(pricing))
        .route("/order-options/{order_id}", get(order_options))
        .route("/contacts", get(contacts))
        .route("/_whoami", get(whoami))
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(from_fn_with_state(orch.clone(), orchestrator::middleware))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, cli.port));
    tracing::info!("anticip8-demo listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
