use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anticip8::config::Config;
use anticip8::policy::PolicyEngine;
use anticip8::server::{core_router, AppState};
use anticip8::store::Store;

#[derive(Parser)]
#[command(name = "anticip8-core")]
#[command(about = "Anticip8 policy engine: transition ingest and next-path ranking", long_about = None)]
struct Cli {
    /// Server host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, env = "ANTICIP8_CORE_PORT", default_value = "8000")]
    port: u16,

    /// Shared state store URL
    #[arg(
        long,
        env = "ANTICIP8_REDIS_URL",
        default_value = "redis://127.0.0.1:6379/0"
    )]
    redis_url: String,

    /// Use the in-process store instead of redis (single-node dev runs)
    #[arg(long, default_value = "false")]
    memory_store: bool,
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
    let config = Config::from_env(cli.redis_url.clone())?;

    let store = if cli.memory_store {
        tracing::warn!("using in-process store; state dies with this process");
        Store::memory()
    } else {
        let store = Store::connect(config.redis_url()).await?;
        tracing::info!("connected to state store at {}", config.redis_url());
        store
    };

    let engine = Arc::new(PolicyEngine::new(store.clone(), config.policy().clone()));
    tracing::info!(
        smooth = config.policy().markov_smooth,
        min_prob = config.policy().min_prob,
        i2v_alpha = config.policy().i2v_alpha,
        "policy engine ready"
    );

    let app = core_router(AppState { engine, store });

    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, cli.port));
    tracing::info!("anticip8-core listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
