use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::normalize::QueryMode;

/// Read an env var and parse it, falling back to `default` when the variable
/// is unset or empty. A set-but-unparsable value is a startup error, not a
/// silent fallback.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("invalid {key}={other}: expected a boolean"),
        },
        _ => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `svc=http://host:port,svc2=...` into a base-URL map.
fn env_url_map(key: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for entry in env_list(key) {
        let (svc, url) = entry
            .split_once('=')
            .with_context(|| format!("invalid {key} entry: {entry} (expected svc=url)"))?;
        map.insert(
            svc.trim().to_string(),
            url.trim().trim_end_matches('/').to_string(),
        );
    }
    Ok(map)
}

/// Policy engine tunables (the core server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Laplace smoothing constant; 0 disables smoothing.
    pub markov_smooth: f64,
    /// Probability floor below which markov edges are dropped.
    pub min_prob: f64,
    /// Self-loops are never scored; kept configurable for offline analysis.
    pub drop_self_loops: bool,
    /// Fold the prefetch-attempt table into scoring.
    pub allow_prefetch_attempts: bool,
    /// Multiplicative weight (< 1) on attempt-table probabilities.
    pub prefetch_attempt_weight: f64,
    /// Embedding weight in the hybrid score.
    pub i2v_alpha: f64,
    /// Similarity rows are truncated to this many entries on read.
    pub i2v_topk: usize,
    /// Advertised per-batch speculation cap.
    pub max_prefetch: u32,
    /// Advertised per-batch wall-clock budget.
    pub max_prefetch_time_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            markov_smooth: 0.25,
            min_prob: 0.02,
            drop_self_loops: true,
            allow_prefetch_attempts: false,
            prefetch_attempt_weight: 0.3,
            i2v_alpha: 0.65,
            i2v_topk: 30,
            max_prefetch: 2,
            max_prefetch_time_ms: 120,
        }
    }
}

impl PolicyConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            markov_smooth: env_parse("MARKOV_SMOOTH", d.markov_smooth)?,
            min_prob: env_parse("MIN_PROB", d.min_prob)?,
            drop_self_loops: env_bool("DROP_SELF_LOOPS", d.drop_self_loops)?,
            allow_prefetch_attempts: env_bool(
                "ALLOW_PREFETCH_ATTEMPTS_IN_POLICY",
                d.allow_prefetch_attempts,
            )?,
            prefetch_attempt_weight: env_parse(
                "PREFETCH_ATTEMPT_WEIGHT",
                d.prefetch_attempt_weight,
            )?,
            i2v_alpha: env_parse("I2V_ALPHA", d.i2v_alpha)?,
            i2v_topk: env_parse("I2V_TOPK", d.i2v_topk)?,
            max_prefetch: env_parse("MAX_PREFETCH", d.max_prefetch)?,
            max_prefetch_time_ms: env_parse("MAX_PREFETCH_TIME_MS", d.max_prefetch_time_ms)?,
        })
    }
}

/// Sidecar (orchestrator middleware) tunables.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub service_name: String,
    pub core_url: String,
    /// Peer service base URLs for cross-service speculation.
    pub base_urls: HashMap<String, String>,

    pub prefetch_enabled: bool,
    pub max_prefetch_concurrency: usize,
    /// Per-batch concurrent dispatch bound; the global semaphore still caps
    /// the whole process.
    pub max_batch_inflight: usize,
    pub prefetch_budget: Duration,
    pub min_prefetch_window: Duration,
    pub prefetch_min_score: f64,
    /// Regex over destination templates that must never be speculated.
    pub prefetch_deny: Option<String>,

    pub query_mode: QueryMode,
    pub query_allowlist: Vec<String>,

    pub intent_ttl: Duration,
    pub prefetch_mark_ttl: Duration,
    pub session_ttl: Duration,
    pub chain_ttl: Duration,

    pub race_grace: Duration,
    pub race_grace_max: Duration,

    pub policy_cache_ttl: Duration,
    pub policy_debounce: Duration,
    pub policy_timeout: Duration,

    pub breaker_trip_errors: usize,
    pub breaker_window: Duration,
    pub breaker_cooloff: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            core_url: "http://127.0.0.1:8000".to_string(),
            base_urls: HashMap::new(),
            prefetch_enabled: true,
            max_prefetch_concurrency: 2,
            max_batch_inflight: 2,
            prefetch_budget: Duration::from_millis(120),
            min_prefetch_window: Duration::from_millis(30),
            prefetch_min_score: 0.05,
            prefetch_deny: None,
            query_mode: QueryMode::Ignore,
            query_allowlist: Vec::new(),
            intent_ttl: Duration::from_secs(15),
            prefetch_mark_ttl: Duration::from_secs(30),
            session_ttl: Duration::from_secs(1800),
            chain_ttl: Duration::from_secs(3600),
            race_grace: Duration::from_millis(12),
            race_grace_max: Duration::from_millis(25),
            policy_cache_ttl: Duration::from_secs(2),
            policy_debounce: Duration::from_millis(500),
            policy_timeout: Duration::from_millis(250),
            breaker_trip_errors: 8,
            breaker_window: Duration::from_secs(10),
            breaker_cooloff: Duration::from_secs(5),
        }
    }
}

impl SidecarConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            service_name: env_parse("SERVICE_NAME", d.service_name)?,
            core_url: env_parse("ANTICIP8_CORE_URL", d.core_url)?,
            base_urls: env_url_map("ANTICIP8_BASE_URLS")?,
            prefetch_enabled: env_bool("PREFETCH_ENABLED", d.prefetch_enabled)?,
            max_prefetch_concurrency: env_parse(
                "MAX_PREFETCH_CONCURRENCY",
                d.max_prefetch_concurrency,
            )?,
            max_batch_inflight: env_parse("MAX_BATCH_INFLIGHT", d.max_batch_inflight)?,
            prefetch_budget: Duration::from_millis(env_parse(
                "PREFETCH_BUDGET_MS",
                d.prefetch_budget.as_millis() as u64,
            )?),
            min_prefetch_window: Duration::from_millis(env_parse(
                "MIN_PREFETCH_WINDOW_MS",
                d.min_prefetch_window.as_millis() as u64,
            )?),
            prefetch_min_score: env_parse("PREFETCH_MIN_SCORE", d.prefetch_min_score)?,
            prefetch_deny: std::env::var("PREFETCH_DENY_REGEX")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            query_mode: env_parse("QUERY_MODE", d.query_mode)?,
            query_allowlist: env_list("QUERY_ALLOWLIST"),
            intent_ttl: Duration::from_secs(env_parse(
                "INTENT_TTL_SEC",
                d.intent_ttl.as_secs(),
            )?),
            prefetch_mark_ttl: Duration::from_secs(env_parse(
                "PREFETCH_MARK_TTL_SEC",
                d.prefetch_mark_ttl.as_secs(),
            )?),
            session_ttl: Duration::from_secs(env_parse(
                "SESSION_TTL_SEC",
                d.session_ttl.as_secs(),
            )?),
            chain_ttl: Duration::from_secs(env_parse(
                "ANTICIP8_CHAINLOG_LAST_TTL_SEC",
                d.chain_ttl.as_secs(),
            )?),
            race_grace: Duration::from_millis(env_parse(
                "RACE_GRACE_MS",
                d.race_grace.as_millis() as u64,
            )?),
            race_grace_max: Duration::from_millis(env_parse(
                "RACE_GRACE_MAX_MS",
                d.race_grace_max.as_millis() as u64,
            )?),
            policy_cache_ttl: Duration::from_secs_f64(env_parse(
                "POLICY_CACHE_TTL_SEC",
                d.policy_cache_ttl.as_secs_f64(),
            )?),
            policy_debounce: Duration::from_secs_f64(env_parse(
                "POLICY_DEBOUNCE_SEC",
                d.policy_debounce.as_secs_f64(),
            )?),
            policy_timeout: Duration::from_millis(env_parse(
                "POLICY_TIMEOUT_MS",
                d.policy_timeout.as_millis() as u64,
            )?),
            breaker_trip_errors: env_parse("BREAKER_TRIP_ERRORS", d.breaker_trip_errors)?,
            breaker_window: Duration::from_secs(env_parse(
                "BREAKER_WINDOW_SEC",
                d.breaker_window.as_secs(),
            )?),
            breaker_cooloff: Duration::from_secs(env_parse(
                "BREAKER_COOLOFF_SEC",
                d.breaker_cooloff.as_secs(),
            )?),
        })
    }
}

/// Runtime configuration shared across handlers via Axum state.
/// Wraps the parsed settings plus one shared reqwest::Client pool.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Debug)]
struct ConfigInner {
    policy: PolicyConfig,
    http_client: reqwest::Client,
    redis_url: String,
}

impl Config {
    pub fn from_env(redis_url: String) -> Result<Self> {
        let policy = PolicyConfig::from_env()?;
        let http_client = build_http_client()?;
        Ok(Self {
            inner: Arc::new(ConfigInner {
                policy,
                http_client,
                redis_url,
            }),
        })
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.inner.policy
    }

    /// Get the shared HTTP client. One pool for all outbound requests.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    pub fn redis_url(&self) -> &str {
        &self.inner.redis_url
    }
}

/// Build the single shared reqwest::Client with a bounded connection pool.
pub fn build_http_client() -> Result<reqwest::Client> {
    let pool_max_idle: usize = env_parse("POOL_MAX_IDLE_PER_HOST", 32)?;
    let timeout_ms: u64 = env_parse("HTTP_TIMEOUT_MS", 2_000)?;

    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .pool_max_idle_per_host(pool_max_idle)
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .build()
        .context("failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let p = PolicyConfig::default();
        assert_eq!(p.max_prefetch, 2);
        assert_eq!(p.max_prefetch_time_ms, 120);
        assert!(p.i2v_alpha > 0.0 && p.i2v_alpha < 1.0);

        let s = SidecarConfig::default();
        assert!(s.intent_ttl < s.prefetch_mark_ttl);
        assert!(s.race_grace <= s.race_grace_max);
        assert!(s.min_prefetch_window < s.prefetch_budget);
    }

    #[test]
    fn env_parse_falls_back_on_missing() {
        std::env::remove_var("ANTICIP8_TEST_MISSING");
        let v: u64 = env_parse("ANTICIP8_TEST_MISSING", 7).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("ANTICIP8_TEST_GARBAGE", "not-a-number");
        let r: Result<u64> = env_parse("ANTICIP8_TEST_GARBAGE", 7);
        assert!(r.is_err());
        std::env::remove_var("ANTICIP8_TEST_GARBAGE");
    }

    #[test]
    fn url_map_parses_pairs() {
        std::env::set_var(
            "ANTICIP8_TEST_URLS",
            "orders-api=http://orders:8000/,options-api=http://options:8000",
        );
        let map = env_url_map("ANTICIP8_TEST_URLS").unwrap();
        assert_eq!(map["orders-api"], "http://orders:8000");
        assert_eq!(map["options-api"], "http://options:8000");
        std::env::remove_var("ANTICIP8_TEST_URLS");
    }

    #[test]
    fn bool_env_accepts_common_forms() {
        std::env::set_var("ANTICIP8_TEST_BOOL", "off");
        assert!(!env_bool("ANTICIP8_TEST_BOOL", true).unwrap());
        std::env::set_var("ANTICIP8_TEST_BOOL", "1");
        assert!(env_bool("ANTICIP8_TEST_BOOL", false).unwrap());
        std::env::remove_var("ANTICIP8_TEST_BOOL");
    }
}
