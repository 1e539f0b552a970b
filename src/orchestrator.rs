use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::chainlog;
use crate::client::PolicyClient;
use crate::config::SidecarConfig;
use crate::metrics::{
    INTENT_MISSING, INTENT_SEEN, POLICY_ERRORS, POLICY_LATENCY, POLICY_REQUESTS,
    PREFETCH_BUDGET_OVERRUN, PREFETCH_DEADLINE_SKIPS, PREFETCH_DEDUP_SKIPS, PREFETCH_ERRORS,
    PREFETCH_HITS, PREFETCH_LATENCY, PREFETCH_MARK_NOT_READY, PREFETCH_MARK_READY,
    PREFETCH_MISSES, PREFETCH_TOTAL, RACE_GRACE_HITS, RACE_GRACE_MISSES, RACE_GRACE_WAIT,
};
use crate::normalize::{
    concretize, is_noise, last_numeric_segment, last_uuid_segment, request_key,
};
use crate::policy::{Candidate, PolicyResponse};
use crate::store::{swallow, KvOp, Store};

pub const HEADER_USER: &str = "x-user";
pub const HEADER_PREFETCH: &str = "x-prefetch";

const DEFAULT_USER: &str = "anon";
const PER_ITEM_TIMEOUT_MIN: Duration = Duration::from_millis(90);
const PER_ITEM_TIMEOUT_MAX: Duration = Duration::from_millis(220);
const INFLIGHT_TTL_FLOOR: Duration = Duration::from_millis(1_000);
const INFLIGHT_TTL_SLACK: Duration = Duration::from_millis(250);
const POLICY_LIMIT: usize = 3;

fn k_intent(user: &str, service: &str, req_key: &str) -> String {
    format!("anticip8:intent:{user}:{service}:{req_key}")
}

fn k_prefetched(user: &str, service: &str, req_key: &str) -> String {
    format!("anticip8:pf:{user}:{service}:{req_key}")
}

fn k_inflight(user: &str, service: &str, req_key: &str) -> String {
    format!("anticip8:inflight:{user}:{service}:{req_key}")
}

fn k_debounce(service: &str, user: &str, src_path: &str) -> String {
    format!("anticip8:policy_seen:{service}:{user}:{src_path}")
}

fn k_session(user: &str) -> String {
    format!("anticip8:sess:{user}")
}

/// Per-orchestrator counters. Prometheus series are global; these atomics
/// belong to one instance so tests can construct a fresh orchestrator and
/// assert exact deltas.
#[derive(Debug, Default)]
pub struct Stats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub intent_seen: AtomicU64,
    pub intent_missing: AtomicU64,
    pub mark_ready: AtomicU64,
    pub mark_not_ready: AtomicU64,
    pub race_grace_hits: AtomicU64,
    pub race_grace_misses: AtomicU64,
    pub dedup_skips: AtomicU64,
    pub deadline_skips: AtomicU64,
    pub budget_overruns: AtomicU64,
    pub prefetch_started: AtomicU64,
    pub prefetch_ok: AtomicU64,
    pub prefetch_failed: AtomicU64,
}

impl Stats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Everything a warmer needs to rebuild one response.
#[derive(Debug, Clone)]
pub struct WarmerCtx {
    pub user_key: String,
    /// Concrete destination path, placeholders already substituted.
    pub path: String,
    pub id: Option<String>,
    pub uuid: Option<String>,
}

/// Handler-owned function that computes a response and writes it into the
/// response cache at the canonical key, skipping the HTTP loopback.
pub type Warmer = Arc<dyn Fn(WarmerCtx) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct WarmerRegistry {
    map: RwLock<HashMap<String, Warmer>>,
}

impl WarmerRegistry {
    /// Register a warmer for a path template (e.g. `/order-options/{id}`).
    pub fn register(&self, template: &str, warmer: Warmer) {
        self.map.write().insert(template.to_string(), warmer);
    }

    fn get(&self, template: &str) -> Option<Warmer> {
        self.map.read().get(template).cloned()
    }

    fn has(&self, template: &str) -> bool {
        self.map.read().contains_key(template)
    }
}

/// In-process TTL cache for policy responses, keyed by source path (the
/// service is fixed per orchestrator instance).
struct PolicyCache {
    ttl: Duration,
    map: RwLock<HashMap<String, (Instant, PolicyResponse)>>,
}

impl PolicyCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, src_path: &str) -> Option<PolicyResponse> {
        let map = self.map.read();
        let (at, resp) = map.get(src_path)?;
        (at.elapsed() < self.ttl).then(|| resp.clone())
    }

    fn put(&self, src_path: &str, resp: PolicyResponse) {
        self.map
            .write()
            .insert(src_path.to_string(), (Instant::now(), resp));
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionWindow {
    svc: String,
    path: String,
    ts: i64,
}

/// The prefetch orchestrator wrapped around every incoming request.
///
/// Request-path work is limited to hit/miss accounting; everything
/// speculative runs on detached tasks owned by this instance and canceled on
/// shutdown. Every boundary is fail-open: a dead store, policy engine, or
/// peer can only cost speculation, never the user's response.
pub struct Orchestrator {
    cfg: SidecarConfig,
    store: Store,
    client: PolicyClient,
    http: reqwest::Client,
    breaker: CircuitBreaker,
    policy_cache: PolicyCache,
    pub warmers: WarmerRegistry,
    deny: Option<Regex>,
    semaphore: Arc<Semaphore>,
    pub stats: Stats,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(cfg: SidecarConfig, store: Store, http: reqwest::Client) -> anyhow::Result<Self> {
        let deny = cfg
            .prefetch_deny
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid PREFETCH_DENY_REGEX: {e}"))?;

        let client = PolicyClient::new(
            http.clone(),
            &cfg.core_url,
            &cfg.service_name,
            cfg.policy_timeout,
        );
        let breaker = CircuitBreaker::new(
            &cfg.service_name,
            cfg.breaker_trip_errors,
            cfg.breaker_window,
            cfg.breaker_cooloff,
        );
        let policy_cache = PolicyCache::new(cfg.policy_cache_ttl);
        let semaphore = Arc::new(Semaphore::new(cfg.max_prefetch_concurrency.max(1)));

        Ok(Self {
            cfg,
            store,
            client,
            http,
            breaker,
            policy_cache,
            warmers: WarmerRegistry::default(),
            deny,
            semaphore,
            stats: Stats::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.cfg
    }

    pub fn service(&self) -> &str {
        &self.cfg.service_name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Cancel all detached speculative work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // -----------------------------------------------------------------
    // Hit/miss accounting (runs before handler dispatch)
    // -----------------------------------------------------------------

    /// The only place the hit/miss counters move.
    pub async fn account_hit_miss(&self, user: &str, req_key: &str) {
        let svc = self.service();
        let intent_key = k_intent(user, svc, req_key);
        let mark_key = k_prefetched(user, svc, req_key);

        let intent = self.store.get(&intent_key).await.ok().flatten();
        if intent.is_none() {
            // Never predicted; calling this a miss would be noise.
            Stats::bump(&self.stats.intent_missing);
            INTENT_MISSING.with_label_values(&[svc]).inc();
            return;
        }
        Stats::bump(&self.stats.intent_seen);
        INTENT_SEEN.with_label_values(&[svc]).inc();

        if self.store.get(&mark_key).await.ok().flatten().is_some() {
            Stats::bump(&self.stats.mark_ready);
            PREFETCH_MARK_READY.with_label_values(&[svc]).inc();
            self.record_hit(user, req_key, &intent_key, &mark_key).await;
            return;
        }

        Stats::bump(&self.stats.mark_not_ready);
        PREFETCH_MARK_NOT_READY.with_label_values(&[svc]).inc();

        // The speculation may have completed microseconds after this request
        // arrived; a short grace re-read keeps the metric honest.
        let mut late_hit = false;
        if self.cfg.race_grace > Duration::ZERO {
            let wait = self.cfg.race_grace.min(self.cfg.race_grace_max);
            let t0 = Instant::now();
            tokio::time::sleep(wait).await;
            RACE_GRACE_WAIT
                .with_label_values(&[svc])
                .observe(t0.elapsed().as_secs_f64());

            late_hit = self.store.get(&mark_key).await.ok().flatten().is_some();
            if late_hit {
                Stats::bump(&self.stats.race_grace_hits);
                RACE_GRACE_HITS.with_label_values(&[svc]).inc();
            } else {
                Stats::bump(&self.stats.race_grace_misses);
                RACE_GRACE_MISSES.with_label_values(&[svc]).inc();
            }
        }

        if late_hit {
            self.record_hit(user, req_key, &intent_key, &mark_key).await;
        } else {
            Stats::bump(&self.stats.misses);
            PREFETCH_MISSES.with_label_values(&[svc]).inc();
            swallow(self.store.del(&intent_key).await, "intent delete");
        }
    }

    async fn record_hit(&self, user: &str, req_key: &str, intent_key: &str, mark_key: &str) {
        Stats::bump(&self.stats.hits);
        PREFETCH_HITS.with_label_values(&[self.service()]).inc();
        debug!(user = %user, req_key = %req_key, "prefetch hit");
        swallow(
            self.store
                .run_pipeline(vec![
                    KvOp::Del {
                        key: intent_key.to_string(),
                    },
                    KvOp::Del {
                        key: mark_key.to_string(),
                    },
                ])
                .await,
            "marker cleanup",
        );
    }

    // -----------------------------------------------------------------
    // Post-response work (detached from the request)
    // -----------------------------------------------------------------

    /// Launch the speculative batch and transition telemetry. Called after
    /// the handler has started emitting its response; nothing here is
    /// awaited by the request.
    pub fn after_response(
        self: Arc<Self>,
        user: String,
        path: String,
        req_key: String,
        status: u16,
        latency_ms: u64,
    ) {
        let orch = self.clone();
        let batch_user = user.clone();
        let batch_path = path.clone();
        tokio::spawn(async move {
            let token = orch.shutdown.clone();
            tokio::select! {
                _ = orch.clone().run_prefetch_batch(batch_user, batch_path) => {}
                _ = token.cancelled() => {}
            }
        });

        let orch = self.clone();
        tokio::spawn(async move {
            let token = orch.shutdown.clone();
            tokio::select! {
                _ = orch.emit_transition(user, path, req_key, status, latency_ms) => {}
                _ = token.cancelled() => {}
            }
        });
    }

    async fn emit_transition(
        self: Arc<Self>,
        user: String,
        path: String,
        req_key: String,
        status: u16,
        latency_ms: u64,
    ) {
        let svc = self.service().to_string();
        let session_key = k_session(&user);

        let prev: Option<SessionWindow> = self
            .store
            .get(&session_key)
            .await
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        if let Some(prev) = prev {
            if prev.svc != svc || prev.path != path {
                if prev.svc == svc {
                    self.client
                        .ingest_event(&user, &prev.path, &path, status, latency_ms)
                        .await;
                } else {
                    self.client
                        .ingest_edge(&user, &prev.svc, &prev.path, &svc, &path, status, latency_ms)
                        .await;
                }
            }
        }

        chainlog::log_step(
            &self.store,
            &svc,
            &user,
            &req_key,
            self.cfg.chain_ttl,
            true,
            true,
        )
        .await;

        let window = SessionWindow {
            svc,
            path,
            ts: chrono::Utc::now().timestamp_millis(),
        };
        if let Ok(raw) = serde_json::to_string(&window) {
            swallow(
                self.store
                    .set_ex(&session_key, &raw, self.cfg.session_ttl)
                    .await,
                "session write",
            );
        }
    }

    // -----------------------------------------------------------------
    // Prefetch batch
    // -----------------------------------------------------------------

    async fn run_prefetch_batch(self: Arc<Self>, user: String, src_path: String) {
        if !self.cfg.prefetch_enabled {
            return;
        }
        let svc = self.service().to_string();

        if !self.breaker.allow() {
            debug!(service = %svc, "breaker open, skipping batch");
            return;
        }

        // One batch per (service, user, src) inside the debounce window;
        // a burst of requests from the same user must not thrash the policy
        // engine. Store failure falls open to trying anyway.
        let debounce_key = k_debounce(&svc, &user, &src_path);
        if let Ok(false) = self
            .store
            .set_nx_px(&debounce_key, "1", self.cfg.policy_debounce)
            .await
        {
            Stats::bump(&self.stats.dedup_skips);
            PREFETCH_DEDUP_SKIPS.with_label_values(&[&svc]).inc();
            return;
        }

        let policy = match self.policy_cache.get(&src_path) {
            Some(cached) => cached,
            None => {
                POLICY_REQUESTS.with_label_values(&[&svc]).inc();
                let t0 = Instant::now();
                match self.client.policy_next(&user, &src_path, POLICY_LIMIT).await {
                    Ok(resp) => {
                        POLICY_LATENCY
                            .with_label_values(&[&svc])
                            .observe(t0.elapsed().as_secs_f64());
                        self.policy_cache.put(&src_path, resp.clone());
                        resp
                    }
                    Err(err) => {
                        POLICY_ERRORS.with_label_values(&[&svc, "call"]).inc();
                        self.breaker.report_error();
                        debug!(error = %err, "policy call failed, batch aborted");
                        return;
                    }
                }
            }
        };

        let max_prefetch = policy.max_prefetch as usize;
        if max_prefetch == 0 || policy.next_paths.is_empty() {
            return;
        }

        // The engine's advertised window and the local config both bound the
        // batch; the tighter one wins.
        let budget = if policy.max_prefetch_time_ms > 0 {
            self.cfg
                .prefetch_budget
                .min(Duration::from_millis(policy.max_prefetch_time_ms))
        } else {
            self.cfg.prefetch_budget
        };
        if budget <= self.cfg.min_prefetch_window {
            Stats::bump(&self.stats.deadline_skips);
            PREFETCH_DEADLINE_SKIPS.with_label_values(&[&svc]).inc();
            return;
        }
        let deadline = Instant::now() + budget;

        let mut candidates: Vec<(Candidate, String)> = policy
            .next_paths
            .into_iter()
            .filter(|c| c.score >= self.cfg.prefetch_min_score)
            .filter(|c| {
                self.deny
                    .as_ref()
                    .map_or(true, |re| !re.is_match(&c.path))
            })
            .filter(|c| self.reachable(c))
            .filter_map(|c| concretize(&c.path, &src_path).map(|concrete| (c, concrete)))
            .collect();

        candidates.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(max_prefetch);
        if candidates.is_empty() {
            return;
        }

        let per_item = (budget / candidates.len() as u32)
            .clamp(PER_ITEM_TIMEOUT_MIN, PER_ITEM_TIMEOUT_MAX);

        let batch_gate = Arc::new(Semaphore::new(self.cfg.max_batch_inflight.max(1)));
        let mut batch = JoinSet::new();
        for (candidate, concrete) in candidates {
            let orch = self.clone();
            let user = user.clone();
            let src = src_path.clone();
            let gate = batch_gate.clone();
            batch.spawn(async move {
                orch.speculate_one(user, src, candidate, concrete, deadline, per_item, gate)
                    .await;
            });
        }
        while batch.join_next().await.is_some() {}
    }

    /// Destination is executable: either a registered internal warmer or a
    /// known peer base URL.
    fn reachable(&self, candidate: &Candidate) -> bool {
        if candidate.service == self.cfg.service_name && self.warmers.has(&candidate.path) {
            return true;
        }
        self.cfg.base_urls.contains_key(&candidate.service)
    }

    #[allow(clippy::too_many_arguments)]
    async fn speculate_one(
        self: Arc<Self>,
        user: String,
        src_path: String,
        candidate: Candidate,
        concrete_path: String,
        deadline: Instant,
        per_item: Duration,
        batch_gate: Arc<Semaphore>,
    ) {
        let svc = self.service().to_string();

        // Take both gates (batch-local and process-global) without blowing
        // the deadline waiting for a slot.
        let _permits = tokio::select! {
            permits = async {
                let batch = batch_gate.acquire_owned().await.ok()?;
                let global = self.semaphore.clone().acquire_owned().await.ok()?;
                Some((batch, global))
            } => match permits {
                Some(p) => p,
                None => return,
            },
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                Stats::bump(&self.stats.deadline_skips);
                PREFETCH_DEADLINE_SKIPS.with_label_values(&[&svc]).inc();
                return;
            }
            _ = self.shutdown.cancelled() => return,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining < self.cfg.min_prefetch_window {
            Stats::bump(&self.stats.deadline_skips);
            PREFETCH_DEADLINE_SKIPS.with_label_values(&[&svc]).inc();
            return;
        }

        let dst_req_key = request_key(
            &concrete_path,
            "",
            self.cfg.query_mode,
            &self.cfg.query_allowlist,
        );

        // Distributed single-flight: first orchestrator to SETNX the token
        // runs the fetch, everyone else skips.
        let lock_key = k_inflight(&user, &candidate.service, &dst_req_key);
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let lock_ttl = per_item.max(INFLIGHT_TTL_FLOOR) + INFLIGHT_TTL_SLACK;
        match self.store.set_nx_px(&lock_key, &token, lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                Stats::bump(&self.stats.dedup_skips);
                PREFETCH_DEDUP_SKIPS.with_label_values(&[&svc]).inc();
                return;
            }
            Err(err) => {
                // No lock means no dedup guarantee; skip rather than stampede.
                debug!(error = %err, "inflight lock unavailable, skipping");
                return;
            }
        }

        swallow(
            self.store
                .set_ex(
                    &k_intent(&user, &candidate.service, &dst_req_key),
                    "1",
                    self.cfg.intent_ttl,
                )
                .await,
            "intent marker",
        );

        // Resolve the execution branch up front: the same choice feeds both
        // `execute` and the breaker scoping below.
        let warmer = (candidate.service == self.cfg.service_name)
            .then(|| self.warmers.get(&candidate.path))
            .flatten();
        let via_warmer = warmer.is_some();

        Stats::bump(&self.stats.prefetch_started);
        PREFETCH_TOTAL.with_label_values(&[&svc]).inc();
        let exec_timeout = remaining.min(per_item);
        let t0 = Instant::now();

        let outcome = tokio::select! {
            result = tokio::time::timeout(
                exec_timeout,
                self.execute(&user, &candidate, &concrete_path, warmer),
            ) => match result {
                Ok(Ok(status)) => Ok(status),
                Ok(Err(err)) => {
                    debug!(error = %err, path = %concrete_path, "speculative fetch failed");
                    Err(if via_warmer { "warmer" } else { "http" })
                }
                Err(_) => Err("timeout"),
            },
            _ = self.shutdown.cancelled() => Err("shutdown"),
        };

        let elapsed = t0.elapsed();
        PREFETCH_LATENCY
            .with_label_values(&[&svc])
            .observe(elapsed.as_secs_f64());

        match outcome {
            Ok(status) if (200..400).contains(&status) => {
                Stats::bump(&self.stats.prefetch_ok);
                swallow(
                    self.store
                        .set_ex(
                            &k_prefetched(&user, &candidate.service, &dst_req_key),
                            "1",
                            self.cfg.prefetch_mark_ttl,
                        )
                        .await,
                    "prefetched marker",
                );
                // Feed the attempt table so future policy answers can learn
                // from what speculation actually reached.
                self.client
                    .ingest_prefetch(
                        &user,
                        &src_path,
                        &candidate.service,
                        &concrete_path,
                        status,
                        elapsed.as_millis() as u64,
                    )
                    .await;
            }
            Ok(status) => {
                // Reached the peer but got a 4xx/5xx: not a transport error,
                // so the breaker stays out of it, and no mark is set.
                Stats::bump(&self.stats.prefetch_failed);
                PREFETCH_ERRORS.with_label_values(&[&svc, "status"]).inc();
                debug!(status, path = %concrete_path, "speculative fetch non-cacheable status");
            }
            Err(reason) => {
                Stats::bump(&self.stats.prefetch_failed);
                PREFETCH_ERRORS.with_label_values(&[&svc, reason]).inc();
                if reason == "timeout" && Instant::now() >= deadline {
                    Stats::bump(&self.stats.budget_overruns);
                    PREFETCH_BUDGET_OVERRUN.with_label_values(&[&svc]).inc();
                }
                // The breaker watches outbound transport only; a warmer
                // failure is process-local and must not pause speculation
                // toward healthy peers.
                if !via_warmer && reason != "shutdown" {
                    self.breaker.report_error();
                }
            }
        }

        match self.store.del_if_equals(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => {
                // Lock expired mid-fetch and someone else took it; logged,
                // never surfaced.
                warn!(key = %lock_key, "inflight token mismatch on release");
            }
            Err(err) => debug!(error = %err, "inflight release failed"),
        }
    }

    async fn execute(
        &self,
        user: &str,
        candidate: &Candidate,
        concrete_path: &str,
        warmer: Option<Warmer>,
    ) -> anyhow::Result<u16> {
        if let Some(warmer) = warmer {
            let ctx = WarmerCtx {
                user_key: user.to_string(),
                path: concrete_path.to_string(),
                id: last_numeric_segment(concrete_path).map(str::to_string),
                uuid: last_uuid_segment(concrete_path).map(str::to_string),
            };
            warmer(ctx).await?;
            return Ok(200);
        }

        let base = self
            .cfg
            .base_urls
            .get(&candidate.service)
            .ok_or_else(|| anyhow::anyhow!("no base url for {}", candidate.service))?;
        let resp = self
            .http
            .get(format!("{base}{concrete_path}"))
            .header(HEADER_USER, user)
            .header(HEADER_PREFETCH, "1")
            .send()
            .await?;
        Ok(resp.status().as_u16())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Axum middleware
// ---------------------------------------------------------------------------

/// Wrap one incoming request: hit/miss accounting before dispatch, handler,
/// then detached speculation and telemetry. Speculative re-entries
/// (`x-prefetch: 1`) and noise paths bypass all of it.
pub async fn middleware(
    State(orch): State<Arc<Orchestrator>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if req.headers().contains_key(HEADER_PREFETCH) || is_noise(&path) {
        return next.run(req).await;
    }

    let user = req
        .headers()
        .get(HEADER_USER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_USER)
        .to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let req_key = request_key(
        &path,
        &query,
        orch.config().query_mode,
        &orch.config().query_allowlist,
    );

    orch.account_hit_miss(&user, &req_key).await;

    let started = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;

    orch.after_response(user, path, req_key, status, latency_ms);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn test_config() -> SidecarConfig {
        SidecarConfig {
            service_name: "svc_s".to_string(),
            ..SidecarConfig::default()
        }
    }

    fn orchestrator(cfg: SidecarConfig, store: Store) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(cfg, store, reqwest::Client::new()).unwrap())
    }

    #[tokio::test]
    async fn no_intent_is_neither_hit_nor_miss() {
        let orch = orchestrator(test_config(), Store::memory());
        orch.account_hit_miss("u1", "/a").await;

        assert_eq!(Stats::get(&orch.stats.intent_missing), 1);
        assert_eq!(Stats::get(&orch.stats.hits), 0);
        assert_eq!(Stats::get(&orch.stats.misses), 0);
    }

    #[tokio::test]
    async fn both_markers_present_is_a_hit_and_cleans_up() {
        let store = Store::memory();
        let orch = orchestrator(test_config(), store.clone());

        store
            .set_ex(
                &k_intent("u1", "svc_s", "/b"),
                "1",
                Duration::from_secs(15),
            )
            .await
            .unwrap();
        store
            .set_ex(
                &k_prefetched("u1", "svc_s", "/b"),
                "1",
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        orch.account_hit_miss("u1", "/b").await;

        assert_eq!(Stats::get(&orch.stats.hits), 1);
        assert_eq!(Stats::get(&orch.stats.intent_seen), 1);
        assert_eq!(Stats::get(&orch.stats.mark_ready), 1);
        assert_eq!(
            store.get(&k_intent("u1", "svc_s", "/b")).await.unwrap(),
            None
        );
        assert_eq!(
            store.get(&k_prefetched("u1", "svc_s", "/b")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn intent_without_mark_is_a_miss_after_grace() {
        let store = Store::memory();
        let orch = orchestrator(test_config(), store.clone());

        store
            .set_ex(
                &k_intent("u1", "svc_s", "/b"),
                "1",
                Duration::from_secs(15),
            )
            .await
            .unwrap();

        orch.account_hit_miss("u1", "/b").await;

        assert_eq!(Stats::get(&orch.stats.misses), 1);
        assert_eq!(Stats::get(&orch.stats.mark_not_ready), 1);
        assert_eq!(Stats::get(&orch.stats.race_grace_misses), 1);
        assert_eq!(Stats::get(&orch.stats.hits), 0);
        // intent marker consumed either way
        assert_eq!(
            store.get(&k_intent("u1", "svc_s", "/b")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn mark_arriving_inside_grace_is_reclassified_as_hit() {
        let store = Store::memory();
        let cfg = SidecarConfig {
            race_grace: Duration::from_millis(40),
            race_grace_max: Duration::from_millis(60),
            ..test_config()
        };
        let orch = orchestrator(cfg, store.clone());

        store
            .set_ex(
                &k_intent("u1", "svc_s", "/b"),
                "1",
                Duration::from_secs(15),
            )
            .await
            .unwrap();

        // Simulate the speculation landing shortly after the real request.
        let racing = store.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            racing
                .set_ex(
                    &k_prefetched("u1", "svc_s", "/b"),
                    "1",
                    Duration::from_secs(30),
                )
                .await
                .unwrap();
        });

        orch.account_hit_miss("u1", "/b").await;
        writer.await.unwrap();

        assert_eq!(Stats::get(&orch.stats.race_grace_hits), 1);
        assert_eq!(Stats::get(&orch.stats.hits), 1);
        assert_eq!(Stats::get(&orch.stats.misses), 0);
    }

    #[tokio::test]
    async fn grace_disabled_counts_immediate_miss() {
        let store = Store::memory();
        let cfg = SidecarConfig {
            race_grace: Duration::ZERO,
            ..test_config()
        };
        let orch = orchestrator(cfg, store.clone());

        store
            .set_ex(
                &k_intent("u1", "svc_s", "/b"),
                "1",
                Duration::from_secs(15),
            )
            .await
            .unwrap();

        orch.account_hit_miss("u1", "/b").await;
        assert_eq!(Stats::get(&orch.stats.misses), 1);
        assert_eq!(Stats::get(&orch.stats.race_grace_hits), 0);
        assert_eq!(Stats::get(&orch.stats.race_grace_misses), 0);
    }

    #[tokio::test]
    async fn store_failure_never_panics_accounting() {
        // Memory store cannot fail, so this exercises the no-intent path;
        // the fail-open read contract is covered by the integration suite
        // with a dead redis URL.
        let orch = orchestrator(test_config(), Store::memory());
        orch.account_hit_miss("u1", "/whatever").await;
        assert_eq!(Stats::get(&orch.stats.intent_missing), 1);
    }

    #[test]
    fn policy_cache_expires() {
        let cache = PolicyCache::new(Duration::from_millis(10));
        cache.put(
            "/a",
            PolicyResponse {
                next_paths: vec![],
                max_prefetch: 2,
                max_prefetch_time_ms: 120,
            },
        );
        assert!(cache.get("/a").is_some());
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("/a").is_none());
    }

    #[test]
    fn warmer_registry_lookup() {
        let reg = WarmerRegistry::default();
        assert!(!reg.has("/order-options/{id}"));
        let warmer: Warmer = Arc::new(|_ctx| {
            let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async { Ok(()) });
            fut
        });
        reg.register("/order-options/{id}", warmer);
        assert!(reg.has("/order-options/{id}"));
        assert!(reg.get("/order-options/{id}").is_some());
    }
}
