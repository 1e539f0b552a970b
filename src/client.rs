use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::policy::PolicyResponse;

#[derive(Debug, Serialize)]
struct EventPayload<'a> {
    service: &'a str,
    user_key: &'a str,
    from_path: &'a str,
    to_path: &'a str,
    status: u16,
    latency_ms: u64,
}

#[derive(Debug, Serialize)]
struct EdgePayload<'a> {
    src_service: &'a str,
    user_key: &'a str,
    src_path: &'a str,
    dst_service: &'a str,
    dst_path: &'a str,
    status: u16,
    latency_ms: u64,
}

/// HTTP client for the policy core, owned by one orchestrator instance.
///
/// Ingest calls are fire-and-forget: failures are logged and dropped, never
/// surfaced. Only `policy_next` propagates errors, because its caller feeds
/// the circuit breaker.
#[derive(Clone)]
pub struct PolicyClient {
    http: reqwest::Client,
    core_url: String,
    service: String,
    timeout: Duration,
}

impl PolicyClient {
    pub fn new(http: reqwest::Client, core_url: &str, service: &str, timeout: Duration) -> Self {
        Self {
            http,
            core_url: core_url.trim_end_matches('/').to_string(),
            service: service.to_string(),
            timeout,
        }
    }

    pub async fn ingest_event(
        &self,
        user_key: &str,
        from_path: &str,
        to_path: &str,
        status: u16,
        latency_ms: u64,
    ) {
        let payload = EventPayload {
            service: &self.service,
            user_key,
            from_path,
            to_path,
            status,
            latency_ms,
        };
        self.fire(&format!("{}/ingest/event", self.core_url), &payload)
            .await;
    }

    pub async fn ingest_edge(
        &self,
        user_key: &str,
        src_service: &str,
        src_path: &str,
        dst_service: &str,
        dst_path: &str,
        status: u16,
        latency_ms: u64,
    ) {
        let payload = EdgePayload {
            src_service,
            user_key,
            src_path,
            dst_service,
            dst_path,
            status,
            latency_ms,
        };
        self.fire(&format!("{}/ingest/edge", self.core_url), &payload)
            .await;
    }

    pub async fn ingest_prefetch(
        &self,
        user_key: &str,
        src_path: &str,
        dst_service: &str,
        dst_path: &str,
        status: u16,
        latency_ms: u64,
    ) {
        let payload = EdgePayload {
            src_service: &self.service,
            user_key,
            src_path,
            dst_service,
            dst_path,
            status,
            latency_ms,
        };
        self.fire(&format!("{}/ingest/prefetch", self.core_url), &payload)
            .await;
    }

    async fn fire<T: Serialize>(&self, url: &str, payload: &T) {
        let result = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await;
        if let Err(err) = result {
            debug!(error = %err, url = %url, "ingest dropped");
        }
    }

    /// Ranked next-path candidates for the current location. Errors bubble
    /// up so the orchestrator can feed the breaker and abort the batch.
    pub async fn policy_next(
        &self,
        user_key: &str,
        path: &str,
        limit: usize,
    ) -> Result<PolicyResponse> {
        let resp = self
            .http
            .get(format!("{}/policy/next", self.core_url))
            .timeout(self.timeout)
            .query(&[
                ("service", self.service.as_str()),
                ("path", path),
                ("user_key", user_key),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .context("policy call failed")?
            .error_for_status()
            .context("policy call returned an error status")?;

        resp.json::<PolicyResponse>()
            .await
            .context("malformed policy response")
    }
}
