use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::normalize::{is_noise, normalize, Node};
use crate::store::{Store, StoreResult};

fn k_trans(service: &str, template: &str) -> String {
    format!("trans:{service}:{template}")
}

fn k_trans_cross(service: &str, template: &str) -> String {
    format!("trans2:{service}:{template}")
}

fn k_trans_attempt(service: &str, template: &str) -> String {
    format!("transpf:{service}:{template}")
}

fn k_topk(node: &Node) -> String {
    format!("anticip8:i2v:topk:{}", node.key())
}

/// One ranked next-path candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub service: String,
    pub path: String,
    pub score: f64,
}

/// Answer to a `next(service, path)` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResponse {
    pub next_paths: Vec<Candidate>,
    pub max_prefetch: u32,
    pub max_prefetch_time_ms: u64,
}

impl PolicyResponse {
    pub fn empty() -> Self {
        Self {
            next_paths: Vec::new(),
            max_prefetch: 0,
            max_prefetch_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Recorded,
    Skipped,
}

/// Row format of the offline similarity trainer:
/// `[{"item": "svc::template", "cos": 0.87}, ...]`.
#[derive(Debug, Deserialize)]
struct TopkEntry {
    item: String,
    cos: f64,
}

/// The policy engine: ingests observed transitions and answers ranked
/// "what comes next" queries by blending Markov probabilities with the
/// offline item-embedding similarity table.
#[derive(Clone)]
pub struct PolicyEngine {
    store: Store,
    cfg: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(store: Store, cfg: PolicyConfig) -> Self {
        Self { store, cfg }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    /// Record an intra-service transition `from -> to`.
    pub async fn ingest_intra(
        &self,
        service: &str,
        from_path: &str,
        to_path: &str,
    ) -> IngestOutcome {
        if is_noise(from_path) || is_noise(to_path) {
            return IngestOutcome::Skipped;
        }
        let from = normalize(from_path);
        let to = normalize(to_path);
        if self.cfg.drop_self_loops && from == to {
            return IngestOutcome::Skipped;
        }

        self.best_effort_incr(&k_trans(service, &from), &to).await;
        IngestOutcome::Recorded
    }

    /// Record a cross-service transition `src -> dst`.
    pub async fn ingest_cross(
        &self,
        src_service: &str,
        src_path: &str,
        dst_service: &str,
        dst_path: &str,
    ) -> IngestOutcome {
        self.ingest_edge_table(k_trans_cross, src_service, src_path, dst_service, dst_path)
            .await
    }

    /// Record a speculative-attempt edge. Kept in its own table: attempts are
    /// what the orchestrator guessed, not what users did, so they only ever
    /// enter scoring down-weighted.
    pub async fn ingest_attempt(
        &self,
        src_service: &str,
        src_path: &str,
        dst_service: &str,
        dst_path: &str,
    ) -> IngestOutcome {
        self.ingest_edge_table(k_trans_attempt, src_service, src_path, dst_service, dst_path)
            .await
    }

    async fn ingest_edge_table(
        &self,
        table: fn(&str, &str) -> String,
        src_service: &str,
        src_path: &str,
        dst_service: &str,
        dst_path: &str,
    ) -> IngestOutcome {
        if is_noise(src_path) || is_noise(dst_path) {
            return IngestOutcome::Skipped;
        }
        let from = normalize(src_path);
        let to = normalize(dst_path);
        if self.cfg.drop_self_loops && src_service == dst_service && from == to {
            return IngestOutcome::Skipped;
        }

        let field = format!("{dst_service}|{to}");
        self.best_effort_incr(&table(src_service, &from), &field)
            .await;
        IngestOutcome::Recorded
    }

    async fn best_effort_incr(&self, key: &str, field: &str) {
        if let Err(err) = self.store.hash_incr(key, field, 1).await {
            debug!(error = %err, key = %key, "transition increment dropped");
        }
    }

    /// Ranked next-path candidates for `(service, path)`.
    pub async fn next(&self, service: &str, path: &str, limit: usize) -> PolicyResponse {
        if is_noise(path) {
            return PolicyResponse::empty();
        }
        let template = normalize(path);
        let origin = Node::new(service, template.clone());

        let markov = self.markov_map(service, &template, &origin).await;
        let similar = self.similarity_row(&origin).await;

        let limit = limit.max(1);
        let mut scored: HashMap<Node, f64> = HashMap::new();

        if similar.is_empty() {
            // No embedding coverage for this node: rank by probability alone.
            for (node, prob) in markov {
                scored.insert(node, prob);
            }
        } else {
            let alpha = self.cfg.i2v_alpha.clamp(0.0, 1.0);

            // Top markov edges ride along even when the embedding table has
            // never seen them, so rare-but-strong transitions are not lost.
            let insurance = top_n_edges(&markov, 5usize.max(3 * limit));

            for (node, cos) in &similar {
                let prob = markov.get(node).copied().unwrap_or(0.0);
                let score = alpha * cos + (1.0 - alpha) * prob;
                merge_max(&mut scored, node.clone(), score);
            }
            for (node, prob) in insurance {
                let score = (1.0 - alpha) * prob;
                merge_max(&mut scored, node, score);
            }
        }

        let mut ranked: Vec<(Node, f64)> = scored.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);

        PolicyResponse {
            next_paths: ranked
                .into_iter()
                .map(|(node, score)| Candidate {
                    service: node.service,
                    path: node.template,
                    score,
                })
                .collect(),
            max_prefetch: self.cfg.max_prefetch,
            max_prefetch_time_ms: self.cfg.max_prefetch_time_ms,
        }
    }

    /// Blend the intra, cross, and (optionally) attempt counter tables into
    /// one `node -> probability` map, taking the max where tables overlap.
    async fn markov_map(&self, service: &str, template: &str, origin: &Node) -> HashMap<Node, f64> {
        let mut map: HashMap<Node, f64> = HashMap::new();

        let intra = self
            .read_counts(&k_trans(service, template))
            .await
            .into_iter()
            .filter_map(|(to, c)| {
                if c <= 0 {
                    return None;
                }
                let node = Node::new(service, to);
                (node != *origin).then_some((node, c))
            })
            .collect::<Vec<_>>();
        for (node, prob) in self.smooth(&intra) {
            merge_max(&mut map, node, prob);
        }

        let cross = self.edge_counts(&k_trans_cross(service, template), origin).await;
        for (node, prob) in self.smooth(&cross) {
            merge_max(&mut map, node, prob);
        }

        if self.cfg.allow_prefetch_attempts {
            let weight = self.cfg.prefetch_attempt_weight.clamp(0.0, 1.0);
            let attempts = self
                .edge_counts(&k_trans_attempt(service, template), origin)
                .await;
            for (node, prob) in self.smooth(&attempts) {
                merge_max(&mut map, node, prob * weight);
            }
        }

        map
    }

    /// Laplace smoothing over one table's raw counts, with the configured
    /// probability floor applied.
    fn smooth(&self, counts: &[(Node, i64)]) -> Vec<(Node, f64)> {
        if counts.is_empty() {
            return Vec::new();
        }
        let alpha = self.cfg.markov_smooth.max(0.0);
        let k = counts.len() as f64;
        let total: f64 = counts.iter().map(|(_, c)| *c as f64).sum();
        let denom = total + alpha * k;
        if denom <= 0.0 {
            return Vec::new();
        }

        counts
            .iter()
            .map(|(node, c)| (node.clone(), (*c as f64 + alpha) / denom))
            .filter(|(_, p)| *p >= self.cfg.min_prob)
            .collect()
    }

    async fn read_counts(&self, key: &str) -> HashMap<String, i64> {
        self.no_data_on_error(self.store.hash_counts(key).await, key)
    }

    /// Counts from a `dstSvc|dstTmpl`-keyed edge table, self-loops dropped.
    async fn edge_counts(&self, key: &str, origin: &Node) -> Vec<(Node, i64)> {
        self.no_data_on_error(self.store.hash_counts(key).await, key)
            .into_iter()
            .filter_map(|(field, c)| {
                if c <= 0 {
                    return None;
                }
                let (svc, tmpl) = field.split_once('|')?;
                let node = Node::new(svc, tmpl);
                (node != *origin).then_some((node, c))
            })
            .collect()
    }

    /// Top-K similarity row for a node, written by the offline trainer.
    /// Missing or malformed rows read as empty.
    async fn similarity_row(&self, origin: &Node) -> Vec<(Node, f64)> {
        let key = k_topk(origin);
        let raw = match self.store.get(&key).await {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, key = %key, "similarity read failed, treating as empty");
                None
            }
        };
        let Some(raw) = raw else {
            return Vec::new();
        };

        let entries: Vec<TopkEntry> = match serde_json::from_str(&raw) {
            Ok(e) => e,
            Err(err) => {
                debug!(error = %err, key = %key, "malformed similarity row, treating as empty");
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .take(self.cfg.i2v_topk)
            .filter_map(|e| {
                let node = Node::parse(&e.item)?;
                (node != *origin).then_some((node, e.cos))
            })
            .collect()
    }

    fn no_data_on_error(
        &self,
        result: StoreResult<HashMap<String, i64>>,
        key: &str,
    ) -> HashMap<String, i64> {
        match result {
            Ok(m) => m,
            Err(err) => {
                debug!(error = %err, key = %key, "counter read failed, treating as empty");
                HashMap::new()
            }
        }
    }
}

fn merge_max(map: &mut HashMap<Node, f64>, node: Node, score: f64) {
    map.entry(node)
        .and_modify(|s| *s = s.max(score))
        .or_insert(score);
}

fn top_n_edges(markov: &HashMap<Node, f64>, n: usize) -> Vec<(Node, f64)> {
    let mut edges: Vec<(Node, f64)> = markov.iter().map(|(k, v)| (k.clone(), *v)).collect();
    edges.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    edges.truncate(n);
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine(store: Store) -> PolicyEngine {
        PolicyEngine::new(store, PolicyConfig::default())
    }

    fn engine_with(store: Store, f: impl FnOnce(&mut PolicyConfig)) -> PolicyEngine {
        let mut cfg = PolicyConfig::default();
        f(&mut cfg);
        PolicyEngine::new(store, cfg)
    }

    #[tokio::test]
    async fn learn_then_predict() {
        let e = engine(Store::memory());
        for _ in 0..3 {
            assert_eq!(
                e.ingest_intra("svc_s", "/a", "/b").await,
                IngestOutcome::Recorded
            );
        }

        let resp = e.next("svc_s", "/a", 3).await;
        assert_eq!(resp.max_prefetch, 2);
        assert_eq!(resp.max_prefetch_time_ms, 120);
        assert_eq!(resp.next_paths.len(), 1);
        assert_eq!(resp.next_paths[0].service, "svc_s");
        assert_eq!(resp.next_paths[0].path, "/b");
        assert!(resp.next_paths[0].score > 0.0);
    }

    #[tokio::test]
    async fn more_frequent_destination_ranks_higher() {
        let e = engine(Store::memory());
        for _ in 0..5 {
            e.ingest_intra("s", "/a", "/hot").await;
        }
        e.ingest_intra("s", "/a", "/cold").await;

        let resp = e.next("s", "/a", 3).await;
        assert_eq!(resp.next_paths[0].path, "/hot");
        assert!(resp.next_paths[0].score > resp.next_paths[1].score);
    }

    #[tokio::test]
    async fn ingest_normalizes_paths() {
        let e = engine(Store::memory());
        e.ingest_intra("svc_s", "/orders/42/", "/orders/42/items").await;

        let resp = e.next("svc_s", "/orders/7", 3).await;
        assert_eq!(resp.next_paths.len(), 1);
        assert_eq!(resp.next_paths[0].path, "/orders/{id}/items");
    }

    #[tokio::test]
    async fn self_loops_never_score() {
        let e = engine(Store::memory());
        assert_eq!(
            e.ingest_intra("s", "/orders/1", "/orders/2").await,
            IngestOutcome::Skipped
        );
        // both normalize to /orders/{id}
        let resp = e.next("s", "/orders/3", 3).await;
        assert!(resp.next_paths.is_empty());
    }

    #[tokio::test]
    async fn noise_paths_skip_ingest_and_empty_policy() {
        let e = engine(Store::memory());
        assert_eq!(
            e.ingest_intra("s", "/metrics", "/a").await,
            IngestOutcome::Skipped
        );
        assert_eq!(
            e.ingest_intra("s", "/a", "/health").await,
            IngestOutcome::Skipped
        );

        let resp = e.next("s", "/metrics", 3).await;
        assert!(resp.next_paths.is_empty());
        assert_eq!(resp.max_prefetch, 0);
    }

    #[tokio::test]
    async fn cross_service_edges_score_with_service() {
        let e = engine(Store::memory());
        for _ in 0..4 {
            e.ingest_cross("orders-api", "/orders/5", "options-api", "/order-options/5")
                .await;
        }

        let resp = e.next("orders-api", "/orders/9", 3).await;
        assert_eq!(resp.next_paths.len(), 1);
        assert_eq!(resp.next_paths[0].service, "options-api");
        assert_eq!(resp.next_paths[0].path, "/order-options/{id}");
    }

    #[tokio::test]
    async fn intra_and_cross_merge_by_max() {
        let e = engine(Store::memory());
        // Same destination reachable in both tables: intra dominated (1 of 4),
        // cross dominant (sole edge).
        e.ingest_intra("s", "/a", "/b").await;
        for _ in 0..3 {
            e.ingest_intra("s", "/a", "/other").await;
        }
        for _ in 0..2 {
            e.ingest_cross("s", "/a", "s", "/b").await;
        }

        let resp = e.next("s", "/a", 3).await;
        let b = resp
            .next_paths
            .iter()
            .find(|c| c.path == "/b")
            .expect("b present");
        // cross table gives /b probability ~1.0, which must win over the
        // diluted intra estimate
        assert!(b.score > 0.5, "expected max-merge, got {}", b.score);
    }

    #[tokio::test]
    async fn min_prob_floor_drops_rare_edges() {
        let e = engine_with(Store::memory(), |c| {
            c.min_prob = 0.2;
            c.markov_smooth = 0.0;
        });
        for _ in 0..99 {
            e.ingest_intra("s", "/a", "/hot").await;
        }
        e.ingest_intra("s", "/a", "/rare").await;

        let resp = e.next("s", "/a", 5).await;
        assert!(resp.next_paths.iter().all(|c| c.path != "/rare"));
    }

    #[tokio::test]
    async fn smoothing_disabled_gives_raw_frequencies() {
        let e = engine_with(Store::memory(), |c| {
            c.markov_smooth = 0.0;
            c.min_prob = 0.0;
        });
        for _ in 0..3 {
            e.ingest_intra("s", "/a", "/b").await;
        }
        e.ingest_intra("s", "/a", "/c").await;

        let resp = e.next("s", "/a", 5).await;
        let b = resp.next_paths.iter().find(|c| c.path == "/b").unwrap();
        let c = resp.next_paths.iter().find(|c| c.path == "/c").unwrap();
        assert!((b.score - 0.75).abs() < 1e-9);
        assert!((c.score - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hybrid_blends_cosine_and_probability() {
        let store = Store::memory();
        let e = engine_with(store.clone(), |c| {
            c.i2v_alpha = 0.65;
            c.markov_smooth = 0.0;
            c.min_prob = 0.0;
        });
        for _ in 0..3 {
            e.ingest_intra("s", "/a", "/b").await;
        }
        e.ingest_intra("s", "/a", "/c").await;

        // Similarity table likes /c much more than /b.
        store
            .set_ex(
                "anticip8:i2v:topk:s::/a",
                r#"[{"item":"s::/c","cos":0.9},{"item":"s::/b","cos":0.1}]"#,
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let resp = e.next("s", "/a", 3).await;
        let b = resp.next_paths.iter().find(|x| x.path == "/b").unwrap();
        let c = resp.next_paths.iter().find(|x| x.path == "/c").unwrap();

        // b: 0.65*0.1 + 0.35*0.75 = 0.3275 ; c: 0.65*0.9 + 0.35*0.25 = 0.6725
        assert!((b.score - 0.3275).abs() < 1e-6);
        assert!((c.score - 0.6725).abs() < 1e-6);
        assert_eq!(resp.next_paths[0].path, "/c");
    }

    #[tokio::test]
    async fn strong_markov_edges_survive_missing_embedding_coverage() {
        let store = Store::memory();
        let e = engine_with(store.clone(), |c| {
            c.markov_smooth = 0.0;
            c.min_prob = 0.0;
        });
        for _ in 0..10 {
            e.ingest_intra("s", "/a", "/dominant").await;
        }

        // The similarity row knows nothing about /dominant.
        store
            .set_ex(
                "anticip8:i2v:topk:s::/a",
                r#"[{"item":"s::/elsewhere","cos":0.4}]"#,
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let resp = e.next("s", "/a", 3).await;
        assert!(
            resp.next_paths.iter().any(|c| c.path == "/dominant"),
            "markov insurance lost: {:?}",
            resp.next_paths
        );
    }

    #[tokio::test]
    async fn malformed_similarity_row_reads_as_empty() {
        let store = Store::memory();
        let e = engine(store.clone());
        for _ in 0..2 {
            e.ingest_intra("s", "/a", "/b").await;
        }
        store
            .set_ex("anticip8:i2v:topk:s::/a", "{broken", Duration::from_secs(60))
            .await
            .unwrap();

        let resp = e.next("s", "/a", 3).await;
        assert_eq!(resp.next_paths.len(), 1);
        assert_eq!(resp.next_paths[0].path, "/b");
    }

    #[tokio::test]
    async fn attempt_table_only_counts_when_enabled() {
        let store = Store::memory();
        let off = engine_with(store.clone(), |c| {
            c.markov_smooth = 0.0;
            c.min_prob = 0.0;
        });
        off.ingest_attempt("s", "/a", "s", "/guessed").await;
        assert!(off.next("s", "/a", 3).await.next_paths.is_empty());

        let on = engine_with(store, |c| {
            c.allow_prefetch_attempts = true;
            c.prefetch_attempt_weight = 0.3;
            c.markov_smooth = 0.0;
            c.min_prob = 0.0;
        });
        let resp = on.next("s", "/a", 3).await;
        assert_eq!(resp.next_paths.len(), 1);
        assert_eq!(resp.next_paths[0].path, "/guessed");
        // sole edge: raw prob 1.0, weighted down
        assert!((resp.next_paths[0].score - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limit_caps_returned_candidates() {
        let e = engine_with(Store::memory(), |c| c.min_prob = 0.0);
        for dst in ["/b", "/c", "/d", "/e"] {
            e.ingest_intra("s", "/a", dst).await;
        }
        let resp = e.next("s", "/a", 2).await;
        assert_eq!(resp.next_paths.len(), 2);
    }
}
