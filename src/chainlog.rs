use std::time::Duration;
use tracing::debug;

use crate::store::{KvOp, Store};

fn step_key(service: &str, req_key: &str) -> String {
    format!("{service}|{req_key}")
}

fn k_last(user: &str) -> String {
    format!("anticip8:chain:last:{user}")
}

fn k_prev(user: &str) -> String {
    format!("anticip8:chain:prev:{user}")
}

pub fn k_top2_global() -> String {
    "anticip8:chain:top2".to_string()
}

pub fn k_top3_global() -> String {
    "anticip8:chain:top3".to_string()
}

pub fn k_top2_user(user: &str) -> String {
    format!("anticip8:chain:u:{user}:top2")
}

pub fn k_top3_user(user: &str) -> String {
    format!("anticip8:chain:u:{user}:top3")
}

/// Slide the per-user 3-node window over `req_key` and bump bigram/trigram
/// counters (global and per-user).
///
/// All writes go out as one non-transactional pipeline, and every failure is
/// swallowed: analytics must never fault a user-serving request. Two racing
/// requests for the same user may each read the same window and double-count
/// one transition; that race is accepted.
pub async fn log_step(
    store: &Store,
    service: &str,
    user: &str,
    req_key: &str,
    ttl: Duration,
    per_user: bool,
    enable_trigram: bool,
) {
    let cur = step_key(service, req_key);
    let last_k = k_last(user);
    let prev_k = k_prev(user);

    let window = match store.mget(&[last_k.clone(), prev_k.clone()]).await {
        Ok(w) => w,
        Err(err) => {
            debug!(error = %err, user = %user, "chain window read failed, skipping step");
            return;
        }
    };
    let last = window.first().cloned().flatten();
    let prev = window.get(1).cloned().flatten();

    let mut ops = Vec::with_capacity(8);

    if let Some(last) = last.as_deref().filter(|l| *l != cur) {
        let bigram = format!("{last} -> {cur}");
        ops.push(KvOp::ZIncrBy {
            key: k_top2_global(),
            member: bigram.clone(),
            by: 1.0,
        });
        if per_user {
            ops.push(KvOp::ZIncrBy {
                key: k_top2_user(user),
                member: bigram,
                by: 1.0,
            });
        }

        if enable_trigram {
            if let Some(prev) = prev.as_deref().filter(|p| *p != last) {
                let trigram = format!("{prev} -> {last} -> {cur}");
                ops.push(KvOp::ZIncrBy {
                    key: k_top3_global(),
                    member: trigram.clone(),
                    by: 1.0,
                });
                if per_user {
                    ops.push(KvOp::ZIncrBy {
                        key: k_top3_user(user),
                        member: trigram,
                        by: 1.0,
                    });
                }
            }
        }
    }

    // shift window: prev = last, last = cur
    ops.push(KvOp::SetEx {
        key: last_k,
        value: cur.clone(),
        ttl,
    });
    ops.push(KvOp::SetEx {
        key: prev_k,
        value: last.unwrap_or(cur),
        ttl,
    });

    if let Err(err) = store.run_pipeline(ops).await {
        debug!(error = %err, user = %user, "chain pipeline failed, dropping step");
    }
}
