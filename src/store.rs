use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Compare-and-delete: release an inflight lock only if the stored token is
/// ours. A plain DEL could release a lock re-acquired by another task.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One operation in a non-transactional pipeline. The chain-log issues its
/// whole window update as one `Vec<KvOp>` roundtrip.
#[derive(Debug, Clone)]
pub enum KvOp {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    ZIncrBy {
        key: String,
        member: String,
        by: f64,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
}

/// Shared keyed state store. `Redis` is the production backend; `Memory`
/// implements the same hash/zset/TTL/SETNX/compare-and-delete semantics
/// in-process and backs the test suite and single-node dev runs.
#[derive(Clone)]
pub enum Store {
    Redis(RedisStore),
    Memory(MemoryStore),
}

impl Store {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Store::Redis(RedisStore {
            conn,
            release: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
        }))
    }

    pub fn memory() -> Self {
        Store::Memory(MemoryStore::default())
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                Ok(conn.get(key).await?)
            }
            Store::Memory(s) => Ok(s.get(key)),
        }
    }

    pub async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                // MGET with a single key collapses to a scalar reply; keep the
                // Vec shape uniform for callers.
                if keys.len() == 1 {
                    let one: Option<String> = conn.get(&keys[0]).await?;
                    return Ok(vec![one]);
                }
                Ok(conn.mget(keys).await?)
            }
            Store::Memory(s) => Ok(keys.iter().map(|k| s.get(k)).collect()),
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                Ok(conn.set_ex(key, value, ttl.as_secs().max(1)).await?)
            }
            Store::Memory(s) => {
                s.set(key, value, Some(ttl));
                Ok(())
            }
        }
    }

    /// SET NX with millisecond TTL. Returns true when this call created the
    /// key. Used for inflight locks and the policy debounce.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                let reply: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis().max(1) as u64)
                    .query_async(&mut conn)
                    .await?;
                Ok(reply.is_some())
            }
            Store::Memory(s) => Ok(s.set_nx(key, value, ttl)),
        }
    }

    pub async fn del(&self, key: &str) -> StoreResult<()> {
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                Ok(conn.del(key).await?)
            }
            Store::Memory(s) => {
                s.del(key);
                Ok(())
            }
        }
    }

    /// Delete `key` only if its value equals `token`. Returns true when the
    /// key was removed by this call.
    pub async fn del_if_equals(&self, key: &str, token: &str) -> StoreResult<bool> {
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                let removed: i64 = s
                    .release
                    .key(key)
                    .arg(token)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(removed == 1)
            }
            Store::Memory(s) => Ok(s.del_if_equals(key, token)),
        }
    }

    /// HINCRBY. Returns the field value after the increment.
    pub async fn hash_incr(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                Ok(conn.hincr(key, field, by).await?)
            }
            Store::Memory(s) => Ok(s.hash_incr(key, field, by)),
        }
    }

    /// HGETALL with non-integer fields dropped.
    pub async fn hash_counts(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        let raw: HashMap<String, String> = match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                conn.hgetall(key).await?
            }
            Store::Memory(s) => s.hash_all(key),
        };
        Ok(raw
            .into_iter()
            .filter_map(|(f, v)| v.parse::<i64>().ok().map(|c| (f, c)))
            .collect())
    }

    /// Top `limit` members of a sorted set, highest score first.
    pub async fn zset_top(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, i64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                let raw: Vec<(String, f64)> =
                    conn.zrevrange_withscores(key, 0, limit as isize - 1).await?;
                Ok(raw.into_iter().map(|(m, sc)| (m, sc as i64)).collect())
            }
            Store::Memory(s) => Ok(s.zset_top(key, limit)),
        }
    }

    /// Execute a batch of writes in one roundtrip. Non-transactional: a
    /// partial failure may leave some ops applied, which every caller
    /// tolerates.
    pub async fn run_pipeline(&self, ops: Vec<KvOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        match self {
            Store::Redis(s) => {
                let mut conn = s.conn.clone();
                let mut pipe = redis::pipe();
                for op in &ops {
                    match op {
                        KvOp::SetEx { key, value, ttl } => {
                            pipe.set_ex(key, value, ttl.as_secs().max(1)).ignore();
                        }
                        KvOp::ZIncrBy { key, member, by } => {
                            pipe.zincr(key, member, *by).ignore();
                        }
                        KvOp::Expire { key, ttl } => {
                            pipe.expire(key, ttl.as_secs().max(1) as i64).ignore();
                        }
                        KvOp::Del { key } => {
                            pipe.del(key).ignore();
                        }
                    }
                }
                pipe.query_async::<()>(&mut conn).await?;
                Ok(())
            }
            Store::Memory(s) => {
                for op in ops {
                    s.apply(op);
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
    release: Arc<redis::Script>,
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, i64>),
    ZSet(BTreeMap<String, f64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// Process-local store with redis-equivalent semantics for everything the
/// sidecar uses. Expiry is lazy: dead entries are dropped on access.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut map = self.inner.lock();
        match map.get(key) {
            Some(e) if e.live() => match &e.value {
                Value::Str(s) => Some(s.clone()),
                _ => None,
            },
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut map = self.inner.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut map = self.inner.lock();
        if let Some(e) = map.get(key) {
            if e.live() {
                return false;
            }
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        true
    }

    fn del(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    fn del_if_equals(&self, key: &str, token: &str) -> bool {
        let mut map = self.inner.lock();
        let matches = matches!(
            map.get(key),
            Some(e) if e.live() && matches!(&e.value, Value::Str(s) if s == token)
        );
        if matches {
            map.remove(key);
        }
        matches
    }

    fn hash_incr(&self, key: &str, field: &str, by: i64) -> i64 {
        let mut map = self.inner.lock();
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if !entry.live() {
            entry.value = Value::Hash(HashMap::new());
            entry.expires_at = None;
        }
        match &mut entry.value {
            Value::Hash(h) => {
                let c = h.entry(field.to_string()).or_insert(0);
                *c += by;
                *c
            }
            _ => {
                // WRONGTYPE in redis terms; counters never collide with other
                // key families in practice, so just replace.
                let mut h = HashMap::new();
                h.insert(field.to_string(), by);
                entry.value = Value::Hash(h);
                by
            }
        }
    }

    fn hash_all(&self, key: &str) -> HashMap<String, String> {
        let mut map = self.inner.lock();
        match map.get(key) {
            Some(e) if e.live() => match &e.value {
                Value::Hash(h) => h.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
                _ => HashMap::new(),
            },
            Some(_) => {
                map.remove(key);
                HashMap::new()
            }
            None => HashMap::new(),
        }
    }

    fn zincr(&self, key: &str, member: &str, by: f64) {
        let mut map = self.inner.lock();
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::ZSet(BTreeMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::ZSet(z) => {
                *z.entry(member.to_string()).or_insert(0.0) += by;
            }
            _ => {
                let mut z = BTreeMap::new();
                z.insert(member.to_string(), by);
                entry.value = Value::ZSet(z);
            }
        }
    }

    fn zset_top(&self, key: &str, limit: usize) -> Vec<(String, i64)> {
        let map = self.inner.lock();
        match map.get(key) {
            Some(e) if e.live() => match &e.value {
                Value::ZSet(z) => {
                    let mut items: Vec<(String, i64)> =
                        z.iter().map(|(m, sc)| (m.clone(), *sc as i64)).collect();
                    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                    items.truncate(limit);
                    items
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) {
        let mut map = self.inner.lock();
        if let Some(e) = map.get_mut(key) {
            e.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn apply(&self, op: KvOp) {
        match op {
            KvOp::SetEx { key, value, ttl } => self.set(&key, &value, Some(ttl)),
            KvOp::ZIncrBy { key, member, by } => self.zincr(&key, &member, by),
            KvOp::Expire { key, ttl } => self.expire(&key, ttl),
            KvOp::Del { key } => self.del(&key),
        }
    }

    /// Test hook: number of live keys.
    pub fn live_keys(&self) -> usize {
        let map = self.inner.lock();
        map.values().filter(|e| e.live()).count()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Store::Redis(_) => f.write_str("Store::Redis"),
            Store::Memory(_) => f.write_str("Store::Memory"),
        }
    }
}

/// Log-and-discard helper for best-effort writes. The hot path never faults
/// on store errors.
pub fn swallow<T>(result: StoreResult<T>, what: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(err) => {
            debug!(error = %err, op = what, "store write failed, continuing");
            None
        }
    }
}
