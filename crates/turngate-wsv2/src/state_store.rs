//! Session-/response-stickiness state: `session_id -> last_response_id`,
//! `response_id -> account_id`, `response_id -> pending_call_ids`.
//!
//! Each mapping lives in an in-process hot cache (write-through) backed by a
//! shared key-value cache, per §4.1/§6. A shared-cache miss or error is
//! treated as "not found" — the state store never fails a request on a cache
//! outage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::warn;

use crate::error::STATE_STORE_DEADLINE;

pub const SESSION_TTL: Duration = Duration::from_secs(600);
pub const RESPONSE_ACCOUNT_TTL: Duration = Duration::from_secs(600);
pub const PENDING_CALLS_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    Conflict,
}

struct HotEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> HotEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Shared key-value cache backing the hot cache. A production deployment
/// wires a real client (see `RedisSharedCache`); tests use an in-memory
/// stand-in with the same contract: miss or error both read as "not found".
#[async_trait::async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration);
    /// `SETNX`: returns `true` if this call established the value.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool;
    async fn del(&self, key: &str);
}

pub struct RedisSharedCache {
    client: redis::Client,
}

impl RedisSharedCache {
    pub fn new(url: &str) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match tokio::time::timeout(
            STATE_STORE_DEADLINE,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Some(conn),
            Ok(Err(err)) => {
                warn!(error = %err, "wsv2 shared cache connect failed");
                None
            }
            Err(_) => {
                warn!("wsv2 shared cache connect timed out");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.connection().await?;
        let fut = redis::AsyncCommands::get::<_, Option<String>>(&mut conn, key);
        match tokio::time::timeout(STATE_STORE_DEADLINE, fut).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                warn!(error = %err, %key, "wsv2 shared cache GET failed");
                None
            }
            Err(_) => {
                warn!(%key, "wsv2 shared cache GET timed out");
                None
            }
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let result = tokio::time::timeout(
            STATE_STORE_DEADLINE,
            redis::AsyncCommands::set_ex::<_, _, ()>(&mut conn, key, value, ttl.as_secs().max(1)),
        )
        .await;
        if let Ok(Err(err)) = result {
            warn!(error = %err, %key, "wsv2 shared cache SET EX failed");
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1) as i64));
        let result = tokio::time::timeout(
            STATE_STORE_DEADLINE,
            redis::AsyncCommands::set_options::<_, _, Option<String>>(
                &mut conn, key, value, opts,
            ),
        )
        .await;
        match result {
            Ok(Ok(Some(_))) => true,
            Ok(Ok(None)) => false,
            Ok(Err(err)) => {
                warn!(error = %err, %key, "wsv2 shared cache SETNX failed");
                false
            }
            Err(_) => {
                warn!(%key, "wsv2 shared cache SETNX timed out");
                false
            }
        }
    }

    async fn del(&self, key: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let result =
            tokio::time::timeout(STATE_STORE_DEADLINE, redis::AsyncCommands::del::<_, ()>(&mut conn, key))
                .await;
        if let Ok(Err(err)) = result {
            warn!(error = %err, %key, "wsv2 shared cache DEL failed");
        }
    }
}

pub struct StateStore {
    shared: Arc<dyn SharedCache>,
    session_last_response: RwLock<HashMap<String, HotEntry<String>>>,
    response_account: RwLock<HashMap<String, HotEntry<i64>>>,
    response_pending_calls: RwLock<HashMap<String, HotEntry<HashSet<String>>>>,
}

impl StateStore {
    pub fn new(shared: Arc<dyn SharedCache>) -> Self {
        Self {
            shared,
            session_last_response: RwLock::new(HashMap::new()),
            response_account: RwLock::new(HashMap::new()),
            response_pending_calls: RwLock::new(HashMap::new()),
        }
    }

    fn session_key(session_id: &str) -> String {
        Self::session_key_from_hash(hash64(session_id))
    }

    fn session_key_from_hash(session_hash: u64) -> String {
        format!("ws:session_last_resp:{session_hash}")
    }

    fn legacy_session_key(legacy_hash: &str) -> String {
        format!("ws:session_last_resp_legacy:{legacy_hash}")
    }

    fn account_key(response_id: &str) -> String {
        format!("ws:resp_account:{response_id}")
    }

    fn pending_calls_key(response_id: &str) -> String {
        format!("ws:resp_pending_calls:{response_id}")
    }

    pub async fn get_session_last_response_id(&self, session_id: &str) -> Option<String> {
        if let Some(entry) = self.session_last_response.read().await.get(session_id)
            && entry.is_live()
        {
            return Some(entry.value.clone());
        }
        let value = self.shared.get(&Self::session_key(session_id)).await?;
        self.session_last_response.write().await.insert(
            session_id.to_string(),
            HotEntry::new(value.clone(), SESSION_TTL),
        );
        Some(value)
    }

    pub async fn set_session_last_response_id(&self, session_id: &str, response_id: &str) {
        self.session_last_response.write().await.insert(
            session_id.to_string(),
            HotEntry::new(response_id.to_string(), SESSION_TTL),
        );
        self.shared
            .set_ex(&Self::session_key(session_id), response_id, SESSION_TTL)
            .await;
    }

    /// Session-sticky lookup by pre-computed fast hash, bypassing the
    /// session-id-keyed hot cache (this path only runs on a scheduler
    /// session-sticky check, which only ever has the hash — see
    /// `scheduler::StateStoreSticky`).
    pub async fn get_session_last_response_id_by_hash(&self, session_hash: u64) -> Option<String> {
        self.shared
            .get(&Self::session_key_from_hash(session_hash))
            .await
    }

    /// Legacy-hash migration read (§6 `session_hash_read_old_fallback`).
    /// Nothing in this process writes `legacy_session_key` yet — it only
    /// resolves once an external dual-write source populates it during the
    /// hash migration window.
    pub async fn get_session_last_response_id_by_legacy_hash(
        &self,
        legacy_hash: &str,
    ) -> Option<String> {
        self.shared.get(&Self::legacy_session_key(legacy_hash)).await
    }

    pub async fn get_response_account(&self, response_id: &str) -> Option<i64> {
        if let Some(entry) = self.response_account.read().await.get(response_id)
            && entry.is_live()
        {
            return Some(entry.value);
        }
        let raw = self.shared.get(&Self::account_key(response_id)).await?;
        let account_id: i64 = raw.parse().ok()?;
        self.response_account.write().await.insert(
            response_id.to_string(),
            HotEntry::new(account_id, RESPONSE_ACCOUNT_TTL),
        );
        Some(account_id)
    }

    /// Binds `response_id -> account_id`, immutable once set until TTL
    /// expiry. Concurrent binds for the same response resolve via the
    /// shared cache's `SETNX`; losers observe the established binding.
    pub async fn bind_response_account(&self, response_id: &str, account_id: i64) -> BindOutcome {
        let key = Self::account_key(response_id);
        let value = account_id.to_string();
        if self
            .shared
            .set_if_absent(&key, &value, RESPONSE_ACCOUNT_TTL)
            .await
        {
            self.response_account.write().await.insert(
                response_id.to_string(),
                HotEntry::new(account_id, RESPONSE_ACCOUNT_TTL),
            );
            return BindOutcome::Bound;
        }

        // Lost the race (or the cache is down and we can't tell) — read
        // back whatever is authoritative and adopt it.
        match self.shared.get(&key).await {
            Some(existing) => {
                if let Ok(existing_id) = existing.parse::<i64>() {
                    self.response_account.write().await.insert(
                        response_id.to_string(),
                        HotEntry::new(existing_id, RESPONSE_ACCOUNT_TTL),
                    );
                    if existing_id != account_id {
                        warn!(
                            response_id,
                            attempted_account_id = account_id,
                            bound_account_id = existing_id,
                            "wsv2 rebind to a different account rejected"
                        );
                    }
                }
                BindOutcome::Conflict
            }
            None => {
                // Shared cache unreachable for the read-back too: best-effort
                // keep our own write in the hot cache so this process stays
                // consistent with itself.
                self.response_account.write().await.insert(
                    response_id.to_string(),
                    HotEntry::new(account_id, RESPONSE_ACCOUNT_TTL),
                );
                BindOutcome::Bound
            }
        }
    }

    pub async fn get_response_pending_call_ids(&self, response_id: &str) -> Option<HashSet<String>> {
        if let Some(entry) = self.response_pending_calls.read().await.get(response_id)
            && entry.is_live()
        {
            return Some(entry.value.clone());
        }
        let raw = self
            .shared
            .get(&Self::pending_calls_key(response_id))
            .await?;
        let ids: Vec<String> = serde_json::from_str(&raw).ok()?;
        let set: HashSet<String> = ids.into_iter().collect();
        self.response_pending_calls.write().await.insert(
            response_id.to_string(),
            HotEntry::new(set.clone(), PENDING_CALLS_TTL),
        );
        Some(set)
    }

    pub async fn set_response_pending_call_ids(&self, response_id: &str, ids: HashSet<String>) {
        self.response_pending_calls.write().await.insert(
            response_id.to_string(),
            HotEntry::new(ids.clone(), PENDING_CALLS_TTL),
        );
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        let Ok(raw) = serde_json::to_string(&sorted) else {
            return;
        };
        self.shared
            .set_ex(&Self::pending_calls_key(response_id), &raw, PENDING_CALLS_TTL)
            .await;
    }

    pub async fn clear_response_pending_call_ids(&self, response_id: &str) {
        self.response_pending_calls.write().await.remove(response_id);
        self.shared.del(&Self::pending_calls_key(response_id)).await;
    }
}

/// Fast non-cryptographic 64-bit hash for session-id bucketing (§4.6.2).
fn hash64(value: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// In-memory `SharedCache` stand-in shared by this module's own tests and by
/// other wsv2 modules that need a real `StateStore` in tests without a Redis
/// server.
#[cfg(test)]
pub(crate) mod test_support {
    use super::{Duration, HashMap, SharedCache, StateStore};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemCache {
        data: Mutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl SharedCache for MemCache {
        async fn get(&self, key: &str) -> Option<String> {
            self.data.lock().await.get(key).cloned()
        }

        async fn set_ex(&self, key: &str, value: &str, _ttl: Duration) {
            self.data.lock().await.insert(key.to_string(), value.to_string());
        }

        async fn set_if_absent(&self, key: &str, value: &str, _ttl: Duration) -> bool {
            let mut guard = self.data.lock().await;
            if guard.contains_key(key) {
                return false;
            }
            guard.insert(key.to_string(), value.to_string());
            true
        }

        async fn del(&self, key: &str) {
            self.data.lock().await.remove(key);
        }
    }

    pub(crate) fn memory_state_store() -> StateStore {
        StateStore::new(std::sync::Arc::new(MemCache::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::memory_state_store;
    use super::*;

    fn store() -> StateStore {
        memory_state_store()
    }

    #[tokio::test]
    async fn session_last_response_round_trips() {
        let store = store();
        store.set_session_last_response_id("s1", "r1").await;
        assert_eq!(
            store.get_session_last_response_id("s1").await,
            Some("r1".to_string())
        );
    }

    #[tokio::test]
    async fn bind_response_account_is_immutable_once_set() {
        let store = store();
        assert_eq!(
            store.bind_response_account("r1", 10).await,
            BindOutcome::Bound
        );
        assert_eq!(
            store.bind_response_account("r1", 20).await,
            BindOutcome::Conflict
        );
        assert_eq!(store.get_response_account("r1").await, Some(10));
    }

    #[tokio::test]
    async fn pending_call_ids_round_trip_exactly() {
        let store = store();
        let ids: HashSet<String> = ["a", "b", "c"].into_iter().map(String::from).collect();
        store.set_response_pending_call_ids("r1", ids.clone()).await;
        assert_eq!(store.get_response_pending_call_ids("r1").await, Some(ids));
        store.clear_response_pending_call_ids("r1").await;
        assert_eq!(store.get_response_pending_call_ids("r1").await, None);
    }

    #[tokio::test]
    async fn missing_key_reads_as_not_found() {
        let store = store();
        assert_eq!(store.get_session_last_response_id("nope").await, None);
        assert_eq!(store.get_response_account("nope").await, None);
    }
}
