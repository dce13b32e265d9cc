//! Per-account connection pool, per §4.3.
//!
//! Shape mirrors the credential pool's per-entity maps guarded by coarse
//! locks plus background sweep tasks; the actual idle-bucket/eviction
//! mechanics are adapted from the WebSocket pool in the retrieval pack
//! (bucketed idle lists, lazy eviction on checkout, bounded per-key and
//! global caps).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::error::{WsError, WsResult};
use crate::ws_client::{ConnectorCache, DialHeaders, ProxyKind, WsConn};

pub const PING_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const PREWARM_COOLDOWN: Duration = Duration::from_millis(200);
const PING_SWEEP_CONCURRENCY: usize = 10;

pub type AccountId = turngate_provider_core::CredentialId;
pub type ConnId = u64;

pub struct PooledConnection {
    pub id: ConnId,
    conn: WsConn,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    in_use: std::sync::atomic::AtomicBool,
    broken: std::sync::atomic::AtomicBool,
}

impl PooledConnection {
    fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::Acquire)
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn conn(&self) -> &WsConn {
        &self.conn
    }
}

pub struct Lease {
    pool: Arc<AccountPoolHandle>,
    conn: Arc<PooledConnection>,
    released: bool,
}

impl Lease {
    pub fn conn(&self) -> &WsConn {
        self.conn.conn()
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn.id
    }

    pub async fn release(mut self) {
        self.released = true;
        self.pool.release(self.conn.clone()).await;
    }

    pub fn mark_broken(&self) {
        self.conn.mark_broken();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            // Caller forgot to release explicitly (e.g. early return on
            // error) — return the connection so it isn't leaked permanently
            // out of the free list. Health state is whatever was already
            // recorded via `mark_broken`.
            let pool = self.pool.clone();
            let conn = self.conn.clone();
            tokio::spawn(async move { pool.release(conn).await });
        }
    }
}

struct Waiter {
    notify: Arc<Notify>,
}

pub struct AccountPool {
    account_id: AccountId,
    concurrency: usize,
    free: Mutex<VecDeque<Arc<PooledConnection>>>,
    total: std::sync::atomic::AtomicUsize,
    waiters: Mutex<VecDeque<Waiter>>,
    next_conn_id: AtomicU64,
    max_age: Duration,
    max_idle: Duration,
    last_prewarm: Mutex<Option<Instant>>,
}

impl AccountPool {
    fn new(account_id: AccountId, concurrency: usize, max_age: Duration, max_idle: Duration) -> Self {
        Self {
            account_id,
            concurrency,
            free: Mutex::new(VecDeque::new()),
            total: std::sync::atomic::AtomicUsize::new(0),
            waiters: Mutex::new(VecDeque::new()),
            next_conn_id: AtomicU64::new(1),
            max_age,
            max_idle,
            last_prewarm: Mutex::new(None),
        }
    }

    async fn take_preferred(&self, preferred_conn_id: ConnId) -> Option<Arc<PooledConnection>> {
        let mut free = self.free.lock().await;
        let idx = free
            .iter()
            .position(|c| c.id == preferred_conn_id && c.is_healthy())?;
        free.remove(idx)
    }

    async fn take_lru(&self) -> Option<Arc<PooledConnection>> {
        let mut free = self.free.lock().await;
        while let Some(candidate) = free.pop_front() {
            if candidate.is_healthy() {
                return Some(candidate);
            }
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
        None
    }
}

pub struct ConnectionPool {
    accounts: RwLock<HashMap<AccountId, Arc<AccountPool>>>,
    connectors: ConnectorCache,
    non_retryable_close_codes: Vec<u16>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_non_retryable_close_codes(vec![1008])
    }

    /// `non_retryable_close_codes` is the operator-configurable
    /// `non_retryable_close_statuses` gateway setting (§6); defaults to
    /// `{1008}` per §4.8.
    pub fn with_non_retryable_close_codes(non_retryable_close_codes: Vec<u16>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            connectors: ConnectorCache::new(),
            non_retryable_close_codes,
        }
    }

    async fn account_pool(
        &self,
        account_id: AccountId,
        concurrency: usize,
        max_age: Duration,
        max_idle: Duration,
    ) -> WsResult<Arc<AccountPool>> {
        if concurrency == 0 {
            return Err(WsError::AccountUnschedulable);
        }
        if let Some(pool) = self.accounts.read().await.get(&account_id) {
            return Ok(pool.clone());
        }
        let mut guard = self.accounts.write().await;
        Ok(guard
            .entry(account_id)
            .or_insert_with(|| Arc::new(AccountPool::new(account_id, concurrency, max_age, max_idle)))
            .clone())
    }

    /// §4.3 Acquire resolution order: preferred → LRU free → dial-if-room →
    /// FIFO wait.
    pub async fn acquire(
        self: &Arc<Self>,
        account_id: AccountId,
        concurrency: usize,
        max_age: Duration,
        max_idle: Duration,
        preferred_conn_id: Option<ConnId>,
        endpoint: &str,
        headers: DialHeaders,
        proxy: Option<ProxyKind>,
    ) -> WsResult<Lease> {
        let account_pool = self
            .account_pool(account_id, concurrency, max_age, max_idle)
            .await?;

        if let Some(preferred) = preferred_conn_id
            && let Some(conn) = account_pool.take_preferred(preferred).await
        {
            return Ok(self.lease(account_pool, conn));
        }

        if let Some(conn) = account_pool.take_lru().await {
            return Ok(self.lease(account_pool, conn));
        }

        loop {
            let total = account_pool.total.load(Ordering::Acquire);
            if total < account_pool.concurrency {
                if account_pool
                    .total
                    .compare_exchange(total, total + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                let raw = WsConn::dial(endpoint, headers, proxy, &self.connectors, &self.non_retryable_close_codes).await;
                let raw = match raw {
                    Ok(conn) => conn,
                    Err(err) => {
                        account_pool.total.fetch_sub(1, Ordering::AcqRel);
                        return Err(err);
                    }
                };
                let id = account_pool.next_conn_id.fetch_add(1, Ordering::Relaxed);
                let pooled = Arc::new(PooledConnection {
                    id,
                    conn: raw,
                    created_at: Instant::now(),
                    last_used_at: Mutex::new(Instant::now()),
                    in_use: std::sync::atomic::AtomicBool::new(true),
                    broken: std::sync::atomic::AtomicBool::new(false),
                });
                return Ok(self.lease(account_pool, pooled));
            }

            let notify = Arc::new(Notify::new());
            account_pool
                .waiters
                .lock()
                .await
                .push_back(Waiter { notify: notify.clone() });
            notify.notified().await;
            if let Some(conn) = account_pool.take_lru().await {
                return Ok(self.lease(account_pool, conn));
            }
        }
    }

    fn lease(self: &Arc<Self>, account_pool: Arc<AccountPool>, conn: Arc<PooledConnection>) -> Lease {
        conn.in_use.store(true, Ordering::Release);
        Lease {
            pool: self.account_pool_wrapper(account_pool),
            conn,
            released: false,
        }
    }

    fn account_pool_wrapper(self: &Arc<Self>, account_pool: Arc<AccountPool>) -> Arc<AccountPoolHandle> {
        Arc::new(AccountPoolHandle { account_pool })
    }

    /// Debounced prewarm: per-account cooldown and failure-rate gate are
    /// enforced by the caller passing `recent_failure_rate`; this only
    /// enforces the cooldown window itself.
    pub async fn ensure_target_idle_async(
        self: &Arc<Self>,
        account_id: AccountId,
        target: usize,
        concurrency: usize,
        max_age: Duration,
        max_idle: Duration,
        recent_failure_rate: f64,
        failure_rate_threshold: f64,
        endpoint: String,
        headers: DialHeaders,
        proxy: Option<ProxyKind>,
    ) {
        if recent_failure_rate > failure_rate_threshold {
            return;
        }
        let Ok(account_pool) = self
            .account_pool(account_id, concurrency, max_age, max_idle)
            .await
        else {
            return;
        };
        {
            let mut last = account_pool.last_prewarm.lock().await;
            let now = Instant::now();
            if let Some(prev) = *last
                && now.duration_since(prev) < PREWARM_COOLDOWN
            {
                return;
            }
            *last = Some(now);
        }

        let current = account_pool.free.lock().await.len();
        if current >= target {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            for _ in current..target {
                let total = account_pool.total.load(Ordering::Acquire);
                if total >= account_pool.concurrency {
                    break;
                }
                if let Ok(conn) = WsConn::dial(
                    &endpoint,
                    headers.clone(),
                    proxy.clone(),
                    &pool.connectors,
                    &pool.non_retryable_close_codes,
                )
                .await
                {
                    account_pool.total.fetch_add(1, Ordering::AcqRel);
                    let id = account_pool.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    account_pool.free.lock().await.push_back(Arc::new(PooledConnection {
                        id,
                        conn,
                        created_at: Instant::now(),
                        last_used_at: Mutex::new(Instant::now()),
                        in_use: std::sync::atomic::AtomicBool::new(false),
                        broken: std::sync::atomic::AtomicBool::new(false),
                    }));
                } else {
                    break;
                }
            }
        });
    }

    /// Ping sweep: bounded concurrency over idle connections across all
    /// accounts, evicting any that fail (§4.3).
    pub async fn run_ping_sweep_once(&self) {
        let accounts: Vec<Arc<AccountPool>> = self.accounts.read().await.values().cloned().collect();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(PING_SWEEP_CONCURRENCY));
        let mut handles = Vec::new();
        for account_pool in accounts {
            let idle: Vec<Arc<PooledConnection>> = account_pool.free.lock().await.iter().cloned().collect();
            for conn in idle {
                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let account_pool = account_pool.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    if conn.conn.ping().await.is_err() {
                        conn.mark_broken();
                        debug!(account_id = account_pool.account_id, conn_id = conn.id, "wsv2 ping sweep evicting");
                        let mut free = account_pool.free.lock().await;
                        free.retain(|c| c.id != conn.id);
                        account_pool.total.fetch_sub(1, Ordering::AcqRel);
                    }
                }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Cleanup sweep: iterate every account, evict connections older than
    /// `max_age` or idle longer than `max_idle` (§4.3).
    pub async fn run_cleanup_sweep_once(&self) {
        let accounts: Vec<Arc<AccountPool>> = self.accounts.read().await.values().cloned().collect();
        let now = Instant::now();
        for account_pool in accounts {
            let mut free = account_pool.free.lock().await;
            let max_age = account_pool.max_age;
            let max_idle = account_pool.max_idle;
            let before = free.len();
            let mut kept = VecDeque::new();
            for conn in free.drain(..) {
                let last_used = *conn.last_used_at.lock().await;
                let expired = now.duration_since(conn.created_at) > max_age
                    || now.duration_since(last_used) > max_idle;
                if expired || !conn.is_healthy() {
                    continue;
                }
                kept.push_back(conn);
            }
            let evicted = before - kept.len();
            if evicted > 0 {
                debug!(account_id = account_pool.account_id, evicted, "wsv2 cleanup sweep");
            }
            account_pool.total.fetch_sub(evicted, Ordering::AcqRel);
            *free = kept;
        }
    }

    pub fn spawn_background_workers(self: &Arc<Self>) -> BackgroundWorkers {
        let ping_pool = self.clone();
        let ping_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                ping_pool.run_ping_sweep_once().await;
            }
        });
        let cleanup_pool = self.clone();
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                cleanup_pool.run_cleanup_sweep_once().await;
            }
        });
        BackgroundWorkers {
            ping_handle,
            cleanup_handle,
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BackgroundWorkers {
    ping_handle: tokio::task::JoinHandle<()>,
    cleanup_handle: tokio::task::JoinHandle<()>,
}

impl BackgroundWorkers {
    pub async fn close(self) {
        self.ping_handle.abort();
        self.cleanup_handle.abort();
        let _ = self.ping_handle.await;
        let _ = self.cleanup_handle.await;
    }
}

/// Bridges a `Lease`'s drop/`release` back into the owning `AccountPool`'s
/// free list and wakes one FIFO waiter, if any.
struct AccountPoolHandle {
    account_pool: Arc<AccountPool>,
}

impl AccountPoolHandle {
    async fn release(&self, conn: Arc<PooledConnection>) {
        conn.in_use.store(false, Ordering::Release);
        if !conn.is_healthy() {
            self.account_pool.total.fetch_sub(1, Ordering::AcqRel);
        } else {
            *conn.last_used_at.lock().await = Instant::now();
            self.account_pool.free.lock().await.push_back(conn);
        }
        if let Some(waiter) = self.account_pool.waiters.lock().await.pop_front() {
            waiter.notify.notify_one();
        }
    }
}

impl std::ops::Deref for Lease {
    type Target = WsConn;

    fn deref(&self) -> &WsConn {
        self.conn.conn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn account_pool_rejects_zero_concurrency() {
        let pool = Arc::new(ConnectionPool::new());
        let result = pool
            .acquire(
                1,
                0,
                Duration::from_secs(60),
                Duration::from_secs(60),
                None,
                "ws://127.0.0.1:0/unused",
                DialHeaders::default(),
                None,
            )
            .await;
        // Rejected by the concurrency==0 guard in `account_pool` before any
        // dial is attempted, so no live server is needed for this to fail
        // with `AccountUnschedulable` rather than a dial error.
        assert!(matches!(result, Err(WsError::AccountUnschedulable)));
    }
}
