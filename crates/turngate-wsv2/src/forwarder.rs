//! Forwarder (C7), per §4.7: `INIT -> PICK_ACCOUNT -> NORMALIZE ->
//! ACQUIRE_CONN -> SEND_TURN -> RELAY -> TURN_END -> NEXT_TURN |
//! HTTP_FALLBACK | DONE`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{WsError, WsResult};
use crate::normalizer::{self, NormalizeReason};
use crate::pool::{ConnId, ConnectionPool, Lease};
use crate::retry::{BackoffConfig, CircuitBreaker, RecoveryAction};
use crate::scheduler::{
    AccountRuntimeStats, AccountScheduler, CandidateAccount, RequestFingerprint, ScheduleError,
};
use crate::state_store::StateStore;
use crate::ws_client::{DialHeaders, Opcode, ProxyKind};

pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIngress {
    Ws,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMode {
    Shared,
    Dedicated,
    CtxPool,
}

/// Events forwarded to the client: either a raw upstream frame (SSE or WS
/// passthrough) or a terminal signal.
#[derive(Debug)]
pub enum ClientEvent {
    Frame(Bytes),
    TurnComplete,
    Error(WsError),
}

pub struct TurnRequest {
    pub session_id: String,
    pub group_id: Option<String>,
    pub model: String,
    pub body: Bytes,
}

pub struct ForwarderDeps {
    pub state_store: Arc<StateStore>,
    pub pool: Arc<ConnectionPool>,
    pub scheduler: Arc<AccountScheduler>,
    pub stats: Arc<AccountRuntimeStats>,
    pub breaker: Arc<CircuitBreaker>,
    pub backoff: BackoffConfig,
}

pub struct TurnOutcome {
    pub account_id: i64,
    pub response_id: Option<String>,
}

/// Drives a single client WS session (or one HTTP request, which is a
/// single-turn session) through the state machine. `endpoint`/`headers`/
/// `proxy` describe the upstream dial target for this account's provider.
pub struct Forwarder {
    deps: ForwarderDeps,
    ingress: ClientIngress,
    mode: WsMode,
    endpoint: String,
    proxy: Option<ProxyKind>,
    max_age: Duration,
    max_idle: Duration,
    /// Held across turns only in dedicated mode; released on client close.
    pinned_lease: Option<Lease>,
}

impl Forwarder {
    pub fn new(
        deps: ForwarderDeps,
        ingress: ClientIngress,
        mode: WsMode,
        endpoint: String,
        proxy: Option<ProxyKind>,
    ) -> Self {
        Self {
            deps,
            ingress,
            mode,
            endpoint,
            proxy,
            max_age: Duration::from_secs(600),
            max_idle: Duration::from_secs(120),
            pinned_lease: None,
        }
    }

    /// Runs one turn to completion, emitting client-facing events on `tx`.
    /// Returns the final account/response pair for stickiness bookkeeping,
    /// which is performed here at `TURN_END` per the ordering guarantee in
    /// §5 ("stickiness writes are issued only after the terminal event").
    pub async fn run_turn(
        &mut self,
        request: TurnRequest,
        candidates: &[CandidateAccount],
        dial_headers_for: impl Fn(i64) -> DialHeaders,
        tx: mpsc::Sender<ClientEvent>,
    ) -> WsResult<TurnOutcome> {
        // INIT
        if request.body.len() > MAX_BODY_BYTES {
            return Err(WsError::UpstreamInvalidRequest("body exceeds 16 MiB".to_string()));
        }
        info!(
            model = %request.model,
            group_id = request.group_id.as_deref().unwrap_or(""),
            "wsv2 turn starting"
        );

        let mut attempt: u32 = 0;
        let mut body = request.body.clone();
        let mut preferred_conn_id: Option<ConnId> = None;
        let mut replayed_tool_output_not_found = false;
        let mut replayed_previous_response_not_found = false;

        loop {
            // PICK_ACCOUNT
            let fingerprint = RequestFingerprint {
                session_id: request.session_id.clone(),
                previous_response_id: extract_previous_response_id(&body),
            };
            let request_id = crate::scheduler::generate_request_id("wsv2");
            let account_id = match self.deps.scheduler.pick(&fingerprint, candidates, &request_id).await {
                Ok(id) => id,
                Err(ScheduleError::NoSchedulableAccount) => return Err(WsError::NoSchedulableAccount),
            };

            if matches!(self.deps.breaker.check(account_id).await, crate::retry::BreakerDecision::Open) {
                let err = WsError::UpstreamDialError("circuit breaker open for this account".to_string());
                match self.recover(err, attempt).await {
                    RecoveryAction::Retry => {
                        attempt += 1;
                        continue;
                    }
                    other => return self.terminal_for(other),
                }
            }

            // NORMALIZE
            let normalized = if self.mode == WsMode::CtxPool {
                let session_last = self
                    .deps
                    .state_store
                    .get_session_last_response_id(&request.session_id)
                    .await;
                // `normalize`'s `known_pending` callback is a synchronous
                // pure lookup (§4.5); C1 is async, so the one id the
                // normalizer can possibly need — whichever
                // `previous_response_id` ends up anchoring this turn — is
                // resolved up front and handed in as a pre-fetched table.
                let anchor_id = extract_previous_response_id(&body).or_else(|| session_last.clone());
                let anchored_pending = match &anchor_id {
                    Some(id) => self.deps.state_store.get_response_pending_call_ids(id).await,
                    None => None,
                };
                let outcome = normalizer::normalize(&body, session_last.as_deref(), |_response_id| {
                    anchored_pending.clone()
                });
                match outcome {
                    Ok(outcome) => {
                        log_normalizer_decision(outcome.reason);
                        Bytes::from(outcome.payload)
                    }
                    Err(message) => {
                        warn!(%message, "wsv2 normalizer invariant violated, falling back to shared mode for this attempt");
                        body.clone()
                    }
                }
            } else {
                body.clone()
            };

            // ACQUIRE_CONN
            let lease = match self
                .deps
                .pool
                .acquire(
                    account_id,
                    candidates
                        .iter()
                        .find(|c| c.account_id == account_id)
                        .map(|c| c.concurrency)
                        .unwrap_or(0),
                    self.max_age,
                    self.max_idle,
                    preferred_conn_id,
                    &self.endpoint,
                    dial_headers_for(account_id),
                    self.proxy.clone(),
                )
                .await
            {
                Ok(lease) => lease,
                Err(err) => {
                    self.deps.breaker.record(account_id, false).await;
                    match self.recover(err, attempt).await {
                        RecoveryAction::Retry => {
                            attempt += 1;
                            continue;
                        }
                        other => return self.terminal_for(other),
                    }
                }
            };
            self.deps.stats.mark_in_flight(account_id, 1).await;

            // SEND_TURN
            let started_at = Instant::now();
            if let Err(err) = lease.write_json(&normalized).await {
                self.deps.stats.mark_in_flight(account_id, -1).await;
                self.deps.breaker.record(account_id, false).await;
                lease.mark_broken();
                lease.release().await;
                match self.recover(err, attempt).await {
                    RecoveryAction::Retry => {
                        attempt += 1;
                        continue;
                    }
                    other => return self.terminal_for(other),
                }
            }

            // RELAY
            match self
                .relay(&lease, account_id, started_at, &tx, &mut preferred_conn_id)
                .await
            {
                Ok(RelayResult::Terminal { response_id, ttft_ms }) => {
                    self.deps.stats.mark_in_flight(account_id, -1).await;
                    self.deps.breaker.record(account_id, true).await;
                    self.deps.stats.report(account_id, false, ttft_ms).await;
                    if let Some(response_id) = &response_id {
                        self.deps
                            .state_store
                            .set_session_last_response_id(&request.session_id, response_id)
                            .await;
                        self.deps
                            .state_store
                            .bind_response_account(response_id, account_id)
                            .await;
                    }
                    if self.mode == WsMode::Dedicated {
                        self.pinned_lease = Some(lease);
                    } else {
                        lease.release().await;
                    }
                    let _ = tx.send(ClientEvent::TurnComplete).await;
                    return Ok(TurnOutcome { account_id, response_id });
                }
                Ok(RelayResult::ToolOutputNotFound) if !replayed_tool_output_not_found => {
                    self.deps.stats.mark_in_flight(account_id, -1).await;
                    replayed_tool_output_not_found = true;
                    body = strip_previous_response_id(&body);
                    lease.release().await;
                    attempt += 1;
                    continue;
                }
                Ok(RelayResult::ToolOutputNotFound) => {
                    self.deps.stats.mark_in_flight(account_id, -1).await;
                    lease.mark_broken();
                    lease.release().await;
                    self.deps.breaker.record(account_id, false).await;
                    attempt += 1;
                    continue;
                }
                Ok(RelayResult::PreviousResponseNotFound) if !replayed_previous_response_not_found => {
                    self.deps.stats.mark_in_flight(account_id, -1).await;
                    replayed_previous_response_not_found = true;
                    body = strip_previous_response_id(&body);
                    preferred_conn_id = None;
                    lease.release().await;
                    attempt += 1;
                    continue;
                }
                Ok(RelayResult::PreviousResponseNotFound) => {
                    self.deps.stats.mark_in_flight(account_id, -1).await;
                    lease.release().await;
                    return Err(WsError::NormalizerInvariantViolation(
                        "previous_response_not_found repeated after single replay".to_string(),
                    ));
                }
                Ok(RelayResult::ClientDisconnected) => {
                    // Only reachable for HTTP ingress; WS ingress keeps
                    // draining inside `relay` until a terminal event (E6).
                    self.deps.stats.mark_in_flight(account_id, -1).await;
                    lease.release().await;
                    return Err(WsError::ClientDisconnect);
                }
                Err(err) => {
                    self.deps.stats.mark_in_flight(account_id, -1).await;
                    self.deps.breaker.record(account_id, false).await;
                    self.deps.stats.report(account_id, true, None).await;
                    lease.mark_broken();
                    lease.release().await;
                    match self.recover(err, attempt).await {
                        RecoveryAction::Retry => {
                            attempt += 1;
                            continue;
                        }
                        other => return self.terminal_for(other),
                    }
                }
            }
        }
    }

    async fn relay(
        &self,
        lease: &Lease,
        account_id: i64,
        started_at: Instant,
        tx: &mpsc::Sender<ClientEvent>,
        preferred_conn_id: &mut Option<ConnId>,
    ) -> WsResult<RelayResult> {
        *preferred_conn_id = Some(lease.conn_id());
        let mut response_id: Option<String> = None;
        let mut first_message = true;
        let mut first_frame_at: Option<Instant> = None;
        let mut pending_call_ids: std::collections::HashSet<String> = std::collections::HashSet::new();

        loop {
            let (opcode, bytes) = lease.read_message().await?;
            if opcode != Opcode::Text {
                continue;
            }
            let value: Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(_) => {
                    let _ = tx.send(ClientEvent::Frame(bytes)).await;
                    continue;
                }
            };
            let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
            first_frame_at.get_or_insert_with(Instant::now);

            if first_message && event_type.contains("error") {
                let code = value.get("code").and_then(Value::as_str).unwrap_or("");
                if code == "tool_output_not_found" {
                    return Ok(RelayResult::ToolOutputNotFound);
                }
                if code == "previous_response_not_found" {
                    return Ok(RelayResult::PreviousResponseNotFound);
                }
            }
            first_message = false;

            // C1 write-through for the ctx_pool pending-call-id table (§4.7
            // RELAY): a `function_call` with no inline output leaves a
            // pending call the next turn's normalizer must account for;
            // pairing it with `function_call_output` clears it.
            if event_type == "function_call"
                && let Some(call_id) = value.get("call_id").and_then(Value::as_str)
                && value.get("output").is_none()
            {
                pending_call_ids.insert(call_id.to_string());
                if let Some(rid) = &response_id {
                    self.deps
                        .state_store
                        .set_response_pending_call_ids(rid, pending_call_ids.clone())
                        .await;
                }
            }
            if event_type == "function_call_output"
                && let Some(call_id) = value.get("call_id").and_then(Value::as_str)
            {
                pending_call_ids.remove(call_id);
                if let Some(rid) = &response_id {
                    if pending_call_ids.is_empty() {
                        self.deps.state_store.clear_response_pending_call_ids(rid).await;
                    } else {
                        self.deps
                            .state_store
                            .set_response_pending_call_ids(rid, pending_call_ids.clone())
                            .await;
                    }
                }
            }

            if event_type == "error" {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_string();
                let _ = tx.send(ClientEvent::Frame(bytes)).await;
                return Err(WsError::UpstreamInvalidRequest(message));
            }

            if event_type.starts_with("response.")
                && let Some(id) = value
                    .get("response")
                    .and_then(|r| r.get("id"))
                    .and_then(Value::as_str)
            {
                response_id = Some(id.to_string());
            }

            if event_type == "response.completed" {
                let ttft_ms = first_frame_at
                    .unwrap_or(started_at)
                    .duration_since(started_at)
                    .as_secs_f64()
                    * 1000.0;
                let _ = tx.send(ClientEvent::Frame(bytes)).await;
                info!(account_id, "wsv2 turn completed");
                return Ok(RelayResult::Terminal { response_id, ttft_ms: Some(ttft_ms) });
            }
            if matches!(event_type, "response.done" | "response.failed") {
                let _ = tx.send(ClientEvent::Frame(bytes)).await;
                return Ok(RelayResult::Terminal { response_id, ttft_ms: None });
            }

            if tx.send(ClientEvent::Frame(bytes)).await.is_err() {
                if self.ingress == ClientIngress::Http {
                    return Ok(RelayResult::ClientDisconnected);
                }
                // WS ingress (E6): the client is gone but the turn isn't
                // over — keep draining upstream so stickiness still gets
                // recorded and the lease is released healthy rather than
                // abandoned mid-stream.
                continue;
            }
        }
    }

    async fn recover(&self, error: WsError, attempt: u32) -> RecoveryAction {
        crate::retry::decide(&error, attempt, &self.deps.backoff, self.ingress == ClientIngress::Http)
    }

    fn terminal_for(&self, action: RecoveryAction) -> WsResult<TurnOutcome> {
        match action {
            RecoveryAction::HttpFallback => {
                info!("wsv2 non-retryable close, falling back to one http attempt");
                Err(WsError::UpstreamDialError(
                    "ws attempt exhausted, http fallback required".to_string(),
                ))
            }
            RecoveryAction::TerminalClose | RecoveryAction::ReturnVerbatim | RecoveryAction::Retry => {
                Err(WsError::UpstreamDialError("ws attempt terminated without recovery".to_string()))
            }
        }
    }

    pub async fn close_session(mut self) {
        if let Some(lease) = self.pinned_lease.take() {
            lease.release().await;
        }
    }
}

enum RelayResult {
    Terminal { response_id: Option<String>, ttft_ms: Option<f64> },
    ToolOutputNotFound,
    PreviousResponseNotFound,
    ClientDisconnected,
}

fn extract_previous_response_id(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("previous_response_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn strip_previous_response_id(body: &Bytes) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    if let Some(object) = value.as_object_mut() {
        object.remove("previous_response_id");
    }
    serde_json::to_vec(&value).map(Bytes::from).unwrap_or_else(|_| body.clone())
}

fn log_normalizer_decision(reason: NormalizeReason) {
    info!(reason = reason.as_str(), "wsv2 normalizer decision");
}

/// Integration-shaped scenarios against in-process fakes: a scripted local
/// WS server stands in for the upstream, and `StateStore` runs on the
/// in-memory cache from `state_store::test_support` instead of Redis.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ConcurrencyService, StickyLookup};
    use crate::state_store::test_support::memory_state_store;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    type ServerStream = WebSocketStream<TcpStream>;

    struct NeverSticky;

    #[async_trait::async_trait]
    impl StickyLookup for NeverSticky {
        async fn account_for_response(&self, _response_id: &str) -> Option<i64> {
            None
        }
        async fn account_for_session(&self, _session_hash: u64) -> Option<i64> {
            None
        }
        async fn account_for_legacy_session_hash(&self, _legacy_hash: &str) -> Option<i64> {
            None
        }
    }

    struct AlwaysGrant;

    #[async_trait::async_trait]
    impl ConcurrencyService for AlwaysGrant {
        async fn acquire_account_slot(&self, _account_id: i64, _request_id: &str) -> bool {
            true
        }
    }

    struct SharedComponents {
        state_store: Arc<StateStore>,
        pool: Arc<ConnectionPool>,
        scheduler: Arc<AccountScheduler>,
        stats: Arc<AccountRuntimeStats>,
        breaker: Arc<CircuitBreaker>,
    }

    impl SharedComponents {
        fn deps(&self) -> ForwarderDeps {
            ForwarderDeps {
                state_store: self.state_store.clone(),
                pool: self.pool.clone(),
                scheduler: self.scheduler.clone(),
                stats: self.stats.clone(),
                breaker: self.breaker.clone(),
                backoff: BackoffConfig::default(),
            }
        }
    }

    fn shared_components() -> SharedComponents {
        SharedComponents {
            state_store: Arc::new(memory_state_store()),
            pool: Arc::new(ConnectionPool::new()),
            scheduler: Arc::new(AccountScheduler::new(
                Arc::new(NeverSticky),
                Arc::new(AccountRuntimeStats::new()),
                Arc::new(AlwaysGrant),
            )),
            stats: Arc::new(AccountRuntimeStats::new()),
            breaker: Arc::new(CircuitBreaker::with_defaults()),
        }
    }

    fn one_candidate(concurrency: usize) -> Vec<CandidateAccount> {
        vec![CandidateAccount { account_id: 1, concurrency, priority: 0 }]
    }

    fn turn(session_id: &str, body: Value) -> TurnRequest {
        TurnRequest {
            session_id: session_id.to_string(),
            group_id: None,
            model: "gpt-5".to_string(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    /// Drains client-facing events until `TurnComplete` (or the channel
    /// closes), discarding the frames themselves.
    async fn drain(rx: &mut mpsc::Receiver<ClientEvent>) {
        while let Some(event) = rx.recv().await {
            if matches!(event, ClientEvent::TurnComplete) {
                break;
            }
        }
    }

    async fn recv_json(ws: &mut ServerStream) -> Value {
        use futures_util::StreamExt;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected a text frame from the client, got {other:?}"),
            }
        }
    }

    async fn send_json(ws: &mut ServerStream, value: &Value) {
        use futures_util::SinkExt;
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    /// Spawns a local WS server accepting any number of connections, each
    /// handled independently by `handler` — the fake upstream for these
    /// tests. Returns the `ws://` endpoint to dial.
    async fn spawn_upstream<F, Fut>(handler: F) -> String
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    handler(ws).await;
                });
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn e1_sticky_hit_reuses_the_same_connection_across_turns() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_for_server = accepted.clone();
        let endpoint = spawn_upstream(move |mut ws: ServerStream| {
            let accepted = accepted_for_server.clone();
            async move {
                accepted.fetch_add(1, Ordering::SeqCst);
                let _ = recv_json(&mut ws).await;
                send_json(&mut ws, &json!({"type": "response.completed", "response": {"id": "r1"}})).await;
                let _ = recv_json(&mut ws).await;
                send_json(&mut ws, &json!({"type": "response.completed", "response": {"id": "r2"}})).await;
            }
        })
        .await;

        let components = shared_components();
        let candidates = one_candidate(1);
        let mut forwarder = Forwarder::new(components.deps(), ClientIngress::Ws, WsMode::Shared, endpoint, None);

        let (tx1, mut rx1) = mpsc::channel(16);
        let outcome1 = forwarder
            .run_turn(turn("s1", json!({"input": []})), &candidates, |_| DialHeaders::default(), tx1)
            .await
            .unwrap();
        drain(&mut rx1).await;
        assert_eq!(outcome1.response_id.as_deref(), Some("r1"));

        let (tx2, mut rx2) = mpsc::channel(16);
        let outcome2 = forwarder
            .run_turn(
                turn("s1", json!({"previous_response_id": "r1", "input": []})),
                &candidates,
                |_| DialHeaders::default(),
                tx2,
            )
            .await
            .unwrap();
        drain(&mut rx2).await;
        assert_eq!(outcome2.response_id.as_deref(), Some("r2"));

        // Both turns were served over the one connection the pool dialed —
        // no extra dial for T2's fast path.
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn e2_ctx_pool_injects_aborted_outputs_for_missing_calls_in_call_id_order() {
        let sent_bodies: Arc<tokio::sync::Mutex<Vec<Value>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sent_for_server = sent_bodies.clone();
        let endpoint = spawn_upstream(move |mut ws: ServerStream| {
            let sent = sent_for_server.clone();
            async move {
                let body = recv_json(&mut ws).await;
                sent.lock().await.push(body);
                send_json(&mut ws, &json!({"type": "response.completed", "response": {"id": "r_new"}})).await;
            }
        })
        .await;

        let components = shared_components();
        components
            .state_store
            .set_response_pending_call_ids("r0", ["c2".to_string()].into_iter().collect())
            .await;
        let candidates = one_candidate(1);
        let mut forwarder = Forwarder::new(components.deps(), ClientIngress::Ws, WsMode::CtxPool, endpoint, None);

        let body = turn(
            "s1",
            json!({
                "previous_response_id": "r0",
                "input": [{"type": "function_call", "call_id": "c1"}],
            }),
        );
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = forwarder
            .run_turn(body, &candidates, |_| DialHeaders::default(), tx)
            .await
            .unwrap();
        drain(&mut rx).await;
        assert_eq!(outcome.response_id.as_deref(), Some("r_new"));

        let sent = sent_bodies.lock().await;
        let input = sent[0].get("input").and_then(Value::as_array).unwrap();
        let mut aborted: Vec<String> = input
            .iter()
            .filter(|entry| entry.get("type").and_then(Value::as_str) == Some("function_call_output"))
            .map(|entry| entry.get("call_id").and_then(Value::as_str).unwrap().to_string())
            .collect();
        aborted.sort();
        assert_eq!(aborted, vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(sent[0].get("previous_response_id").and_then(Value::as_str), Some("r0"));
    }

    #[tokio::test]
    async fn e3_previous_response_not_found_replays_exactly_once() {
        let seen_bodies: Arc<tokio::sync::Mutex<Vec<Value>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let seen_for_server = seen_bodies.clone();
        let endpoint = spawn_upstream(move |mut ws: ServerStream| {
            let seen = seen_for_server.clone();
            async move {
                // Both the failed attempt and its single replay land on this
                // same connection, since the pool's LRU reuse hands the
                // just-released connection straight back out.
                let first = recv_json(&mut ws).await;
                seen.lock().await.push(first);
                send_json(
                    &mut ws,
                    &json!({"type": "error", "code": "previous_response_not_found", "message": "unknown response"}),
                )
                .await;
                let second = recv_json(&mut ws).await;
                seen.lock().await.push(second);
                send_json(&mut ws, &json!({"type": "response.completed", "response": {"id": "r_final"}})).await;
            }
        })
        .await;

        let components = shared_components();
        let candidates = one_candidate(1);
        // Shared mode: the recovery itself is mode-agnostic (driven by the
        // in-band error code, not the normalizer), so this isolates it from
        // ctx_pool's own N6 keep/drop decision over an unknown anchor.
        let mut forwarder = Forwarder::new(components.deps(), ClientIngress::Ws, WsMode::Shared, endpoint, None);

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = forwarder
            .run_turn(
                turn("s1", json!({"previous_response_id": "r_lost", "input": []})),
                &candidates,
                |_| DialHeaders::default(),
                tx,
            )
            .await
            .unwrap();
        drain(&mut rx).await;
        assert_eq!(outcome.response_id.as_deref(), Some("r_final"));

        let seen = seen_bodies.lock().await;
        assert_eq!(seen.len(), 2);
        assert!(seen[0].get("previous_response_id").is_some());
        assert!(seen[1].get("previous_response_id").is_none(), "replay must strip previous_response_id");
    }

    #[tokio::test]
    async fn e4_policy_close_1008_fast_falls_back_without_a_ws_retry() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_for_server = accepted.clone();
        let endpoint = spawn_upstream(move |mut ws: ServerStream| {
            let accepted = accepted_for_server.clone();
            async move {
                accepted.fetch_add(1, Ordering::SeqCst);
                let _ = recv_json(&mut ws).await;
                use futures_util::SinkExt;
                let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: 1008u16.into(),
                    reason: "blocked".into(),
                };
                let _ = ws.send(Message::Close(Some(frame))).await;
            }
        })
        .await;

        let components = shared_components();
        let candidates = one_candidate(1);
        let mut forwarder = Forwarder::new(components.deps(), ClientIngress::Http, WsMode::Shared, endpoint, None);

        let (tx, mut rx) = mpsc::channel(16);
        let err = forwarder
            .run_turn(turn("s1", json!({"input": []})), &candidates, |_| DialHeaders::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::UpstreamDialError(_)));
        assert!(rx.try_recv().is_err(), "nothing should reach the client on the fast-fallback path");
        // Exactly one dial: the non-retryable close skips straight to
        // recommending an HTTP attempt rather than retrying on WS.
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn e5_concurrency_cap_holds_the_third_request_until_a_slot_frees() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(2);
        let accepted_for_server = accepted.clone();
        let gate_for_server = gate.clone();
        let endpoint = spawn_upstream(move |mut ws: ServerStream| {
            let accepted = accepted_for_server.clone();
            let gate = gate_for_server.clone();
            let ready_tx = ready_tx.clone();
            async move {
                let idx = accepted.fetch_add(1, Ordering::SeqCst);
                let _ = recv_json(&mut ws).await;
                if idx < 2 {
                    let _ = ready_tx.send(()).await;
                    gate.notified().await;
                }
                send_json(&mut ws, &json!({"type": "response.completed", "response": {"id": format!("r{idx}")}})).await;
            }
        })
        .await;

        let components = shared_components();
        let candidates = one_candidate(2);

        let mut handles = Vec::new();
        for n in 0..3 {
            let mut forwarder =
                Forwarder::new(components.deps(), ClientIngress::Ws, WsMode::Shared, endpoint.clone(), None);
            let candidates = candidates.clone();
            handles.push(tokio::spawn(async move {
                let (tx, mut rx) = mpsc::channel(16);
                let result = forwarder
                    .run_turn(turn(&format!("s{n}"), json!({"input": []})), &candidates, |_| DialHeaders::default(), tx)
                    .await;
                drain(&mut rx).await;
                result
            }));
        }

        // Both slots are taken and their handlers are parked on the gate —
        // the third request cannot have dialed a connection yet.
        ready_rx.recv().await.unwrap();
        ready_rx.recv().await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 2, "third request must not dial before a slot frees");

        gate.notify_waiters();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 3, "third request dials only once a slot frees");
    }

    #[tokio::test]
    async fn e6_ws_client_disconnect_drains_to_completion_and_stays_healthy() {
        let endpoint = spawn_upstream(|mut ws: ServerStream| async move {
            let _ = recv_json(&mut ws).await;
            send_json(&mut ws, &json!({"type": "response.output_text.delta", "delta": "hi"})).await;
            send_json(&mut ws, &json!({"type": "response.completed", "response": {"id": "r1"}})).await;
        })
        .await;

        let components = shared_components();
        let candidates = one_candidate(1);
        let mut forwarder = Forwarder::new(components.deps(), ClientIngress::Ws, WsMode::Shared, endpoint, None);

        let (tx, rx) = mpsc::channel(16);
        drop(rx); // the client is already gone before the first upstream frame arrives

        let outcome = forwarder
            .run_turn(turn("s1", json!({"input": []})), &candidates, |_| DialHeaders::default(), tx)
            .await
            .unwrap();
        assert_eq!(outcome.response_id.as_deref(), Some("r1"));
        // Stickiness is still recorded at TURN_END even though nothing was
        // listening on the client channel, and the lease was released
        // healthy rather than torn down (reaching `Ok` here at all rules
        // out the broken-lease path, which returns `Err`).
        assert_eq!(components.state_store.get_response_account("r1").await, Some(1));
        assert_eq!(
            components.state_store.get_session_last_response_id("s1").await,
            Some("r1".to_string())
        );
    }
}
