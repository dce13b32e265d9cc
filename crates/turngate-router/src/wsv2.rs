//! WSv2 ingress: the `/v1/responses` WebSocket upgrade that hands eligible
//! turns to `turngate_wsv2`'s forwarder instead of the HTTP-only path in
//! `proxy.rs`. Mirrors that module's aggregate-route convention (provider
//! id carried as a `{provider}/{model}` prefix on the body's `model`
//! field) since this route, like `openai_responses_aggregate`, has no
//! `{provider}` path segment of its own.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{info, warn};

use turngate_core::proxy_engine::{ProxyAuth, ProxyCall, ProxyEngine};
use turngate_provider_core::{Credential, Op, Proto};
use turngate_storage::snapshot::CredentialRow;
use turngate_wsv2::{
    resolve, AccountId, AccountRuntimeStats, AccountScheduler, AdmitAll, AuthType, BackoffConfig,
    CandidateAccount, CircuitBreaker, ClientEvent, ClientIngress, ConnectionPool, DialHeaders,
    Forwarder, ForwarderDeps, GatewayGates, IngressMode, ProtocolPath, ProxyKind, RedisSharedCache,
    SharedCache, StateStore, StateStoreSticky, TurnRequest, WsMode,
};

/// Everything the WS route needs beyond `ProxyEngine`: C1's shared state, C3's
/// pool, C6's scheduler, C8's breaker/backoff. Constructed once at startup
/// and shared across connections.
#[derive(Clone)]
pub struct Wsv2Runtime {
    state_store: Arc<StateStore>,
    pool: Arc<ConnectionPool>,
    scheduler: Arc<AccountScheduler>,
    stats: Arc<AccountRuntimeStats>,
    breaker: Arc<CircuitBreaker>,
    backoff: BackoffConfig,
}

impl Wsv2Runtime {
    pub fn new(redis_url: &str, legacy_session_hash_fallback: bool) -> redis::RedisResult<Self> {
        let shared: Arc<dyn SharedCache> = Arc::new(RedisSharedCache::new(redis_url)?);
        let state_store = Arc::new(StateStore::new(shared));
        let stats = Arc::new(AccountRuntimeStats::new());
        let scheduler = Arc::new(
            AccountScheduler::new(
                Arc::new(StateStoreSticky::new(state_store.clone())),
                stats.clone(),
                Arc::new(AdmitAll),
            )
            .with_legacy_session_hash_fallback(legacy_session_hash_fallback),
        );
        Ok(Self {
            state_store,
            pool: Arc::new(ConnectionPool::new()),
            scheduler,
            stats,
            breaker: Arc::new(CircuitBreaker::with_defaults()),
            backoff: BackoffConfig::default(),
        })
    }
}

#[derive(Clone)]
struct Wsv2State {
    engine: Arc<ProxyEngine>,
    runtime: Arc<Wsv2Runtime>,
}

pub fn wsv2_router(engine: Arc<ProxyEngine>, runtime: Arc<Wsv2Runtime>) -> Router {
    let state = Wsv2State { engine, runtime };
    Router::new()
        .route("/v1/responses", get(responses_ws_upgrade))
        .with_state(state)
}

async fn responses_ws_upgrade(
    State(state): State<Wsv2State>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(key) = extract_downstream_key(&headers, &query) else {
        return (StatusCode::UNAUTHORIZED, "missing_api_key").into_response();
    };
    let Some(auth) = state.engine.authenticate_user_key(&key) else {
        return (StatusCode::UNAUTHORIZED, "invalid_api_key").into_response();
    };
    ws.on_upgrade(move |socket| run_session(socket, state, auth))
}

fn extract_downstream_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        let prefix = "Bearer ";
        if s.len() > prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = s[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-api-key")
        && let Ok(s) = value.to_str()
        && !s.is_empty()
    {
        return Some(s.to_string());
    }
    query.get("key").filter(|s| !s.is_empty()).cloned()
}

fn split_provider_model(input: &str) -> Option<(String, String)> {
    let raw = input.trim().trim_start_matches('/');
    let (provider, model) = raw.split_once('/')?;
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider.to_string(), model.to_string()))
}

/// Rewrites `body`'s `model` field from `{provider}/{model}` to `{model}`,
/// returning the provider id alongside the rewritten body.
fn split_provider_and_rewrite_model(body: &[u8]) -> Option<(String, Bytes)> {
    let mut value: JsonValue = serde_json::from_slice(body).ok()?;
    let obj = value.as_object_mut()?;
    let model = obj.get("model")?.as_str()?;
    let (provider, model) = split_provider_model(model)?;
    obj.insert("model".to_string(), JsonValue::String(model));
    let rewritten = serde_json::to_vec(&value).ok()?;
    Some((provider, Bytes::from(rewritten)))
}

async fn run_session(mut socket: WebSocket, state: Wsv2State, auth: ProxyAuth) {
    loop {
        let msg = match socket.recv().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(%err, "wsv2 client socket error");
                return;
            }
            None => return,
        };
        let raw = match msg {
            Message::Text(text) => Bytes::from(text.into_bytes()),
            Message::Binary(bin) => Bytes::from(bin.to_vec()),
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let Some((provider, body)) = split_provider_and_rewrite_model(&raw) else {
            let _ = socket
                .send(Message::Text("missing_provider_prefix".into()))
                .await;
            continue;
        };

        match run_one_turn(&state, &auth, &provider, body).await {
            Ok(TurnDelivery::Ws(mut rx)) => {
                while let Some(event) = rx.recv().await {
                    match event {
                        ClientEvent::Frame(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if socket.send(Message::Text(text.into())).await.is_err() {
                                return;
                            }
                        }
                        ClientEvent::TurnComplete => break,
                        ClientEvent::Error(err) => {
                            let _ = socket
                                .send(Message::Text(format!("{{\"error\":\"{err}\"}}").into()))
                                .await;
                            break;
                        }
                    }
                }
            }
            Ok(TurnDelivery::Http(resp)) => {
                if socket.send(Message::Text(resp.into())).await.is_err() {
                    return;
                }
            }
            Err(message) => {
                let _ = socket
                    .send(Message::Text(format!("{{\"error\":\"{message}\"}}").into()))
                    .await;
            }
        }
    }
}

enum TurnDelivery {
    Ws(mpsc::Receiver<ClientEvent>),
    Http(String),
}

async fn run_one_turn(
    state: &Wsv2State,
    auth: &ProxyAuth,
    provider: &str,
    body: Bytes,
) -> Result<TurnDelivery, String> {
    let global = state.engine.global_config();
    let config_json = state.engine.provider_config_json(provider);
    let credential_rows = state.engine.credential_rows_for_provider(provider);
    if credential_rows.is_empty() {
        return Err("no_active_credentials".to_string());
    }

    let auth_type = auth_type_for_rows(&credential_rows);
    let gates = GatewayGates {
        mode_router_v2_enabled: true,
        openai_ws_enabled: global.openai_ws_enabled,
        force_http: global.wsv2_force_http,
        responses_websockets_v2: global.responses_websockets_v2,
        oauth_enabled: global.wsv2_oauth_enabled,
        apikey_enabled: global.wsv2_apikey_enabled,
        ingress_mode_default: parse_ingress_mode(&global.wsv2_ingress_mode_default)
            .unwrap_or(IngressMode::Shared),
    };
    let overrides = account_mode_override(config_json.as_ref());
    let decision = resolve(gates, overrides, auth_type, ClientIngress::Ws);

    if decision.protocol_path == ProtocolPath::HttpHttp {
        let text = run_http_fallback(&state.engine, auth, provider, &body).await?;
        return Ok(TurnDelivery::Http(text));
    }

    let candidates = candidate_accounts(&credential_rows);
    if candidates.is_empty() {
        return Err("no_schedulable_account".to_string());
    }
    let session_id = session_id_from_body(&body).unwrap_or_else(|| format!("user-{}", auth.user_id));
    let mode = match decision.mode {
        IngressMode::Dedicated => WsMode::Dedicated,
        IngressMode::CtxPool => WsMode::CtxPool,
        IngressMode::Shared | IngressMode::Off => WsMode::Shared,
    };
    let endpoint = resolve_ws_endpoint(provider, config_json.as_ref());
    let proxy = global.proxy.as_deref().map(parse_proxy);
    let credential_rows = Arc::new(credential_rows);

    let deps = ForwarderDeps {
        state_store: state.runtime.state_store.clone(),
        pool: state.runtime.pool.clone(),
        scheduler: state.runtime.scheduler.clone(),
        stats: state.runtime.stats.clone(),
        breaker: state.runtime.breaker.clone(),
        backoff: state.runtime.backoff.clone(),
    };
    let mut forwarder = Forwarder::new(deps, ClientIngress::Ws, mode, endpoint, proxy);
    let (tx, rx) = mpsc::channel(32);
    let request = TurnRequest {
        session_id,
        group_id: None,
        model: String::new(),
        body: body.clone(),
    };
    let rows_for_headers = credential_rows.clone();
    let fallback_engine = state.engine.clone();
    let fallback_auth = auth.clone();
    let fallback_provider = provider.to_string();
    let fallback_tx = tx.clone();

    // `run_turn` drains into `tx` as it goes; it must run concurrently with
    // the caller draining `rx`, not be awaited to completion here, or a long
    // turn deadlocks against the channel's bounded capacity.
    tokio::spawn(async move {
        let outcome = forwarder
            .run_turn(
                request,
                &candidates,
                move |account_id| dial_headers_for(&rows_for_headers, account_id),
                tx,
            )
            .await;
        forwarder.close_session().await;
        if let Err(err) = outcome {
            info!(%err, "wsv2 turn fell back to http");
            let text = run_http_fallback(&fallback_engine, &fallback_auth, &fallback_provider, &body)
                .await
                .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
            let _ = fallback_tx.send(ClientEvent::Frame(Bytes::from(text))).await;
        }
    });
    Ok(TurnDelivery::Ws(rx))
}

async fn run_http_fallback(
    engine: &Arc<ProxyEngine>,
    auth: &ProxyAuth,
    provider: &str,
    body: &Bytes,
) -> Result<String, String> {
    let parsed: turngate_protocol::openai::create_response::request::CreateResponseRequestBody =
        serde_json::from_slice(body).map_err(|err| format!("bad_responses_body: {err}"))?;
    let req = turngate_protocol::openai::create_response::request::CreateResponseRequest {
        body: parsed,
    };
    let call = ProxyCall::Protocol {
        trace_id: None,
        auth: auth.clone(),
        provider: provider.to_string(),
        response_model_prefix_provider: None,
        user_proto: Proto::OpenAIResponse,
        user_op: Op::GenerateContent,
        req: Box::new(turngate_provider_core::Request::GenerateContent(
            turngate_provider_core::GenerateContentRequest::OpenAIResponse(req),
        )),
    };
    let resp = engine.handle(call).await;
    let bytes = match resp.body {
        turngate_provider_core::UpstreamBody::Bytes(b) => b,
        turngate_provider_core::UpstreamBody::Stream(_) => {
            return Err("http_fallback_stream_unsupported".to_string());
        }
    };
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn auth_type_for_rows(rows: &[CredentialRow]) -> AuthType {
    for row in rows {
        if let Ok(cred) = serde_json::from_value::<Credential>(row.secret_json.clone()) {
            return match cred {
                Credential::Codex(_) => AuthType::OAuth,
                Credential::OpenAI(_) => AuthType::ApiKey,
            };
        }
    }
    AuthType::Other
}

fn account_mode_override(config_json: Option<&JsonValue>) -> turngate_wsv2::resolver::AccountModeOverride {
    let oauth_mode = config_json
        .and_then(|v| v.get("wsv2_oauth_mode"))
        .and_then(JsonValue::as_str)
        .and_then(parse_ingress_mode);
    let apikey_mode = config_json
        .and_then(|v| v.get("wsv2_apikey_mode"))
        .and_then(JsonValue::as_str)
        .and_then(parse_ingress_mode);
    turngate_wsv2::resolver::AccountModeOverride { oauth_mode, apikey_mode }
}

fn parse_ingress_mode(raw: &str) -> Option<IngressMode> {
    match raw {
        "off" => Some(IngressMode::Off),
        "shared" => Some(IngressMode::Shared),
        "dedicated" => Some(IngressMode::Dedicated),
        "ctx_pool" => Some(IngressMode::CtxPool),
        _ => None,
    }
}

fn candidate_accounts(rows: &[CredentialRow]) -> Vec<CandidateAccount> {
    rows.iter()
        .filter_map(|row| {
            let schedulable = row
                .settings_json
                .get("wsv2_schedulable")
                .and_then(JsonValue::as_bool)
                .unwrap_or(true);
            if !schedulable {
                return None;
            }
            let concurrency = row
                .settings_json
                .get("wsv2_concurrency")
                .and_then(JsonValue::as_u64)
                .unwrap_or(4) as usize;
            let priority = row
                .settings_json
                .get("wsv2_priority")
                .and_then(JsonValue::as_i64)
                .unwrap_or(0) as i32;
            Some(CandidateAccount { account_id: row.id, concurrency, priority })
        })
        .collect()
}

/// Grounded on `codex/mod.rs`'s `DEFAULT_BASE_URL`/`codex_base_url`: the
/// account's configured HTTPS base doubles as the WS endpoint's host, with
/// the scheme swapped and `/responses` appended. `wsv2_endpoint` in
/// `config_json` overrides this outright.
fn resolve_ws_endpoint(provider: &str, config_json: Option<&JsonValue>) -> String {
    if let Some(explicit) = config_json
        .and_then(|v| v.get("wsv2_endpoint"))
        .and_then(JsonValue::as_str)
    {
        return explicit.to_string();
    }
    let base_url = config_json
        .and_then(|v| v.get("base_url"))
        .and_then(JsonValue::as_str)
        .unwrap_or(if provider == "codex" {
            "https://chatgpt.com/backend-api/codex"
        } else {
            "https://api.openai.com/v1"
        });
    let wss_base = base_url
        .replacen("https://", "wss://", 1)
        .trim_end_matches('/')
        .to_string();
    format!("{wss_base}/responses")
}

fn parse_proxy(raw: &str) -> ProxyKind {
    if raw.starts_with("socks5") {
        ProxyKind::Socks5h(raw.to_string())
    } else {
        ProxyKind::Http(raw.to_string())
    }
}

fn session_id_from_body(body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    value
        .get("session_id")
        .or_else(|| value.get("conversation_id"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

/// Bearer material for one account's dial, grounded on
/// `codex/mod.rs::build_openai_responses`'s header-building style: Codex
/// credentials dial with the OAuth access token and the `originator`/
/// account-id headers that style requires, API-key credentials dial with
/// the plain key.
fn dial_headers_for(rows: &Arc<Vec<CredentialRow>>, account_id: AccountId) -> DialHeaders {
    let Some(row) = rows.iter().find(|r| r.id == account_id) else {
        return DialHeaders::default();
    };
    let Ok(cred) = serde_json::from_value::<Credential>(row.secret_json.clone()) else {
        return DialHeaders::default();
    };
    match cred {
        Credential::Codex(codex) => {
            let mut extra = HashMap::new();
            extra.insert("chatgpt-account-id".to_string(), codex.account_id);
            DialHeaders {
                bearer_token: codex.access_token,
                user_agent: "turngate-wsv2".to_string(),
                is_codex_style: true,
                auth_type_oauth: true,
                openai_beta: Vec::new(),
                extra,
            }
        }
        Credential::OpenAI(key) => DialHeaders {
            bearer_token: key.api_key,
            user_agent: "turngate-wsv2".to_string(),
            is_codex_style: false,
            auth_type_oauth: false,
            openai_beta: Vec::new(),
            extra: HashMap::new(),
        },
    }
}
