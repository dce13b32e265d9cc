use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// Compatibility switch for the WSv2 session-sticky migration: consult
    /// the legacy cryptographic-hash key as a fallback when the new
    /// fast-hash key misses.
    pub session_hash_read_old_fallback: bool,
    /// Compatibility switch for the WSv2 session-sticky migration: keep
    /// writing the legacy cryptographic-hash key alongside the new one.
    pub session_hash_dual_write_old: bool,
    /// `gateway.openai_ws.enabled` (§6): master switch for the WSv2 ingress
    /// route. Off means `/v1/responses` WebSocket upgrades are refused and
    /// every request runs `http_http`.
    pub openai_ws_enabled: bool,
    /// `force_http` (§6): forces every WSv2-eligible request to `http_http`
    /// regardless of account mode, for incident mitigation.
    pub wsv2_force_http: bool,
    /// `responses_websockets_v2` (§6): the v2 forwarding subsystem's own
    /// enable flag, independent of the legacy v1 websockets gate.
    pub responses_websockets_v2: bool,
    /// Auth-type gates (§4.4 step 3): whether OAuth-authenticated /
    /// API-key-authenticated accounts are eligible for WSv2 at all.
    pub wsv2_oauth_enabled: bool,
    pub wsv2_apikey_enabled: bool,
    /// Gateway-wide default ingress mode (§4.4 step 4) used when an account
    /// has no per-account mode override: `off`, `shared`, `dedicated`, or
    /// `ctx_pool`.
    pub wsv2_ingress_mode_default: String,
    /// Shared-cache connection string for the WSv2 state store (C1).
    pub wsv2_redis_url: String,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub session_hash_read_old_fallback: Option<bool>,
    pub session_hash_dual_write_old: Option<bool>,
    pub openai_ws_enabled: Option<bool>,
    pub wsv2_force_http: Option<bool>,
    pub responses_websockets_v2: Option<bool>,
    pub wsv2_oauth_enabled: Option<bool>,
    pub wsv2_apikey_enabled: Option<bool>,
    pub wsv2_ingress_mode_default: Option<String>,
    pub wsv2_redis_url: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
        if other.session_hash_read_old_fallback.is_some() {
            self.session_hash_read_old_fallback = other.session_hash_read_old_fallback;
        }
        if other.session_hash_dual_write_old.is_some() {
            self.session_hash_dual_write_old = other.session_hash_dual_write_old;
        }
        if other.openai_ws_enabled.is_some() {
            self.openai_ws_enabled = other.openai_ws_enabled;
        }
        if other.wsv2_force_http.is_some() {
            self.wsv2_force_http = other.wsv2_force_http;
        }
        if other.responses_websockets_v2.is_some() {
            self.responses_websockets_v2 = other.responses_websockets_v2;
        }
        if other.wsv2_oauth_enabled.is_some() {
            self.wsv2_oauth_enabled = other.wsv2_oauth_enabled;
        }
        if other.wsv2_apikey_enabled.is_some() {
            self.wsv2_apikey_enabled = other.wsv2_apikey_enabled;
        }
        if other.wsv2_ingress_mode_default.is_some() {
            self.wsv2_ingress_mode_default = other.wsv2_ingress_mode_default;
        }
        if other.wsv2_redis_url.is_some() {
            self.wsv2_redis_url = other.wsv2_redis_url;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            session_hash_read_old_fallback: self.session_hash_read_old_fallback.unwrap_or(false),
            session_hash_dual_write_old: self.session_hash_dual_write_old.unwrap_or(false),
            openai_ws_enabled: self.openai_ws_enabled.unwrap_or(true),
            wsv2_force_http: self.wsv2_force_http.unwrap_or(false),
            responses_websockets_v2: self.responses_websockets_v2.unwrap_or(true),
            wsv2_oauth_enabled: self.wsv2_oauth_enabled.unwrap_or(true),
            wsv2_apikey_enabled: self.wsv2_apikey_enabled.unwrap_or(true),
            wsv2_ingress_mode_default: self
                .wsv2_ingress_mode_default
                .unwrap_or_else(|| "shared".to_string()),
            wsv2_redis_url: self
                .wsv2_redis_url
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            session_hash_read_old_fallback: Some(value.session_hash_read_old_fallback),
            session_hash_dual_write_old: Some(value.session_hash_dual_write_old),
            openai_ws_enabled: Some(value.openai_ws_enabled),
            wsv2_force_http: Some(value.wsv2_force_http),
            responses_websockets_v2: Some(value.responses_websockets_v2),
            wsv2_oauth_enabled: Some(value.wsv2_oauth_enabled),
            wsv2_apikey_enabled: Some(value.wsv2_apikey_enabled),
            wsv2_ingress_mode_default: Some(value.wsv2_ingress_mode_default),
            wsv2_redis_url: Some(value.wsv2_redis_url),
        }
    }
}
