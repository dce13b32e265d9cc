//! Protocol Resolver (C4): pure function of configuration and account
//! metadata producing an `EffectiveDecision`, per §4.4.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressMode {
    Off,
    Shared,
    Dedicated,
    CtxPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIngress {
    Ws,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    OAuth,
    ApiKey,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPath {
    WsWs,
    HttpHttp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveDecision {
    pub mode: IngressMode,
    pub protocol_path: ProtocolPath,
}

/// Global and per-auth-type gates plus the account-mode default, read from
/// configuration (§6's recognized options).
#[derive(Debug, Clone, Copy)]
pub struct GatewayGates {
    pub mode_router_v2_enabled: bool,
    pub openai_ws_enabled: bool,
    pub force_http: bool,
    pub responses_websockets_v2: bool,
    pub oauth_enabled: bool,
    pub apikey_enabled: bool,
    pub ingress_mode_default: IngressMode,
}

/// Per-account mode override, already resolved from either the new
/// `*_mode` key or the legacy `*_enabled` boolean (§4.4 step 4 is applied
/// by the caller before constructing this — see `resolve_account_mode`).
#[derive(Debug, Clone, Copy)]
pub struct AccountModeOverride {
    pub oauth_mode: Option<IngressMode>,
    pub apikey_mode: Option<IngressMode>,
}

/// §4.4 step 4: new key `*_mode` preferred; legacy boolean `*_enabled`
/// maps `true -> shared`, `false -> off`; else the gateway default.
pub fn resolve_account_mode(
    mode_override: Option<IngressMode>,
    legacy_enabled: Option<bool>,
    default: IngressMode,
) -> IngressMode {
    if let Some(mode) = mode_override {
        return mode;
    }
    match legacy_enabled {
        Some(true) => IngressMode::Shared,
        Some(false) => IngressMode::Off,
        None => default,
    }
}

/// §4.4: resolve the full decision for one request. Assumes configuration
/// was already validated at load time (rejected gate combinations, e.g.
/// `responses_websockets=true` with `responses_websockets_v2=false`, can't
/// reach this function).
pub fn resolve(
    gates: GatewayGates,
    overrides: AccountModeOverride,
    auth_type: AuthType,
    client_ingress: ClientIngress,
) -> EffectiveDecision {
    if !gates.mode_router_v2_enabled
        || !gates.openai_ws_enabled
        || gates.force_http
        || !gates.responses_websockets_v2
    {
        return EffectiveDecision {
            mode: IngressMode::Off,
            protocol_path: ProtocolPath::HttpHttp,
        };
    }

    let (auth_gate_open, account_mode) = match auth_type {
        AuthType::OAuth => (gates.oauth_enabled, overrides.oauth_mode),
        AuthType::ApiKey => (gates.apikey_enabled, overrides.apikey_mode),
        AuthType::Other => (false, None),
    };

    if matches!(auth_type, AuthType::Other) {
        return EffectiveDecision {
            mode: IngressMode::Off,
            protocol_path: ProtocolPath::HttpHttp,
        };
    }

    if !auth_gate_open {
        return EffectiveDecision {
            mode: IngressMode::Off,
            protocol_path: ProtocolPath::HttpHttp,
        };
    }

    let mode = account_mode.unwrap_or(gates.ingress_mode_default);

    let protocol_path = match (client_ingress, mode) {
        (ClientIngress::Ws, IngressMode::Off) => ProtocolPath::HttpHttp,
        (ClientIngress::Ws, _) => ProtocolPath::WsWs,
        (ClientIngress::Http, _) => ProtocolPath::HttpHttp,
    };

    EffectiveDecision { mode, protocol_path }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_gates() -> GatewayGates {
        GatewayGates {
            mode_router_v2_enabled: true,
            openai_ws_enabled: true,
            force_http: false,
            responses_websockets_v2: true,
            oauth_enabled: true,
            apikey_enabled: true,
            ingress_mode_default: IngressMode::Shared,
        }
    }

    #[test]
    fn v2_disabled_forces_http_http() {
        let mut gates = open_gates();
        gates.mode_router_v2_enabled = false;
        let decision = resolve(
            gates,
            AccountModeOverride { oauth_mode: None, apikey_mode: None },
            AuthType::OAuth,
            ClientIngress::Ws,
        );
        assert_eq!(decision.protocol_path, ProtocolPath::HttpHttp);
        assert_eq!(decision.mode, IngressMode::Off);
    }

    #[test]
    fn force_http_overrides_ws_ingress() {
        let mut gates = open_gates();
        gates.force_http = true;
        let decision = resolve(
            gates,
            AccountModeOverride { oauth_mode: Some(IngressMode::Shared), apikey_mode: None },
            AuthType::OAuth,
            ClientIngress::Ws,
        );
        assert_eq!(decision.protocol_path, ProtocolPath::HttpHttp);
    }

    #[test]
    fn ws_ingress_with_non_off_mode_is_ws_ws() {
        let decision = resolve(
            open_gates(),
            AccountModeOverride { oauth_mode: Some(IngressMode::CtxPool), apikey_mode: None },
            AuthType::OAuth,
            ClientIngress::Ws,
        );
        assert_eq!(decision.protocol_path, ProtocolPath::WsWs);
        assert_eq!(decision.mode, IngressMode::CtxPool);
    }

    #[test]
    fn http_ingress_always_http_http_even_when_mode_is_ws_capable() {
        let decision = resolve(
            open_gates(),
            AccountModeOverride { oauth_mode: Some(IngressMode::Dedicated), apikey_mode: None },
            AuthType::OAuth,
            ClientIngress::Http,
        );
        assert_eq!(decision.protocol_path, ProtocolPath::HttpHttp);
    }

    #[test]
    fn non_oauth_apikey_auth_type_forces_http_http() {
        let decision = resolve(
            open_gates(),
            AccountModeOverride { oauth_mode: Some(IngressMode::Shared), apikey_mode: Some(IngressMode::Shared) },
            AuthType::Other,
            ClientIngress::Ws,
        );
        assert_eq!(decision.protocol_path, ProtocolPath::HttpHttp);
    }

    #[test]
    fn closed_auth_gate_forces_off() {
        let mut gates = open_gates();
        gates.oauth_enabled = false;
        let decision = resolve(
            gates,
            AccountModeOverride { oauth_mode: Some(IngressMode::Shared), apikey_mode: None },
            AuthType::OAuth,
            ClientIngress::Ws,
        );
        assert_eq!(decision.mode, IngressMode::Off);
        assert_eq!(decision.protocol_path, ProtocolPath::HttpHttp);
    }

    #[test]
    fn legacy_boolean_maps_true_to_shared_false_to_off() {
        assert_eq!(
            resolve_account_mode(None, Some(true), IngressMode::Off),
            IngressMode::Shared
        );
        assert_eq!(
            resolve_account_mode(None, Some(false), IngressMode::Shared),
            IngressMode::Off
        );
        assert_eq!(
            resolve_account_mode(None, None, IngressMode::Dedicated),
            IngressMode::Dedicated
        );
        assert_eq!(
            resolve_account_mode(Some(IngressMode::CtxPool), Some(false), IngressMode::Off),
            IngressMode::CtxPool
        );
    }
}
