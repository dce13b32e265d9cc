//! Ctx-pool-aware forwarding of OpenAI Responses traffic over pooled
//! upstream WebSockets: state/stickiness (C1), the upstream WS client
//! (C2), its connection pool (C3), the protocol resolver (C4), the
//! ctx-pool normalizer (C5), the account scheduler (C6), the turn
//! forwarder (C7), and the retry/fallback policy (C8).

pub mod error;
pub mod forwarder;
pub mod normalizer;
pub mod pool;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod state_store;
pub mod ws_client;

pub use error::{ErrorClass, WsError, WsResult};
pub use forwarder::{ClientEvent, ClientIngress, Forwarder, ForwarderDeps, TurnOutcome, TurnRequest, WsMode};
pub use pool::ConnectionPool;
pub use resolver::{resolve, AuthType, EffectiveDecision, GatewayGates, IngressMode, ProtocolPath};
pub use retry::{BackoffConfig, CircuitBreaker};
pub use scheduler::{
    AccountId, AccountRuntimeStats, AccountScheduler, AdmitAll, CandidateAccount,
    RequestFingerprint, StateStoreSticky,
};
pub use state_store::{RedisSharedCache, SharedCache, StateStore};
pub use ws_client::{DialHeaders, ProxyKind};
