//! Core provider abstractions for turngate.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP client.
//! Provider implementations should construct `UpstreamHttpRequest` (and optional
//! internal requests like `upstream_usage`), while a higher layer performs IO.

pub mod config;
pub mod credential;
pub mod errors;
pub mod events;
pub mod headers;
pub mod middleware;
pub mod provider;
pub mod registry;

pub use config::{
    CodexConfig, DispatchRule, DispatchTable, ModelTable, OpenAIConfig, OperationKind,
    ProviderConfig,
};
pub use credential::{
    AcquireError, Credential, CredentialId, CredentialPool, CredentialState, UnavailableReason,
};
pub use errors::{ProviderError, ProviderResult};
pub use events::{
    DownstreamEvent, Event, EventHub, EventSink, ModelUnavailableEndEvent,
    ModelUnavailableStartEvent, OperationalEvent, TerminalEventSink, UnavailableEndEvent,
    UnavailableStartEvent, UpstreamEvent,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use provider::{
    AuthRetryAction, HttpMethod, OAuthCallbackRequest, OAuthCallbackResult, OAuthCredential,
    OAuthStartRequest, UpstreamBody, UpstreamCtx, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider,
};
pub use registry::ProviderRegistry;

pub use middleware::{
    CountTokensFn, CountTokensRequest, CountTokensResponse, GenerateContentRequest,
    GenerateContentResponse, MemoryTraceSummarizeRequest, MemoryTraceSummarizeResponse,
    ModelGetRequest, ModelGetResponse, ModelListRequest, ModelListResponse, NostreamToStream, Op,
    OutputAccumulator, Proto, Request, Response, ResponseCancelRequest, ResponseCancelResponse,
    ResponseCompactRequest, ResponseCompactResponse, ResponseDeleteRequest, ResponseDeleteResponse,
    ResponseGetRequest, ResponseGetResponse, ResponseListInputItemsRequest,
    ResponseListInputItemsResponse, StreamEvent, StreamFormat, StreamToNostream, StreamTransformer,
    TransformContext, TransformError, UsageAccumulator, UsageError, UsageSummary,
    fallback_usage_with_count_tokens, output_for_counting, stream_format, transform_request,
    transform_response, usage_from_response,
};
