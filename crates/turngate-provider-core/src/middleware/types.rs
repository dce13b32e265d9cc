use serde::{Deserialize, Serialize};

use turngate_protocol::openai::count_tokens::request::InputTokenCountRequest as OpenAICountTokensRequest;
use turngate_protocol::openai::count_tokens::response::InputTokenCountResponse as OpenAICountTokensResponse;
use turngate_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest as OpenAIChatCompletionRequest;
use turngate_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse as OpenAIChatCompletionResponse;
use turngate_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
use turngate_protocol::openai::create_response::request::CreateResponseRequest as OpenAIResponseRequest;
use turngate_protocol::openai::create_response::response::Response as OpenAIResponse;
use turngate_protocol::openai::create_response::stream::ResponseStreamEvent;
use turngate_protocol::openai::get_model::{GetModelRequest as OpenAIGetModelRequest, GetModelResponse as OpenAIGetModelResponse};
use turngate_protocol::openai::list_models::{ListModelsRequest as OpenAIListModelsRequest, ListModelsResponse as OpenAIListModelsResponse};
use turngate_protocol::openai::get_response::{GetResponseRequest, GetResponseResponse};
use turngate_protocol::openai::delete_response::{DeleteResponseRequest, DeleteResponseResponse};
use turngate_protocol::openai::cancel_response::{CancelResponseRequest, CancelResponseResponse};
use turngate_protocol::openai::list_input_items::{ListInputItemsRequest, ListInputItemsResponse};
use turngate_protocol::openai::compact_response::request::CompactResponseRequest;
use turngate_protocol::openai::compact_response::response::CompactResponseResponse;
use turngate_protocol::openai::trace_summarize::request::TraceSummarizeRequest;
use turngate_protocol::openai::trace_summarize::response::TraceSummarizeResponse;

/// Only two wire shapes ever reach this gateway: bare OpenAI REST calls
/// (models, count_tokens) and the two generation surfaces that can carry a
/// WSv2 turn (chat completions, responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Proto {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "openai_chat")]
    OpenAIChat,
    #[serde(rename = "openai_response")]
    OpenAIResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    ModelList,
    ModelGet,
    CountTokens,
    GenerateContent,
    ResponseGet,
    ResponseDelete,
    ResponseCancel,
    ResponseListInputItems,
    ResponseCompact,
    MemoryTraceSummarize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformContext {
    pub src: Proto,
    pub dst: Proto,
    pub src_op: Op,
    pub dst_op: Op,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    SseNamedEvent,
    SseDataOnly,
}

pub fn stream_format(proto: Proto) -> Option<StreamFormat> {
    match proto {
        Proto::OpenAIChat => Some(StreamFormat::SseDataOnly),
        Proto::OpenAIResponse => Some(StreamFormat::SseNamedEvent),
        Proto::OpenAI => None,
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    ModelList(ModelListRequest),
    ModelGet(ModelGetRequest),
    CountTokens(CountTokensRequest),
    GenerateContent(GenerateContentRequest),
    ResponseGet(ResponseGetRequest),
    ResponseDelete(ResponseDeleteRequest),
    ResponseCancel(ResponseCancelRequest),
    ResponseListInputItems(ResponseListInputItemsRequest),
    ResponseCompact(ResponseCompactRequest),
    MemoryTraceSummarize(MemoryTraceSummarizeRequest),
}

#[derive(Debug, Clone)]
pub enum Response {
    ModelList(ModelListResponse),
    ModelGet(ModelGetResponse),
    CountTokens(CountTokensResponse),
    GenerateContent(GenerateContentResponse),
    ResponseGet(ResponseGetResponse),
    ResponseDelete(ResponseDeleteResponse),
    ResponseCancel(ResponseCancelResponse),
    ResponseListInputItems(ResponseListInputItemsResponse),
    ResponseCompact(ResponseCompactResponse),
    MemoryTraceSummarize(MemoryTraceSummarizeResponse),
}

#[derive(Debug, Clone)]
pub struct ModelListRequest(pub OpenAIListModelsRequest);

#[derive(Debug, Clone)]
pub struct ModelListResponse(pub OpenAIListModelsResponse);

#[derive(Debug, Clone)]
pub struct ModelGetRequest(pub OpenAIGetModelRequest);

#[derive(Debug, Clone)]
pub struct ModelGetResponse(pub OpenAIGetModelResponse);

#[derive(Debug, Clone)]
pub struct CountTokensRequest(pub OpenAICountTokensRequest);

#[derive(Debug, Clone)]
pub struct CountTokensResponse(pub OpenAICountTokensResponse);

#[derive(Debug, Clone)]
pub enum GenerateContentRequest {
    OpenAIChat(OpenAIChatCompletionRequest),
    OpenAIResponse(OpenAIResponseRequest),
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum GenerateContentResponse {
    OpenAIChat(OpenAIChatCompletionResponse),
    OpenAIResponse(OpenAIResponse),
}

#[derive(Debug, Clone)]
pub struct ResponseGetRequest(pub GetResponseRequest);

#[derive(Debug, Clone)]
pub struct ResponseGetResponse(pub GetResponseResponse);

#[derive(Debug, Clone)]
pub struct ResponseDeleteRequest(pub DeleteResponseRequest);

#[derive(Debug, Clone)]
pub struct ResponseDeleteResponse(pub DeleteResponseResponse);

#[derive(Debug, Clone)]
pub struct ResponseCancelRequest(pub CancelResponseRequest);

#[derive(Debug, Clone)]
pub struct ResponseCancelResponse(pub CancelResponseResponse);

#[derive(Debug, Clone)]
pub struct ResponseListInputItemsRequest(pub ListInputItemsRequest);

#[derive(Debug, Clone)]
pub struct ResponseListInputItemsResponse(pub ListInputItemsResponse);

#[derive(Debug, Clone)]
pub struct ResponseCompactRequest(pub CompactResponseRequest);

#[derive(Debug, Clone)]
pub struct ResponseCompactResponse(pub CompactResponseResponse);

#[derive(Debug, Clone)]
pub struct MemoryTraceSummarizeRequest(pub TraceSummarizeRequest);

#[derive(Debug, Clone)]
pub struct MemoryTraceSummarizeResponse(pub TraceSummarizeResponse);

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum StreamEvent {
    OpenAIChat(CreateChatCompletionStreamResponse),
    OpenAIResponse(ResponseStreamEvent),
}

#[derive(Debug, Clone)]
pub enum TransformError {
    OpMismatch,
    ProtoMismatch,
    StreamMismatch,
    UnsupportedPair {
        src: Proto,
        dst: Proto,
        src_op: Op,
        dst_op: Op,
    },
}
