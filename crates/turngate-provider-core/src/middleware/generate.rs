use super::generate_content::{openai_chat2response, openai_response2chat};
use super::types::{
    GenerateContentRequest, GenerateContentResponse, Op, Proto, Request, Response,
    TransformContext, TransformError,
};

pub(crate) fn transform_generate_request(
    ctx: &TransformContext,
    req: GenerateContentRequest,
) -> Result<Request, TransformError> {
    if ctx.src_op != Op::GenerateContent || ctx.dst_op != Op::GenerateContent {
        return Err(TransformError::OpMismatch);
    }

    let result = match (ctx.src, ctx.dst, req) {
        (Proto::OpenAIChat, Proto::OpenAIChat, GenerateContentRequest::OpenAIChat(req)) => {
            GenerateContentRequest::OpenAIChat(req)
        }
        (Proto::OpenAIChat, Proto::OpenAIResponse, GenerateContentRequest::OpenAIChat(req)) => {
            GenerateContentRequest::OpenAIResponse(
                openai_chat2response::request::transform_request(req),
            )
        }
        (Proto::OpenAIResponse, Proto::OpenAIResponse, GenerateContentRequest::OpenAIResponse(req)) => {
            GenerateContentRequest::OpenAIResponse(req)
        }
        (Proto::OpenAIResponse, Proto::OpenAIChat, GenerateContentRequest::OpenAIResponse(req)) => {
            GenerateContentRequest::OpenAIChat(
                openai_response2chat::request::transform_request(req),
            )
        }
        _ => return Err(TransformError::ProtoMismatch),
    };

    Ok(Request::GenerateContent(result))
}

pub(crate) fn transform_generate_response(
    ctx: &TransformContext,
    resp: GenerateContentResponse,
) -> Result<Response, TransformError> {
    if ctx.src_op != Op::GenerateContent || ctx.dst_op != Op::GenerateContent {
        return Err(TransformError::OpMismatch);
    }

    let result = match (ctx.src, ctx.dst, resp) {
        (Proto::OpenAIChat, Proto::OpenAIChat, GenerateContentResponse::OpenAIChat(resp)) => {
            GenerateContentResponse::OpenAIChat(resp)
        }
        (Proto::OpenAIChat, Proto::OpenAIResponse, GenerateContentResponse::OpenAIChat(resp)) => {
            GenerateContentResponse::OpenAIResponse(
                openai_response2chat::response::transform_response(resp),
            )
        }
        (Proto::OpenAIResponse, Proto::OpenAIResponse, GenerateContentResponse::OpenAIResponse(resp)) => {
            GenerateContentResponse::OpenAIResponse(resp)
        }
        (Proto::OpenAIResponse, Proto::OpenAIChat, GenerateContentResponse::OpenAIResponse(resp)) => {
            GenerateContentResponse::OpenAIChat(
                openai_chat2response::response::transform_response(resp),
            )
        }
        _ => return Err(TransformError::ProtoMismatch),
    };

    Ok(Response::GenerateContent(result))
}
