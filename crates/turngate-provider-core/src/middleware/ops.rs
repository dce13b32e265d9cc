use super::generate::{transform_generate_request, transform_generate_response};
use super::types::{
    CountTokensRequest, CountTokensResponse, ModelGetRequest, ModelGetResponse, ModelListRequest,
    ModelListResponse, Op, Request, Response, TransformContext, TransformError,
};

/// Every non-generate op carries a single wire shape (OpenAI's own), so the
/// only legal transform is an identity one; cross-protocol conversion only
/// applies to chat-completions/responses generation.
pub fn transform_request(ctx: &TransformContext, req: Request) -> Result<Request, TransformError> {
    match (ctx.src_op, req) {
        (Op::ModelList, Request::ModelList(req)) => Ok(Request::ModelList(req)),
        (Op::ModelGet, Request::ModelGet(req)) => Ok(Request::ModelGet(req)),
        (Op::CountTokens, Request::CountTokens(req)) => Ok(Request::CountTokens(req)),
        (Op::GenerateContent, Request::GenerateContent(req)) => {
            transform_generate_request(ctx, req)
        }
        (Op::ResponseGet, Request::ResponseGet(req)) => Ok(Request::ResponseGet(req)),
        (Op::ResponseDelete, Request::ResponseDelete(req)) => Ok(Request::ResponseDelete(req)),
        (Op::ResponseCancel, Request::ResponseCancel(req)) => Ok(Request::ResponseCancel(req)),
        (Op::ResponseListInputItems, Request::ResponseListInputItems(req)) => {
            Ok(Request::ResponseListInputItems(req))
        }
        (Op::ResponseCompact, Request::ResponseCompact(req)) => Ok(Request::ResponseCompact(req)),
        (Op::MemoryTraceSummarize, Request::MemoryTraceSummarize(req)) => {
            Ok(Request::MemoryTraceSummarize(req))
        }
        _ => Err(TransformError::OpMismatch),
    }
}

pub fn transform_response(
    ctx: &TransformContext,
    resp: Response,
) -> Result<Response, TransformError> {
    match (ctx.src_op, resp) {
        (Op::ModelList, Response::ModelList(resp)) => Ok(Response::ModelList(resp)),
        (Op::ModelGet, Response::ModelGet(resp)) => Ok(Response::ModelGet(resp)),
        (Op::CountTokens, Response::CountTokens(resp)) => Ok(Response::CountTokens(resp)),
        (Op::GenerateContent, Response::GenerateContent(resp)) => {
            transform_generate_response(ctx, resp)
        }
        (Op::ResponseGet, Response::ResponseGet(resp)) => Ok(Response::ResponseGet(resp)),
        (Op::ResponseDelete, Response::ResponseDelete(resp)) => Ok(Response::ResponseDelete(resp)),
        (Op::ResponseCancel, Response::ResponseCancel(resp)) => Ok(Response::ResponseCancel(resp)),
        (Op::ResponseListInputItems, Response::ResponseListInputItems(resp)) => {
            Ok(Response::ResponseListInputItems(resp))
        }
        (Op::ResponseCompact, Response::ResponseCompact(resp)) => {
            Ok(Response::ResponseCompact(resp))
        }
        (Op::MemoryTraceSummarize, Response::MemoryTraceSummarize(resp)) => {
            Ok(Response::MemoryTraceSummarize(resp))
        }
        _ => Err(TransformError::OpMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::types::Proto;
    use turngate_protocol::openai::list_models::request::ListModelsRequest;

    #[test]
    fn model_list_passes_through_identity() {
        let ctx = TransformContext {
            src: Proto::OpenAI,
            dst: Proto::OpenAI,
            src_op: Op::ModelList,
            dst_op: Op::ModelList,
        };
        let req = Request::ModelList(ModelListRequest(ListModelsRequest));
        assert!(transform_request(&ctx, req).is_ok());
    }

    #[test]
    fn op_and_payload_mismatch_is_rejected() {
        let ctx = TransformContext {
            src: Proto::OpenAI,
            dst: Proto::OpenAI,
            src_op: Op::ModelGet,
            dst_op: Op::ModelList,
        };
        let req = Request::ModelList(ModelListRequest(ListModelsRequest));
        assert!(matches!(
            transform_request(&ctx, req),
            Err(TransformError::OpMismatch)
        ));
    }
}
