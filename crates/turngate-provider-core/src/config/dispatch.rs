use serde::{Deserialize, Serialize};

use crate::{Op, Proto, TransformContext};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    OpenAIChatGenerate = 0,
    OpenAIChatGenerateStream = 1,
    OpenAIResponseGenerate = 2,
    OpenAIResponseGenerateStream = 3,
    OpenAIInputTokens = 4,
    OpenAIModelsList = 5,
    OpenAIModelsGet = 6,
    // Extra internal ops (not covered by `TransformContext`)
    OAuthStart = 7,
    OAuthCallback = 8,
    Usage = 9,
    // Stored-response management, all OpenAI-only.
    OpenAIResponseGet = 10,
    OpenAIResponseDelete = 11,
    OpenAIResponseCancel = 12,
    OpenAIResponseListInputItems = 13,
    OpenAIResponseCompact = 14,
    MemoryTraceSummarize = 15,
}

impl OperationKind {
    pub const COUNT: usize = 16;

    pub fn from_context(ctx: &TransformContext) -> Option<Self> {
        match ctx.src_op {
            Op::GenerateContent => match ctx.src {
                Proto::OpenAIChat => Some(OperationKind::OpenAIChatGenerate),
                Proto::OpenAIResponse => Some(OperationKind::OpenAIResponseGenerate),
                Proto::OpenAI => None,
            },
            Op::CountTokens => match ctx.src {
                Proto::OpenAI => Some(OperationKind::OpenAIInputTokens),
                _ => None,
            },
            Op::ModelList => match ctx.src {
                Proto::OpenAI => Some(OperationKind::OpenAIModelsList),
                _ => None,
            },
            Op::ModelGet => match ctx.src {
                Proto::OpenAI => Some(OperationKind::OpenAIModelsGet),
                _ => None,
            },
            Op::ResponseGet => Some(OperationKind::OpenAIResponseGet),
            Op::ResponseDelete => Some(OperationKind::OpenAIResponseDelete),
            Op::ResponseCancel => Some(OperationKind::OpenAIResponseCancel),
            Op::ResponseListInputItems => Some(OperationKind::OpenAIResponseListInputItems),
            Op::ResponseCompact => Some(OperationKind::OpenAIResponseCompact),
            Op::MemoryTraceSummarize => Some(OperationKind::MemoryTraceSummarize),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchRule {
    /// The provider can handle this request in its current protocol/shape (no transform needed).
    Native,
    /// Transform to the target protocol first, then call the provider in that protocol.
    Transform { target: Proto },
    /// Not supported by this provider.
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DispatchTable {
    ops: [DispatchRule; OperationKind::COUNT],
}

impl DispatchTable {
    pub const fn new(ops: [DispatchRule; OperationKind::COUNT]) -> Self {
        Self { ops }
    }

    pub fn rule(&self, kind: OperationKind) -> DispatchRule {
        self.ops[kind as usize]
    }
    pub fn rule_for_context(&self, ctx: &TransformContext) -> DispatchRule {
        match OperationKind::from_context(ctx) {
            Some(kind) => self.rule(kind),
            None => DispatchRule::Unsupported,
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self {
            ops: [DispatchRule::Unsupported; OperationKind::COUNT],
        }
    }
}
