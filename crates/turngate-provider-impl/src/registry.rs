use std::sync::Arc;

use turngate_provider_core::ProviderRegistry;

use crate::providers::codex::CodexProvider;
use crate::providers::openai::OpenAIProvider;

pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(OpenAIProvider::new()));
    registry.register(Arc::new(CodexProvider::new()));
}
