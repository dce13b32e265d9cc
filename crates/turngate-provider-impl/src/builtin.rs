pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: String,
    pub enabled: bool,
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        BuiltinProviderSeed {
            name: "openai",
            config_json: serde_json::to_string(&turngate_provider_core::ProviderConfig::OpenAI(
                turngate_provider_core::OpenAIConfig::default(),
            ))
            .expect("serialize default openai config"),
            enabled: true,
        },
        BuiltinProviderSeed {
            name: "codex",
            config_json: serde_json::to_string(&turngate_provider_core::ProviderConfig::Codex(
                turngate_provider_core::CodexConfig::default(),
            ))
            .expect("serialize default codex config"),
            enabled: true,
        },
    ]
}
