//! LLM 层：引擎契约与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::{MockFactory, MockModel, MockScript};
pub use openai::{OpenAiFactory, OpenAiModel};
pub use traits::{
    CreateOptions, LanguageModel, LlmError, ModelFactory, PromptInput, PromptOptions, TextStream,
};

use crate::config::AppConfig;

/// 按配置选择引擎：provider 为 openai 且设置了 OPENAI_API_KEY 时用 OpenAI 兼容端点，否则用 Mock
pub fn create_factory_from_config(cfg: &AppConfig) -> Arc<dyn ModelFactory> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI-compatible engine ({})", cfg.llm.model);
            Arc::new(OpenAiFactory::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
                cfg.llm.input_quota,
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider is mock, using Mock engine");
            Arc::new(MockFactory::new(cfg.llm.input_quota))
        }
    }
}
