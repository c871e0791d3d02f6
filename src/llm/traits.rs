//! 生成引擎抽象
//!
//! 引擎本身（模型推理）在本 crate 之外；这里只定义消费的契约：
//! `ModelFactory::create` 建立会话，会话实现 prompt / prompt_streaming / append /
//! measure_input_usage，并暴露 input_quota（总容量）与 input_usage（已占用）。

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::Message;

/// 引擎层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("usage measurement failed: {0}")]
    Measurement(String),

    #[error("session destroyed")]
    Destroyed,

    #[error("aborted")]
    Aborted,
}

/// 流式输出：逐段文本
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 一次调用的输入：单段文本或消息列表
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptInput {
    Text(String),
    Messages(Vec<Message>),
}

impl PromptInput {
    /// 作为消息列表（纯文本视为一条 user 消息）
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            PromptInput::Text(t) => vec![Message::user(t.clone())],
            PromptInput::Messages(m) => m.clone(),
        }
    }

    /// 文本形式
    pub fn text(&self) -> String {
        match self {
            PromptInput::Text(t) => t.clone(),
            PromptInput::Messages(m) => m.iter().map(Message::text).collect::<Vec<_>>().join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PromptInput::Text(t) => t.is_empty(),
            PromptInput::Messages(m) => m.is_empty(),
        }
    }
}

impl From<&str> for PromptInput {
    fn from(t: &str) -> Self {
        PromptInput::Text(t.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(t: String) -> Self {
        PromptInput::Text(t)
    }
}

impl From<Vec<Message>> for PromptInput {
    fn from(m: Vec<Message>) -> Self {
        PromptInput::Messages(m)
    }
}

/// 单次调用选项
#[derive(Clone, Debug, Default)]
pub struct PromptOptions {
    /// 约束输出的 JSON Schema
    pub response_constraint: Option<serde_json::Value>,
    /// 取消信号
    pub signal: Option<CancellationToken>,
}

impl PromptOptions {
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_response_constraint(mut self, schema: serde_json::Value) -> Self {
        self.response_constraint = Some(schema);
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// 会话创建选项
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// 会话初始消息（system 在前）
    pub initial_prompts: Vec<Message>,
    pub temperature: Option<f32>,
}

impl CreateOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompts.retain(|m| !m.is_system());
        self.initial_prompts.insert(0, Message::system(prompt));
        self
    }

    pub fn with_initial_prompts(mut self, prompts: Vec<Message>) -> Self {
        self.initial_prompts = prompts;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// 引擎会话
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 非流式调用，输入与回复都计入会话
    async fn prompt(&self, input: PromptInput, options: &PromptOptions) -> Result<String, LlmError>;

    /// 流式调用
    async fn prompt_streaming(
        &self,
        input: PromptInput,
        options: &PromptOptions,
    ) -> Result<TextStream, LlmError>;

    /// 只追加输入、不生成
    async fn append(&self, input: PromptInput, options: &PromptOptions) -> Result<(), LlmError>;

    /// 测量输入在本会话中的用量（不改变会话）
    async fn measure_input_usage(
        &self,
        input: &PromptInput,
        options: &PromptOptions,
    ) -> Result<u64, LlmError>;

    /// 总容量
    fn input_quota(&self) -> u64;

    /// 当前已占用
    fn input_usage(&self) -> u64;

    /// 销毁会话，之后的调用返回 `LlmError::Destroyed`
    async fn destroy(&self);
}

/// 会话工厂
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn create(&self, options: CreateOptions) -> Result<Arc<dyn LanguageModel>, LlmError>;
}
