//! Mock 引擎（用于测试与离线运行，无需 API）
//!
//! 用量 = 字符数：会话用量为初始消息、所有输入与回复的字符总和，measure 返回输入字符数。
//! 回复来源依次为：脚本队列、自定义 responder、默认回显。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{
    CreateOptions, LanguageModel, LlmError, ModelFactory, PromptInput, PromptOptions, TextStream,
};
use crate::memory::Message;

/// 根据输入文本生成回复
pub type Responder = Arc<dyn Fn(&str) -> Result<String, LlmError> + Send + Sync>;

/// 多个会话共享的回复脚本与调用记录
#[derive(Default)]
pub struct MockScript {
    responses: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    /// 流式输出时每段字符数（0 表示整段输出）
    chunk_chars: usize,
    /// 流式输出时每段之前的等待，让其他任务有机会观察中间状态
    chunk_delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.responses).extend(responses.into_iter().map(Into::into));
        self
    }

    pub fn with_responder(
        mut self,
        f: impl Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn with_chunk_chars(mut self, n: usize) -> Self {
        self.chunk_chars = n;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// 所有会话收到的 prompt 输入（按时间顺序）
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    fn respond(&self, input: &str, constrained: bool) -> Result<String, LlmError> {
        lock(&self.prompts).push(input.to_string());
        if let Some(next) = lock(&self.responses).pop_front() {
            return Ok(next);
        }
        if let Some(f) = &self.responder {
            return f(input);
        }
        let echo = format!("Echo from Mock: {}", last_line(input));
        if constrained {
            Ok(serde_json::json!({
                "thoughts": "Nothing to do but echo.",
                "plan": [],
                "tool_calls": [],
                "message": echo,
            })
            .to_string())
        } else {
            Ok(echo)
        }
    }
}

fn last_line(input: &str) -> &str {
    input.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("(no input)")
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn char_len(input: &PromptInput) -> u64 {
    match input {
        PromptInput::Text(t) => t.chars().count() as u64,
        PromptInput::Messages(m) => m.iter().map(|m| m.text().chars().count() as u64).sum(),
    }
}

/// Mock 会话
pub struct MockModel {
    quota: u64,
    usage: AtomicU64,
    destroyed: AtomicBool,
    script: Arc<MockScript>,
    initial_prompts: Vec<Message>,
}

impl MockModel {
    pub fn new(quota: u64) -> Self {
        Self::with_script(quota, Arc::new(MockScript::new()), Vec::new())
    }

    pub fn with_script(quota: u64, script: Arc<MockScript>, initial_prompts: Vec<Message>) -> Self {
        let usage = initial_prompts
            .iter()
            .map(|m| m.text().chars().count() as u64)
            .sum();
        Self {
            quota,
            usage: AtomicU64::new(usage),
            destroyed: AtomicBool::new(false),
            script,
            initial_prompts,
        }
    }

    pub fn initial_prompts(&self) -> &[Message] {
        &self.initial_prompts
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn check(&self, options: &PromptOptions) -> Result<(), LlmError> {
        if self.is_destroyed() {
            return Err(LlmError::Destroyed);
        }
        if options.is_aborted() {
            return Err(LlmError::Aborted);
        }
        Ok(())
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn prompt(&self, input: PromptInput, options: &PromptOptions) -> Result<String, LlmError> {
        self.check(options)?;
        let reply = self
            .script
            .respond(&input.text(), options.response_constraint.is_some())?;
        self.usage.fetch_add(
            char_len(&input) + reply.chars().count() as u64,
            Ordering::SeqCst,
        );
        Ok(reply)
    }

    async fn prompt_streaming(
        &self,
        input: PromptInput,
        options: &PromptOptions,
    ) -> Result<TextStream, LlmError> {
        let reply = self.prompt(input, options).await?;
        let chunks: Vec<Result<String, LlmError>> = if self.script.chunk_chars == 0 {
            vec![Ok(reply)]
        } else {
            reply
                .chars()
                .collect::<Vec<_>>()
                .chunks(self.script.chunk_chars)
                .map(|c| Ok(c.iter().collect()))
                .collect()
        };
        match self.script.chunk_delay {
            Some(delay) => Ok(Box::pin(stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                chunk
            }))),
            None => Ok(Box::pin(stream::iter(chunks))),
        }
    }

    async fn append(&self, input: PromptInput, options: &PromptOptions) -> Result<(), LlmError> {
        self.check(options)?;
        self.usage.fetch_add(char_len(&input), Ordering::SeqCst);
        Ok(())
    }

    async fn measure_input_usage(
        &self,
        input: &PromptInput,
        _options: &PromptOptions,
    ) -> Result<u64, LlmError> {
        if self.is_destroyed() {
            return Err(LlmError::Destroyed);
        }
        Ok(char_len(input))
    }

    fn input_quota(&self) -> u64 {
        self.quota
    }

    fn input_usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Mock 工厂：所有会话共享同一脚本，并记录每次创建的初始消息
pub struct MockFactory {
    quota: u64,
    script: Arc<MockScript>,
    created: Mutex<Vec<Arc<MockModel>>>,
    creates: AtomicUsize,
}

impl MockFactory {
    pub fn new(quota: u64) -> Self {
        Self::with_script(quota, MockScript::new())
    }

    pub fn with_script(quota: u64, script: MockScript) -> Self {
        Self {
            quota,
            script: Arc::new(script),
            created: Mutex::new(Vec::new()),
            creates: AtomicUsize::new(0),
        }
    }

    pub fn script(&self) -> &Arc<MockScript> {
        &self.script
    }

    /// 创建过的会话数
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// 创建过的全部会话（按时间顺序）
    pub fn sessions(&self) -> Vec<Arc<MockModel>> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl ModelFactory for MockFactory {
    async fn create(&self, options: CreateOptions) -> Result<Arc<dyn LanguageModel>, LlmError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let model = Arc::new(MockModel::with_script(
            self.quota,
            self.script.clone(),
            options.initial_prompts,
        ));
        lock(&self.created).push(model.clone());
        Ok(model)
    }
}
