//! BoundedModel：带配额保护的引擎会话
//!
//! 与原始会话方法面相同（实现 LanguageModel），可直接替换。每次 prompt / append / 流式调用前：
//! 1. 单条文本输入自身超过总容量时，先切块、让引擎压缩、拼接，递归到放得下；
//! 2. 预计用量 = 当前用量 + 输入用量，比例不低于 max_quota_usage 时依次执行
//!    HistoryHandler 与 ContextHandler，重建会话后再发起调用。
//! 同一实例上的调用由 call_lock 串行化（流式调用持锁直到上游结束）。
//! 调用方的取消信号会传给归约与摘要产生的每一次引擎调用。

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::core::HiveError;
use crate::llm::{
    CreateOptions, LanguageModel, LlmError, ModelFactory, PromptInput, PromptOptions, TextStream,
};
use crate::memory::{HistoryManager, Message, TranscriptFormat};
use crate::reduce::{BoundedTask, SummaryLength, SummaryType, TaskKind, TextSplitter, CHUNK_SEPARATOR};
use crate::session::quota::{ContextHandler, HistoryHandler, QuotaConfig, QuotaOverflow};

const OVERFLOW_CHANNEL_CAPACITY: usize = 16;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 内部辅助调用只沿用取消信号，不带调用方的输出约束
fn signal_only(options: &PromptOptions) -> PromptOptions {
    PromptOptions {
        signal: options.signal.clone(),
        ..PromptOptions::default()
    }
}

pub struct BoundedModel {
    factory: Arc<dyn ModelFactory>,
    /// 创建时的选项，重建会话时沿用（初始消息除外）
    options: CreateOptions,
    config: QuotaConfig,
    session: RwLock<Arc<dyn LanguageModel>>,
    history: Arc<Mutex<HistoryManager>>,
    call_lock: Arc<AsyncMutex<()>>,
    overflow_tx: broadcast::Sender<QuotaOverflow>,
}

impl BoundedModel {
    pub async fn create(
        factory: Arc<dyn ModelFactory>,
        options: CreateOptions,
        config: QuotaConfig,
    ) -> Result<Self, HiveError> {
        let session = factory.create(options.clone()).await?;
        let history = HistoryManager::from_messages(options.initial_prompts.clone());
        let (overflow_tx, _) = broadcast::channel(OVERFLOW_CHANNEL_CAPACITY);
        Ok(Self {
            factory,
            options,
            config,
            session: RwLock::new(session),
            history: Arc::new(Mutex::new(history)),
            call_lock: Arc::new(AsyncMutex::new(())),
            overflow_tx,
        })
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// 历史副本
    pub fn history(&self) -> Vec<Message> {
        lock(&self.history).copy()
    }

    /// 订阅溢出通知
    pub fn subscribe_overflow(&self) -> broadcast::Receiver<QuotaOverflow> {
        self.overflow_tx.subscribe()
    }

    /// 预先为即将发送的输入检查配额，必要时执行溢出处理。
    ///
    /// 返回 true 表示会话已重建：此前只存在于旧会话中的对话已经不在引擎上下文里，
    /// 调用方应在下一次调用中重新带上需要保留的消息。
    pub async fn reserve(&self, input: &PromptInput, options: &PromptOptions) -> Result<bool, HiveError> {
        let _guard = self.call_lock.lock().await;
        self.ensure_quota(Some(input), options).await
    }

    fn current(&self) -> Arc<dyn LanguageModel> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 超大输入预归约 + 配额检查，返回实际发送的输入
    async fn prepare(&self, input: PromptInput, options: &PromptOptions) -> Result<PromptInput, HiveError> {
        let input = match input {
            PromptInput::Text(text) => {
                let session = self.current();
                let usage = session
                    .measure_input_usage(&PromptInput::Text(text.clone()), options)
                    .await?;
                if usage > session.input_quota() {
                    info!(usage, quota = session.input_quota(), "Single input exceeds quota, reducing");
                    PromptInput::Text(self.reduce_oversized(text, 0, &signal_only(options)).await?)
                } else {
                    PromptInput::Text(text)
                }
            }
            other => other,
        };
        self.ensure_quota(Some(&input), options).await?;
        Ok(input)
    }

    /// 预计用量超过比例时执行溢出处理；返回是否重建了会话
    async fn ensure_quota(&self, pending: Option<&PromptInput>, options: &PromptOptions) -> Result<bool, HiveError> {
        let session = self.current();
        let new_usage = match pending {
            Some(input) if !input.is_empty() => session.measure_input_usage(input, options).await?,
            _ => 0,
        };
        let quota = session.input_quota();
        let projected = session.input_usage() + new_usage;
        let ratio = if quota == 0 {
            f64::INFINITY
        } else {
            projected as f64 / quota as f64
        };
        if self.config.max_quota_usage > ratio {
            return Ok(false);
        }
        info!(projected, quota, ratio, "Quota overflow, remediating");
        let _ = self.overflow_tx.send(QuotaOverflow {
            projected,
            quota,
            ratio,
        });
        self.remediate(&signal_only(options)).await?;
        Ok(true)
    }

    async fn remediate(&self, options: &PromptOptions) -> Result<(), HiveError> {
        let snapshot = self.history();

        match &self.config.history_handler {
            HistoryHandler::Clear | HistoryHandler::Update => lock(&self.history).clear(true),
            HistoryHandler::Preserve => {}
            HistoryHandler::Custom(f) => {
                let replaced = f(snapshot.clone()).await?;
                lock(&self.history).replace(replaced);
            }
        }

        let initial = match &self.config.context_handler {
            ContextHandler::Clear => self.recreation_prompts(),
            ContextHandler::Summarize => {
                let transcript =
                    HistoryManager::from_messages(snapshot).render(TranscriptFormat::Plain, false);
                if !transcript.is_empty() {
                    let summary = self.summarize(&transcript, options).await?;
                    if matches!(self.config.history_handler, HistoryHandler::Update) {
                        lock(&self.history).add(Message::assistant(format!(
                            "Summary of the conversation so far:\n{}",
                            summary
                        )));
                    }
                }
                self.recreation_prompts()
            }
            ContextHandler::Custom(f) => f(snapshot).await?,
        };
        self.recreate(initial).await
    }

    /// 新会话的初始消息：Preserve 只带 system，其余带当前历史
    fn recreation_prompts(&self) -> Vec<Message> {
        let history = lock(&self.history);
        match self.config.history_handler {
            HistoryHandler::Preserve => {
                if history.has_system_prompt() {
                    vec![history.system_prompt()]
                } else {
                    Vec::new()
                }
            }
            _ => history.copy(),
        }
    }

    /// 一次性摘要器，调用结束即销毁
    async fn summarize(&self, transcript: &str, options: &PromptOptions) -> Result<String, HiveError> {
        let mut summarizer = BoundedTask::summarizer(self.factory.clone(), SummaryType::Tldr, SummaryLength::Long)
            .with_config(self.config.reduction.clone());
        if let Some(signal) = &options.signal {
            summarizer = summarizer.with_signal(signal.clone());
        }
        summarizer.run(transcript).await
    }

    async fn recreate(&self, initial_prompts: Vec<Message>) -> Result<(), HiveError> {
        let old = self.current();
        old.destroy().await;
        let count = initial_prompts.len();
        let fresh = self
            .factory
            .create(self.options.clone().with_initial_prompts(initial_prompts))
            .await?;
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        info!(initial_prompts = count, "Session recreated");
        Ok(())
    }

    /// 切块 → 引擎压缩 → 拼接 → 重新测量，直到不超过总容量
    fn reduce_oversized<'a>(
        &'a self,
        text: String,
        depth: usize,
        options: &'a PromptOptions,
    ) -> BoxFuture<'a, Result<String, HiveError>> {
        async move {
            if depth >= self.config.oversized_max_depth {
                return Err(HiveError::ReductionDepthExceeded {
                    max_depth: self.config.oversized_max_depth,
                });
            }
            let session = self.current();
            let quota = session.input_quota();
            let budget = self.config.reduction.budget(quota);
            let chunks = TextSplitter::new()
                .with_max_chunks(self.config.reduction.max_chunks)
                .split(
                    &text,
                    |chunk: String| {
                        let session = session.clone();
                        async move {
                            Ok(session
                                .measure_input_usage(&PromptInput::Text(chunk), &PromptOptions::default())
                                .await?)
                        }
                    },
                    budget,
                )
                .await?;

            let scratch = BoundedModel::create(
                self.factory.clone(),
                CreateOptions::default().with_system_prompt(TaskKind::Condense.instruction()),
                QuotaConfig::new(ContextHandler::Clear, HistoryHandler::Clear)
                    .with_reduction(self.config.reduction.clone()),
            )
            .await?;
            let mut condensed = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                match scratch.prompt(PromptInput::Text(chunk), options).await {
                    Ok(c) => condensed.push(c),
                    Err(e) => {
                        scratch.destroy().await;
                        return Err(e.into());
                    }
                }
            }
            scratch.destroy().await;

            let joined = condensed.join(CHUNK_SEPARATOR);
            let usage = session
                .measure_input_usage(&PromptInput::Text(joined.clone()), &PromptOptions::default())
                .await?;
            debug!(depth, usage, quota, "Oversized input reduction pass");
            if usage > quota {
                self.reduce_oversized(joined, depth + 1, options).await
            } else {
                Ok(joined)
            }
        }
        .boxed()
    }

    fn record(&self, input: &PromptInput, reply: Option<String>) -> Option<usize> {
        let mut history = lock(&self.history);
        for msg in input.to_messages() {
            history.add(msg);
        }
        reply.map(|r| {
            history.add(Message::assistant(r));
            history.len() - 1
        })
    }
}

fn to_llm(e: HiveError) -> LlmError {
    match e {
        HiveError::Llm(inner) => inner,
        HiveError::Aborted => LlmError::Aborted,
        HiveError::Measurement(m) => LlmError::Measurement(m),
        other => LlmError::Request(other.to_string()),
    }
}

#[async_trait]
impl LanguageModel for BoundedModel {
    async fn prompt(&self, input: PromptInput, options: &PromptOptions) -> Result<String, LlmError> {
        let _guard = self.call_lock.lock().await;
        let input = self.prepare(input, options).await.map_err(to_llm)?;
        let reply = self.current().prompt(input.clone(), options).await?;
        self.record(&input, Some(reply.clone()));
        Ok(reply)
    }

    async fn prompt_streaming(
        &self,
        input: PromptInput,
        options: &PromptOptions,
    ) -> Result<TextStream, LlmError> {
        let guard = self.call_lock.clone().lock_owned().await;
        let input = self.prepare(input, options).await.map_err(to_llm)?;
        let mut upstream = self.current().prompt_streaming(input.clone(), options).await?;
        let index = self.record(&input, Some(String::new())).unwrap_or_default();

        // 一路转发给调用方，一路累积进历史；调用方提前丢弃流时仍读完上游
        let (tx, rx) = mpsc::unbounded_channel::<Result<String, LlmError>>();
        let history = self.history.clone();
        let signal = options.signal.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut acc = String::new();
            loop {
                let next = match &signal {
                    Some(s) => tokio::select! {
                        _ = s.cancelled() => Some(Err(LlmError::Aborted)),
                        item = upstream.next() => item,
                    },
                    None => upstream.next().await,
                };
                let Some(item) = next else { break };
                match item {
                    Ok(chunk) => {
                        acc.push_str(&chunk);
                        lock(&history).set_text(index, acc.clone());
                        let _ = tx.send(Ok(chunk));
                    }
                    Err(e) => {
                        warn!(error = %e, "Streaming reply interrupted");
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
            debug!(chars = acc.chars().count(), "Streaming reply recorded");
        });

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn append(&self, input: PromptInput, options: &PromptOptions) -> Result<(), LlmError> {
        let _guard = self.call_lock.lock().await;
        let input = self.prepare(input, options).await.map_err(to_llm)?;
        self.current().append(input.clone(), options).await?;
        self.record(&input, None);
        Ok(())
    }

    async fn measure_input_usage(
        &self,
        input: &PromptInput,
        options: &PromptOptions,
    ) -> Result<u64, LlmError> {
        self.current().measure_input_usage(input, options).await
    }

    fn input_quota(&self) -> u64 {
        self.current().input_quota()
    }

    fn input_usage(&self) -> u64 {
        self.current().input_usage()
    }

    async fn destroy(&self) {
        self.current().destroy().await;
    }
}
