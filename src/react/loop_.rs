//! Agent 主循环
//!
//! 每轮：thinking（流式调用引擎，宽松解析 JSON，发布草稿）→ 无工具调用则 done；
//! 否则 calling_tools（按声明顺序逐个执行工具，结果作为下一轮输入）→ 下一轮。
//! 受 max_iterations 与取消信号约束；任何终止路径都恰好 finalize 三个可观察属性一次。
//!
//! 运行中维护完整消息列表（任务、每轮原始回复、工具结果）。会话未重建时只发送新消息；
//! 配额处理重建会话后，重新发送任务与能放下的最近消息，保证模型始终看得到任务。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::AgentSection;
use crate::core::{HiveError, StreamingProperty};
use crate::llm::{CreateOptions, LanguageModel, ModelFactory, PromptInput, PromptOptions};
use crate::memory::{Message, Role};
use crate::react::partial_json::{parse_complete, parse_partial};
use crate::react::schema::{build_system_prompt, response_schema, AgentResponse, DEFAULT_SYSTEM_PROMPT};
use crate::react::state::{AgentOutcome, AgentStatus, IterationLogEntry};
use crate::session::{BoundedModel, QuotaConfig};
use crate::tools::{OutputKind, ToolExecutor, ToolOutput, ToolRegistry};

/// 循环参数
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_iterations: usize,
    pub tool_timeout: Duration,
    /// 基础 system prompt（响应格式与工具说明会追加在后面）
    pub system_prompt: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            tool_timeout: Duration::from_secs(30),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl AgentOptions {
    pub fn from_section(section: &AgentSection) -> Self {
        Self {
            max_iterations: section.max_iterations,
            tool_timeout: Duration::from_secs(section.tool_timeout_secs),
            system_prompt: section
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }
}

/// Agent：持有引擎工厂与工具注册表，每次 `run` 在独立的带配额会话上执行
pub struct AgentLoop {
    factory: Arc<dyn ModelFactory>,
    registry: Arc<ToolRegistry>,
    options: AgentOptions,
    quota: QuotaConfig,
}

impl AgentLoop {
    pub fn new(factory: Arc<dyn ModelFactory>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            factory,
            registry,
            options: AgentOptions::default(),
            quota: QuotaConfig::default(),
        }
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn system_prompt(&self) -> String {
        build_system_prompt(&self.options.system_prompt, &self.registry)
    }

    pub fn run(&self, task: impl Into<String>) -> AgentRun {
        self.run_with_signal(task, CancellationToken::new())
    }

    /// 在后台任务中执行；signal 取消后运行以 `HiveError::Aborted` 结束
    pub fn run_with_signal(&self, task: impl Into<String>, signal: CancellationToken) -> AgentRun {
        let run_id = Uuid::new_v4();
        let status = Arc::new(StreamingProperty::new(AgentStatus::Thinking));
        let history = Arc::new(StreamingProperty::new(Vec::new()));
        let current_iteration = Arc::new(StreamingProperty::new(None));

        let ctx = RunContext {
            factory: self.factory.clone(),
            executor: ToolExecutor::new(self.registry.clone(), self.options.tool_timeout),
            system_prompt: self.system_prompt(),
            max_iterations: self.options.max_iterations,
            quota: self.quota.clone(),
            signal: signal.clone(),
            status: status.clone(),
            history: history.clone(),
            current: current_iteration.clone(),
        };
        let span = tracing::info_span!("agent_run", %run_id);
        let completion = tokio::spawn(ctx.execute(task.into()).instrument(span));

        AgentRun {
            run_id,
            status,
            history,
            current_iteration,
            signal,
            completion,
        }
    }
}

/// 一次运行：三个可观察属性 + 完成结果
pub struct AgentRun {
    run_id: Uuid,
    status: Arc<StreamingProperty<AgentStatus>>,
    history: Arc<StreamingProperty<Vec<IterationLogEntry>>>,
    current_iteration: Arc<StreamingProperty<Option<IterationLogEntry>>>,
    signal: CancellationToken,
    completion: JoinHandle<Result<AgentOutcome, HiveError>>,
}

impl AgentRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> &Arc<StreamingProperty<AgentStatus>> {
        &self.status
    }

    pub fn history(&self) -> &Arc<StreamingProperty<Vec<IterationLogEntry>>> {
        &self.history
    }

    pub fn current_iteration(&self) -> &Arc<StreamingProperty<Option<IterationLogEntry>>> {
        &self.current_iteration
    }

    /// 请求取消
    pub fn abort(&self) {
        self.signal.cancel();
    }

    pub async fn wait(self) -> Result<AgentOutcome, HiveError> {
        match self.completion.await {
            Ok(result) => result,
            Err(e) => Err(HiveError::TaskFailed(e.to_string())),
        }
    }
}

struct RunContext {
    factory: Arc<dyn ModelFactory>,
    executor: ToolExecutor,
    system_prompt: String,
    max_iterations: usize,
    quota: QuotaConfig,
    signal: CancellationToken,
    status: Arc<StreamingProperty<AgentStatus>>,
    history: Arc<StreamingProperty<Vec<IterationLogEntry>>>,
    current: Arc<StreamingProperty<Option<IterationLogEntry>>>,
}

impl RunContext {
    async fn execute(self, task: String) -> Result<AgentOutcome, HiveError> {
        let result = self.drive(task).await;
        match &result {
            Ok(outcome) => {
                info!(iterations = outcome.iterations, "Agent run finished");
                self.status.finalize(Some(AgentStatus::Done));
            }
            Err(e) => {
                if e.is_abort() {
                    info!("Agent run aborted");
                } else {
                    warn!(error = %e, "Agent run failed");
                }
                self.status.finalize(Some(AgentStatus::Error));
            }
        }
        self.history.finalize(None);
        self.current.finalize(None);
        result
    }

    async fn drive(&self, task: String) -> Result<AgentOutcome, HiveError> {
        let model = BoundedModel::create(
            self.factory.clone(),
            CreateOptions::default().with_system_prompt(self.system_prompt.clone()),
            self.quota.clone(),
        )
        .await?;
        let result = self.iterate(&model, task).await;
        model.destroy().await;
        result
    }

    async fn iterate(&self, model: &BoundedModel, task: String) -> Result<AgentOutcome, HiveError> {
        let constraint = response_schema();
        // 已发送的消息（任务在首位）与本轮待发送的新消息
        let mut sent: Vec<Message> = Vec::new();
        let mut pending = vec![Message::user(task)];

        for iteration in 1..=self.max_iterations {
            if self.signal.is_cancelled() {
                return Err(HiveError::Aborted);
            }
            self.status.set(AgentStatus::Thinking);
            info!(iteration, "Iteration started");

            let options = PromptOptions::default()
                .with_signal(self.signal.clone())
                .with_response_constraint(constraint.clone());
            let input = self.next_input(model, &sent, &pending, &options).await?;
            let (response, raw) = self.think(model, iteration, input, &options).await?;
            sent.append(&mut pending);
            sent.push(Message::assistant(raw));
            let mut entry = IterationLogEntry::from_response(iteration, response);
            self.current.set(Some(entry.clone()));

            if entry.tool_calls.is_empty() {
                self.history.update(|h| h.push(entry.clone()));
                self.current.set(None);
                self.status.set(AgentStatus::Done);
                return Ok(AgentOutcome {
                    message: entry.message,
                    iterations: iteration,
                    history: self.history.get(),
                });
            }

            self.status.set(AgentStatus::CallingTools);
            for index in 0..entry.tool_calls.len() {
                let message = self.call_tool(&mut entry, index).await;
                pending.push(message);
            }
            self.history.update(|h| h.push(entry.clone()));
        }

        Err(HiveError::MaxIterations(self.max_iterations))
    }

    /// 本轮输入：会话保留着此前的对话时只发新消息；会话被重建后，
    /// 重新带上任务，再从最近往前补齐能放进配额的已发送消息
    async fn next_input(
        &self,
        model: &BoundedModel,
        sent: &[Message],
        pending: &[Message],
        options: &PromptOptions,
    ) -> Result<PromptInput, HiveError> {
        let input = PromptInput::Messages(pending.to_vec());
        if !model.reserve(&input, options).await? {
            return Ok(input);
        }
        let Some((task, earlier)) = sent.split_first() else {
            return Ok(input);
        };

        let limit = model.input_quota() as f64 * model.config().max_quota_usage;
        let mut keep = 0;
        for skip in 0..=earlier.len() {
            let candidate = resend_list(task, &earlier[skip..], pending);
            let usage = model.measure_input_usage(&candidate, options).await?;
            if ((model.input_usage() + usage) as f64) < limit {
                keep = earlier.len() - skip;
                break;
            }
        }
        info!(kept = keep, dropped = earlier.len() - keep, "Session recreated, resending task");
        Ok(resend_list(task, &earlier[earlier.len() - keep..], pending))
    }

    /// 流式读取模型输出；每段之后尝试宽松解析，四个字段齐全时发布草稿。
    /// 返回解析结果与原始文本
    async fn think(
        &self,
        model: &BoundedModel,
        iteration: usize,
        input: PromptInput,
        options: &PromptOptions,
    ) -> Result<(AgentResponse, String), HiveError> {
        let mut stream = model.prompt_streaming(input, options).await?;
        let mut raw = String::new();
        let mut draft: Option<AgentResponse> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.signal.cancelled() => return Err(HiveError::Aborted),
                item = stream.next() => item,
            };
            let Some(chunk) = next else { break };
            raw.push_str(&chunk?);
            if let Some(parsed) = parse_partial::<AgentResponse>(&raw) {
                if draft.as_ref() != Some(&parsed) {
                    self.current
                        .set(Some(IterationLogEntry::from_response(iteration, parsed.clone())));
                    draft = Some(parsed);
                }
            }
        }
        debug!(iteration, chars = raw.chars().count(), "Model response received");

        let response = parse_complete::<AgentResponse>(&raw)
            .or(draft)
            .ok_or_else(|| HiveError::Parse(preview(&raw)))?;
        Ok((response, raw))
    }

    /// 执行第 index 个工具调用，更新记录并返回给模型的结果消息
    async fn call_tool(&self, entry: &mut IterationLogEntry, index: usize) -> Message {
        entry.tool_calls[index].start();
        self.current.set(Some(entry.clone()));

        let record = &mut entry.tool_calls[index];
        let name = record.tool.clone();
        let args = if record.args.is_null() {
            serde_json::json!({})
        } else {
            record.args.clone()
        };
        let message = match self.executor.execute(&name, args).await {
            Ok(output) => {
                record.succeed(describe(&output));
                let label = format!("Result of tool `{}`:", name);
                let parts = output.into_parts(&label);
                if parts.len() == 1 {
                    Message::user(parts[0].render())
                } else {
                    Message::with_parts(Role::User, parts)
                }
            }
            Err(HiveError::ToolNotFound(_)) => {
                warn!(tool = %name, "Tool not found");
                record.fail("tool not found");
                let available = self.executor.registry().tool_names().join(", ");
                Message::user(format!(
                    "Tool `{}` not found. Available tools: {}",
                    name,
                    if available.is_empty() { "(none)" } else { available.as_str() }
                ))
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool execution failed");
                record.fail(e.to_string());
                Message::user(format!("Error from tool `{}`: {}", name, e))
            }
        };
        self.current.set(Some(entry.clone()));
        message
    }
}

fn resend_list(task: &Message, earlier: &[Message], pending: &[Message]) -> PromptInput {
    let mut messages = Vec::with_capacity(1 + earlier.len() + pending.len());
    messages.push(task.clone());
    messages.extend_from_slice(earlier);
    messages.extend_from_slice(pending);
    PromptInput::Messages(messages)
}

/// 工具结果在记录中的文本形式
fn describe(output: &ToolOutput) -> String {
    match output {
        ToolOutput::Text(text) => text.clone(),
        ToolOutput::Binary { data, .. } => match output.kind() {
            OutputKind::Image(mime) | OutputKind::Audio(mime) => format!("{}, {} bytes", mime, data.len()),
            _ => format!("unrecognized binary, {} bytes", data.len()),
        },
    }
}

fn preview(raw: &str) -> String {
    const MAX: usize = 200;
    if raw.chars().count() > MAX {
        format!("{}...", raw.chars().take(MAX).collect::<String>())
    } else if raw.is_empty() {
        "(empty response)".to_string()
    } else {
        raw.to_string()
    }
}
