//! 文本任务
//!
//! `TextOperation` 是归约策略操作的对象：执行、流式执行、测量用量、查询容量。
//! `PromptTask` 用引擎实现 summarize / translate / write / rewrite / condense：
//! 每次调用在一次性会话上完成，结束后销毁会话（流式调用在上游结束或调用方丢弃流后销毁）。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OnceCell};
use tracing::debug;

use crate::core::HiveError;
use crate::llm::{CreateOptions, LanguageModel, ModelFactory, PromptInput, PromptOptions, TextStream};

/// 归约策略作用的文本操作
#[async_trait]
pub trait TextOperation: Send + Sync {
    /// options 携带取消信号，传给每次引擎调用
    async fn execute(&self, input: &str, options: &PromptOptions) -> Result<String, HiveError>;

    async fn execute_streaming(&self, input: &str, options: &PromptOptions) -> Result<TextStream, HiveError>;

    async fn measure_input_usage(&self, input: &str) -> Result<u64, HiveError>;

    /// 单次调用可用的输入容量
    async fn input_quota(&self) -> Result<u64, HiveError>;
}

/// 摘要类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryType {
    #[default]
    KeyPoints,
    Tldr,
    Teaser,
    Headline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryLength {
    Short,
    #[default]
    Medium,
    Long,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RewriteTone {
    #[default]
    AsIs,
    MoreFormal,
    MoreCasual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RewriteLength {
    #[default]
    AsIs,
    Shorter,
    Longer,
}

/// 任务种类
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Summarize { style: SummaryType, length: SummaryLength },
    Translate { source: String, target: String },
    Write { shared_context: Option<String> },
    Rewrite { tone: RewriteTone, length: RewriteLength },
    /// merge 策略用的压缩
    Condense,
}

impl TaskKind {
    /// 会话 system 指令
    pub fn instruction(&self) -> String {
        match self {
            TaskKind::Summarize { style, length } => {
                let shape = match style {
                    SummaryType::KeyPoints => "a bulleted list of the key points",
                    SummaryType::Tldr => "a short tl;dr overview",
                    SummaryType::Teaser => "an intriguing teaser that makes the reader want more",
                    SummaryType::Headline => "a single headline",
                };
                let size = match length {
                    SummaryLength::Short => "short",
                    SummaryLength::Medium => "medium-length",
                    SummaryLength::Long => "long",
                };
                format!("Summarize the user's text as {shape}. Keep it {size}. Output only the summary.")
            }
            TaskKind::Translate { source, target } => format!(
                "Translate the user's text from {source} to {target}. Output only the translation."
            ),
            TaskKind::Write { shared_context } => {
                let mut s = "Write the text the user asks for. Output only the text.".to_string();
                if let Some(ctx) = shared_context {
                    s.push_str("\n\nContext:\n");
                    s.push_str(ctx);
                }
                s
            }
            TaskKind::Rewrite { tone, length } => {
                let tone = match tone {
                    RewriteTone::AsIs => "keep the original tone",
                    RewriteTone::MoreFormal => "make it more formal",
                    RewriteTone::MoreCasual => "make it more casual",
                };
                let length = match length {
                    RewriteLength::AsIs => "keep roughly the same length",
                    RewriteLength::Shorter => "make it shorter",
                    RewriteLength::Longer => "make it longer",
                };
                format!("Rewrite the user's text: {tone}, {length}. Output only the rewritten text.")
            }
            TaskKind::Condense => "Condense the user's text to the essential information, \
                preserving facts, names and numbers. Output only the condensed text."
                .to_string(),
        }
    }
}

/// 基于引擎的任务
pub struct PromptTask {
    factory: Arc<dyn ModelFactory>,
    kind: TaskKind,
    options: CreateOptions,
    /// 只用于测量与查询容量的会话
    meter: OnceCell<Arc<dyn LanguageModel>>,
}

impl PromptTask {
    pub fn new(factory: Arc<dyn ModelFactory>, kind: TaskKind) -> Self {
        let options = CreateOptions::default().with_system_prompt(kind.instruction());
        Self {
            factory,
            kind,
            options,
            meter: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    async fn session(&self) -> Result<Arc<dyn LanguageModel>, HiveError> {
        Ok(self.factory.create(self.options.clone()).await?)
    }

    async fn meter(&self) -> Result<&Arc<dyn LanguageModel>, HiveError> {
        self.meter.get_or_try_init(|| self.session()).await
    }
}

#[async_trait]
impl TextOperation for PromptTask {
    async fn execute(&self, input: &str, options: &PromptOptions) -> Result<String, HiveError> {
        let session = self.session().await?;
        let result = session.prompt(PromptInput::Text(input.to_string()), options).await;
        session.destroy().await;
        Ok(result?)
    }

    async fn execute_streaming(&self, input: &str, options: &PromptOptions) -> Result<TextStream, HiveError> {
        let session = self.session().await?;
        let mut upstream = match session
            .prompt_streaming(PromptInput::Text(input.to_string()), options)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                session.destroy().await;
                return Err(e.into());
            }
        };

        // 会话归转发任务所有：上游结束或调用方丢弃流时销毁
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = upstream.next().await {
                if tx.send(item).is_err() {
                    debug!("Task stream dropped by caller");
                    break;
                }
            }
            session.destroy().await;
        });
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn measure_input_usage(&self, input: &str) -> Result<u64, HiveError> {
        let meter = self.meter().await?;
        Ok(meter
            .measure_input_usage(&PromptInput::Text(input.to_string()), &PromptOptions::default())
            .await?)
    }

    async fn input_quota(&self) -> Result<u64, HiveError> {
        let meter = self.meter().await?;
        Ok(meter.input_quota().saturating_sub(meter.input_usage()))
    }
}

impl Drop for PromptTask {
    fn drop(&mut self) {
        if let Some(meter) = self.meter.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { meter.destroy().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockFactory, MockScript};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_instructions_mention_task_shape() {
        let k = TaskKind::Summarize {
            style: SummaryType::KeyPoints,
            length: SummaryLength::Short,
        };
        assert!(k.instruction().contains("key points"));
        let t = TaskKind::Translate {
            source: "en".into(),
            target: "de".into(),
        };
        assert!(t.instruction().contains("from en to de"));
    }

    #[tokio::test]
    async fn test_execute_uses_and_destroys_scratch_session() {
        let factory = Arc::new(MockFactory::with_script(
            1000,
            MockScript::new().with_responses(["condensed"]),
        ));
        let task = PromptTask::new(factory.clone(), TaskKind::Condense);
        assert_eq!(
            task.execute("long text", &PromptOptions::default()).await.unwrap(),
            "condensed"
        );
        let sessions = factory.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_destroyed());
        assert!(sessions[0].initial_prompts()[0].is_system());
    }

    #[tokio::test]
    async fn test_quota_excludes_instruction() {
        let factory = Arc::new(MockFactory::new(1000));
        let task = PromptTask::new(factory, TaskKind::Condense);
        let instruction_len = TaskKind::Condense.instruction().chars().count() as u64;
        assert_eq!(task.input_quota().await.unwrap(), 1000 - instruction_len);
        assert_eq!(task.measure_input_usage("abcd").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_streaming_session_destroyed_after_early_drop() {
        let script = MockScript::new()
            .with_responses(["abcdefgh"])
            .with_chunk_chars(2)
            .with_chunk_delay(Duration::from_millis(10));
        let factory = Arc::new(MockFactory::with_script(1000, script));
        let task = PromptTask::new(factory.clone(), TaskKind::Condense);
        let mut stream = task
            .execute_streaming("text", &PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "ab");
        drop(stream);

        let session = factory.sessions()[0].clone();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !session.is_destroyed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_streaming_forwards_every_chunk() {
        let script = MockScript::new().with_responses(["abcdefgh"]).with_chunk_chars(3);
        let factory = Arc::new(MockFactory::with_script(1000, script));
        let task = PromptTask::new(factory.clone(), TaskKind::Condense);
        let chunks: Vec<String> = task
            .execute_streaming("text", &PromptOptions::default())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["abc", "def", "gh"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(factory.sessions()[0].is_destroyed());
    }

    #[tokio::test]
    async fn test_cancelled_signal_reaches_engine_call() {
        let factory = Arc::new(MockFactory::with_script(
            1000,
            MockScript::new().with_responses(["never"]),
        ));
        let task = PromptTask::new(factory.clone(), TaskKind::Condense);
        let signal = CancellationToken::new();
        signal.cancel();
        let err = task
            .execute("text", &PromptOptions::default().with_signal(signal))
            .await
            .unwrap_err();
        assert!(err.is_abort());
        assert!(factory.script().prompts().is_empty());
        assert!(factory.sessions()[0].is_destroyed());
    }

    #[test]
    fn test_summary_type_serde() {
        let t: SummaryType = serde_json::from_str("\"key-points\"").unwrap();
        assert_eq!(t, SummaryType::KeyPoints);
    }
}
