//! 大内容归约策略
//!
//! 输入超出单次调用容量时，BoundedTask 按策略处理：
//! - join：按 quota×threshold 切块，各块独立并发执行主操作，按原顺序以空行拼接；
//! - merge：切块后并发压缩，拼接后重新测量，仍超限则递归（限深），最后对结果执行一次主操作；
//! - summarize：先用 join 对整段输入做摘要，再对摘要执行一次主操作（write / rewrite 用）。

use std::sync::Arc;

use futures_util::future::{try_join_all, BoxFuture};
use futures_util::{stream, FutureExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ReductionSection;
use crate::core::HiveError;
use crate::llm::{ModelFactory, PromptOptions, TextStream};
use crate::reduce::splitter::{TextSplitter, DEFAULT_MAX_CHUNKS};
use crate::reduce::task::{
    PromptTask, RewriteLength, RewriteTone, SummaryLength, SummaryType, TaskKind, TextOperation,
};

/// 拼接块结果用的分隔符
pub const CHUNK_SEPARATOR: &str = "\n\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LargeContentStrategy {
    Join,
    Merge,
    Summarize,
}

/// 归约参数
#[derive(Clone, Debug)]
pub struct ReductionConfig {
    /// 切块预算 = 容量 × threshold，为模型侧开销留余量
    pub threshold: f64,
    pub max_merge_depth: usize,
    pub max_chunks: usize,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            max_merge_depth: 10,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

impl ReductionConfig {
    pub fn from_section(section: &ReductionSection) -> Self {
        Self {
            threshold: section.threshold,
            max_merge_depth: section.max_merge_depth,
            max_chunks: section.max_chunks,
        }
    }

    pub(crate) fn budget(&self, quota: u64) -> u64 {
        (quota as f64 * self.threshold).floor() as u64
    }
}

/// 带容量保护的任务：输入放得下时直接执行主操作，否则按策略归约
pub struct BoundedTask {
    primary: Arc<dyn TextOperation>,
    condenser: Option<Arc<dyn TextOperation>>,
    summarizer: Option<Arc<dyn TextOperation>>,
    strategy: LargeContentStrategy,
    config: ReductionConfig,
    /// 每次操作调用使用的选项（只带取消信号）
    options: PromptOptions,
}

impl BoundedTask {
    pub fn new(primary: Arc<dyn TextOperation>, strategy: LargeContentStrategy) -> Self {
        Self {
            primary,
            condenser: None,
            summarizer: None,
            strategy,
            config: ReductionConfig::default(),
            options: PromptOptions::default(),
        }
    }

    /// merge 策略使用的压缩操作
    pub fn with_condenser(mut self, condenser: Arc<dyn TextOperation>) -> Self {
        self.condenser = Some(condenser);
        self
    }

    /// summarize 策略使用的摘要操作
    pub fn with_summarizer(mut self, summarizer: Arc<dyn TextOperation>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_config(mut self, config: ReductionConfig) -> Self {
        self.config = config;
        self
    }

    /// 取消信号传给每个切块调用
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.options = PromptOptions::default().with_signal(signal);
        self
    }

    pub fn with_strategy(mut self, strategy: LargeContentStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> LargeContentStrategy {
        self.strategy
    }

    /// 摘要任务（默认 join，merge 时用引擎压缩）
    pub fn summarizer(factory: Arc<dyn ModelFactory>, style: SummaryType, length: SummaryLength) -> Self {
        let primary = Arc::new(PromptTask::new(factory.clone(), TaskKind::Summarize { style, length }));
        Self::new(primary, LargeContentStrategy::Join)
            .with_condenser(Arc::new(PromptTask::new(factory, TaskKind::Condense)))
    }

    /// 翻译任务（join：块间无需上下文）
    pub fn translator(factory: Arc<dyn ModelFactory>, source: &str, target: &str) -> Self {
        let primary = Arc::new(PromptTask::new(
            factory,
            TaskKind::Translate {
                source: source.to_string(),
                target: target.to_string(),
            },
        ));
        Self::new(primary, LargeContentStrategy::Join)
    }

    /// 写作任务（summarize）
    pub fn writer(factory: Arc<dyn ModelFactory>, shared_context: Option<String>) -> Self {
        let primary = Arc::new(PromptTask::new(factory.clone(), TaskKind::Write { shared_context }));
        Self::with_default_helpers(primary, factory)
    }

    /// 改写任务（summarize）
    pub fn rewriter(factory: Arc<dyn ModelFactory>, tone: RewriteTone, length: RewriteLength) -> Self {
        let primary = Arc::new(PromptTask::new(factory.clone(), TaskKind::Rewrite { tone, length }));
        Self::with_default_helpers(primary, factory)
    }

    fn with_default_helpers(primary: Arc<dyn TextOperation>, factory: Arc<dyn ModelFactory>) -> Self {
        let summarizer = Arc::new(PromptTask::new(
            factory.clone(),
            TaskKind::Summarize {
                style: SummaryType::Tldr,
                length: SummaryLength::Long,
            },
        ));
        Self::new(primary, LargeContentStrategy::Summarize)
            .with_summarizer(summarizer)
            .with_condenser(Arc::new(PromptTask::new(factory, TaskKind::Condense)))
    }

    /// 执行任务
    pub async fn run(&self, input: &str) -> Result<String, HiveError> {
        if self.fits(input).await? {
            return self.primary.execute(input, &self.options).await;
        }
        info!(strategy = ?self.strategy, "Input exceeds quota, reducing");
        match self.strategy {
            LargeContentStrategy::Join => self.join(&self.primary, input).await,
            LargeContentStrategy::Merge => {
                let reduced = self.merge_reduce(input.to_string(), 0).await?;
                self.primary.execute(&reduced, &self.options).await
            }
            LargeContentStrategy::Summarize => {
                let summary = self.summarize_first(input).await?;
                self.primary.execute(&summary, &self.options).await
            }
        }
    }

    /// 流式执行：策略与 `run` 相同；join 把已拼好的结果作为单段流输出
    pub async fn run_streaming(&self, input: &str) -> Result<TextStream, HiveError> {
        if self.fits(input).await? {
            return self.primary.execute_streaming(input, &self.options).await;
        }
        match self.strategy {
            LargeContentStrategy::Join => {
                let combined = self.join(&self.primary, input).await?;
                Ok(Box::pin(stream::once(async move { Ok(combined) })))
            }
            LargeContentStrategy::Merge => {
                let reduced = self.merge_reduce(input.to_string(), 0).await?;
                self.primary.execute_streaming(&reduced, &self.options).await
            }
            LargeContentStrategy::Summarize => {
                let summary = self.summarize_first(input).await?;
                self.primary.execute_streaming(&summary, &self.options).await
            }
        }
    }

    async fn fits(&self, input: &str) -> Result<bool, HiveError> {
        let quota = self.primary.input_quota().await?;
        let usage = self.primary.measure_input_usage(input).await?;
        debug!(usage, quota, "Measured task input");
        Ok(usage <= quota)
    }

    async fn split_for(&self, op: &Arc<dyn TextOperation>, text: &str) -> Result<Vec<String>, HiveError> {
        let budget = self.config.budget(op.input_quota().await?);
        TextSplitter::new()
            .with_max_chunks(self.config.max_chunks)
            .split(
                text,
                |chunk: String| {
                    let op = op.clone();
                    async move { op.measure_input_usage(&chunk).await }
                },
                budget,
            )
            .await
    }

    /// 各块独立并发执行，按原顺序拼接
    async fn join(&self, op: &Arc<dyn TextOperation>, input: &str) -> Result<String, HiveError> {
        let chunks = self.split_for(op, input).await?;
        debug!(chunks = chunks.len(), "Join strategy");
        let results = try_join_all(chunks.iter().map(|c| op.execute(c, &self.options))).await?;
        Ok(results.join(CHUNK_SEPARATOR))
    }

    /// 压缩直到放得下
    fn merge_reduce(&self, text: String, depth: usize) -> BoxFuture<'_, Result<String, HiveError>> {
        async move {
            if depth >= self.config.max_merge_depth {
                return Err(HiveError::ReductionDepthExceeded {
                    max_depth: self.config.max_merge_depth,
                });
            }
            let condenser = self.condenser.as_ref().ok_or_else(|| {
                HiveError::InvalidConfig("merge strategy requires a condenser".to_string())
            })?;
            let chunks = self.split_for(&self.primary, &text).await?;
            let condensed =
                try_join_all(chunks.iter().map(|c| condenser.execute(c, &self.options))).await?;
            let joined = condensed.join(CHUNK_SEPARATOR);
            debug!(depth, chunks = chunks.len(), "Merge pass");
            if self.fits(&joined).await? {
                Ok(joined)
            } else {
                self.merge_reduce(joined, depth + 1).await
            }
        }
        .boxed()
    }

    async fn summarize_first(&self, input: &str) -> Result<String, HiveError> {
        let summarizer = self.summarizer.as_ref().ok_or_else(|| {
            HiveError::InvalidConfig("summarize strategy requires a summarizer".to_string())
        })?;
        if summarizer.measure_input_usage(input).await? <= summarizer.input_quota().await? {
            return summarizer.execute(input, &self.options).await;
        }
        self.join(summarizer, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures_util::StreamExt;

    /// 用量 = 字符数；执行结果由闭包决定
    struct FakeOp {
        quota: u64,
        calls: AtomicUsize,
        inputs: Mutex<Vec<String>>,
        f: Box<dyn Fn(&str, usize) -> String + Send + Sync>,
    }

    impl FakeOp {
        fn new(quota: u64, f: impl Fn(&str, usize) -> String + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                quota,
                calls: AtomicUsize::new(0),
                inputs: Mutex::new(Vec::new()),
                f: Box::new(f),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextOperation for FakeOp {
        async fn execute(&self, input: &str, options: &PromptOptions) -> Result<String, HiveError> {
            if options.is_aborted() {
                return Err(HiveError::Aborted);
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.to_string());
            Ok((self.f)(input, n))
        }

        async fn execute_streaming(&self, input: &str, options: &PromptOptions) -> Result<TextStream, HiveError> {
            let out = self.execute(input, options).await?;
            // 按字符拆成多段，模拟逐段输出
            let chunks: Vec<_> = out.chars().map(|c| Ok(c.to_string())).collect();
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn measure_input_usage(&self, input: &str) -> Result<u64, HiveError> {
            Ok(input.chars().count() as u64)
        }

        async fn input_quota(&self) -> Result<u64, HiveError> {
            Ok(self.quota)
        }
    }

    fn three_chunk_text() -> String {
        // 210 字符，预算 75 时恰好切成 3 块
        "abcdefghi.".repeat(21)
    }

    #[tokio::test]
    async fn test_fitting_input_runs_primary_once() {
        let primary = FakeOp::new(100, |i, _| format!("S({})", i.len()));
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Join);
        assert_eq!(task.run("short").await.unwrap(), "S(5)");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_join_key_points_three_chunks() {
        let primary = FakeOp::new(100, |_, n| format!("points {}", n));
        let condenser = FakeOp::new(100, |i, _| i.to_string());
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Join)
            .with_condenser(condenser.clone());
        let out = task.run(&three_chunk_text()).await.unwrap();
        assert_eq!(primary.calls(), 3);
        assert_eq!(condenser.calls(), 0);
        let parts: Vec<&str> = out.split(CHUNK_SEPARATOR).collect();
        assert_eq!(parts.len(), 3);
        let mut sorted = parts.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["points 0", "points 1", "points 2"]);
    }

    #[tokio::test]
    async fn test_join_keeps_chunk_order() {
        let primary = FakeOp::new(80, |i, _| i.chars().count().to_string());
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Join);
        let text = format!("{}{}", "a".repeat(59) + ".", "b".repeat(29) + ".");
        let out = task.run(&text).await.unwrap();
        assert_eq!(out, "60\n\n30");
    }

    #[tokio::test]
    async fn test_merge_condenses_then_runs_primary_once() {
        let primary = FakeOp::new(100, |i, _| format!("final:{}", i.chars().count()));
        let condenser = FakeOp::new(100, |_, _| "tiny.".to_string());
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Merge)
            .with_condenser(condenser.clone());
        let out = task.run(&three_chunk_text()).await.unwrap();
        assert_eq!(condenser.calls(), 3);
        assert_eq!(primary.calls(), 1);
        // "tiny." ×3 以空行连接
        assert_eq!(out, "final:19");
    }

    #[tokio::test]
    async fn test_merge_depth_limit() {
        let primary = FakeOp::new(100, |_, _| String::new());
        // 压缩不缩短文本
        let condenser = FakeOp::new(100, |i, _| i.to_string());
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Merge)
            .with_condenser(condenser)
            .with_config(ReductionConfig {
                max_merge_depth: 3,
                ..ReductionConfig::default()
            });
        let err = task.run(&three_chunk_text()).await.unwrap_err();
        assert!(matches!(err, HiveError::ReductionDepthExceeded { max_depth: 3 }));
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_summarize_strategy_summarizes_then_runs_once() {
        let primary = FakeOp::new(100, |i, _| format!("rewritten[{}]", i));
        let summarizer = FakeOp::new(100, |_, n| format!("s{}", n));
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Summarize)
            .with_summarizer(summarizer.clone());
        let out = task.run(&three_chunk_text()).await.unwrap();
        assert_eq!(summarizer.calls(), 3);
        assert_eq!(primary.calls(), 1);
        assert!(out.starts_with("rewritten[s"));
    }

    #[tokio::test]
    async fn test_summarize_without_summarizer_is_invalid() {
        let primary = FakeOp::new(100, |_, _| String::new());
        let task = BoundedTask::new(primary, LargeContentStrategy::Summarize);
        let err = task.run(&three_chunk_text()).await.unwrap_err();
        assert!(matches!(err, HiveError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_join_streaming_is_single_chunk() {
        let primary = FakeOp::new(100, |_, n| format!("p{}", n));
        let task = BoundedTask::new(primary, LargeContentStrategy::Join);
        let chunks: Vec<String> = task
            .run_streaming(&three_chunk_text())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].split(CHUNK_SEPARATOR).count(), 3);
    }

    #[tokio::test]
    async fn test_merge_streaming_streams_primary_over_condensed_text() {
        let primary = FakeOp::new(100, |i, _| format!("final:{}", i.chars().count()));
        let condenser = FakeOp::new(100, |_, _| "tiny.".to_string());
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Merge)
            .with_condenser(condenser.clone());
        let chunks: Vec<String> = task
            .run_streaming(&three_chunk_text())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(condenser.calls(), 3);
        assert_eq!(primary.calls(), 1);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), "final:19");
    }

    #[tokio::test]
    async fn test_summarize_streaming_streams_primary_over_summary() {
        let primary = FakeOp::new(100, |i, _| format!("w[{}]", i));
        let summarizer = FakeOp::new(100, |_, n| format!("s{}", n));
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Summarize)
            .with_summarizer(summarizer.clone());
        let chunks: Vec<String> = task
            .run_streaming(&three_chunk_text())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(summarizer.calls(), 3);
        assert_eq!(primary.calls(), 1);
        let out = chunks.concat();
        assert!(out.starts_with("w[s"));
        // 摘要按块顺序拼接后作为主操作的唯一输入
        assert_eq!(primary.inputs.lock().unwrap()[0].split(CHUNK_SEPARATOR).count(), 3);
    }

    #[tokio::test]
    async fn test_signal_reaches_every_chunk_call() {
        let primary = FakeOp::new(100, |_, _| String::new());
        let signal = CancellationToken::new();
        signal.cancel();
        let task = BoundedTask::new(primary.clone(), LargeContentStrategy::Join).with_signal(signal);
        let err = task.run(&three_chunk_text()).await.unwrap_err();
        assert!(err.is_abort());
        assert_eq!(primary.calls(), 0);
    }

    #[test]
    fn test_reduction_config_from_section() {
        let section = ReductionSection {
            threshold: 0.5,
            max_merge_depth: 2,
            max_chunks: 7,
        };
        let config = ReductionConfig::from_section(&section);
        assert_eq!(config.budget(200), 100);
        assert_eq!(config.max_merge_depth, 2);
        assert_eq!(config.max_chunks, 7);
    }

    #[tokio::test]
    async fn test_prompt_task_summarizer_against_mock_engine() {
        use crate::llm::{MockFactory, MockScript};
        let factory = Arc::new(MockFactory::with_script(
            200,
            MockScript::new().with_responder(|_| Ok("point".to_string())),
        ));
        let task = BoundedTask::summarizer(factory.clone(), SummaryType::KeyPoints, SummaryLength::Short);
        let out = task.run(&"lorem ipsum dolor.".repeat(40)).await.unwrap();
        assert!(out.split(CHUNK_SEPARATOR).all(|p| p == "point"));
        assert!(out.split(CHUNK_SEPARATOR).count() >= 2);
    }
}
