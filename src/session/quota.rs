//! 会话配额配置
//!
//! 溢出时先执行 HistoryHandler（处理本地历史），再执行 ContextHandler（重建引擎会话）。
//! 两者都是带 `Custom` 分支的枚举，自定义处理函数拿到历史的副本。

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;

use crate::config::QuotaSection;
use crate::core::HiveError;
use crate::memory::Message;
use crate::reduce::ReductionConfig;

/// 自定义处理函数：输入历史副本，输出新的消息列表
pub type MessagesFn =
    Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, Result<Vec<Message>, HiveError>> + Send + Sync>;

fn boxed_fn<F, Fut>(f: F) -> MessagesFn
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>, HiveError>> + Send + 'static,
{
    Arc::new(move |history| f(history).boxed())
}

/// 引擎会话的处理方式
#[derive(Clone)]
pub enum ContextHandler {
    /// 立即重建会话
    Clear,
    /// 摘要整段转录后重建
    Summarize,
    /// 自定义：返回新会话的初始消息
    Custom(MessagesFn),
}

impl ContextHandler {
    pub fn custom<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Message>, HiveError>> + Send + 'static,
    {
        ContextHandler::Custom(boxed_fn(f))
    }
}

impl fmt::Debug for ContextHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextHandler::Clear => f.write_str("Clear"),
            ContextHandler::Summarize => f.write_str("Summarize"),
            ContextHandler::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for ContextHandler {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clear" => Ok(ContextHandler::Clear),
            "summarize" => Ok(ContextHandler::Summarize),
            other => Err(HiveError::InvalidConfig(format!("unknown context handler `{other}`"))),
        }
    }
}

/// 本地历史的处理方式
#[derive(Clone)]
pub enum HistoryHandler {
    /// 只保留 system 消息
    Clear,
    /// 不动
    Preserve,
    /// 只保留 system 消息；配合 Summarize 时写入一条摘要
    Update,
    /// 自定义：返回新的历史
    Custom(MessagesFn),
}

impl HistoryHandler {
    pub fn custom<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Message>, HiveError>> + Send + 'static,
    {
        HistoryHandler::Custom(boxed_fn(f))
    }
}

impl fmt::Debug for HistoryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryHandler::Clear => f.write_str("Clear"),
            HistoryHandler::Preserve => f.write_str("Preserve"),
            HistoryHandler::Update => f.write_str("Update"),
            HistoryHandler::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for HistoryHandler {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clear" => Ok(HistoryHandler::Clear),
            "preserve" => Ok(HistoryHandler::Preserve),
            "update" => Ok(HistoryHandler::Update),
            other => Err(HiveError::InvalidConfig(format!("unknown history handler `{other}`"))),
        }
    }
}

/// BoundedModel 配置
#[derive(Clone, Debug)]
pub struct QuotaConfig {
    /// 预计用量 / 容量 低于此比例才直接放行
    pub max_quota_usage: f64,
    pub context_handler: ContextHandler,
    pub history_handler: HistoryHandler,
    /// 单条超大输入预归约的最大深度
    pub oversized_max_depth: usize,
    /// 超大输入预归约与溢出摘要使用的切块参数
    pub reduction: ReductionConfig,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_quota_usage: 0.75,
            context_handler: ContextHandler::Clear,
            history_handler: HistoryHandler::Clear,
            oversized_max_depth: 8,
            reduction: ReductionConfig::default(),
        }
    }
}

impl QuotaConfig {
    pub fn new(context_handler: ContextHandler, history_handler: HistoryHandler) -> Self {
        Self {
            context_handler,
            history_handler,
            ..Self::default()
        }
    }

    pub fn with_max_quota_usage(mut self, ratio: f64) -> Self {
        self.max_quota_usage = ratio;
        self
    }

    pub fn with_reduction(mut self, reduction: ReductionConfig) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn from_section(section: &QuotaSection) -> Result<Self, HiveError> {
        if !(section.max_quota_usage > 0.0 && section.max_quota_usage <= 1.0) {
            return Err(HiveError::InvalidConfig(format!(
                "max_quota_usage must be in (0, 1], got {}",
                section.max_quota_usage
            )));
        }
        Ok(Self {
            max_quota_usage: section.max_quota_usage,
            context_handler: section.context_handler.parse()?,
            history_handler: section.history_handler.parse()?,
            oversized_max_depth: section.oversized_max_depth,
            ..Self::default()
        })
    }
}

/// 溢出通知
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuotaOverflow {
    pub projected: u64,
    pub quota: u64,
    pub ratio: f64,
}
