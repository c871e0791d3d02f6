//! Hive - 带容量保护的文本生成引擎封装与 Agent 循环
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 统一错误类型、可订阅的流式属性
//! - **llm**: 引擎契约与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息、历史管理、用量估算
//! - **observability**: 日志初始化
//! - **react**: Agent 主循环（流式 JSON 解析、顺序工具调用、取消）
//! - **reduce**: 文本切分与大内容归约策略（join / merge / summarize）
//! - **session**: 带配额保护的会话（溢出时处理历史并重建会话）
//! - **tools**: 工具注册表与执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod reduce;
pub mod session;
pub mod tools;

pub use crate::core::{HiveError, StreamingProperty};
pub use react::{AgentLoop, AgentOutcome, AgentRun, AgentStatus};
pub use session::BoundedModel;
