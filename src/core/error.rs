//! 错误类型
//!
//! 切分、归约、会话配额、工具、Agent 循环共用一套错误分类；
//! 取消（Aborted）必须在 API 边界上与系统故障区分开，见 `is_abort`。

use thiserror::Error;

use crate::llm::LlmError;

/// 运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum HiveError {
    /// 用量测量失败（直接向上传播）
    #[error("Usage measurement failed: {0}")]
    Measurement(String),

    /// 在 max_chunks 以内找不到每块都不超预算的切分
    #[error("No split into at most {max_chunks} chunks fits a budget of {budget}")]
    SplitExhausted { max_chunks: usize, budget: u64 },

    /// merge 递归深度超限
    #[error("Reduction depth exceeded (max {max_depth})")]
    ReductionDepthExceeded { max_depth: usize },

    /// 工具未注册（Agent 循环内以结果消息形式回传，不中止运行）
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// 单个工具执行失败或超时（Agent 循环内隔离）
    #[error("Tool `{tool}` failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    /// 流结束时仍无法解析出合法的响应对象
    #[error("Could not parse model response: {0}")]
    Parse(String),

    /// 调用方取消
    #[error("Aborted")]
    Aborted,

    /// 达到最大迭代次数仍未结束
    #[error("Agent did not finish within {0} iterations")]
    MaxIterations(usize),

    /// 生成引擎错误
    #[error("LLM error: {0}")]
    Llm(LlmError),

    /// 后台运行任务异常退出（panic）
    #[error("Agent task failed: {0}")]
    TaskFailed(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HiveError {
    /// 是否为取消导致的错误
    pub fn is_abort(&self) -> bool {
        matches!(self, HiveError::Aborted)
    }
}

impl From<LlmError> for HiveError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Aborted => HiveError::Aborted,
            LlmError::Measurement(msg) => HiveError::Measurement(msg),
            other => HiveError::Llm(other),
        }
    }
}

impl From<config::ConfigError> for HiveError {
    fn from(e: config::ConfigError) -> Self {
        HiveError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_classified() {
        assert!(HiveError::Aborted.is_abort());
        assert!(HiveError::from(LlmError::Aborted).is_abort());
        assert!(!HiveError::MaxIterations(5).is_abort());
        assert!(!HiveError::Parse("x".into()).is_abort());
    }

    #[test]
    fn test_measurement_error_maps_through() {
        let err = HiveError::from(LlmError::Measurement("quota api down".into()));
        assert!(matches!(err, HiveError::Measurement(ref m) if m.contains("quota api down")));
    }

    #[test]
    fn test_llm_error_wraps_other_variants() {
        let err = HiveError::from(LlmError::Request("503".into()));
        assert!(matches!(err, HiveError::Llm(LlmError::Request(_))));
        assert!(err.to_string().contains("503"));
    }
}
