//! 工具执行器
//!
//! 持有共享的 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用工具，
//! 未注册、失败或超时时转为 HiveError（ToolNotFound / ToolExecution）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::HiveError;
use crate::tools::{ToolOutput, ToolRegistry};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行指定工具并输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> Result<ToolOutput, HiveError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| HiveError::ToolNotFound(tool_name.to_string()))?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, tool.execute(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(reason)) => Err(HiveError::ToolExecution {
                tool: tool_name.to_string(),
                reason,
            }),
            Err(_) => Err(HiveError::ToolExecution {
                tool: tool_name.to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs_f64()),
            }),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
