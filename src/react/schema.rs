//! Agent 响应格式与 system prompt
//!
//! 模型每轮输出一个 JSON 对象：thoughts / plan / tool_calls / message，
//! schema 由 schemars 从 `AgentResponse` 生成，作为响应约束传给引擎并拼入 system prompt。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolRegistry;

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCallRequest {
    /// 工具名
    pub tool: String,
    /// 工具参数，依工具的 input schema 而定
    #[serde(default)]
    pub args: Value,
}

/// 模型每轮的结构化输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentResponse {
    /// 对当前情况的思考
    pub thoughts: String,
    /// 接下来的步骤
    pub plan: Vec<String>,
    /// 本轮要执行的工具调用，按顺序执行；为空表示任务完成
    pub tool_calls: Vec<ToolCallRequest>,
    /// 给用户的消息；tool_calls 为空时即最终答复
    pub message: String,
}

/// 响应 JSON Schema（作为 response_constraint）
pub fn response_schema() -> Value {
    serde_json::to_value(schema_for!(AgentResponse)).unwrap_or(Value::Null)
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable assistant that solves the user's task step by step. \
In every turn, think about the situation, write a short plan, and either call tools or give the final answer. \
Tools run in the order you list them and their results are sent back to you in the next turn. \
When the task is complete, return an empty tool_calls list and put the final answer in message.";

/// 完整 system prompt：基础说明 + 响应格式 + 可用工具（含 schema 与示例）
pub fn build_system_prompt(base: &str, registry: &ToolRegistry) -> String {
    let schema = serde_json::to_string_pretty(&response_schema()).unwrap_or_default();
    format!(
        "{base}\n\nAlways respond with a single JSON object matching this schema:\n{schema}\n\n{}",
        registry.render_for_prompt()
    )
}
