//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / examples / execute），
//! 由 ToolRegistry 按名注册与查找，ToolExecutor 在调用时加超时并统一转 HiveError。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::tools::ToolOutput;

/// 工具用法示例，拼入 system prompt
#[derive(Debug, Clone, Serialize)]
pub struct ToolExample {
    pub description: String,
    pub args: Value,
}

impl ToolExample {
    pub fn new(description: impl Into<String>, args: Value) -> Self {
        Self {
            description: description.into(),
            args,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、示例、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应响应中 tool_calls[].tool）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn examples(&self) -> Vec<ToolExample> {
        Vec::new()
    }

    /// 执行工具；失败返回原因文本
    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名工具后注册者覆盖
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按名称排序，保证 prompt 稳定
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    fn sorted(&self) -> Vec<&Arc<dyn Tool>> {
        let mut tools: Vec<&Arc<dyn Tool>> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// system prompt 中的 Available tools 段落：名称、描述、参数 schema、示例
    pub fn render_for_prompt(&self) -> String {
        if self.tools.is_empty() {
            return "No tools are available. Answer directly.".to_string();
        }
        let mut out = String::from("Available tools:\n");
        for tool in self.sorted() {
            out.push_str(&format!("\n## {}\n{}\n", tool.name(), tool.description()));
            out.push_str(&format!("Input schema: {}\n", tool.parameters_schema()));
            for ex in tool.examples() {
                out.push_str(&format!(
                    "Example ({}): {}\n",
                    ex.description,
                    serde_json::json!({ "tool": tool.name(), "args": ex.args })
                ));
            }
        }
        out
    }
}
