//! Echo 工具（测试与离线运行用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolExample, ToolOutput};

/// Echo 工具：回显 text 参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back unchanged."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    fn examples(&self) -> Vec<ToolExample> {
        vec![ToolExample::new("repeat a greeting", json!({ "text": "hello" }))]
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        args.get("text")
            .and_then(|v| v.as_str())
            .map(ToolOutput::text)
            .ok_or_else(|| "missing string argument `text`".to_string())
    }
}
