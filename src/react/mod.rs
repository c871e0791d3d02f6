//! Agent 层：响应格式、宽松 JSON 解析、运行状态、主循环

pub mod loop_;
pub mod partial_json;
pub mod schema;
pub mod state;

pub use loop_::{AgentLoop, AgentOptions, AgentRun};
pub use partial_json::{parse_complete, parse_partial, repair};
pub use schema::{build_system_prompt, response_schema, AgentResponse, ToolCallRequest, DEFAULT_SYSTEM_PROMPT};
pub use state::{AgentOutcome, AgentStatus, IterationLogEntry, ToolCallRecord, ToolCallStatus};
