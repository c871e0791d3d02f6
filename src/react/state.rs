//! Agent 运行状态：状态机、工具调用记录、每轮日志、运行结果

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::react::schema::AgentResponse;

/// 运行状态：thinking → calling_tools → thinking → … → done | error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Thinking,
    CallingTools,
    Error,
    Done,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Done | AgentStatus::Error)
    }
}

/// 工具调用状态：pending → running → success | error，只进不退
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl ToolCallStatus {
    fn can_move_to(self, next: ToolCallStatus) -> bool {
        use ToolCallStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Error) | (Running, Success) | (Running, Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: Value,
    pub status: ToolCallStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolCallRecord {
    pub fn pending(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: ToolCallStatus) -> bool {
        if !self.status.can_move_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn start(&mut self) -> bool {
        let moved = self.transition(ToolCallStatus::Running);
        if moved {
            self.started_at = Some(Utc::now());
        }
        moved
    }

    pub fn succeed(&mut self, result: impl Into<String>) -> bool {
        let moved = self.transition(ToolCallStatus::Success);
        if moved {
            self.result = Some(result.into());
            self.finished_at = Some(Utc::now());
        }
        moved
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let moved = self.transition(ToolCallStatus::Error);
        if moved {
            self.error = Some(error.into());
            self.finished_at = Some(Utc::now());
        }
        moved
    }
}

/// 单轮日志
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationLogEntry {
    pub iteration: usize,
    pub thoughts: String,
    pub plan: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub message: String,
}

impl IterationLogEntry {
    /// 由模型输出构造，所有工具调用初始为 pending
    pub fn from_response(iteration: usize, response: AgentResponse) -> Self {
        Self {
            iteration,
            thoughts: response.thoughts,
            plan: response.plan,
            tool_calls: response
                .tool_calls
                .into_iter()
                .map(|c| ToolCallRecord::pending(c.tool, c.args))
                .collect(),
            message: response.message,
        }
    }
}

/// 运行结果
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    /// 最终答复
    pub message: String,
    pub iterations: usize,
    pub history: Vec<IterationLogEntry>,
}
