//! 会话历史
//!
//! 有序消息日志，由单个 BoundedModel 独占。所有修改操作维持同一不变式：
//! system 消息至多一条，且若存在必在下标 0。

use crate::core::HiveError;
use crate::llm::{LanguageModel, PromptInput, PromptOptions};
use crate::memory::{Message, Role};

/// 转录文本格式（用于摘要提示）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TranscriptFormat {
    /// `role: content`，消息间空行分隔
    #[default]
    Plain,
    /// `### Role` 标题 + 内容
    Markdown,
}

#[derive(Clone, Debug, Default)]
pub struct HistoryManager {
    messages: Vec<Message>,
}

impl HistoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        let mut history = Self::new();
        history.replace(messages);
        history
    }

    /// 追加消息；system 消息替换（或插入）到下标 0
    pub fn add(&mut self, message: impl Into<Message>) {
        let message = message.into();
        if message.is_system() {
            match self.messages.first() {
                Some(first) if first.is_system() => self.messages[0] = message,
                _ => self.messages.insert(0, message),
            }
        } else {
            self.messages.push(message);
        }
    }

    /// 实时引用
    pub fn get(&self) -> &[Message] {
        &self.messages
    }

    /// 深拷贝，调用方可随意修改
    pub fn copy(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// 整体替换；多余的 system 消息只保留第一条并移到开头
    pub fn replace(&mut self, new_history: Vec<Message>) {
        let mut system: Option<Message> = None;
        let mut rest = Vec::with_capacity(new_history.len());
        for msg in new_history {
            if msg.is_system() {
                if system.is_none() {
                    system = Some(msg);
                } else {
                    tracing::warn!("Dropping extra system message while replacing history");
                }
            } else {
                rest.push(msg);
            }
        }
        self.messages = system.into_iter().chain(rest).collect();
    }

    /// 清空；preserve_system 为 true 时保留 system 消息
    pub fn clear(&mut self, preserve_system: bool) {
        if preserve_system && self.messages.first().is_some_and(Message::is_system) {
            self.messages.truncate(1);
        } else {
            self.messages.clear();
        }
    }

    /// system 消息；不存在时返回内容为空的占位
    pub fn system_prompt(&self) -> Message {
        self.messages
            .first()
            .filter(|m| m.is_system())
            .cloned()
            .unwrap_or_else(|| Message::system(""))
    }

    pub fn has_system_prompt(&self) -> bool {
        self.messages.first().is_some_and(Message::is_system)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 修改指定下标消息的文本（流式回复累积用）
    pub(crate) fn set_text(&mut self, index: usize, text: impl Into<String>) -> bool {
        match self.messages.get_mut(index) {
            Some(msg) if !msg.is_system() => {
                *msg = Message::new(msg.role, text);
                true
            }
            _ => false,
        }
    }

    /// 渲染转录文本
    pub fn render(&self, format: TranscriptFormat, include_system: bool) -> String {
        self.messages
            .iter()
            .filter(|m| include_system || !m.is_system())
            .map(|m| match format {
                TranscriptFormat::Plain => format!("{}: {}", m.role.as_str(), m.text()),
                TranscriptFormat::Markdown => {
                    format!("### {}\n\n{}", capitalize(m.role.as_str()), m.text())
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// 用引擎测量整段历史的用量
    ///
    /// 部分测量接口要求至少一条非 system 消息，因此开头的 system 消息按 user 角色计量。
    pub async fn measure_usage(&self, engine: &dyn LanguageModel) -> Result<u64, HiveError> {
        if self.messages.is_empty() {
            return Ok(0);
        }
        let messages: Vec<Message> = self
            .messages
            .iter()
            .map(|m| {
                if m.is_system() {
                    Message {
                        role: Role::User,
                        content: m.content.clone(),
                    }
                } else {
                    m.clone()
                }
            })
            .collect();
        let usage = engine
            .measure_input_usage(&PromptInput::Messages(messages), &PromptOptions::default())
            .await?;
        Ok(usage)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::user(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::user(text)
    }
}
