//! 记忆层：对话消息、会话历史、token 估算

pub mod conversation;
pub mod history;
pub mod tokens;

pub use conversation::{ContentPart, Message, MessageContent, Role};
pub use history::{HistoryManager, TranscriptFormat};
pub use tokens::TokenEstimator;
