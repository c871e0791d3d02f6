//! 会话层：带配额保护的引擎会话

pub mod bounded;
pub mod quota;

pub use bounded::BoundedModel;
pub use quota::{ContextHandler, HistoryHandler, MessagesFn, QuotaConfig, QuotaOverflow};
