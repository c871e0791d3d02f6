//! 核心类型：统一错误、可订阅的流式属性

pub mod error;
pub mod streaming;

pub use error::HiveError;
pub use streaming::{StreamingProperty, Subscription};
