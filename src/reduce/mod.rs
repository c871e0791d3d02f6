//! 归约层：文本切分、文本任务、大内容策略（join / merge / summarize）

pub mod splitter;
pub mod strategy;
pub mod task;

pub use splitter::{balanced_split, sentences, TextSplitter, DEFAULT_MAX_CHUNKS};
pub use strategy::{BoundedTask, LargeContentStrategy, ReductionConfig, CHUNK_SEPARATOR};
pub use task::{
    PromptTask, RewriteLength, RewriteTone, SummaryLength, SummaryType, TaskKind, TextOperation,
};
