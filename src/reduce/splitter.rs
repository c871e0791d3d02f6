//! 文本切分
//!
//! 把超出预算的文本切成最少的、长度均衡的若干块，每块的用量（由注入的异步测量函数给出）都不超过预算。
//! 按整句累积（句末标点/换行保留在句子里），块数从 2 开始递增，最先成功的块数胜出。

use std::future::Future;
use std::sync::OnceLock;

use futures_util::future::try_join_all;
use regex::Regex;
use tracing::debug;

use crate::core::HiveError;

/// 默认最大块数
pub const DEFAULT_MAX_CHUNKS: usize = 100;

static SENTENCE: OnceLock<Regex> = OnceLock::new();

fn sentence_regex() -> &'static Regex {
    SENTENCE.get_or_init(|| {
        Regex::new(r"[^.!?。！？\n]*[.!?。！？\n]+|[^.!?。！？\n]+").expect("valid sentence pattern")
    })
}

/// 按句切分，分隔符保留；各句首尾相接即原文
pub fn sentences(text: &str) -> Vec<&str> {
    sentence_regex().find_iter(text).map(|m| m.as_str()).collect()
}

/// 均衡切成至多 `num_chunks` 块：第 k 块在累计字符数达到 total·k/n 时结束，最后一块吸收剩余部分
pub fn balanced_split(text: &str, num_chunks: usize) -> Vec<String> {
    let num_chunks = num_chunks.max(1);
    let total = text.chars().count();
    let mut parts = Vec::with_capacity(num_chunks);
    let mut current = String::new();
    let mut consumed = 0usize;
    for sentence in sentences(text) {
        current.push_str(sentence);
        consumed += sentence.chars().count();
        if parts.len() + 1 < num_chunks && consumed * num_chunks >= total * (parts.len() + 1) {
            parts.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// 文本切分器
#[derive(Clone, Debug)]
pub struct TextSplitter {
    max_chunks: usize,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

impl TextSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks.max(2);
        self
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// 切分 `text`，使每块 `measure(chunk) <= budget`
    ///
    /// 整体已在预算内时原样返回 `[text]`；找不到可行切分时返回 `SplitExhausted`。
    pub async fn split<F, Fut>(&self, text: &str, measure: F, budget: u64) -> Result<Vec<String>, HiveError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<u64, HiveError>>,
    {
        let usage = measure(text.to_string()).await?;
        if usage <= budget {
            return Ok(vec![text.to_string()]);
        }

        let mut previous: Vec<String> = Vec::new();
        for num_chunks in 2..=self.max_chunks {
            let parts = balanced_split(text, num_chunks);
            // 句子数不够时多个 num_chunks 会得到同一切分
            if parts == previous {
                continue;
            }
            let usages = try_join_all(parts.iter().map(|p| measure(p.clone()))).await?;
            if usages.iter().all(|u| *u <= budget) {
                debug!(num_chunks = parts.len(), usage, budget, "Split text");
                return Ok(parts);
            }
            previous = parts;
        }
        Err(HiveError::SplitExhausted {
            max_chunks: self.max_chunks,
            budget,
        })
    }
}
