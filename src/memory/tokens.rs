//! Token 估算
//!
//! 没有原生用量测量接口的后端（OpenAI 兼容端点）用它近似 `measure_input_usage`。

use crate::memory::Message;

/// 每条消息的固定开销（角色标记、分隔符）
const MESSAGE_OVERHEAD: usize = 4;

/// Token 估算器（字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量：ASCII 约 4 字符/token，其余约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let (ascii, other) = text.chars().fold((0usize, 0usize), |(a, o), c| {
            if c.is_ascii() {
                (a + 1, o)
            } else {
                (a, o + 1)
            }
        });
        let tokens = ascii.div_ceil(4) + (other as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算一组消息的 token 数量
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| Self::estimate(&m.text()) + MESSAGE_OVERHEAD)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_cjk() {
        assert_eq!(TokenEstimator::estimate("你好世界"), 3);
        assert_eq!(TokenEstimator::estimate(""), 0);
    }

    #[test]
    fn test_message_overhead() {
        let msgs = vec![Message::user("abcd"), Message::assistant("")];
        assert_eq!(TokenEstimator::estimate_messages(&msgs), 1 + 4 + 4);
    }
}
