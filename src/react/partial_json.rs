//! 宽松 JSON 修复：解析流式输出中尚未完整的 JSON 对象
//!
//! 从第一个 `{` 开始扫描，记录字符串 / 转义状态与括号栈；
//! 补全未闭合的字符串与括号后尝试解析，失败则退回到更早的安全截断点（`,` 之前、`{` / `[` 之后）再试。
//! 代码块围栏（```json）与对象前后的杂文会被忽略。

use serde::de::DeserializeOwned;
use serde_json::Value;

/// 把（可能不完整的）文本修复为可解析的 JSON 值
pub fn repair(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let body = &text[start..];
    let scan = Scan::run(body);

    if let Some(end) = scan.complete_at {
        return serde_json::from_str(&body[..end]).ok();
    }

    let mut candidates = vec![body.len()];
    candidates.extend(scan.cut_points.iter().rev().copied());
    candidates
        .into_iter()
        .find_map(|cut| serde_json::from_str(&close(&body[..cut])).ok())
}

/// 修复后按类型解析；字段缺失或类型不符时返回 None
pub fn parse_partial<T: DeserializeOwned>(text: &str) -> Option<T> {
    repair(text).and_then(|v| serde_json::from_value(v).ok())
}

/// 完整解析：先严格解析整个对象，再退回宽松修复
pub fn parse_complete<T: DeserializeOwned>(text: &str) -> Option<T> {
    let trimmed = strip_fence(text);
    if let Ok(v) = serde_json::from_str::<T>(trimmed) {
        return Some(v);
    }
    parse_partial(trimmed)
}

fn strip_fence(text: &str) -> &str {
    let t = text.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

struct Scan {
    /// 顶层对象在此（字节偏移）闭合
    complete_at: Option<usize>,
    /// 可截断的位置（字节偏移，前缀不含该位置）
    cut_points: Vec<usize>,
}

impl Scan {
    fn run(body: &str) -> Self {
        let mut stack: Vec<char> = Vec::new();
        let mut in_string = false;
        let mut escape = false;
        let mut cut_points = Vec::new();

        for (i, c) in body.char_indices() {
            if in_string {
                if escape {
                    escape = false;
                } else if c == '\\' {
                    escape = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => {
                    stack.push('}');
                    cut_points.push(i + 1);
                }
                '[' => {
                    stack.push(']');
                    cut_points.push(i + 1);
                }
                '}' | ']' => {
                    if stack.pop() != Some(c) {
                        break;
                    }
                    if stack.is_empty() {
                        return Self {
                            complete_at: Some(i + 1),
                            cut_points,
                        };
                    }
                }
                ',' => cut_points.push(i),
                _ => {}
            }
        }
        Self {
            complete_at: None,
            cut_points,
        }
    }
}

/// 补全前缀：闭合字符串、去掉悬空的逗号、给悬空的键补 null、按栈闭合括号
fn close(prefix: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    for c in prefix.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = prefix.to_string();
    if in_string {
        if escape {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    }
    if out.ends_with(':') {
        out.push_str("null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_object_with_surrounding_text() {
        let v = repair("Sure! ```json\n{\"a\": 1, \"b\": [1, 2]}\n``` done").unwrap();
        assert_eq!(v, json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn test_open_string_and_brackets_are_closed() {
        let v = repair(r#"{"thoughts": "thinking ab"#).unwrap();
        assert_eq!(v, json!({"thoughts": "thinking ab"}));

        let v = repair(r#"{"plan": ["one", "tw"#).unwrap();
        assert_eq!(v, json!({"plan": ["one", "tw"]}));
    }

    #[test]
    fn test_dangling_key_falls_back_to_cut_point() {
        let v = repair(r#"{"thoughts": "x", "pla"#).unwrap();
        assert_eq!(v, json!({"thoughts": "x"}));

        let v = repair(r#"{"thoughts": "x", "plan":"#).unwrap();
        assert_eq!(v, json!({"thoughts": "x", "plan": null}));
    }

    #[test]
    fn test_partial_literal_is_dropped() {
        let v = repair(r#"{"a": "x", "b": tr"#).unwrap();
        assert_eq!(v, json!({"a": "x"}));
    }

    #[test]
    fn test_escapes_inside_strings() {
        let v = repair(r#"{"m": "say \"hi\" {not a brace"#).unwrap();
        assert_eq!(v, json!({"m": "say \"hi\" {not a brace"}));

        let v = repair(r#"{"m": "trailing \"#).unwrap();
        assert_eq!(v, json!({"m": "trailing "}));
    }

    #[test]
    fn test_no_object_yields_none() {
        assert!(repair("no json here").is_none());
        assert!(parse_complete::<Value>("").is_none());
    }

    #[test]
    fn test_parse_partial_requires_fields() {
        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct Two {
            a: String,
            b: String,
        }
        assert!(parse_partial::<Two>(r#"{"a": "x", "#).is_none());
        assert!(parse_partial::<Two>(r#"{"a": "x", "b": "y"#).is_some());
    }
}
