//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__QUOTA__MAX_QUOTA_USAGE=0.6`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub quota: QuotaSection,
    pub reduction: ReductionSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
}

/// [quota] 段：会话配额与溢出处理
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    /// 用量 / 容量 达到此比例即触发处理
    pub max_quota_usage: f64,
    /// clear / summarize
    pub context_handler: String,
    /// clear / preserve / update
    pub history_handler: String,
    /// 单条超大输入的预归约最大递归深度
    pub oversized_max_depth: usize,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            max_quota_usage: 0.75,
            context_handler: "clear".to_string(),
            history_handler: "clear".to_string(),
            oversized_max_depth: 8,
        }
    }
}

/// [reduction] 段：大内容归约（BoundedModel 的超大输入预归约与溢出摘要使用）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReductionSection {
    pub threshold: f64,
    pub max_merge_depth: usize,
    pub max_chunks: usize,
}

impl Default for ReductionSection {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            max_merge_depth: 10,
            max_chunks: 100,
        }
    }
}

/// [agent] 段：Agent 循环
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 覆盖默认 system prompt
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            tool_timeout_secs: 30,
            system_prompt: None,
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// OpenAI 兼容端点没有容量接口，由配置给出
    pub input_quota: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            input_quota: 8192,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
