//! Hive 命令行
//!
//! 用法：`hive "<task>" [config.toml]`。加载配置，选择引擎，注册 echo 工具后运行 Agent 循环，
//! 打印状态变化与最终答复。Ctrl-C 取消运行。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::{
    config::load_config,
    llm::create_factory_from_config,
    observability,
    react::{AgentLoop, AgentOptions},
    reduce::ReductionConfig,
    session::QuotaConfig,
    tools::{EchoTool, ToolRegistry},
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let task = args
        .next()
        .context("usage: hive \"<task>\" [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);

    let cfg = load_config(config_path).context("Failed to load config")?;
    let quota = QuotaConfig::from_section(&cfg.quota)
        .context("Invalid [quota] section")?
        .with_reduction(ReductionConfig::from_section(&cfg.reduction));
    let factory = create_factory_from_config(&cfg);

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);

    let agent = AgentLoop::new(factory, Arc::new(tools))
        .with_options(AgentOptions::from_section(&cfg.agent))
        .with_quota(quota);

    let signal = CancellationToken::new();
    let ctrl_c = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let run = agent.run_with_signal(task, signal);
    println!("run {}", run.run_id());
    let watcher = run.status().observe(|status| println!("status: {:?}", status));

    let outcome = run.wait().await;
    let _ = watcher.await;
    let outcome = outcome.context("Agent run failed")?;

    println!("\n{}", outcome.message);
    println!("({} iteration(s))", outcome.iterations);
    Ok(())
}
