//! Agent 循环集成测试（Mock 引擎 + 测试工具）

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::llm::{MockFactory, MockScript};
    use hive::react::{AgentLoop, AgentOptions, AgentStatus, ToolCallStatus};
    use hive::tools::{EchoTool, Tool, ToolOutput, ToolRegistry};
    use hive::HiveError;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    fn response(tool_calls: Value, message: &str) -> String {
        json!({
            "thoughts": "thinking",
            "plan": ["step"],
            "tool_calls": tool_calls,
            "message": message,
        })
        .to_string()
    }

    fn registry_with(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        for tool in tools {
            registry.register_arc(tool);
        }
        Arc::new(registry)
    }

    /// 调用时取消运行
    struct CancelTool(CancellationToken);

    #[async_trait]
    impl Tool for CancelTool {
        fn name(&self) -> &str {
            "cancel"
        }

        fn description(&self) -> &str {
            "Cancels the run"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            self.0.cancel();
            Ok(ToolOutput::text("cancelled"))
        }
    }

    /// 记录开始 / 结束事件，用于验证顺序执行
    struct TraceTool {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for TraceTool {
        fn name(&self) -> &str {
            "trace"
        }

        fn description(&self) -> &str {
            "Records start and end"
        }

        async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
            let id = args["id"].as_str().unwrap_or("?").to_string();
            let delay = args["delay_ms"].as_u64().unwrap_or(0);
            self.events.lock().unwrap().push(format!("start {id}"));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.events.lock().unwrap().push(format!("end {id}"));
            Ok(ToolOutput::text(id))
        }
    }

    /// 返回一张 PNG
    struct ScreenshotTool;

    #[async_trait]
    impl Tool for ScreenshotTool {
        fn name(&self) -> &str {
            "screenshot"
        }

        fn description(&self) -> &str {
            "Captures a screenshot"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::binary(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]))
        }
    }

    /// 总是失败
    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Err("disk on fire".to_string())
        }
    }

    #[tokio::test]
    async fn test_empty_tool_calls_finish_after_one_iteration() {
        let script = MockScript::new().with_responses([response(json!([]), "all done")]);
        let factory = Arc::new(MockFactory::with_script(100_000, script));
        let run = AgentLoop::new(factory, registry_with(vec![])).run("task");
        let history = run.history().clone();
        let current = run.current_iteration().clone();
        let status = run.status().clone();

        let outcome = run.wait().await.unwrap();
        assert_eq!(outcome.message, "all done");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(history.get().len(), 1);
        assert_eq!(current.get(), None);
        assert_eq!(status.get(), AgentStatus::Done);
        assert!(history.is_finalized() && current.is_finalized() && status.is_finalized());
        // 终态之后不再接受更新
        assert!(!status.set(AgentStatus::Thinking));
    }

    #[tokio::test]
    async fn test_unregistered_tool_never_throws() {
        let script = MockScript::new()
            .with_responder(|_| Ok(response(json!([{"tool": "ghost", "args": {}}]), "")));
        let factory = Arc::new(MockFactory::with_script(100_000, script));
        let run = AgentLoop::new(factory.clone(), registry_with(vec![]))
            .with_options(AgentOptions::default().with_max_iterations(3))
            .run("task");
        let history = run.history().clone();

        let err = run.wait().await.unwrap_err();
        assert!(matches!(err, HiveError::MaxIterations(3)));
        let entries = history.get();
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            for call in &entry.tool_calls {
                assert_eq!(call.status, ToolCallStatus::Error);
                assert_eq!(call.error.as_deref(), Some("tool not found"));
            }
        }
        let prompts = factory.script().prompts();
        assert!(prompts[1].contains("Tool `ghost` not found"));
    }

    #[tokio::test]
    async fn test_abort_before_second_iteration() {
        let signal = CancellationToken::new();
        let script = MockScript::new()
            .with_responder(|_| Ok(response(json!([{"tool": "cancel", "args": {}}]), "")));
        let factory = Arc::new(MockFactory::with_script(100_000, script));
        let registry = registry_with(vec![Arc::new(CancelTool(signal.clone()))]);
        let run = AgentLoop::new(factory, registry).run_with_signal("task", signal);
        let status = run.status().clone();
        let history = run.history().clone();

        let err = run.wait().await.unwrap_err();
        assert!(err.is_abort());
        assert_eq!(status.get(), AgentStatus::Error);
        assert_eq!(history.get().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_response_fails_run() {
        let script = MockScript::new().with_responses(["I refuse to answer in JSON"]);
        let factory = Arc::new(MockFactory::with_script(100_000, script));
        let run = AgentLoop::new(factory, registry_with(vec![])).run("task");
        let status = run.status().clone();

        let err = run.wait().await.unwrap_err();
        assert!(matches!(err, HiveError::Parse(_)));
        assert!(!err.is_abort());
        assert_eq!(status.get(), AgentStatus::Error);
    }

    #[tokio::test]
    async fn test_tools_run_sequentially_in_declared_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let script = MockScript::new().with_responses([
            response(
                json!([
                    {"tool": "trace", "args": {"id": "a", "delay_ms": 40}},
                    {"tool": "trace", "args": {"id": "b", "delay_ms": 0}},
                    {"tool": "trace", "args": {"id": "c", "delay_ms": 10}},
                ]),
                "",
            ),
            response(json!([]), "finished"),
        ]);
        let factory = Arc::new(MockFactory::with_script(100_000, script));
        let registry = registry_with(vec![Arc::new(TraceTool {
            events: events.clone(),
        })]);
        let outcome = AgentLoop::new(factory.clone(), registry).run("task").wait().await.unwrap();

        assert_eq!(outcome.message, "finished");
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start a", "end a", "start b", "end b", "start c", "end c"]
        );
        let results: Vec<_> = outcome.history[0]
            .tool_calls
            .iter()
            .map(|c| c.result.clone().unwrap_or_default())
            .collect();
        assert_eq!(results, vec!["a", "b", "c"]);
        // 三个结果按顺序作为下一轮输入
        let second = &factory.script().prompts()[1];
        let pos = |id: &str| second.find(&format!("Result of tool `trace`:\n{id}")).unwrap();
        assert!(pos("a") < pos("b") && pos("b") < pos("c"));
    }

    #[tokio::test]
    async fn test_tool_failure_is_isolated() {
        let script = MockScript::new().with_responses([
            response(
                json!([
                    {"tool": "broken", "args": {}},
                    {"tool": "echo", "args": {"text": "still here"}},
                ]),
                "",
            ),
            response(json!([]), "recovered"),
        ]);
        let factory = Arc::new(MockFactory::with_script(100_000, script));
        let registry = registry_with(vec![Arc::new(BrokenTool)]);
        let outcome = AgentLoop::new(factory.clone(), registry).run("task").wait().await.unwrap();

        assert_eq!(outcome.message, "recovered");
        let calls = &outcome.history[0].tool_calls;
        assert_eq!(calls[0].status, ToolCallStatus::Error);
        assert!(calls[0].error.as_deref().unwrap().contains("disk on fire"));
        assert!(calls[0].finished_at.is_some());
        assert_eq!(calls[1].status, ToolCallStatus::Success);
        assert!(factory.script().prompts()[1].contains("Error from tool `broken`"));
    }

    #[tokio::test]
    async fn test_image_output_becomes_multimodal_message() {
        let script = MockScript::new().with_responses([
            response(json!([{"tool": "screenshot", "args": {}}]), ""),
            response(json!([]), "saw it"),
        ]);
        let factory = Arc::new(MockFactory::with_script(100_000, script));
        let registry = registry_with(vec![Arc::new(ScreenshotTool)]);
        let outcome = AgentLoop::new(factory.clone(), registry).run("task").wait().await.unwrap();

        assert_eq!(outcome.message, "saw it");
        assert_eq!(
            outcome.history[0].tool_calls[0].result.as_deref(),
            Some("image/png, 8 bytes")
        );
        assert!(factory.script().prompts()[1].contains("[image: image/png, 8 bytes]"));
    }

    #[tokio::test]
    async fn test_each_run_has_own_session_and_id() {
        let factory = Arc::new(MockFactory::new(100_000));
        let agent = AgentLoop::new(factory.clone(), registry_with(vec![]));
        let first = agent.run("one");
        let second = agent.run("two");
        assert_ne!(first.run_id(), second.run_id());
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        let sessions = factory.sessions();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.is_destroyed()));
        assert!(sessions[0].initial_prompts()[0].text().contains("Available tools"));
    }
}
