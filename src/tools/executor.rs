//! 工具执行器
//!
//! 对已审批的步骤执行工具调用：先做执行前参数校验（防御绕过了计划校验的产出），
//! 不匹配时不调用工具、直接产出失败结果；通过后剔除多余键、在超时内调用，
//! 每次调用输出结构化审计日志（JSON）。每个被执行步骤恰好产生一条 ToolResult。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::agents::schema::{Step, ToolResult};
use crate::tools::ToolRegistry;

/// 工具执行器：持有注册表与全局超时；所有副作用都经由这里发生
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行单个已审批步骤。参数与 schema 不匹配时立即失败且不调用工具；
    /// 超时与工具自身的失败信号都折算进 ToolResult，由验证环节消化。
    pub async fn execute_step(&self, step: &Step) -> ToolResult {
        if let Err(e) = self.registry.validate_args(&step.tool, &step.args) {
            self.audit(&step.tool, &step.args, false, "schema_mismatch", 0);
            return ToolResult::err(step.id, format!("argument mismatch: {}", e));
        }
        let args = self.registry.sanitize_args(&step.tool, &step.args);

        // validate_args 已确认工具存在
        let Some(tool) = self.registry.get(&step.tool) else {
            return ToolResult::err(step.id, format!("Unknown tool: {}", step.tool));
        };

        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(args.clone())).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                self.audit(&step.tool, &args, true, "ok", duration_ms);
                ToolResult::ok(step.id, output)
            }
            Ok(Err(e)) => {
                self.audit(&step.tool, &args, false, "error", duration_ms);
                ToolResult::err(step.id, e)
            }
            Err(_) => {
                self.audit(&step.tool, &args, false, "timeout", duration_ms);
                ToolResult::err(
                    step.id,
                    format!("tool '{}' timed out after {:?}", step.tool, self.timeout),
                )
            }
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    fn audit(&self, tool: &str, args: &Value, ok: bool, outcome: &str, duration_ms: u64) {
        let effect = self
            .registry
            .get(tool)
            .map(|t| t.effect().label())
            .unwrap_or("unknown");
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "effect": effect,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::schema::StepStatus;
    use crate::tools::{FinalAnswerTool, Tool};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("done".into())
        }
    }

    fn step(tool: &str, args: Value) -> Step {
        Step {
            id: Uuid::new_v4(),
            tool: tool.to_string(),
            args,
            expected: String::new(),
            status: StepStatus::Approved,
        }
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_without_invoking() {
        let mut reg = ToolRegistry::new();
        reg.register(FinalAnswerTool);
        let exec = ToolExecutor::new(reg, 5);
        // answer 是必填参数
        let result = exec.execute_step(&step("final_answer", serde_json::json!({}))).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("argument mismatch"));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let exec = ToolExecutor::new(ToolRegistry::new(), 5);
        let result = exec.execute_step(&step("nope", serde_json::json!({}))).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_failure() {
        let mut reg = ToolRegistry::new();
        reg.register(SlowTool);
        let exec = ToolExecutor::new(reg, 1);
        let result = exec.execute_step(&step("slow", serde_json::json!({}))).await;
        assert!(!result.success);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let mut reg = ToolRegistry::new();
        reg.register(FinalAnswerTool);
        let exec = ToolExecutor::new(reg, 5);
        let result = exec
            .execute_step(&step("final_answer", serde_json::json!({"answer": "hi"})))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "hi");
    }
}
