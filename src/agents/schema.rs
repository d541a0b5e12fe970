//! Agent 共享数据结构
//!
//! Supervisor / Executor / Verifier / Reporter 之间传递的实体：
//! ExecutionPlan（带修订号的有序步骤）、Step（自带生命周期状态）、ToolResult、
//! VerificationResult、Report。LLM 的结构化输出在此统一解析并做类型化校验，
//! 校验失败为具名错误（PlanGeneration），绝不隐式放行。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::AgentError;
use crate::tools::ToolRegistry;

/// 步骤生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    AwaitingApproval,
    Approved,
    Rejected,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// 是否为终态（不会再变化）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Rejected | StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// 单个计划步骤：一次带预期结果的工具调用，归属于创建它的 ExecutionPlan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub tool: String,
    pub args: Value,
    /// 预期结果描述（审批提示与验证依据）
    pub expected: String,
    pub status: StepStatus,
}

/// 执行计划：目标描述 + 有序步骤 + 修订号（重新计划时 +1）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub revision: u32,
    /// 计划整体的高层思考 / 目标描述
    pub goal: String,
    pub steps: Vec<Step>,
}

/// LLM 输出的计划格式（无 id / status，由校验层补全）
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RawPlan {
    /// 计划整体的高层思考过程
    pub goal: String,
    /// 按顺序执行的步骤列表
    pub steps: Vec<RawStep>,
}

/// LLM 输出的单个步骤
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RawStep {
    /// 工具名，必须在注册表中
    pub tool: String,
    /// 工具参数对象
    pub args: Value,
    /// 该步骤的预期结果描述
    #[serde(default)]
    pub expected: String,
}

/// 返回计划输出的 JSON Schema 字符串，拼入 Supervisor system prompt，减少格式错误
pub fn plan_schema_json() -> String {
    let schema = schema_for!(RawPlan);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

/// 从 LLM 文本中提取 JSON 块（```json ... ``` 围栏或首个 { 到末个 }）
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(
            rest.find("```")
                .map(|end| rest[..end].trim())
                .unwrap_or(rest.trim()),
        );
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

impl ExecutionPlan {
    /// 类型化校验边界：解析 LLM 输出并校验每一步（非空、工具已注册、参数符合 schema），
    /// 通过后分配步骤 id 与 Pending 状态。任何违规都是 PlanGeneration 错误，不做隐式纠正。
    pub fn from_llm_output(
        output: &str,
        revision: u32,
        registry: &ToolRegistry,
    ) -> Result<Self, AgentError> {
        let json_str = extract_json(output)
            .ok_or_else(|| AgentError::PlanGeneration("no JSON object in planner output".into()))?;

        let raw: RawPlan = serde_json::from_str(json_str)
            .map_err(|e| AgentError::PlanGeneration(format!("{}: {}", e, json_str)))?;

        if raw.steps.is_empty() {
            return Err(AgentError::PlanGeneration("plan contains no steps".into()));
        }

        let mut steps = Vec::with_capacity(raw.steps.len());
        for (i, rs) in raw.steps.into_iter().enumerate() {
            registry.validate_args(&rs.tool, &rs.args).map_err(|e| {
                AgentError::PlanGeneration(format!("step {}: {}", i + 1, e))
            })?;
            steps.push(Step {
                id: Uuid::new_v4(),
                tool: rs.tool,
                args: rs.args,
                expected: rs.expected,
                status: StepStatus::Pending,
            });
        }

        Ok(Self {
            revision,
            goal: raw.goal,
            steps,
        })
    }

    /// 是否所有步骤都已到达终态
    pub fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// 已实际执行（Succeeded / Failed）的步骤数
    pub fn executed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Failed))
            .count()
    }

    pub fn step_mut(&mut self, id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }
}

/// 单次工具执行结果：每个被执行的步骤恰好产生一条，此后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub step_id: Uuid,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(step_id: Uuid, output: impl Into<String>) -> Self {
        Self {
            step_id,
            output: output.into(),
            success: true,
            error: None,
        }
    }

    pub fn err(step_id: Uuid, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            step_id,
            output: format!("Error: {}", error),
            success: false,
            error: Some(error),
        }
    }
}

/// 验证裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// 验证结果：裁决 + 反馈文本 + 失败步骤 id；Fail 时反馈作为下一修订的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub revision: u32,
    pub verdict: Verdict,
    pub feedback: String,
    #[serde(default)]
    pub failing_steps: Vec<Uuid>,
}

/// LLM 输出的验证格式（failing_steps 容忍缺失或不可解析的 id）
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RawVerification {
    /// "pass" 或 "fail"
    pub verdict: String,
    /// 成功时一句完成说明；失败时包含原因推测与下一步行动建议
    pub feedback: String,
    /// 失败步骤的 id 列表（可省略）
    #[serde(default)]
    pub failing_steps: Vec<String>,
}

/// 返回验证输出的 JSON Schema 字符串，拼入 Verifier prompt
pub fn verification_schema_json() -> String {
    let schema = schema_for!(RawVerification);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

impl VerificationResult {
    /// 解析 LLM 的验证输出；verdict 大小写不敏感，未知值视为解析失败
    pub fn from_llm_output(output: &str, revision: u32) -> Result<Self, AgentError> {
        let json_str = extract_json(output).ok_or_else(|| {
            AgentError::PlanGeneration("no JSON object in verifier output".into())
        })?;
        let raw: RawVerification = serde_json::from_str(json_str)
            .map_err(|e| AgentError::PlanGeneration(format!("{}: {}", e, json_str)))?;

        let verdict = match raw.verdict.to_lowercase().as_str() {
            "pass" => Verdict::Pass,
            "fail" => Verdict::Fail,
            other => {
                return Err(AgentError::PlanGeneration(format!(
                    "unknown verdict '{}'",
                    other
                )))
            }
        };
        let failing_steps = raw
            .failing_steps
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect();
        Ok(Self {
            revision,
            verdict,
            feedback: raw.feedback,
            failing_steps,
        })
    }
}

/// 最终报告：摘要正文 + 指向会话转录条目的引用下标；一次产生，不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub summary: String,
    pub references: Vec<usize>,
}

/// 将计划与结果渲染为验证/报告用的执行摘要（成功列结果，失败标注步骤号与错误）
pub fn format_execution_summary(plan: &ExecutionPlan, results: &[ToolResult]) -> String {
    let find = |id: Uuid| results.iter().find(|r| r.step_id == id);
    let failed = plan
        .steps
        .iter()
        .enumerate()
        .find(|(_, s)| matches!(s.status, StepStatus::Failed | StepStatus::Rejected));

    let mut lines = Vec::new();
    match failed {
        None => {
            lines.push("Plan executed successfully. Step results:".to_string());
            for (i, step) in plan.steps.iter().enumerate() {
                if let Some(r) = find(step.id) {
                    lines.push(format!("Step {} ({}): {}", i + 1, step.tool, r.output));
                }
            }
        }
        Some((idx, step)) => {
            lines.push("Plan execution failed.".to_string());
            for (i, s) in plan.steps.iter().take(idx).enumerate() {
                if let Some(r) = find(s.id) {
                    lines.push(format!("Step {} ({}): {}", i + 1, s.tool, r.output));
                }
            }
            match step.status {
                StepStatus::Rejected => {
                    lines.push(format!(
                        "Step {} ({}): rejected by user, not executed",
                        idx + 1,
                        step.tool
                    ));
                }
                _ => {
                    let detail = find(step.id)
                        .and_then(|r| r.error.clone())
                        .unwrap_or_else(|| "unknown error".to_string());
                    lines.push(format!("Step {} ({}): Error: {}", idx + 1, step.tool, detail));
                }
            }
            let skipped = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Skipped)
                .count();
            if skipped > 0 {
                lines.push(format!("{} remaining step(s) skipped.", skipped));
            }
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolRegistry};
    use async_trait::async_trait;

    struct WriteFileStub;

    #[async_trait]
    impl Tool for WriteFileStub {
        fn name(&self) -> &str {
            "write_file"
        }

        fn description(&self) -> &str {
            "stub"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            })
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("ok".into())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(WriteFileStub);
        reg
    }

    #[test]
    fn test_extract_json_fenced() {
        let out = "Sure!\n```json\n{\"a\": 1}\n```\ndone";
        assert_eq!(extract_json(out), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_bare() {
        let out = "prefix {\"a\": {\"b\": 2}} suffix";
        assert_eq!(extract_json(out), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn test_plan_from_valid_output() {
        let out = r#"{"goal": "create a file", "steps": [
            {"tool": "write_file", "args": {"path": "a.txt", "content": "hi"}, "expected": "file created"}
        ]}"#;
        let plan = ExecutionPlan::from_llm_output(out, 1, &registry()).unwrap();
        assert_eq!(plan.revision, 1);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        assert_eq!(plan.steps[0].tool, "write_file");
    }

    #[test]
    fn test_plan_unknown_tool_is_plan_generation_error() {
        let out = r#"{"goal": "g", "steps": [{"tool": "teleport", "args": {}, "expected": ""}]}"#;
        let err = ExecutionPlan::from_llm_output(out, 1, &registry()).unwrap_err();
        assert!(matches!(err, AgentError::PlanGeneration(_)));
    }

    #[test]
    fn test_plan_missing_required_arg() {
        let out = r#"{"goal": "g", "steps": [{"tool": "write_file", "args": {"path": "a.txt"}, "expected": ""}]}"#;
        let err = ExecutionPlan::from_llm_output(out, 1, &registry()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("content"), "unexpected message: {}", msg);
    }

    #[test]
    fn test_plan_empty_steps_rejected() {
        let out = r#"{"goal": "g", "steps": []}"#;
        assert!(ExecutionPlan::from_llm_output(out, 1, &registry()).is_err());
    }

    #[test]
    fn test_verification_parse_lenient_ids() {
        let out = r#"{"verdict": "Fail", "feedback": "step 1 wrong", "failing_steps": ["not-a-uuid"]}"#;
        let v = VerificationResult::from_llm_output(out, 2).unwrap();
        assert_eq!(v.verdict, Verdict::Fail);
        assert!(v.failing_steps.is_empty());
        assert_eq!(v.revision, 2);
    }

    #[test]
    fn test_execution_summary_failure_marks_step() {
        let out = r#"{"goal": "g", "steps": [
            {"tool": "write_file", "args": {"path": "a.txt", "content": "x"}, "expected": ""},
            {"tool": "write_file", "args": {"path": "b.txt", "content": "y"}, "expected": ""}
        ]}"#;
        let mut plan = ExecutionPlan::from_llm_output(out, 1, &registry()).unwrap();
        plan.steps[0].status = StepStatus::Failed;
        plan.steps[1].status = StepStatus::Skipped;
        let results = vec![ToolResult::err(plan.steps[0].id, "disk full")];
        let summary = format_execution_summary(&plan, &results);
        assert!(summary.contains("Plan execution failed."));
        assert!(summary.contains("Error: disk full"));
        assert!(summary.contains("1 remaining step(s) skipped."));
    }
}
