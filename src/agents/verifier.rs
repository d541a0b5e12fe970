//! Verifier：结果验证
//!
//! 对照原始指令与执行摘要裁决 Pass / Fail。两条本地守卫先于 LLM 生效：
//! 计划存在未到终态的步骤时绝不放行；摘要中出现 Error: 时强制 Fail。
//! LLM 输出畸形时吸收为 Fail（带解释反馈），会话继续存活，不上抛错误。

use std::sync::Arc;

use uuid::Uuid;

use crate::agents::schema::{
    verification_schema_json, ExecutionPlan, StepStatus, Verdict, VerificationResult,
};
use crate::llm::{LlmClient, Message};

/// 访问越界时的固定安全反馈（不让 LLM 自由发挥安全结论）
const ACCESS_DENIED_FEEDBACK: &str =
    "The task failed because a step attempted to access a path outside the workspace. \
     This is a security boundary and must not be retried with the same path; \
     re-plan using paths inside the workspace root.";

/// 结果验证：持有 LLM，verdict 永远是显式 Pass / Fail
pub struct Verifier {
    llm: Arc<dyn LlmClient>,
}

impl Verifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn judgment_prompt(&self, instruction: &str, summary: &str) -> String {
        format!(
            "You are a strict result verifier. Judge whether the executed plan fulfilled the \
             user's request.\n\n\
             User request:\n{}\n\n\
             Execution summary:\n{}\n\n\
             Judgment rules:\n\
             1. If the summary contains any line with 'Error:', the verdict MUST be fail.\n\
             2. A step that merely ran is not enough; its output must match the request.\n\
             3. On fail, the feedback must state the likely cause AND the concrete next \
                action for a revised plan.\n\
             4. On pass, the feedback is one short sentence confirming completion.\n\n\
             Respond with exactly one JSON object matching this schema:\n{}\n",
            instruction,
            summary,
            verification_schema_json()
        )
    }

    /// 本地判定失败步骤 id（Failed / Rejected）
    fn local_failing_ids(plan: &ExecutionPlan) -> Vec<Uuid> {
        plan.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Rejected))
            .map(|s| s.id)
            .collect()
    }

    /// 验证一次执行。守卫命中或 LLM 异常时不经补全/不信任补全直接给出 Fail；
    /// LLM 给 Pass 但摘要含 Error: 时同样降级为 Fail。
    pub async fn verify(
        &self,
        instruction: &str,
        plan: &ExecutionPlan,
        summary: &str,
    ) -> VerificationResult {
        let revision = plan.revision;

        // 守卫：未执行完的计划不进入裁决
        if !plan.all_terminal() || plan.executed_count() == 0 {
            return VerificationResult {
                revision,
                verdict: Verdict::Fail,
                feedback: "The plan was not fully executed; no completed work to verify. \
                           Re-plan and execute all steps."
                    .to_string(),
                failing_steps: Self::local_failing_ids(plan),
            };
        }

        let summary_has_error = summary.lines().any(|l| l.contains("Error:"));
        if summary_has_error && summary.contains("Access denied") {
            return VerificationResult {
                revision,
                verdict: Verdict::Fail,
                feedback: ACCESS_DENIED_FEEDBACK.to_string(),
                failing_steps: Self::local_failing_ids(plan),
            };
        }

        let prompt = self.judgment_prompt(instruction, summary);
        let mut result = match self.llm.complete(&[Message::user(prompt)]).await {
            Ok(output) => match VerificationResult::from_llm_output(&output, revision) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "verifier output unparseable, absorbing as fail");
                    VerificationResult {
                        revision,
                        verdict: Verdict::Fail,
                        feedback: format!(
                            "Verification output was malformed ({}); treat the attempt as \
                             unconfirmed and re-plan.",
                            e
                        ),
                        failing_steps: Vec::new(),
                    }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "verifier completion failed, absorbing as fail");
                VerificationResult {
                    revision,
                    verdict: Verdict::Fail,
                    feedback: format!(
                        "Verification could not be performed ({}); treat the attempt as \
                         unconfirmed and re-plan.",
                        e
                    ),
                    failing_steps: Vec::new(),
                }
            }
        };

        if result.verdict == Verdict::Pass && summary_has_error {
            tracing::warn!(revision, "verifier passed a summary containing Error:, overriding");
            result.verdict = Verdict::Fail;
            result.feedback = format!(
                "The execution summary contains errors even though verification reported \
                 success. Original feedback: {}. Re-plan to address the failing step.",
                result.feedback
            );
        }

        // 合并本地失败步骤 id：LLM 可能漏报
        let local = Self::local_failing_ids(plan);
        for id in local {
            if !result.failing_steps.contains(&id) {
                result.failing_steps.push(id);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::schema::Step;
    use crate::llm::ScriptedLlmClient;

    fn plan_with_status(status: StepStatus) -> ExecutionPlan {
        ExecutionPlan {
            revision: 1,
            goal: "g".into(),
            steps: vec![Step {
                id: Uuid::new_v4(),
                tool: "write_file".into(),
                args: serde_json::json!({"path": "a.txt", "content": "hi"}),
                expected: "file created".into(),
                status,
            }],
        }
    }

    #[tokio::test]
    async fn test_guard_fails_unexecuted_plan_without_llm() {
        // 空脚本：若调用 LLM 会得到 exhausted 错误文案，这里应直接走守卫
        let verifier = Verifier::new(Arc::new(ScriptedLlmClient::default()));
        let plan = plan_with_status(StepStatus::Pending);
        let v = verifier.verify("create a.txt", &plan, "").await;
        assert_eq!(v.verdict, Verdict::Fail);
        assert!(v.feedback.contains("not fully executed"));
    }

    #[tokio::test]
    async fn test_pass_verdict_from_llm() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            r#"{"verdict": "pass", "feedback": "File created as requested."}"#.to_string(),
        ]));
        let verifier = Verifier::new(llm);
        let plan = plan_with_status(StepStatus::Succeeded);
        let v = verifier
            .verify("create a.txt", &plan, "Step 1 (write_file): Wrote a.txt")
            .await;
        assert_eq!(v.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_error_line_overrides_llm_pass() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            r#"{"verdict": "pass", "feedback": "looks fine"}"#.to_string(),
        ]));
        let verifier = Verifier::new(llm);
        let mut plan = plan_with_status(StepStatus::Failed);
        plan.steps[0].status = StepStatus::Failed;
        let v = verifier
            .verify("create a.txt", &plan, "Step 1 (write_file): Error: disk full")
            .await;
        assert_eq!(v.verdict, Verdict::Fail);
        assert_eq!(v.failing_steps, vec![plan.steps[0].id]);
    }

    #[tokio::test]
    async fn test_access_denied_uses_fixed_security_feedback() {
        let verifier = Verifier::new(Arc::new(ScriptedLlmClient::default()));
        let plan = plan_with_status(StepStatus::Failed);
        let v = verifier
            .verify(
                "read /etc/passwd",
                &plan,
                "Step 1 (read_file): Error: Access denied: path escapes workspace",
            )
            .await;
        assert_eq!(v.verdict, Verdict::Fail);
        assert!(v.feedback.contains("security boundary"));
    }

    #[tokio::test]
    async fn test_malformed_output_absorbed_as_fail() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["garbage".to_string()]));
        let verifier = Verifier::new(llm);
        let plan = plan_with_status(StepStatus::Succeeded);
        let v = verifier
            .verify("create a.txt", &plan, "Step 1 (write_file): Wrote a.txt")
            .await;
        assert_eq!(v.verdict, Verdict::Fail);
        assert!(v.feedback.contains("malformed"));
    }
}
