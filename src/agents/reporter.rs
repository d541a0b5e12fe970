//! Reporter：最终报告
//!
//! 仅读会话转录，按最新计划的规模在简短摘要与详细报告两种 prompt 间切换
//! （超过 2 步走详细形式）。无论成败都必须产出 Report，LLM 不可用时回退为
//! 本地拼装的摘要文本。

use std::sync::Arc;

use crate::agents::schema::{format_execution_summary, Report};
use crate::llm::{LlmClient, Message};
use crate::session::{Session, SessionStatus};

/// 超过此步数的计划使用详细报告 prompt
const DETAILED_REPORT_THRESHOLD: usize = 2;

/// 报告生成：持有 LLM，只消费转录，不触发任何执行
pub struct Reporter {
    llm: Arc<dyn LlmClient>,
}

impl Reporter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(&self, session: &Session, summary: &str, detailed: bool) -> String {
        let outcome = match session.status {
            SessionStatus::Done => "completed successfully",
            _ => "did not complete; the summary below covers the work done and the failure",
        };
        if detailed {
            format!(
                "You are a report writer. The task below {}.\n\n\
                 User request:\n{}\n\n\
                 Execution record:\n{}\n\n\
                 Write a structured report for the user: what was done step by step, the \
                 outcome of each step, and (if the task failed) what went wrong and what \
                 remains. Plain text, no JSON.",
                outcome, session.instruction, summary
            )
        } else {
            format!(
                "You are a report writer. The task below {}.\n\n\
                 User request:\n{}\n\n\
                 Execution record:\n{}\n\n\
                 Write a short answer for the user in at most three sentences. If a step \
                 produced the answer directly, lead with it. Plain text, no JSON.",
                outcome, session.instruction, summary
            )
        }
    }

    /// 本地回退摘要：LLM 不可用时保证仍有报告
    fn fallback_summary(session: &Session, summary: &str) -> String {
        let outcome = match session.status {
            SessionStatus::Done => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Running => "was interrupted",
        };
        format!(
            "Task '{}' {}.\n{}",
            session.instruction, outcome, summary
        )
    }

    /// 生成最终报告；references 指向最新修订的转录条目
    pub async fn report(&self, session: &Session) -> Report {
        let references = session.latest_revision_indices();
        let summary = match session.latest_plan() {
            Some(plan) => {
                let results: Vec<_> = session.results_for(plan).into_iter().cloned().collect();
                format_execution_summary(plan, &results)
            }
            None => "No plan was produced.".to_string(),
        };

        let detailed = session
            .latest_plan()
            .map(|p| p.steps.len() > DETAILED_REPORT_THRESHOLD)
            .unwrap_or(false);

        let prompt = self.prompt(session, &summary, detailed);
        let text = match self.llm.complete(&[Message::user(prompt)]).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) | Err(_) => {
                tracing::warn!("report completion unavailable, using fallback summary");
                Self::fallback_summary(session, &summary)
            }
        };

        Report {
            summary: text,
            references,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::schema::{ExecutionPlan, Step, StepStatus, ToolResult};
    use crate::llm::ScriptedLlmClient;
    use crate::session::TranscriptEntry;
    use uuid::Uuid;

    fn session_with_plan(steps: usize) -> Session {
        let mut session = Session::new("do the thing");
        let plan = ExecutionPlan {
            revision: 1,
            goal: "g".into(),
            steps: (0..steps)
                .map(|_| Step {
                    id: Uuid::new_v4(),
                    tool: "final_answer".into(),
                    args: serde_json::json!({"answer": "42"}),
                    expected: "answered".into(),
                    status: StepStatus::Succeeded,
                })
                .collect(),
        };
        let ids: Vec<Uuid> = plan.steps.iter().map(|s| s.id).collect();
        session.push(TranscriptEntry::Plan(plan));
        for id in ids {
            session.push(TranscriptEntry::ToolResult(ToolResult::ok(id, "42")));
        }
        session.status = SessionStatus::Done;
        session
    }

    #[tokio::test]
    async fn test_report_from_llm_with_references() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["The answer is 42.".to_string()]));
        let reporter = Reporter::new(llm);
        let session = session_with_plan(1);
        let report = reporter.report(&session).await;
        assert_eq!(report.summary, "The answer is 42.");
        assert_eq!(report.references, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_fallback_report_when_llm_unavailable() {
        // 空脚本 => complete 报错 => 本地回退
        let reporter = Reporter::new(Arc::new(ScriptedLlmClient::default()));
        let session = session_with_plan(1);
        let report = reporter.report(&session).await;
        assert!(report.summary.contains("do the thing"));
        assert!(report.summary.contains("completed"));
    }

    #[tokio::test]
    async fn test_long_plan_selects_detailed_prompt() {
        let reporter = Reporter::new(Arc::new(ScriptedLlmClient::default()));
        let session = session_with_plan(3);
        let prompt = reporter.prompt(&session, "summary", true);
        assert!(prompt.contains("structured report"));
        let short = reporter.prompt(&session, "summary", false);
        assert!(short.contains("at most three sentences"));
    }
}
