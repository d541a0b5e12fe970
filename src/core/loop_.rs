//! 编排循环：计划 → 审批 → 执行 → 验证 → 报告
//!
//! 单循环驱动整个会话状态机，持有全部组件并独占推进 Session 与审计日志
//! （记录先于推进）。验证失败带反馈回到计划阶段，修订次数由 max_iterations
//! 约束；计划输出畸形时带「重新生成」提示重试，次数由 plan_retry_limit 约束。
//! 会话必定以报告收尾：用户取消与审计写入失败同样转入 Failed 终态并产出报告
//! （带着已有的部分转录），不把会话半途丢弃。

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agents::schema::{
    format_execution_summary, ExecutionPlan, StepStatus, ToolResult, Verdict, VerificationResult,
};
use crate::agents::{Reporter, Supervisor, Verifier};
use crate::approval::{ApprovalGate, ApprovalVerdict};
use crate::core::error::AgentError;
use crate::session::{Session, SessionRecord, SessionRecorder, SessionStatus, TranscriptEntry};
use crate::tools::{Effect, ToolExecutor};

/// 会话所处阶段；Done / Failed 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Planning,
    AwaitingApproval,
    Executing,
    Verifying,
    Reporting,
    Done,
    Failed,
}

/// 编排循环：组件的唯一持有者；会话内严格串行，无并行步骤执行
pub struct OrchestrationLoop {
    supervisor: Supervisor,
    executor: ToolExecutor,
    gate: ApprovalGate,
    verifier: Verifier,
    reporter: Reporter,
    max_iterations: u32,
    plan_retry_limit: u32,
    cancel: CancellationToken,
}

impl OrchestrationLoop {
    pub fn new(
        supervisor: Supervisor,
        executor: ToolExecutor,
        gate: ApprovalGate,
        verifier: Verifier,
        reporter: Reporter,
        max_iterations: u32,
        plan_retry_limit: u32,
    ) -> Self {
        Self {
            supervisor,
            executor,
            gate,
            verifier,
            reporter,
            max_iterations: max_iterations.max(1),
            plan_retry_limit: plan_retry_limit.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// 取消句柄：在挂起点（补全调用、审批等待）生效
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transition(
        &self,
        recorder: &mut SessionRecorder,
        phase: &mut Phase,
        to: Phase,
    ) -> Result<(), AgentError> {
        recorder.record(SessionRecord::Transition { from: *phase, to })?;
        tracing::debug!(from = ?*phase, to = ?to, "phase transition");
        *phase = to;
        Ok(())
    }

    /// 驱动一条指令直到终态。会话必定带报告返回：取消与审计写入失败
    /// 转入 Failed 终态（部分转录保留）而非丢弃会话。
    pub async fn run(
        &self,
        instruction: &str,
        recorder: &mut SessionRecorder,
    ) -> Result<Session, AgentError> {
        let mut session = Session::new(instruction);
        let mut phase = Phase::Idle;
        tracing::info!(session = %session.id, "session started");

        let status = match self.drive(&mut session, recorder, &mut phase).await {
            Ok(status) => status,
            Err(AgentError::Cancelled) => {
                tracing::warn!(session = %session.id, "cancelled by user, closing with partial transcript");
                SessionStatus::Failed
            }
            Err(e) => {
                tracing::error!(session = %session.id, error = %e, "session aborted, closing with partial transcript");
                SessionStatus::Failed
            }
        };

        Ok(self.finish(session, recorder, &mut phase, status).await)
    }

    /// 内层循环：返回会话终态；取消与审计写入失败以错误上抛，由 run 统一收尾
    async fn drive(
        &self,
        session: &mut Session,
        recorder: &mut SessionRecorder,
        phase: &mut Phase,
    ) -> Result<SessionStatus, AgentError> {
        recorder.record(SessionRecord::SessionStarted {
            session_id: session.id,
            instruction: session.instruction.clone(),
        })?;

        let mut iteration: u32 = 1;
        let mut feedback: Option<String> = None;

        loop {
            self.transition(recorder, phase, Phase::Planning)?;

            let mut plan = match self
                .generate_plan(session, feedback.as_deref(), iteration)
                .await
            {
                Ok(plan) => plan,
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    tracing::error!(error = %e, "plan generation exhausted, session failed");
                    return Ok(SessionStatus::Failed);
                }
            };
            recorder.record(SessionRecord::Plan { plan: plan.clone() })?;
            let plan_idx = session.push(TranscriptEntry::Plan(plan.clone()));
            tracing::info!(revision = plan.revision, steps = plan.steps.len(), goal = %plan.goal, "plan accepted");

            // 逐步审批与执行；首个失败/拒绝后跳过其余步骤
            let mut rejected_step = None;
            let mut results: Vec<ToolResult> = Vec::new();
            let step_count = plan.steps.len();
            'steps: for i in 0..step_count {
                self.transition(recorder, phase, Phase::AwaitingApproval)?;
                self.set_status(recorder, session, plan_idx, &mut plan, i, StepStatus::AwaitingApproval)?;

                let effect = self
                    .executor
                    .registry()
                    .get(&plan.steps[i].tool)
                    .map(|t| t.effect())
                    .unwrap_or(Effect::Mutating);
                let decision = self.gate.decide(&plan.steps[i], effect, &self.cancel).await?;
                recorder.record(SessionRecord::Approval {
                    decision: decision.clone(),
                })?;
                session.push(TranscriptEntry::Approval(decision.clone()));

                match decision.verdict {
                    ApprovalVerdict::Reject => {
                        tracing::info!(step = %plan.steps[i].id, "step rejected by user");
                        self.set_status(recorder, session, plan_idx, &mut plan, i, StepStatus::Rejected)?;
                        rejected_step = Some(plan.steps[i].id);
                        self.skip_remaining(recorder, session, plan_idx, &mut plan, i + 1)?;
                        break 'steps;
                    }
                    ApprovalVerdict::Edit => {
                        // 单轮内编辑后直接执行，不再发起二次审批；参数在执行前重新校验
                        if let Some(args) = decision.edited_args {
                            plan.steps[i].args = args;
                        }
                        self.set_status(recorder, session, plan_idx, &mut plan, i, StepStatus::Approved)?;
                    }
                    ApprovalVerdict::Approve => {
                        self.set_status(recorder, session, plan_idx, &mut plan, i, StepStatus::Approved)?;
                    }
                }

                self.transition(recorder, phase, Phase::Executing)?;
                self.set_status(recorder, session, plan_idx, &mut plan, i, StepStatus::Running)?;
                let result = self.executor.execute_step(&plan.steps[i]).await;
                let status = if result.success {
                    StepStatus::Succeeded
                } else {
                    StepStatus::Failed
                };
                self.set_status(recorder, session, plan_idx, &mut plan, i, status)?;
                recorder.record(SessionRecord::ToolResult {
                    result: result.clone(),
                })?;
                session.push(TranscriptEntry::ToolResult(result.clone()));
                let failed = !result.success;
                results.push(result);
                if failed {
                    self.skip_remaining(recorder, session, plan_idx, &mut plan, i + 1)?;
                    break 'steps;
                }
            }

            self.transition(recorder, phase, Phase::Verifying)?;
            let verification = match rejected_step {
                // 拒绝即失败反馈，不经补全服务
                Some(step_id) => VerificationResult {
                    revision: plan.revision,
                    verdict: Verdict::Fail,
                    feedback: "step rejected by user".to_string(),
                    failing_steps: vec![step_id],
                },
                None => {
                    if self.cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    let summary = format_execution_summary(&plan, &results);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                        v = self.verifier.verify(&session.instruction, &plan, &summary) => v,
                    }
                }
            };
            recorder.record(SessionRecord::Verification {
                result: verification.clone(),
            })?;
            session.push(TranscriptEntry::Verification(verification.clone()));

            match verification.verdict {
                Verdict::Pass => return Ok(SessionStatus::Done),
                Verdict::Fail => {
                    tracing::info!(revision = plan.revision, feedback = %verification.feedback, "verification failed");
                    if iteration >= self.max_iterations {
                        let err = AgentError::RetryBudgetExceeded(iteration);
                        tracing::error!(error = %err, "session failed");
                        return Ok(SessionStatus::Failed);
                    }
                    iteration += 1;
                    feedback = Some(verification.feedback);
                }
            }
        }
    }

    /// 计划生成（畸形输出带提示重试，上限 plan_retry_limit）
    async fn generate_plan(
        &self,
        session: &Session,
        feedback: Option<&str>,
        revision: u32,
    ) -> Result<ExecutionPlan, AgentError> {
        let context = session.context_messages();
        let registry = self.executor.registry();
        let mut hint: Option<String> = None;
        let mut attempts = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            attempts += 1;
            let fut = self.supervisor.plan(
                &context,
                registry,
                feedback,
                hint.as_deref(),
                revision,
            );
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                r = fut => r,
            };
            match outcome {
                Ok(plan) => return Ok(plan),
                Err(AgentError::PlanGeneration(e)) if attempts < self.plan_retry_limit => {
                    tracing::warn!(attempt = attempts, error = %e, "plan output invalid, regenerating");
                    hint = Some(format!(
                        "Validation error: {}. Output only the JSON object, nothing else.",
                        e
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 更新步骤状态：本地计划、转录内的计划副本与审计日志三处保持一致
    fn set_status(
        &self,
        recorder: &mut SessionRecorder,
        session: &mut Session,
        plan_idx: usize,
        plan: &mut ExecutionPlan,
        step: usize,
        status: StepStatus,
    ) -> Result<(), AgentError> {
        plan.steps[step].status = status;
        recorder.record(SessionRecord::StepStatus {
            step_id: plan.steps[step].id,
            status,
        })?;
        if let Some(TranscriptEntry::Plan(p)) = session.transcript.get_mut(plan_idx) {
            p.steps[step].status = status;
        }
        Ok(())
    }

    fn skip_remaining(
        &self,
        recorder: &mut SessionRecorder,
        session: &mut Session,
        plan_idx: usize,
        plan: &mut ExecutionPlan,
        from: usize,
    ) -> Result<(), AgentError> {
        for i in from..plan.steps.len() {
            self.set_status(recorder, session, plan_idx, plan, i, StepStatus::Skipped)?;
        }
        Ok(())
    }

    /// 收尾：任何终态都产出报告。收尾阶段的记录是尽力而为——写入失败
    /// 只降级会话为 Failed 并记日志，报告仍留在返回的 Session 里。
    async fn finish(
        &self,
        mut session: Session,
        recorder: &mut SessionRecorder,
        phase: &mut Phase,
        status: SessionStatus,
    ) -> Session {
        session.status = status;
        let mut durable = self.transition_lossy(recorder, phase, Phase::Reporting);
        if !durable {
            session.status = SessionStatus::Failed;
        }

        let report = self.reporter.report(&session).await;
        durable &= Self::record_lossy(
            recorder,
            SessionRecord::Report {
                report: report.clone(),
            },
        );
        session.report = Some(report);
        if !durable {
            session.status = SessionStatus::Failed;
        }

        let terminal = match session.status {
            SessionStatus::Done => Phase::Done,
            _ => Phase::Failed,
        };
        self.transition_lossy(recorder, phase, terminal);
        Self::record_lossy(
            recorder,
            SessionRecord::SessionClosed {
                status: session.status,
            },
        );
        tracing::info!(session = %session.id, status = ?session.status, "session closed");
        session
    }

    fn transition_lossy(
        &self,
        recorder: &mut SessionRecorder,
        phase: &mut Phase,
        to: Phase,
    ) -> bool {
        let ok = Self::record_lossy(recorder, SessionRecord::Transition { from: *phase, to });
        *phase = to;
        ok
    }

    fn record_lossy(recorder: &mut SessionRecorder, record: SessionRecord) -> bool {
        match recorder.record(record) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "audit record dropped at session close");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalGate, AutoApproveChannel, ScriptedApprovalChannel};
    use crate::llm::ScriptedLlmClient;
    use crate::tools::{FinalAnswerTool, ToolExecutor, ToolRegistry};
    use chrono::Local;
    use std::sync::Arc;

    fn build_loop(llm: Arc<ScriptedLlmClient>, channel: Arc<dyn crate::approval::ApprovalChannel>) -> OrchestrationLoop {
        let mut registry = ToolRegistry::new();
        registry.register(FinalAnswerTool);
        OrchestrationLoop::new(
            Supervisor::new(llm.clone()),
            ToolExecutor::new(registry, 5),
            ApprovalGate::new(channel, 5),
            Verifier::new(llm.clone()),
            Reporter::new(llm),
            3,
            3,
        )
    }

    fn answer_plan() -> String {
        r#"{"goal": "answer", "steps": [{"tool": "final_answer", "args": {"answer": "42"}, "expected": "answer given"}]}"#
            .to_string()
    }

    #[tokio::test]
    async fn test_happy_path_reaches_done_with_report() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            answer_plan(),
            r#"{"verdict": "pass", "feedback": "Answered."}"#.to_string(),
            "The answer is 42.".to_string(),
        ]));
        let orchestration = build_loop(llm.clone(), Arc::new(AutoApproveChannel));
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(tmp.path(), Local::now()).unwrap();

        let session = orchestration.run("what is 6*7", &mut recorder).await.unwrap();
        assert_eq!(session.status, SessionStatus::Done);
        assert_eq!(session.report.as_ref().unwrap().summary, "The answer is 42.");
        assert_eq!(llm.remaining(), 0);
    }

    #[tokio::test]
    async fn test_rejection_replans_then_budget_failure() {
        // 每个修订：计划 + 报告前无验证调用（拒绝合成反馈），最后一次后走报告
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            answer_plan(),
            answer_plan(),
            answer_plan(),
            "Could not complete: every step was rejected.".to_string(),
        ]));
        let channel = Arc::new(ScriptedApprovalChannel::new(vec![
            crate::approval::ApprovalVerdict::Reject,
            crate::approval::ApprovalVerdict::Reject,
            crate::approval::ApprovalVerdict::Reject,
        ]));
        let orchestration = build_loop(llm, channel);
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(tmp.path(), Local::now()).unwrap();

        let session = orchestration.run("do something", &mut recorder).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        // 三个修订都进了转录，反馈是合成的拒绝文案
        let verifications: Vec<_> = session
            .transcript
            .iter()
            .filter_map(|e| match e {
                TranscriptEntry::Verification(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(verifications.len(), 3);
        assert!(verifications.iter().all(|v| v.feedback == "step rejected by user"));
        assert!(session.report.is_some());
    }

    #[tokio::test]
    async fn test_invalid_plan_output_retried_with_hint() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            "not json".to_string(),
            answer_plan(),
            r#"{"verdict": "pass", "feedback": "Answered."}"#.to_string(),
            "done".to_string(),
        ]));
        let orchestration = build_loop(llm, Arc::new(AutoApproveChannel));
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(tmp.path(), Local::now()).unwrap();

        let session = orchestration.run("answer", &mut recorder).await.unwrap();
        assert_eq!(session.status, SessionStatus::Done);
    }

    #[tokio::test]
    async fn test_plan_retry_limit_exhaustion_fails_with_report() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            "junk".to_string(),
            "junk".to_string(),
            "junk".to_string(),
            "Report: planning failed.".to_string(),
        ]));
        let orchestration = build_loop(llm, Arc::new(AutoApproveChannel));
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(tmp.path(), Local::now()).unwrap();

        let session = orchestration.run("answer", &mut recorder).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.report.is_some());
        assert!(session.latest_plan().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_closes_failed_with_report() {
        // 取消后会话仍然收尾：Failed 终态 + 报告（LLM 不可用时为本地回退摘要）
        let llm = Arc::new(ScriptedLlmClient::default());
        let orchestration = build_loop(llm, Arc::new(AutoApproveChannel));
        orchestration.cancel_token().cancel();
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(tmp.path(), Local::now()).unwrap();

        let session = orchestration.run("answer", &mut recorder).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        let report = session.report.as_ref().unwrap();
        assert!(report.summary.contains("answer"));
        assert!(report.summary.contains("failed"));
    }

    #[tokio::test]
    async fn test_cancellation_at_approval_closes_failed_with_report() {
        use crate::approval::{ApprovalChannel, ApprovalDecision, ApprovalRequest};
        use async_trait::async_trait;

        // 审批等待期间触发取消：闸口解除挂起，会话收尾而非被丢弃
        struct SilentChannel;

        #[async_trait]
        impl ApprovalChannel for SilentChannel {
            async fn request(&self, _req: ApprovalRequest) -> Result<ApprovalDecision, String> {
                futures_util::future::pending().await
            }
        }

        let llm = Arc::new(ScriptedLlmClient::new(vec![
            answer_plan(),
            "Cancelled midway.".to_string(),
        ]));
        let orchestration = build_loop(llm, Arc::new(SilentChannel));
        let cancel = orchestration.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(tmp.path(), Local::now()).unwrap();

        let session = orchestration.run("answer", &mut recorder).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.report.is_some());
        // 部分转录保留：计划已经进入会话
        assert!(session.latest_plan().is_some());
    }

    #[tokio::test]
    async fn test_audit_write_failure_closes_failed_with_report() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            "Audit log unavailable.".to_string(),
        ]));
        let orchestration = build_loop(llm, Arc::new(AutoApproveChannel));
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(tmp.path(), Local::now()).unwrap();
        // 会话目录只读：首条记录即失败
        let mut perms = std::fs::metadata(recorder.dir()).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(recorder.dir(), perms).unwrap();

        let session = orchestration.run("answer", &mut recorder).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.report.is_some());

        let mut perms = std::fs::metadata(recorder.dir()).unwrap().permissions();
        perms.set_readonly(false);
        std::fs::set_permissions(recorder.dir(), perms).unwrap();
    }
}
