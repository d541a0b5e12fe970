//! 审批闸口：执行任何步骤前的人工检查点
//!
//! 编排循环把待执行步骤包装为 ApprovalRequest 发给审批通道（显式挂起点，
//! 而非 UI 回调耦合），在配置的超时内等待 Approve / Reject / Edit 决定：
//! 超时视为 Reject；Edit 允许修订参数后执行，单轮内不要求二次审批。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::schema::Step;
use crate::core::AgentError;
use crate::tools::Effect;

/// 审批裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
    Approve,
    Reject,
    Edit,
}

/// 审批决定：Edit 时携带修订后的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub step_id: Uuid,
    pub verdict: ApprovalVerdict,
    pub edited_args: Option<Value>,
}

impl ApprovalDecision {
    pub fn approve(step_id: Uuid) -> Self {
        Self {
            step_id,
            verdict: ApprovalVerdict::Approve,
            edited_args: None,
        }
    }

    pub fn reject(step_id: Uuid) -> Self {
        Self {
            step_id,
            verdict: ApprovalVerdict::Reject,
            edited_args: None,
        }
    }

    pub fn edit(step_id: Uuid, args: Value) -> Self {
        Self {
            step_id,
            verdict: ApprovalVerdict::Edit,
            edited_args: Some(args),
        }
    }
}

/// 呈现给审批方的步骤描述：工具名、参数、预期结果与副作用类别
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub step_id: Uuid,
    pub tool: String,
    pub args: Value,
    pub expected: String,
    pub effect: Effect,
}

impl ApprovalRequest {
    pub fn from_step(step: &Step, effect: Effect) -> Self {
        Self {
            step_id: step.id,
            tool: step.tool.clone(),
            args: step.args.clone(),
            expected: step.expected.clone(),
            effect,
        }
    }
}

/// 审批通道 trait：前端（stdin / TUI / 远端）实现此接口即可接入
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// 等待人工决定；实现方可以无限等待，超时由 ApprovalGate 统一处理
    async fn request(&self, req: ApprovalRequest) -> Result<ApprovalDecision, String>;
}

/// 审批闸口：包装通道与超时；超时与通道错误都折算为 Reject（步骤不执行）
pub struct ApprovalGate {
    channel: std::sync::Arc<dyn ApprovalChannel>,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(channel: std::sync::Arc<dyn ApprovalChannel>, timeout_secs: u64) -> Self {
        Self {
            channel,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 为单个 Pending 步骤取得决定。返回 Err 仅当用户取消了整个会话。
    pub async fn decide(
        &self,
        step: &Step,
        effect: Effect,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision, AgentError> {
        let req = ApprovalRequest::from_step(step, effect);
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, self.channel.request(req)) => {
                match outcome {
                    Ok(Ok(decision)) => Ok(decision),
                    Ok(Err(e)) => {
                        tracing::warn!(step = %step.id, error = %e, "approval channel failed, treating as reject");
                        Ok(ApprovalDecision::reject(step.id))
                    }
                    Err(_) => {
                        tracing::warn!(step = %step.id, "approval timed out, treating as reject");
                        Ok(ApprovalDecision::reject(step.id))
                    }
                }
            }
        }
    }
}

/// 自动批准通道：非交互运行（如测试、批处理）使用
#[derive(Debug, Default)]
pub struct AutoApproveChannel;

#[async_trait]
impl ApprovalChannel for AutoApproveChannel {
    async fn request(&self, req: ApprovalRequest) -> Result<ApprovalDecision, String> {
        Ok(ApprovalDecision::approve(req.step_id))
    }
}

/// 脚本化审批通道：按预置顺序弹出裁决（测试用）；脚本耗尽时批准
#[derive(Debug, Default)]
pub struct ScriptedApprovalChannel {
    verdicts: Mutex<VecDeque<ApprovalVerdict>>,
    edited_args: Mutex<Option<Value>>,
}

impl ScriptedApprovalChannel {
    pub fn new(verdicts: Vec<ApprovalVerdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            edited_args: Mutex::new(None),
        }
    }

    /// 设置 Edit 裁决时返回的修订参数
    pub fn with_edited_args(self, args: Value) -> Self {
        if let Ok(mut e) = self.edited_args.lock() {
            *e = Some(args);
        }
        self
    }
}

#[async_trait]
impl ApprovalChannel for ScriptedApprovalChannel {
    async fn request(&self, req: ApprovalRequest) -> Result<ApprovalDecision, String> {
        let verdict = self
            .verdicts
            .lock()
            .map_err(|_| "scripted verdicts poisoned".to_string())?
            .pop_front()
            .unwrap_or(ApprovalVerdict::Approve);
        Ok(match verdict {
            ApprovalVerdict::Approve => ApprovalDecision::approve(req.step_id),
            ApprovalVerdict::Reject => ApprovalDecision::reject(req.step_id),
            ApprovalVerdict::Edit => {
                let args = self
                    .edited_args
                    .lock()
                    .ok()
                    .and_then(|e| e.clone())
                    .unwrap_or(req.args);
                ApprovalDecision::edit(req.step_id, args)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::schema::StepStatus;
    use std::sync::Arc;

    fn step() -> Step {
        Step {
            id: Uuid::new_v4(),
            tool: "echo".into(),
            args: serde_json::json!({}),
            expected: String::new(),
            status: StepStatus::Pending,
        }
    }

    /// 永不回复的通道，用于超时测试
    struct SilentChannel;

    #[async_trait]
    impl ApprovalChannel for SilentChannel {
        async fn request(&self, _req: ApprovalRequest) -> Result<ApprovalDecision, String> {
            futures_util::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reject() {
        let gate = ApprovalGate::new(Arc::new(SilentChannel), 0);
        let s = step();
        let decision = gate
            .decide(&s, Effect::ReadOnly, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision.verdict, ApprovalVerdict::Reject);
        assert_eq!(decision.step_id, s.id);
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let gate = ApprovalGate::new(Arc::new(SilentChannel), 60);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gate
            .decide(&step(), Effect::ReadOnly, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_scripted_sequence() {
        let channel = ScriptedApprovalChannel::new(vec![
            ApprovalVerdict::Reject,
            ApprovalVerdict::Approve,
        ]);
        let gate = ApprovalGate::new(Arc::new(channel), 5);
        let cancel = CancellationToken::new();
        let d1 = gate.decide(&step(), Effect::Mutating, &cancel).await.unwrap();
        let d2 = gate.decide(&step(), Effect::Mutating, &cancel).await.unwrap();
        assert_eq!(d1.verdict, ApprovalVerdict::Reject);
        assert_eq!(d2.verdict, ApprovalVerdict::Approve);
    }

    #[tokio::test]
    async fn test_edit_carries_args() {
        let channel = ScriptedApprovalChannel::new(vec![ApprovalVerdict::Edit])
            .with_edited_args(serde_json::json!({"path": "b.txt"}));
        let gate = ApprovalGate::new(Arc::new(channel), 5);
        let d = gate
            .decide(&step(), Effect::Mutating, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(d.verdict, ApprovalVerdict::Edit);
        assert_eq!(d.edited_args, Some(serde_json::json!({"path": "b.txt"})));
    }
}
