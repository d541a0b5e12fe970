//! 会话：单条指令从接收到最终报告的完整生命周期
//!
//! Session 在指令到达时创建，仅由编排循环变更，到达终态后关闭；
//! 它拥有本次任务的全部实体（各修订的计划、审批、结果、验证与报告）。

pub mod recorder;
pub mod replay;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::schema::{
    format_execution_summary, ExecutionPlan, Report, ToolResult, VerificationResult,
};
use crate::approval::ApprovalDecision;
use crate::llm::Message;

pub use recorder::{SessionRecord, SessionRecorder};
pub use replay::replay_session;

/// 会话终态；Running 仅在进行中出现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Done,
    Failed,
}

/// 转录条目：按产生顺序追加，构成可重放的完整记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Plan(ExecutionPlan),
    Approval(ApprovalDecision),
    ToolResult(ToolResult),
    Verification(VerificationResult),
}

/// 单次指令处理的会话值：显式传递，无环境可变全局
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Local>,
    /// 原始用户指令；会话开始后不可变
    pub instruction: String,
    pub transcript: Vec<TranscriptEntry>,
    pub report: Option<Report>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Local::now(),
            instruction: instruction.into(),
            transcript: Vec::new(),
            report: None,
            status: SessionStatus::Running,
        }
    }

    /// 追加转录条目，返回其下标（报告引用用）
    pub fn push(&mut self, entry: TranscriptEntry) -> usize {
        self.transcript.push(entry);
        self.transcript.len() - 1
    }

    /// 最新计划（最高修订）
    pub fn latest_plan(&self) -> Option<&ExecutionPlan> {
        self.transcript.iter().rev().find_map(|e| match e {
            TranscriptEntry::Plan(p) => Some(p),
            _ => None,
        })
    }

    /// 属于某修订的工具结果
    pub fn results_for(&self, plan: &ExecutionPlan) -> Vec<&ToolResult> {
        let ids: Vec<Uuid> = plan.steps.iter().map(|s| s.id).collect();
        self.transcript
            .iter()
            .filter_map(|e| match e {
                TranscriptEntry::ToolResult(r) if ids.contains(&r.step_id) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// 供 Supervisor 重新计划用的上下文消息：指令 + 历次尝试的执行摘要与验证反馈
    pub fn context_messages(&self) -> Vec<Message> {
        let mut messages = vec![Message::user(self.instruction.clone())];
        let mut current_plan: Option<&ExecutionPlan> = None;
        for entry in &self.transcript {
            match entry {
                TranscriptEntry::Plan(p) => current_plan = Some(p),
                TranscriptEntry::Verification(v) => {
                    if let Some(plan) = current_plan {
                        let results: Vec<ToolResult> =
                            self.results_for(plan).into_iter().cloned().collect();
                        let summary = format_execution_summary(plan, &results);
                        messages.push(Message::assistant(format!(
                            "Attempt {} execution result:\n{}\nVerifier feedback: {}",
                            plan.revision, summary, v.feedback
                        )));
                    }
                }
                _ => {}
            }
        }
        messages
    }

    /// 最新修订的转录条目下标（报告引用）
    pub fn latest_revision_indices(&self) -> Vec<usize> {
        let Some(latest) = self.latest_plan() else {
            return Vec::new();
        };
        let rev = latest.revision;
        let mut in_latest = false;
        let mut indices = Vec::new();
        for (i, entry) in self.transcript.iter().enumerate() {
            if let TranscriptEntry::Plan(p) = entry {
                in_latest = p.revision == rev;
            }
            if in_latest {
                indices.push(i);
            }
        }
        indices
    }
}
