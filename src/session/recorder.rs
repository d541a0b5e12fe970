//! 会话审计日志：只追加、可重放
//!
//! 每个会话在日志根目录下建一个以启动时间命名的子目录，内部是顺序编号的 JSON 记录，
//! 每条含单调递增的序号、墙钟时间戳与完整序列化实体，足以全序排列并重放会话。
//! 每次状态转换与每个产生的实体都在循环推进前落盘（write + fsync）；
//! 写入失败是 BackupWrite 错误，阻断推进，绝不静默吞掉。

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::schema::{ExecutionPlan, Report, StepStatus, ToolResult, VerificationResult};
use crate::approval::ApprovalDecision;
use crate::core::error::AgentError;
use crate::core::Phase;
use crate::session::SessionStatus;

/// 单条审计记录（实体或状态转换）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionRecord {
    SessionStarted {
        session_id: Uuid,
        instruction: String,
    },
    Transition {
        from: Phase,
        to: Phase,
    },
    Plan {
        plan: ExecutionPlan,
    },
    StepStatus {
        step_id: Uuid,
        status: StepStatus,
    },
    Approval {
        decision: ApprovalDecision,
    },
    ToolResult {
        result: ToolResult,
    },
    Verification {
        result: VerificationResult,
    },
    Report {
        report: Report,
    },
    SessionClosed {
        status: SessionStatus,
    },
}

/// 落盘信封：序号 + 时间戳 + 记录
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub record: SessionRecord,
}

/// 会话记录器：只追加；seq 由单一编排线程推进，无需额外锁
pub struct SessionRecorder {
    dir: PathBuf,
    seq: u64,
}

impl SessionRecorder {
    /// 在日志根目录下创建会话目录（以启动时间命名；同秒冲突时加序号后缀）
    pub fn create(log_root: &Path, started_at: DateTime<Local>) -> Result<Self, AgentError> {
        std::fs::create_dir_all(log_root)
            .map_err(|e| AgentError::BackupWrite(format!("create log root: {}", e)))?;

        let base = started_at.format("%Y%m%d_%H%M%S").to_string();
        let mut dir = log_root.join(&base);
        let mut suffix = 2;
        while dir.exists() {
            dir = log_root.join(format!("{}_{:02}", base, suffix));
            suffix += 1;
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| AgentError::BackupWrite(format!("create session dir: {}", e)))?;

        Ok(Self { dir, seq: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 追加一条记录并 fsync；返回分配的序号
    pub fn record(&mut self, record: SessionRecord) -> Result<u64, AgentError> {
        self.seq += 1;
        let envelope = RecordEnvelope {
            seq: self.seq,
            timestamp: Local::now(),
            record,
        };
        let path = self.dir.join(format!("{:04}.json", self.seq));
        let data = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| AgentError::BackupWrite(format!("serialize record: {}", e)))?;

        let mut file = File::create(&path)
            .map_err(|e| AgentError::BackupWrite(format!("create {}: {}", path.display(), e)))?;
        file.write_all(&data)
            .map_err(|e| AgentError::BackupWrite(format!("write {}: {}", path.display(), e)))?;
        // 崩溃后已记录的实体不丢失
        file.sync_all()
            .map_err(|e| AgentError::BackupWrite(format!("sync {}: {}", path.display(), e)))?;

        Ok(self.seq)
    }
}
