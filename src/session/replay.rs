//! 会话日志重放
//!
//! 按序号读取会话目录的记录，确定性地重建完整转录与最终报告；
//! 不访问补全服务或任何外部接口——给定相同日志，重放结果恒同。

use std::path::Path;

use crate::core::error::AgentError;
use crate::session::recorder::{RecordEnvelope, SessionRecord};
use crate::session::{Session, TranscriptEntry};

/// 从会话目录重建 Session；序号必须从 1 连续递增，首条必须是 SessionStarted
pub fn replay_session(dir: &Path) -> Result<Session, AgentError> {
    // 按文件名的数字序排序（词法序在超过补零宽度后会乱序）
    let mut files: Vec<(u64, std::path::PathBuf)> = std::fs::read_dir(dir)
        .map_err(|e| AgentError::BackupWrite(format!("read session dir: {}", e)))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
        .filter_map(|p| {
            let seq = p.file_stem()?.to_str()?.parse::<u64>().ok()?;
            Some((seq, p))
        })
        .collect();
    files.sort_by_key(|(seq, _)| *seq);
    let files: Vec<_> = files.into_iter().map(|(_, p)| p).collect();

    if files.is_empty() {
        return Err(AgentError::BackupWrite(format!(
            "no records in {}",
            dir.display()
        )));
    }

    let mut session: Option<Session> = None;
    let mut expected_seq = 1;

    for path in files {
        let data = std::fs::read_to_string(&path)
            .map_err(|e| AgentError::BackupWrite(format!("read {}: {}", path.display(), e)))?;
        let envelope: RecordEnvelope = serde_json::from_str(&data)
            .map_err(|e| AgentError::BackupWrite(format!("parse {}: {}", path.display(), e)))?;

        if envelope.seq != expected_seq {
            return Err(AgentError::BackupWrite(format!(
                "gap in session log: expected seq {}, found {}",
                expected_seq, envelope.seq
            )));
        }
        expected_seq += 1;

        match envelope.record {
            SessionRecord::SessionStarted {
                session_id,
                instruction,
            } => {
                let mut s = Session::new(instruction);
                s.id = session_id;
                s.started_at = envelope.timestamp;
                session = Some(s);
            }
            record => {
                let s = session.as_mut().ok_or_else(|| {
                    AgentError::BackupWrite("log does not start with session_started".into())
                })?;
                apply(s, record);
            }
        }
    }

    session.ok_or_else(|| AgentError::BackupWrite("log does not start with session_started".into()))
}

fn apply(session: &mut Session, record: SessionRecord) {
    match record {
        SessionRecord::Plan { plan } => {
            session.push(TranscriptEntry::Plan(plan));
        }
        SessionRecord::StepStatus { step_id, status } => {
            // 状态更新落在最新修订的对应步骤上
            if let Some(TranscriptEntry::Plan(plan)) = session
                .transcript
                .iter_mut()
                .rev()
                .find(|e| matches!(e, TranscriptEntry::Plan(_)))
            {
                if let Some(step) = plan.step_mut(step_id) {
                    step.status = status;
                }
            }
        }
        SessionRecord::Approval { decision } => {
            session.push(TranscriptEntry::Approval(decision));
        }
        SessionRecord::ToolResult { result } => {
            session.push(TranscriptEntry::ToolResult(result));
        }
        SessionRecord::Verification { result } => {
            session.push(TranscriptEntry::Verification(result));
        }
        SessionRecord::Report { report } => {
            session.report = Some(report);
        }
        SessionRecord::SessionClosed { status } => {
            session.status = status;
        }
        SessionRecord::Transition { .. } | SessionRecord::SessionStarted { .. } => {}
    }
}
