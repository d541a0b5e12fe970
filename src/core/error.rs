//! Agent 错误类型
//!
//! 覆盖会话生命周期各环节：计划生成（有限重试后致命）、工具执行（吸收为步骤失败）、
//! 重试预算耗尽（致命）、审计写入失败（阻断推进）。审批超时与拒绝不是错误：
//! 闸口把它们折算为 Reject 决定，作为未执行的步骤失败进入验证反馈。

use thiserror::Error;

/// 会话运行过程中可能出现的错误（计划、审批、工具、审计、取消等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 计划输出无法通过 Step schema 校验（缺字段、未知工具、参数畸形）；
    /// Supervisor 内部不重试，由编排循环带「重新生成」提示再调用，超出上限后致命
    #[error("Plan generation failed: {0}")]
    PlanGeneration(String),

    /// 工具调用失败或参数与 schema 不匹配；吸收为步骤 Failed，进入验证反馈
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// 重新计划次数达到 max_iterations，会话进入 Failed 终态
    #[error("Retry budget exceeded after {0} plan revisions")]
    RetryBudgetExceeded(u32),

    /// 会话审计日志写入失败；不可静默丢弃，阻断状态推进
    #[error("Backup write failed: {0}")]
    BackupWrite(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    /// 路径逃逸（如 ../../etc/passwd），沙箱拒绝访问
    #[error("Access denied: path escapes workspace: {0}")]
    PathEscape(String),
}
