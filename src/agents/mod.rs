//! Agent 角色层：计划 / 验证 / 报告
//!
//! 三个角色各自持有 LLM 客户端、无共享可变状态，由编排循环串联调用；
//! 共享实体与 LLM 输出解析集中在 schema。

pub mod reporter;
pub mod schema;
pub mod supervisor;
pub mod verifier;

pub use reporter::Reporter;
pub use schema::{
    ExecutionPlan, Report, Step, StepStatus, ToolResult, Verdict, VerificationResult,
};
pub use supervisor::Supervisor;
pub use verifier::Verifier;
