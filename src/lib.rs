//! UKA - Rust 任务编排智能体
//!
//! 单条用户指令经过 计划 → 审批 → 执行 → 验证 → 报告 的闭环处理：
//! Supervisor 产出带修订号的执行计划，每一步经审批闸口放行后由工具执行器
//! 在沙箱内执行，Verifier 裁决结果，失败则带反馈重新计划（次数受配置约束），
//! 全程写入只追加、可重放的会话审计日志，最终无论成败都产出报告。
//!
//! 模块：
//! - core: 错误类型与编排循环（状态机）
//! - agents: Supervisor / Verifier / Reporter 与共享实体
//! - approval: 审批闸口与审批通道抽象
//! - tools: 工具 trait、注册表、执行器与内置工具（沙箱文件系统 / Shell / final_answer）
//! - session: 会话值、审计记录器与日志重放
//! - llm: LLM 客户端抽象（OpenAI 兼容 / Mock）
//! - config: 应用配置
//! - observability: tracing 初始化

pub mod agents;
pub mod approval;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod session;
pub mod tools;
