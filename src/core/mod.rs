//! 核心层：错误类型与编排循环

pub mod error;
pub mod loop_;

pub use error::AgentError;
pub use loop_::{OrchestrationLoop, Phase};
