//! final_answer 工具
//!
//! Supervisor 的「直接回答」出口：当用户问题无需其它工具，或所有任务完成、准备返回最终答案时，
//! 计划以一步 final_answer 收尾，answer 参数即给用户的完整回答。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// final_answer 工具：原样返回 answer 参数
pub struct FinalAnswerTool;

#[async_trait]
impl Tool for FinalAnswerTool {
    fn name(&self) -> &str {
        "final_answer"
    }

    fn description(&self) -> &str {
        "Return the final answer to the user directly. Use when no other tool is needed, or the task is complete."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "answer": {
                    "type": "string",
                    "description": "The complete answer to give the user"
                }
            },
            "required": ["answer"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let answer = args
            .get("answer")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(answer.to_string())
    }
}
