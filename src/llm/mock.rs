//! Mock LLM 客户端（用于测试，无需 API）
//!
//! MockLlmClient 对任意输入返回一个单步 final_answer 计划，便于本地跑通整个编排流程；
//! ScriptedLlmClient 按预置脚本依次吐出响应（计划 / 验证 / 报告），供集成测试精确控制每次补全。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：将用户最后一条消息包装为 final_answer 单步计划
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!(
            r#"{{"goal": "Answer directly", "steps": [{{"tool": "final_answer", "args": {{"answer": "Echo from Mock: {}"}}, "expected": "answer returned"}}]}}"#,
            last_user.replace('"', "'")
        ))
    }
}

/// 脚本化客户端：complete 依次弹出预置响应；脚本耗尽时返回错误
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    /// 追加一条脚本响应
    pub fn push(&self, response: impl Into<String>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(response.into());
        }
    }

    /// 剩余未消费的脚本条数
    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        self.responses
            .lock()
            .map_err(|_| "scripted responses poisoned".to_string())?
            .pop_front()
            .ok_or_else(|| "scripted responses exhausted".to_string())
    }
}
