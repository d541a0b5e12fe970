//! Supervisor：计划立案
//!
//! 由用户指令、会话上下文与（可选的）验证反馈产出新的 ExecutionPlan，修订号逐次 +1。
//! 输出经类型化校验边界（schema.rs），畸形输出是 PlanGeneration 错误——Supervisor
//! 内部不重试，由编排循环决定是否带「重新生成」提示再调用。除补全调用外无副作用。

use std::sync::Arc;

use crate::agents::schema::{plan_schema_json, ExecutionPlan};
use crate::core::error::AgentError;
use crate::llm::{LlmClient, Message};
use crate::tools::ToolRegistry;

/// 计划立案：持有 LLM，prompt 动态拼装（工具清单 + 输出 schema + 反馈块）
pub struct Supervisor {
    llm: Arc<dyn LlmClient>,
}

impl Supervisor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn system_prompt(
        &self,
        registry: &ToolRegistry,
        feedback: Option<&str>,
        regenerate_hint: Option<&str>,
    ) -> String {
        let mut prompt = String::from(
            "You are a meticulous planning AI. Produce a complete, gap-free execution plan \
             that fulfils the user's request using only the tools listed below.\n\n",
        );

        if let Some(fb) = feedback {
            prompt.push_str(&format!(
                "IMPORTANT: the previous attempt failed. Verifier feedback:\n---\n{}\n---\n\
                 Produce a NEW plan that resolves this feedback.\n\n",
                fb
            ));
        }
        if let Some(hint) = regenerate_hint {
            prompt.push_str(&format!(
                "IMPORTANT: your previous output was invalid and has been discarded. {}\n\n",
                hint
            ));
        }

        prompt.push_str(&format!(
            "Available tools:\n{}\n\n\
             Planning rules:\n\
             1. Ambiguous locations like 'the root directory' or 'here' always mean the \
                workspace root '.'; never plan absolute filesystem paths.\n\
             2. Prefer the most direct tool that achieves the goal in the fewest steps.\n\
             3. If the request is a general knowledge question, or the task is complete and \
                you are ready to answer, plan a single final_answer step with the full answer \
                in the 'answer' argument.\n\
             4. Every step needs an 'expected' description of its intended outcome.\n\n\
             Respond with exactly one JSON object matching this schema (no prose outside it):\n{}\n",
            registry.tools_prompt_section(),
            plan_schema_json()
        ));
        prompt
    }

    /// 立案：context 为指令与历次尝试摘要；revision 由编排循环递增传入。
    /// 校验失败（缺字段、未知工具、参数畸形）原样上抛，不在此处重试。
    pub async fn plan(
        &self,
        context: &[Message],
        registry: &ToolRegistry,
        feedback: Option<&str>,
        regenerate_hint: Option<&str>,
        revision: u32,
    ) -> Result<ExecutionPlan, AgentError> {
        let system = self.system_prompt(registry, feedback, regenerate_hint);
        let mut messages = vec![Message::system(system)];
        messages.extend(context.to_vec());

        if feedback.is_some() {
            tracing::info!(revision, "re-planning with verifier feedback");
        }

        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::Llm)?;

        ExecutionPlan::from_llm_output(&output, revision, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::tools::{FinalAnswerTool, ToolRegistry};

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(FinalAnswerTool);
        reg
    }

    #[tokio::test]
    async fn test_plan_valid_output() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            r#"{"goal": "answer", "steps": [{"tool": "final_answer", "args": {"answer": "hi"}, "expected": "answered"}]}"#.to_string(),
        ]));
        let supervisor = Supervisor::new(llm);
        let plan = supervisor
            .plan(&[Message::user("hello")], &registry(), None, None, 1)
            .await
            .unwrap();
        assert_eq!(plan.revision, 1);
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_output_is_plan_generation_error() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["not json at all".to_string()]));
        let supervisor = Supervisor::new(llm);
        let err = supervisor
            .plan(&[Message::user("hello")], &registry(), None, None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PlanGeneration(_)));
    }

    #[tokio::test]
    async fn test_prompt_carries_feedback_and_hint() {
        let supervisor = Supervisor::new(Arc::new(ScriptedLlmClient::default()));
        let prompt = supervisor.system_prompt(
            &registry(),
            Some("step rejected by user"),
            Some("Output only the JSON object."),
        );
        assert!(prompt.contains("step rejected by user"));
        assert!(prompt.contains("Output only the JSON object."));
        assert!(prompt.contains("final_answer"));
    }
}
