//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / effect / execute），
//! 由 ToolRegistry 按名注册与查找。参数校验在两处进行：计划校验（Supervisor 产出时）
//! 与执行前校验（ToolExecutor 调用前），两处共用 validate_args。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具副作用类别：只读 or 变更（审批提示与审计元数据中展示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    ReadOnly,
    Mutating,
}

impl Effect {
    pub fn label(&self) -> &'static str {
        match self {
            Effect::ReadOnly => "read-only",
            Effect::Mutating => "mutating",
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、副作用类别、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划中 "tool" 字段引用的名字）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式，也是两处校验的依据）
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 副作用类别；默认只读，有写入/执行副作用的工具必须覆盖为 Mutating
    fn effect(&self) -> Effect {
        Effect::ReadOnly
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，支持 register / get / validate_args / tool_names
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称校验参数是否符合工具声明的 schema：
    /// 未知工具、args 非对象、缺少 required 键均为错误。多余键不在此处拒绝（执行前剔除）。
    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {}", name))?;

        let schema = tool.parameters_schema();
        let obj = args
            .as_object()
            .ok_or_else(|| format!("Arguments for '{}' must be a JSON object", name))?;

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    return Err(format!("Missing required argument '{}' for tool '{}'", key, name));
                }
            }
        }
        Ok(())
    }

    /// 剔除 schema 未声明的多余键（LLM 偶尔会发明参数名），返回净化后的 args
    pub fn sanitize_args(&self, name: &str, args: &Value) -> Value {
        let Some(tool) = self.tools.get(name) else {
            return args.clone();
        };
        let schema = tool.parameters_schema();
        let Some(props) = schema.get("properties").and_then(|p| p.as_object()) else {
            return args.clone();
        };
        let Some(obj) = args.as_object() else {
            return args.clone();
        };
        let kept: serde_json::Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| props.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(kept)
    }

    /// 返回工具清单的 prompt 片段：名称、描述、每个参数的类型/必填/说明
    pub fn tools_prompt_section(&self) -> String {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        let mut lines = Vec::new();
        for name in names {
            let tool = &self.tools[name];
            lines.push(format!("Tool: {} [{}]", name, tool.effect().label()));
            lines.push(format!("  Description: {}", tool.description()));
            let schema = tool.parameters_schema();
            let required: Vec<&str> = schema
                .get("required")
                .and_then(|r| r.as_array())
                .map(|a| a.iter().filter_map(|k| k.as_str()).collect())
                .unwrap_or_default();
            if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
                if !props.is_empty() {
                    lines.push("  Arguments:".to_string());
                    for (prop, details) in props {
                        let ty = details.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                        let desc = details
                            .get("description")
                            .and_then(|d| d.as_str())
                            .unwrap_or("");
                        let req = if required.contains(&prop.as_str()) {
                            "required"
                        } else {
                            "optional"
                        };
                        lines.push(format!("    - {} ({}, {}): {}", prop, ty, req, desc));
                    }
                }
            }
            lines.push("-".repeat(20));
        }
        lines.join("\n")
    }
}
