//! Shell 执行工具：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、chmod 777 等子串；
//! 在工作目录内通过 sh -c / cmd /C 执行。超时由 ToolExecutor 统一施加。

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::{Effect, Tool};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// run_shell_command 工具：仅允许白名单内命令，工作目录固定为沙箱根
pub struct RunShellCommandTool {
    allowed_commands: HashSet<String>,
    workdir: PathBuf,
}

impl RunShellCommandTool {
    pub fn new(allowed_commands: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            workdir: workdir.into(),
        }
    }

    /// 解析命令：只取第一个 token 作为命令名
    fn command_name<'a>(&self, raw: &'a str) -> &'a str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = self.command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }
}

#[async_trait]
impl Tool for RunShellCommandTool {
    fn name(&self) -> &str {
        "run_shell_command"
    }

    fn description(&self) -> &str {
        "Run a whitelisted shell command in the workspace directory."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (first word must be in the allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    fn effect(&self) -> Effect {
        Effect::Mutating
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.is_allowed(command)?;

        tracing::info!(command = %command, "run_shell_command execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.workdir);

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status, stderr.trim()));
        }
        Ok(if stderr.is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> RunShellCommandTool {
        RunShellCommandTool::new(vec!["echo".into(), "ls".into()], ".")
    }

    #[test]
    fn test_allowlist_blocks_unknown_command() {
        assert!(tool().is_allowed("python evil.py").is_err());
        assert!(tool().is_allowed("ls -la").is_ok());
    }

    #[test]
    fn test_forbidden_pattern_blocked_even_when_allowed() {
        let t = RunShellCommandTool::new(vec!["rm".into()], ".");
        assert!(t.is_allowed("rm -rf /").is_err());
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let out = tool()
            .execute(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
