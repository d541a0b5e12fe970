//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `UKA__*` 覆盖（双下划线表示嵌套，如 `UKA__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// [app] 段：应用名、沙箱根目录、重试预算
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 每个会话允许的计划修订轮数（Planning→Verifying 为一轮）
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 计划输出畸形时，带「重新生成」提示再调用 Supervisor 的次数上限
    #[serde(default = "default_plan_retry_limit")]
    pub plan_retry_limit: u32,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: None,
            max_iterations: default_max_iterations(),
            plan_retry_limit: default_plan_retry_limit(),
        }
    }
}

fn default_max_iterations() -> u32 {
    3
}

fn default_plan_retry_limit() -> u32 {
    3
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；base_url 可指向任意 OpenAI 兼容端点
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [tools] 段：工具超时、Shell 白名单
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "cargo".into(),
        "rustc".into(),
    ]
}

/// [session] 段：会话日志根目录与审批等待超时
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 会话日志根目录；每个会话在其下建一个以启动时间命名的子目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 审批等待超时（秒）；超时视为 Reject
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            approval_timeout_secs: default_approval_timeout_secs(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("agent_log")
}

fn default_approval_timeout_secs() -> u64 {
    120
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            tools: ToolsSection::default(),
            session: SessionSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 UKA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 UKA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("UKA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder
        .build()
        .map_err(|e| AgentError::Config(e.to_string()))?;
    c.try_deserialize()
        .map_err(|e| AgentError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_iterations, 3);
        assert_eq!(cfg.app.plan_retry_limit, 3);
        assert_eq!(cfg.session.approval_timeout_secs, 120);
        assert_eq!(cfg.session.log_dir, PathBuf::from("agent_log"));
        assert!(cfg.tools.shell.allowed_commands.contains(&"ls".to_string()));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.toml");
        std::fs::write(&path, "[app\nname = ===").unwrap();
        let err = load_config(Some(path)).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
