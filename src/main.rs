//! UKA - 任务编排智能体 CLI
//!
//! 入口：初始化日志与配置，逐行读取用户指令，每条指令建一个带审计日志的会话，
//! 由编排循环驱动到终态后打印报告。审批通过 stdin 交互（y 批准 / n 拒绝 / e 编辑参数）。

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use tokio::task::spawn_blocking;

use uka::agents::{Reporter, Supervisor, Verifier};
use uka::approval::{
    ApprovalChannel, ApprovalDecision, ApprovalGate, ApprovalRequest,
};
use uka::config::{load_config, AppConfig};
use uka::core::OrchestrationLoop;
use uka::llm::{create_llm_from_config, LlmClient};
use uka::session::{SessionRecorder, SessionStatus};
use uka::tools::{
    AppendToFileTool, CreateDirectoryTool, DeleteFileTool, FinalAnswerTool, FindFilesTool,
    ListFilesTool, ReadFileTool, RunShellCommandTool, SafeFs, ToolExecutor, ToolRegistry,
    WriteFileTool,
};

/// stdin 审批通道：打印待执行步骤，等用户输入一行决定
struct StdinApprovalChannel;

#[async_trait]
impl ApprovalChannel for StdinApprovalChannel {
    async fn request(&self, req: ApprovalRequest) -> Result<ApprovalDecision, String> {
        println!(
            "\n[approval] {} ({})\n  args: {}\n  expected: {}",
            req.tool,
            req.effect.label(),
            serde_json::to_string(&req.args).unwrap_or_default(),
            req.expected
        );
        print!("  approve? [y/n/e(dit)] ");
        std::io::stdout().flush().ok();

        let line = spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map(|_| line)
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())??;

        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(ApprovalDecision::approve(req.step_id)),
            "e" | "edit" => {
                print!("  new args (JSON object): ");
                std::io::stdout().flush().ok();
                let raw = spawn_blocking(|| {
                    let mut line = String::new();
                    std::io::stdin()
                        .read_line(&mut line)
                        .map(|_| line)
                        .map_err(|e| e.to_string())
                })
                .await
                .map_err(|e| e.to_string())??;
                match serde_json::from_str(raw.trim()) {
                    Ok(args) => Ok(ApprovalDecision::edit(req.step_id, args)),
                    Err(e) => {
                        println!("  invalid JSON ({}), step rejected", e);
                        Ok(ApprovalDecision::reject(req.step_id))
                    }
                }
            }
            _ => Ok(ApprovalDecision::reject(req.step_id)),
        }
    }
}

/// 按配置组装工具注册表；备份目录指向本会话的日志目录
fn build_registry(cfg: &AppConfig, workspace: &std::path::Path, session_dir: &std::path::Path) -> ToolRegistry {
    let fs = SafeFs::new(workspace).with_backup_dir(session_dir.join("backups"));
    let mut registry = ToolRegistry::new();
    registry.register(ListFilesTool::new(fs.clone()));
    registry.register(FindFilesTool::new(fs.clone()));
    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(WriteFileTool::new(fs.clone()));
    registry.register(AppendToFileTool::new(fs.clone()));
    registry.register(CreateDirectoryTool::new(fs.clone()));
    registry.register(DeleteFileTool::new(fs));
    registry.register(RunShellCommandTool::new(
        cfg.tools.shell.allowed_commands.clone(),
        workspace,
    ));
    registry.register(FinalAnswerTool);
    registry
}

fn build_loop(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    registry: ToolRegistry,
) -> OrchestrationLoop {
    OrchestrationLoop::new(
        Supervisor::new(llm.clone()),
        ToolExecutor::new(registry, cfg.tools.tool_timeout_secs),
        ApprovalGate::new(Arc::new(StdinApprovalChannel), cfg.session.approval_timeout_secs),
        Verifier::new(llm.clone()),
        Reporter::new(llm),
        cfg.app.max_iterations,
        cfg.app.plan_retry_limit,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    uka::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let workspace = cfg
        .app
        .workspace_root
        .clone()
        .unwrap_or_else(|| "workspace".into());
    std::fs::create_dir_all(&workspace).context("Failed to create workspace")?;
    std::fs::create_dir_all(&cfg.session.log_dir).context("Failed to create log dir")?;

    let llm = create_llm_from_config(&cfg);

    println!(
        "{} ready. Type an instruction, or 'exit' to quit.",
        cfg.app.name.as_deref().unwrap_or("uka")
    );

    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if std::io::stdin()
            .read_line(&mut line)
            .context("stdin read failed")?
            == 0
        {
            break;
        }
        let instruction = line.trim();
        if instruction.is_empty() {
            continue;
        }
        if matches!(instruction, "exit" | "quit") {
            break;
        }

        let mut recorder = SessionRecorder::create(&cfg.session.log_dir, Local::now())
            .context("Failed to create session log")?;
        let registry = build_registry(&cfg, &workspace, recorder.dir());
        let orchestration = build_loop(&cfg, llm.clone(), registry);

        match orchestration.run(instruction, &mut recorder).await {
            Ok(session) => {
                let status = match session.status {
                    SessionStatus::Done => "done",
                    SessionStatus::Failed => "failed",
                    SessionStatus::Running => "interrupted",
                };
                println!("\n--- report ({}) ---", status);
                if let Some(report) = &session.report {
                    println!("{}", report.summary);
                }
                println!("--- session log: {} ---", recorder.dir().display());
            }
            Err(e) => {
                eprintln!("Session aborted: {}", e);
            }
        }
    }

    let (prompt, completion, total) = llm.token_usage();
    tracing::info!(prompt, completion, total, "token usage");
    Ok(())
}
