//! 工具箱：注册表、执行器与内置工具（文件系统 / Shell / final_answer）

pub mod answer;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod shell;

pub use answer::FinalAnswerTool;
pub use executor::ToolExecutor;
pub use filesystem::{
    AppendToFileTool, CreateDirectoryTool, DeleteFileTool, FindFilesTool, ListFilesTool,
    ReadFileTool, SafeFs, WriteFileTool,
};
pub use registry::{Effect, Tool, ToolRegistry};
pub use shell::RunShellCommandTool;
