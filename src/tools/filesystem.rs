//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径必须落在 root 下（禁止 ../ 与绝对路径逃逸）；
//! 变更类工具在覆盖或删除既有文件前，先把原内容备份到会话日志目录下的 backups/，
//! 备份失败即工具失败，不静默继续。
//!
//! 工具集：list_files / find_files / read_file / write_file / append_to_file /
//! create_directory / delete_file。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::{Effect, Tool};

/// 沙箱文件系统：绑定根目录与可选备份目录，校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
    backup_dir: Option<PathBuf>,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self {
            root_dir,
            backup_dir: None,
        }
    }

    /// 设置变更前备份目录（通常为会话日志目录下的 backups/）
    pub fn with_backup_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.backup_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// 校验既有路径在沙箱内（用于读取/删除）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecution(format!("Path not found: {}", path)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string()))
        }
    }

    /// 校验待创建路径在沙箱内（目标可以尚不存在）：拒绝绝对路径与 .. 分量
    pub fn resolve_new(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = Path::new(path.trim_start_matches("./"));
        if rel.is_absolute() {
            return Err(AgentError::PathEscape(path.to_string()));
        }
        for comp in rel.components() {
            if matches!(comp, Component::ParentDir) {
                return Err(AgentError::PathEscape(path.to_string()));
            }
        }
        Ok(self.root_dir.join(rel))
    }

    /// 变更前备份：目标文件已存在且配置了备份目录时，按相对路径复制一份；
    /// 备份失败是硬错误（审计缺口不可接受）
    fn backup_if_needed(&self, full: &Path, rel: &str) -> Result<Option<PathBuf>, AgentError> {
        let Some(backup_root) = &self.backup_dir else {
            return Ok(None);
        };
        if !full.is_file() {
            return Ok(None);
        }
        let dest = backup_root.join(rel.trim_start_matches("./"));
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::BackupWrite(format!("create backup dir: {}", e)))?;
        }
        std::fs::copy(full, &dest)
            .map_err(|e| AgentError::BackupWrite(format!("backup {}: {}", rel, e)))?;
        Ok(Some(dest))
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecution(format!("Read failed: {}", e)))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<String, AgentError> {
        let full = self.resolve_new(path)?;
        let backed_up = self.backup_if_needed(&full, path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ToolExecution(format!("Create dir failed: {}", e)))?;
        }
        std::fs::write(&full, content)
            .map_err(|e| AgentError::ToolExecution(format!("Write failed: {}", e)))?;
        Ok(match backed_up {
            Some(_) => format!("Wrote {} ({} bytes); previous version backed up.", path, content.len()),
            None => format!("Wrote {} ({} bytes).", path, content.len()),
        })
    }

    pub fn append_to_file(&self, path: &str, content: &str) -> Result<String, AgentError> {
        use std::io::Write;
        let full = self.resolve_new(path)?;
        self.backup_if_needed(&full, path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ToolExecution(format!("Create dir failed: {}", e)))?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .map_err(|e| AgentError::ToolExecution(format!("Open failed: {}", e)))?;
        f.write_all(content.as_bytes())
            .map_err(|e| AgentError::ToolExecution(format!("Append failed: {}", e)))?;
        Ok(format!("Appended {} bytes to {}.", content.len(), path))
    }

    pub fn create_directory(&self, path: &str) -> Result<String, AgentError> {
        let full = self.resolve_new(path)?;
        std::fs::create_dir_all(&full)
            .map_err(|e| AgentError::ToolExecution(format!("Create dir failed: {}", e)))?;
        Ok(format!("Created directory {}.", path))
    }

    pub fn delete_file(&self, path: &str) -> Result<String, AgentError> {
        let full = self.resolve(path)?;
        if !full.is_file() {
            return Err(AgentError::ToolExecution(format!("Not a file: {}", path)));
        }
        self.backup_if_needed(&full, path)?;
        std::fs::remove_file(&full)
            .map_err(|e| AgentError::ToolExecution(format!("Delete failed: {}", e)))?;
        Ok(format!("Deleted {} (backup kept in session log).", path))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecution(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| AgentError::ToolExecution(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn find_files(&self, pattern: &str) -> Result<Vec<String>, AgentError> {
        if pattern.contains("..") {
            return Err(AgentError::PathEscape(pattern.to_string()));
        }
        let glob_pattern = self.root_dir.join(pattern);
        let glob_str = glob_pattern.to_string_lossy();
        let mut found = Vec::new();
        for entry in glob::glob(&glob_str)
            .map_err(|e| AgentError::ToolExecution(format!("Bad pattern: {}", e)))?
        {
            let p = entry.map_err(|e| AgentError::ToolExecution(e.to_string()))?;
            if let Ok(rel) = p.strip_prefix(&self.root_dir) {
                found.push(rel.to_string_lossy().to_string());
            }
        }
        found.sort();
        Ok(found)
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// list_files 工具：列出目录内容
pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in a directory inside the workspace."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "directory": {
                    "type": "string",
                    "description": "Directory path relative to workspace root; '.' for the root"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let dir = args.get("directory").and_then(|v| v.as_str()).unwrap_or(".");
        let entries = self.fs.list_dir(dir).map_err(|e| e.to_string())?;
        if entries.is_empty() {
            Ok(format!("{} is empty.", dir))
        } else {
            Ok(entries.join("\n"))
        }
    }
}

/// find_files 工具：按 glob 模式查找文件
pub struct FindFilesTool {
    fs: SafeFs,
}

impl FindFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for FindFilesTool {
    fn name(&self) -> &str {
        "find_files"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern, e.g. '**/*.rs'."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern relative to workspace root"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let found = self
            .fs
            .find_files(str_arg(&args, "pattern"))
            .map_err(|e| e.to_string())?;
        if found.is_empty() {
            Ok("No files matched.".to_string())
        } else {
            Ok(found.join("\n"))
        }
    }
}

/// read_file 工具：读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.fs
            .read_file(str_arg(&args, "path"))
            .map_err(|e| e.to_string())
    }
}

/// write_file 工具：写入（覆盖）文件，覆盖前备份
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, overwriting it. The previous version is backed up first."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn effect(&self) -> Effect {
        Effect::Mutating
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.fs
            .write_file(str_arg(&args, "path"), str_arg(&args, "content"))
            .map_err(|e| e.to_string())
    }
}

/// append_to_file 工具：向文件末尾追加内容
pub struct AppendToFileTool {
    fs: SafeFs,
}

impl AppendToFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for AppendToFileTool {
    fn name(&self) -> &str {
        "append_to_file"
    }

    fn description(&self) -> &str {
        "Append content to the end of a file, creating it if absent."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Content to append"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn effect(&self) -> Effect {
        Effect::Mutating
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.fs
            .append_to_file(str_arg(&args, "path"), str_arg(&args, "content"))
            .map_err(|e| e.to_string())
    }
}

/// create_directory 工具：创建目录（含父目录）
pub struct CreateDirectoryTool {
    fs: SafeFs,
}

impl CreateDirectoryTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for CreateDirectoryTool {
    fn name(&self) -> &str {
        "create_directory"
    }

    fn description(&self) -> &str {
        "Create a directory (and any missing parents)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "directory_path": {
                    "type": "string",
                    "description": "Directory path relative to workspace root"
                }
            },
            "required": ["directory_path"]
        })
    }

    fn effect(&self) -> Effect {
        Effect::Mutating
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.fs
            .create_directory(str_arg(&args, "directory_path"))
            .map_err(|e| e.to_string())
    }
}

/// delete_file 工具：删除文件，删除前备份
pub struct DeleteFileTool {
    fs: SafeFs,
}

impl DeleteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file. The file is backed up to the session log before removal."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to workspace root"
                }
            },
            "required": ["path"]
        })
    }

    fn effect(&self) -> Effect {
        Effect::Mutating
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.fs
            .delete_file(str_arg(&args, "path"))
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(tmp.path());
        assert!(matches!(
            fs.resolve_new("../outside.txt"),
            Err(AgentError::PathEscape(_))
        ));
        assert!(matches!(
            fs.resolve_new("/etc/passwd"),
            Err(AgentError::PathEscape(_))
        ));
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(tmp.path());
        fs.write_file("a.txt", "hi").unwrap();
        assert_eq!(fs.read_file("a.txt").unwrap(), "hi");
    }

    #[test]
    fn test_overwrite_backs_up_previous_version() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = tmp.path().join("backups");
        let work = tmp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let fs = SafeFs::new(&work).with_backup_dir(&backups);
        fs.write_file("a.txt", "v1").unwrap();
        fs.write_file("a.txt", "v2").unwrap();
        assert_eq!(fs.read_file("a.txt").unwrap(), "v2");
        let backed = std::fs::read_to_string(backups.join("a.txt")).unwrap();
        assert_eq!(backed, "v1");
    }

    #[test]
    fn test_delete_requires_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(tmp.path());
        assert!(fs.delete_file("missing.txt").is_err());
    }

    #[test]
    fn test_find_files_relative_results() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(tmp.path());
        fs.write_file("src/a.rs", "x").unwrap();
        fs.write_file("src/b.rs", "y").unwrap();
        let found = fs.find_files("src/*.rs").unwrap();
        assert_eq!(found, vec!["src/a.rs".to_string(), "src/b.rs".to_string()]);
    }
}
