use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolResult};
use crate::failure::Failure;
use crate::paths::resolve_repo_path;

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the repository root"
                }
            },
            "required": ["path"]
        })
    }

    fn mutates(&self) -> bool {
        true
    }

    fn mutated_paths(&self, args: &Value) -> Vec<String> {
        args.get("path")
            .and_then(|v| v.as_str())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, Failure> {
        let raw = args.get("path").and_then(|v| v.as_str()).unwrap_or_default();
        let path = resolve_repo_path(&ctx.repo_root, raw)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Failure::tool(format!("cannot delete {raw}: {e}")))?;
        ctx.file_cache.invalidate(&path);
        Ok(ToolResult {
            output: format!("Deleted {raw}"),
            payload: json!({ "deleted": true }),
            paths: vec![raw.to_string()],
        })
    }
}

pub struct MoveFileTool;

#[async_trait]
impl Tool for MoveFileTool {
    fn name(&self) -> &str {
        "move_file"
    }

    fn description(&self) -> &str {
        "Move or rename a file. Creates destination directories if needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": {
                    "type": "string",
                    "description": "Existing path relative to the repository root"
                },
                "destination": {
                    "type": "string",
                    "description": "New path relative to the repository root"
                }
            },
            "required": ["source", "destination"]
        })
    }

    fn mutates(&self) -> bool {
        true
    }

    fn mutated_paths(&self, args: &Value) -> Vec<String> {
        ["source", "destination"]
            .iter()
            .filter_map(|k| args.get(*k).and_then(|v| v.as_str()))
            .map(String::from)
            .collect()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, Failure> {
        let source_raw = args
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let dest_raw = args
            .get("destination")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let source = resolve_repo_path(&ctx.repo_root, source_raw)?;
        let dest = resolve_repo_path(&ctx.repo_root, dest_raw)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Failure::tool(format!("cannot create directories for {dest_raw}: {e}"))
            })?;
        }
        tokio::fs::rename(&source, &dest)
            .await
            .map_err(|e| Failure::tool(format!("cannot move {source_raw} to {dest_raw}: {e}")))?;

        // Both ends of a move go stale.
        ctx.file_cache.invalidate(&source);
        ctx.file_cache.invalidate(&dest);

        Ok(ToolResult {
            output: format!("Moved {source_raw} to {dest_raw}"),
            payload: json!({ "moved": true }),
            paths: vec![source_raw.to_string(), dest_raw.to_string()],
        })
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the repository root; defaults to the root"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, Failure> {
        let raw = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = resolve_repo_path(&ctx.repo_root, raw)?;
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| Failure::tool(format!("cannot list {raw}: {e}")))?;
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let suffix = if entry.path().is_dir() { "/" } else { "" };
            entries.push(format!("{name}{suffix}"));
        }
        entries.sort();
        Ok(ToolResult {
            output: entries.join("\n"),
            payload: json!({ "count": entries.len() }),
            paths: vec![raw.to_string()],
        })
    }
}
