use async_trait::async_trait;
use serde_json::{json, Value};

use super::diff::{truncate_diff, unified_diff};
use super::{Tool, ToolContext, ToolResult};
use crate::failure::Failure;
use crate::paths::resolve_repo_path;

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it and its parent directories if \
         needed. Overwrites existing content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the repository root"
                },
                "content": {
                    "type": "string",
                    "description": "Full content to write"
                }
            },
            "required": ["path", "content"]
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
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let path = resolve_repo_path(&ctx.repo_root, raw)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Failure::tool(format!("cannot create directories for {raw}: {e}")))?;
        }
        let original = tokio::fs::read_to_string(&path).await.ok();
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Failure::tool(format!("cannot write {raw}: {e}")))?;

        // Write-through: invalidate before returning so the next read on
        // any worker observes the new bytes.
        ctx.file_cache.invalidate(&path);

        let preview = match &original {
            Some(old) => truncate_diff(&unified_diff(raw, old, content, 3), 40),
            None => String::new(),
        };
        let mut output = format!("Wrote {} bytes to {raw}", content.len());
        if !preview.is_empty() {
            output.push_str("\n\n");
            output.push_str(&preview);
        }

        Ok(ToolResult {
            output,
            payload: json!({ "bytes": content.len(), "created": original.is_none() }),
            paths: vec![raw.to_string()],
        })
    }
}

pub struct AppendFileTool;

#[async_trait]
impl Tool for AppendFileTool {
    fn name(&self) -> &str {
        "append_file"
    }

    fn description(&self) -> &str {
        "Append content to the end of a file, creating it if absent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the repository root"
                },
                "content": {
                    "type": "string",
                    "description": "Content to append"
                }
            },
            "required": ["path", "content"]
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
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let path = resolve_repo_path(&ctx.repo_root, raw)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Failure::tool(format!("cannot create directories for {raw}: {e}")))?;
        }
        let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        existing.push_str(content);
        tokio::fs::write(&path, &existing)
            .await
            .map_err(|e| Failure::tool(format!("cannot append to {raw}: {e}")))?;

        ctx.file_cache.invalidate(&path);

        Ok(ToolResult {
            output: format!("Appended {} bytes to {raw}", content.len()),
            payload: json!({ "bytes_appended": content.len(), "total_bytes": existing.len() }),
            paths: vec![raw.to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[tokio::test]
    async fn read_after_write_returns_written_bytes_with_warm_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "old").unwrap();
        let ctx = context(dir.path());

        // Warm the cache with the old content.
        ctx.file_cache.read(&path).unwrap();

        WriteFileTool
            .execute(json!({"path": "a.txt", "content": "new"}), &ctx)
            .await
            .unwrap();

        let bytes = ctx.file_cache.read(&path).unwrap();
        assert_eq!(bytes.as_slice(), b"new");
    }

    #[tokio::test]
    async fn write_creates_parent_directories_and_reports_created() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let result = WriteFileTool
            .execute(json!({"path": "deep/nested/f.rs", "content": "x"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.payload["created"], true);
        assert!(dir.path().join("deep/nested/f.rs").exists());
    }

    #[tokio::test]
    async fn overwrite_includes_a_diff_preview() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let ctx = context(dir.path());
        let result = WriteFileTool
            .execute(json!({"path": "a.txt", "content": "one\nTWO\n"}), &ctx)
            .await
            .unwrap();
        assert!(result.output.contains("-two"));
        assert!(result.output.contains("+TWO"));
    }

    #[tokio::test]
    async fn append_after_write_is_cache_coherent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let ctx = context(dir.path());
        WriteFileTool
            .execute(json!({"path": "log.txt", "content": "a"}), &ctx)
            .await
            .unwrap();
        ctx.file_cache.read(&path).unwrap();
        AppendFileTool
            .execute(json!({"path": "log.txt", "content": "b"}), &ctx)
            .await
            .unwrap();
        assert_eq!(ctx.file_cache.read(&path).unwrap().as_slice(), b"ab");
    }
}
