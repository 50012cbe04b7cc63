use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolResult};
use crate::failure::Failure;
use crate::paths::resolve_repo_path;

const MAX_READ_BYTES: usize = 256 * 1024;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's content. Serves from the file cache when the on-disk \
         modification time has not changed."
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

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, Failure> {
        let raw = args.get("path").and_then(|v| v.as_str()).unwrap_or_default();
        let path = resolve_repo_path(&ctx.repo_root, raw)?;

        let bytes = ctx
            .file_cache
            .read(&path)
            .map_err(|e| Failure::tool(format!("cannot read {raw}: {e}")))?;

        let inspect_count = ctx.session.note_inspected(raw);
        let mut output = if bytes.len() > MAX_READ_BYTES {
            let text = String::from_utf8_lossy(&bytes[..MAX_READ_BYTES]);
            format!("{text}\n... (truncated, {} bytes total)", bytes.len())
        } else {
            String::from_utf8_lossy(&bytes).to_string()
        };
        if inspect_count > 2 {
            output.push_str(&format!(
                "\n[note: this file has now been read {inspect_count} times this run]"
            ));
        }

        Ok(ToolResult {
            output,
            payload: json!({ "bytes": bytes.len(), "reads": inspect_count }),
            paths: vec![raw.to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[tokio::test]
    async fn reads_content_and_counts_inspections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "file body").unwrap();
        let ctx = context(dir.path());

        let tool = ReadFileTool;
        let result = tool
            .execute(json!({"path": "a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "file body");
        assert_eq!(result.payload["reads"], 1);

        tool.execute(json!({"path": "a.txt"}), &ctx).await.unwrap();
        let third = tool.execute(json!({"path": "a.txt"}), &ctx).await.unwrap();
        assert!(third.output.contains("read 3 times"));
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let err = ReadFileTool
            .execute(json!({"path": "ghost.txt"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::failure::FailureKind::Tool);
    }
}
