use async_trait::async_trait;
use serde_json::{json, Value};

use super::diff::{truncate_diff, unified_diff};
use super::{Tool, ToolContext, ToolResult};
use crate::failure::Failure;
use crate::paths::resolve_repo_path;

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text fragment in a file. `find` must match exactly \
         once; an empty `replace` deletes the fragment."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the repository root"
                },
                "find": {
                    "type": "string",
                    "description": "Exact text to replace; must occur exactly once"
                },
                "replace": {
                    "type": "string",
                    "description": "Replacement text; empty string deletes the fragment"
                }
            },
            "required": ["path", "find", "replace"]
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
        let find = args.get("find").and_then(|v| v.as_str()).unwrap_or_default();
        // An empty replace value is a valid deletion.
        let replace = args
            .get("replace")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if find.is_empty() {
            return Err(Failure::schema(
                "`find` must not be empty",
                "pass the exact text to locate; to create content use write_file",
            ));
        }

        let path = resolve_repo_path(&ctx.repo_root, raw)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Failure::tool(format!("cannot read {raw}: {e}")))?;

        let occurrences = content.matches(find).count();
        if occurrences == 0 {
            return Err(Failure::tool(format!("`find` text not present in {raw}"))
                .with_hint("read the file first and copy the fragment exactly"));
        }
        if occurrences > 1 {
            return Err(Failure::tool(format!(
                "`find` text occurs {occurrences} times in {raw}; it must be unique"
            ))
            .with_hint("include more surrounding context to disambiguate"));
        }

        let new_content = content.replacen(find, replace, 1);
        tokio::fs::write(&path, &new_content)
            .await
            .map_err(|e| Failure::tool(format!("cannot write {raw}: {e}")))?;
        ctx.file_cache.invalidate(&path);

        let preview = truncate_diff(&unified_diff(raw, &content, &new_content, 3), 40);
        Ok(ToolResult {
            output: format!("Edited {raw}\n\n{preview}"),
            payload: json!({
                "deleted": replace.is_empty(),
                "bytes": new_content.len(),
            }),
            paths: vec![raw.to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[tokio::test]
    async fn replaces_a_unique_fragment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def old_name():\n    pass\n").unwrap();
        let ctx = context(dir.path());
        EditFileTool
            .execute(
                json!({"path": "a.py", "find": "old_name", "replace": "new_name"}),
                &ctx,
            )
            .await
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("a.py")).unwrap();
        assert!(content.contains("new_name"));
    }

    #[tokio::test]
    async fn empty_replace_is_a_deletion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "keep REMOVE keep").unwrap();
        let ctx = context(dir.path());
        let result = EditFileTool
            .execute(
                json!({"path": "a.txt", "find": "REMOVE ", "replace": ""}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.payload["deleted"], true);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "keep keep"
        );
    }

    #[tokio::test]
    async fn ambiguous_fragment_is_rejected_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x x").unwrap();
        let ctx = context(dir.path());
        let err = EditFileTool
            .execute(json!({"path": "a.txt", "find": "x", "replace": "y"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.message.contains("2 times"));
        assert!(err.hint.is_some());
    }

    #[tokio::test]
    async fn edit_invalidates_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "before").unwrap();
        let ctx = context(dir.path());
        ctx.file_cache.read(&path).unwrap();
        EditFileTool
            .execute(
                json!({"path": "a.txt", "find": "before", "replace": "after"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(ctx.file_cache.read(&path).unwrap().as_slice(), b"after");
    }
}
