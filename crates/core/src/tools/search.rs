use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolResult};
use crate::failure::Failure;

const MAX_MATCHES: usize = 100;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv"];

pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching \
         lines as path:line:text, capped at 100 matches."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "glob": {
                    "type": "string",
                    "description": "Optional filename glob filter, e.g. *.py"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, Failure> {
        let pattern = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let regex = regex::Regex::new(pattern)
            .map_err(|e| Failure::schema(format!("invalid regex: {e}"), "use Rust regex syntax"))?;
        let name_filter = args
            .get("glob")
            .and_then(|v| v.as_str())
            .map(|g| glob::Pattern::new(g))
            .transpose()
            .map_err(|e| Failure::schema(format!("invalid glob: {e}"), "e.g. *.py or src/**/*.rs"))?;

        let mut matches = Vec::new();
        search_dir(
            &ctx.repo_root,
            &ctx.repo_root,
            &regex,
            name_filter.as_ref(),
            &mut matches,
        );

        let truncated = matches.len() >= MAX_MATCHES;
        let mut output = matches.join("\n");
        if truncated {
            output.push_str("\n... (match limit reached)");
        }
        if output.is_empty() {
            output = "no matches".to_string();
        }
        Ok(ToolResult {
            output,
            payload: json!({ "matches": matches.len(), "truncated": truncated }),
            paths: Vec::new(),
        })
    }
}

fn search_dir(
    root: &std::path::Path,
    dir: &std::path::Path,
    regex: &regex::Regex,
    name_filter: Option<&glob::Pattern>,
    out: &mut Vec<String>,
) {
    if out.len() >= MAX_MATCHES {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if out.len() >= MAX_MATCHES {
            return;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_str()) || name.starts_with('.') {
                continue;
            }
            search_dir(root, &path, regex, name_filter, out);
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| name.clone());
        if let Some(filter) = name_filter {
            if !filter.matches(&rel) && !filter.matches(&name) {
                continue;
            }
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (i, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                out.push(format!("{rel}:{}:{line}", i + 1));
                if out.len() >= MAX_MATCHES {
                    return;
                }
            }
        }
    }
}
