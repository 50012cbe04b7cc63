pub mod diff;
pub mod edit;
pub mod fs;
pub mod read;
pub mod run_cmd;
pub mod search;
pub mod write;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::FileStateCache;
use crate::context::SessionContext;
use crate::failure::Failure;
use crate::transaction::{PreState, Transaction, TxAction};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    /// Whether this tool writes to the filesystem. Mutating tools get
    /// pre-state capture and write-through cache invalidation.
    fn mutates(&self) -> bool {
        false
    }

    /// Repo-relative paths this invocation will mutate, extracted from
    /// the arguments before dispatch for pre-state capture.
    fn mutated_paths(&self, _args: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Shell commands and similar effects cannot be undone.
    fn reversible(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, Failure>;
}

#[derive(Clone)]
pub struct ToolContext {
    pub repo_root: PathBuf,
    pub file_cache: Arc<FileStateCache>,
    pub session: Arc<SessionContext>,
    pub transaction: Arc<tokio::sync::Mutex<Transaction>>,
    pub cancel: CancellationToken,
    /// Destructive shell invocations require this risk confirmation.
    pub allow_destructive: bool,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Text surfaced to the model as the tool message.
    pub output: String,
    /// Structured payload for verifier and report consumers.
    pub payload: Value,
    /// Paths this call touched (reads and writes).
    pub paths: Vec<String>,
}

impl ToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            payload: Value::Null,
            paths: Vec::new(),
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<rev_provider::ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .values()
            .map(|t| rev_provider::ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn definitions_filtered(&self, allowed: &[&str]) -> Vec<rev_provider::ToolDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| allowed.contains(&d.name.as_str()))
            .collect()
    }

    /// Validate, dispatch, and record one invocation into the active
    /// transaction. Every failure is structured; unknown tools and
    /// schema violations come back with actionable hints.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, Failure> {
        let Some(tool) = self.get(name) else {
            return Err(Failure::invariant(format!("unknown tool: {name}"))
                .with_hint(format!("available tools: {}", self.names().join(", "))));
        };

        if let Some(problem) = validate_args(&tool.parameters_schema(), &args) {
            return Err(Failure::schema(
                format!("invalid arguments for {name}: {problem}"),
                format!(
                    "expected parameters: {}",
                    serde_json::to_string(&tool.parameters_schema()).unwrap_or_default()
                ),
            ));
        }

        // Pre-state capture before any mutation, so rollback can restore.
        let mut pre_states = Vec::new();
        if tool.mutates() {
            for raw in tool.mutated_paths(&args) {
                let resolved = crate::paths::resolve_repo_path(&ctx.repo_root, &raw)?;
                pre_states.push(PreState::capture(&resolved));
            }
        }

        let result = tool.execute(args.clone(), ctx).await;

        let mut tx = ctx.transaction.lock().await;
        tx.record(TxAction {
            tool: name.to_string(),
            args,
            result_summary: match &result {
                Ok(r) => summarize(&r.output),
                Err(e) => format!("error: {e}"),
            },
            pre_states,
            reversible: tool.reversible(),
        });
        drop(tx);

        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the full tool surface.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(read::ReadFileTool));
    registry.register(Box::new(write::WriteFileTool));
    registry.register(Box::new(write::AppendFileTool));
    registry.register(Box::new(edit::EditFileTool));
    registry.register(Box::new(fs::DeleteFileTool));
    registry.register(Box::new(fs::MoveFileTool));
    registry.register(Box::new(fs::ListDirTool));
    registry.register(Box::new(search::SearchFilesTool));
    registry.register(Box::new(run_cmd::RunCmdTool));
    registry.register(Box::new(run_tests::RunTestsTool));
    registry
}

fn summarize(output: &str) -> String {
    const MAX: usize = 200;
    if output.len() <= MAX {
        output.to_string()
    } else {
        let mut cut = MAX;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &output[..cut])
    }
}

/// Minimal JSON-schema check: required keys present, declared property
/// types respected. Returns the first problem found.
fn validate_args(schema: &Value, args: &Value) -> Option<String> {
    let Some(obj) = args.as_object() else {
        return Some("arguments must be a JSON object".to_string());
    };
    if let Some(raw) = obj.get("_raw") {
        return Some(format!(
            "arguments were not valid JSON: {}",
            raw.as_str().unwrap_or("")
        ));
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Some(format!("missing required parameter `{key}`"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(decl) = props.get(key) else {
                continue;
            };
            let Some(expected) = decl.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Some(format!("parameter `{key}` should be a {expected}"));
            }
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A ToolContext rooted at a temp dir with fresh shared state.
    pub fn context(root: &std::path::Path) -> ToolContext {
        let budgets = rev_config::BudgetSettings::default();
        ToolContext {
            repo_root: root.to_path_buf(),
            file_cache: Arc::new(FileStateCache::new()),
            session: Arc::new(SessionContext::new("test request", &budgets)),
            transaction: Arc::new(tokio::sync::Mutex::new(Transaction::begin("t-test"))),
            cancel: CancellationToken::new(),
            allow_destructive: false,
        }
    }
}
