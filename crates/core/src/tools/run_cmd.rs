use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolResult};
use crate::failure::Failure;

const MAX_OUTPUT_BYTES: usize = 64 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 300;

/// Curated command-prefix surface: language toolchains, test runners,
/// formatters, version control, build tools. Anything else is blocked.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "cargo", "rustc", "rustfmt", "python", "python3", "pytest", "pip", "ruff", "black", "mypy",
    "node", "npm", "npx", "yarn", "tsc", "eslint", "prettier", "jest", "go", "gofmt", "git",
    "make", "mvn", "gradle", "ls", "cat", "grep", "find", "diff",
];

/// Invocations gated behind the risk confirmation even when the prefix
/// is allowed.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "git reset --hard",
    "git push --force",
    "git push -f",
    "git clean",
    "git checkout .",
    "rm ",
    "rm\t",
];

pub struct RunCmdTool;

#[async_trait]
impl Tool for RunCmdTool {
    fn name(&self) -> &str {
        "run_cmd"
    }

    fn description(&self) -> &str {
        "Run a shell command from the allowed toolchain set and return \
         stdout, stderr, and the exit code."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 60, max 300)"
                }
            },
            "required": ["command"]
        })
    }

    fn reversible(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, Failure> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();

        let first_word = command.split_whitespace().next().unwrap_or_default();
        if !ALLOWED_PREFIXES.contains(&first_word) {
            // Blocked, but not an error: the model should see the
            // allow-list and adjust.
            return Ok(ToolResult {
                output: format!(
                    "Command blocked: `{first_word}` is not in the allowed set.\nAllowed prefixes: {}",
                    ALLOWED_PREFIXES.join(", ")
                ),
                payload: json!({ "blocked": true, "allowed": ALLOWED_PREFIXES }),
                paths: Vec::new(),
            });
        }

        if is_destructive(&command) && !ctx.allow_destructive {
            return Ok(ToolResult {
                output: format!(
                    "Command blocked: `{command}` is destructive and requires risk confirmation."
                ),
                payload: json!({ "blocked": true, "destructive": true }),
                paths: Vec::new(),
            });
        }

        let timeout_secs = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        run_shell(&command, &ctx.repo_root, timeout_secs).await
    }
}

pub fn is_destructive(command: &str) -> bool {
    DESTRUCTIVE_PATTERNS.iter().any(|p| command.contains(p))
}

pub async fn run_shell(
    command: &str,
    cwd: &std::path::Path,
    timeout_secs: u64,
) -> Result<ToolResult, Failure> {
    let fut = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output();

    let output = match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), fut).await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(Failure::tool(format!("failed to spawn `{command}`: {e}"))),
        Err(_) => {
            return Err(
                Failure::tool(format!("`{command}` timed out after {timeout_secs}s"))
                    .with_hint("pass a larger timeout or narrow the command"),
            )
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = clip(&String::from_utf8_lossy(&output.stdout));
    let stderr = clip(&String::from_utf8_lossy(&output.stderr));

    let mut text = format!("exit code: {exit_code}");
    if !stdout.is_empty() {
        text.push_str("\nstdout:\n");
        text.push_str(&stdout);
    }
    if !stderr.is_empty() {
        text.push_str("\nstderr:\n");
        text.push_str(&stderr);
    }

    Ok(ToolResult {
        output: text,
        payload: json!({ "exit_code": exit_code, "stdout": stdout, "stderr": stderr }),
        paths: Vec::new(),
    })
}

fn clip(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_BYTES {
        return s.trim_end().to_string();
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... (output truncated)", &s[..cut])
}
