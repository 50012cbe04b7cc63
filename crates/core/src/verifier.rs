use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use serde_json::{json, Value};

use crate::task::{ActionType, Task};
use crate::tools::run_tests::{classify_exit_code, TestClassification};

/// Marker a refactor may leave in a source file to declare that growing
/// it was intentional.
pub const EXPANSION_MARKER: &str = "allow-expansion";

/// Post-task check outcome. `should_replan` asks the orchestrator to
/// drop the plan tail and regenerate from current state.
#[derive(Debug, Clone)]
pub struct Verification {
    pub passed: bool,
    pub message: String,
    pub details: Value,
    pub should_replan: bool,
}

impl Verification {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Value::Null,
            should_replan: false,
        }
    }

    fn fail(message: impl Into<String>, details: Value) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details,
            should_replan: false,
        }
    }

    fn replan(mut self) -> Self {
        self.should_replan = true;
        self
    }
}

/// Sizes of a task's target paths captured when the task started, plus
/// the start timestamp. The verifier compares post-state against this.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub started_at: SystemTime,
    pub sizes: HashMap<String, Option<u64>>,
}

impl TaskSnapshot {
    pub fn capture(repo_root: &Path, task: &Task) -> Self {
        let sizes = task
            .target_paths
            .iter()
            .map(|p| {
                let size = std::fs::metadata(repo_root.join(p)).map(|m| m.len()).ok();
                (p.clone(), size)
            })
            .collect();
        Self {
            started_at: SystemTime::now(),
            sizes,
        }
    }

    fn existed(&self, path: &str) -> bool {
        matches!(self.sizes.get(path), Some(Some(_)))
    }

    fn size_of(&self, path: &str) -> Option<u64> {
        self.sizes.get(path).copied().flatten()
    }
}

pub struct Verifier {
    similarity_threshold: f64,
}

impl Verifier {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    pub fn verify(&self, task: &Task, repo_root: &Path, snapshot: &TaskSnapshot) -> Verification {
        match task.action_type {
            ActionType::Add => self.verify_add(task, repo_root),
            ActionType::Edit | ActionType::Fix | ActionType::Debug | ActionType::Document => {
                self.verify_edit(task, repo_root, snapshot)
            }
            ActionType::Refactor => self.verify_refactor(task, repo_root, snapshot),
            ActionType::Move => self.verify_move(task, repo_root, snapshot),
            ActionType::Delete => self.verify_delete(task, repo_root),
            ActionType::Test => self.verify_test(task),
            ActionType::Research | ActionType::Analyze | ActionType::Review => {
                if task.result.as_deref().unwrap_or("").is_empty() {
                    Verification::fail(
                        format!("{} task produced no findings", task.action_type),
                        Value::Null,
                    )
                } else {
                    Verification::pass("findings recorded")
                }
            }
        }
    }

    fn verify_add(&self, task: &Task, repo_root: &Path) -> Verification {
        for target in &task.target_paths {
            let path = repo_root.join(target);
            let Ok(meta) = std::fs::metadata(&path) else {
                return Verification::fail(
                    format!("expected new file {target} does not exist"),
                    Value::Null,
                );
            };
            if meta.len() == 0 {
                return Verification::fail(format!("created file {target} is empty"), Value::Null);
            }

            // Duplicate-file detection: a highly similar peer in the same
            // directory means this should have been an edit.
            if let Some((peer, score)) = self.most_similar_peer(repo_root, target) {
                if score >= self.similarity_threshold {
                    return Verification::fail(
                        format!(
                            "{target} is {:.0}% similar to existing {peer}",
                            score * 100.0
                        ),
                        json!({
                            "duplicate_of": peer,
                            "similarity": score,
                            "suggestion": format!("edit {peer} instead of adding {target}"),
                        }),
                    )
                    .replan();
                }
            }

            if let Some(problem) = check_imports(&path, repo_root) {
                return Verification::fail(
                    format!("{target} has a broken import: {problem}"),
                    json!({ "import_problem": problem }),
                );
            }
        }
        Verification::pass("all created files present and distinct")
    }

    fn verify_edit(&self, task: &Task, repo_root: &Path, snapshot: &TaskSnapshot) -> Verification {
        for target in &task.target_paths {
            let path = repo_root.join(target);
            let Ok(meta) = std::fs::metadata(&path) else {
                return Verification::fail(format!("edited file {target} is missing"), Value::Null);
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified <= snapshot.started_at {
                return Verification::fail(
                    format!("{target} was not modified by this task"),
                    json!({ "mtime_unchanged": true }),
                );
            }
            if let Some(problem) = check_imports(&path, repo_root) {
                return Verification::fail(
                    format!("{target} has a broken import: {problem}"),
                    json!({ "import_problem": problem }),
                );
            }
        }
        Verification::pass("edited files updated")
    }

    fn verify_refactor(
        &self,
        task: &Task,
        repo_root: &Path,
        snapshot: &TaskSnapshot,
    ) -> Verification {
        for target in &task.target_paths {
            let path = repo_root.join(target);
            let existed = snapshot.existed(target);
            if !existed {
                // An expected new file from the extraction.
                if !path.exists() {
                    return Verification::fail(
                        format!("expected extracted file {target} does not exist"),
                        Value::Null,
                    );
                }
                continue;
            }
            // The source file: deleted entirely is fine (a later task may
            // have owned the deletion); grown is suspect.
            if let Ok(meta) = std::fs::metadata(&path) {
                let before = snapshot.size_of(target).unwrap_or(0);
                if meta.len() >= before {
                    let content = std::fs::read_to_string(&path).unwrap_or_default();
                    if !content.contains(EXPANSION_MARKER) {
                        return Verification::fail(
                            format!(
                                "refactor source {target} did not shrink ({before} -> {} bytes)",
                                meta.len()
                            ),
                            json!({ "before": before, "after": meta.len() }),
                        );
                    }
                }
                if let Some(problem) = check_imports(&path, repo_root) {
                    return Verification::fail(
                        format!("{target} has a broken import: {problem}"),
                        json!({ "import_problem": problem }),
                    );
                }
            }
        }
        Verification::pass("refactor outputs present")
    }

    fn verify_move(&self, task: &Task, repo_root: &Path, snapshot: &TaskSnapshot) -> Verification {
        for target in &task.target_paths {
            let exists = repo_root.join(target).exists();
            let existed = snapshot.existed(target);
            if existed && exists {
                return Verification::fail(
                    format!("move source {target} still exists"),
                    Value::Null,
                );
            }
            if !existed && !exists {
                return Verification::fail(
                    format!("move destination {target} was not created"),
                    Value::Null,
                );
            }
        }
        Verification::pass("move completed")
    }

    fn verify_delete(&self, task: &Task, repo_root: &Path) -> Verification {
        for target in &task.target_paths {
            if repo_root.join(target).exists() {
                return Verification::fail(
                    format!("{target} still exists after delete task"),
                    Value::Null,
                );
            }
        }
        Verification::pass("targets removed")
    }

    fn verify_test(&self, task: &Task) -> Verification {
        let exit_code = task
            .tool_events
            .iter()
            .rev()
            .find(|e| e.tool == "run_tests" || e.tool == "run_cmd")
            .and_then(|e| e.exit_code);
        match exit_code {
            Some(code) => match classify_exit_code(code) {
                TestClassification::Passed => Verification::pass("tests passed"),
                TestClassification::PassedNoTests => Verification {
                    passed: true,
                    message: "no tests collected (pass with warning)".into(),
                    details: json!({ "warning": "no_tests_collected", "exit_code": code }),
                    should_replan: false,
                },
                TestClassification::Failed => Verification::fail(
                    format!("test run failed with exit code {code}"),
                    json!({ "exit_code": code }),
                ),
            },
            None => Verification::fail(
                "test task never ran the test suite",
                json!({ "missing_tool_call": "run_tests" }),
            ),
        }
    }

    fn most_similar_peer(&self, repo_root: &Path, target: &str) -> Option<(String, f64)> {
        let target_path = repo_root.join(target);
        let content = std::fs::read_to_string(&target_path).ok()?;
        let dir = target_path.parent()?;
        let extension = target_path.extension().map(|e| e.to_os_string());

        let mut best: Option<(String, f64)> = None;
        for entry in std::fs::read_dir(dir).ok()?.flatten() {
            let path = entry.path();
            if path == target_path || !path.is_file() {
                continue;
            }
            if path.extension().map(|e| e.to_os_string()) != extension {
                continue;
            }
            let Ok(peer_content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let score = trigram_similarity(&content, &peer_content);
            let rel = path
                .strip_prefix(repo_root)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| path.to_string_lossy().to_string());
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((rel, score));
            }
        }
        best
    }
}

/// Character-trigram Jaccard similarity in [0, 1].
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let grams_a = trigrams(a);
    let grams_b = trigrams(b);
    if grams_a.is_empty() && grams_b.is_empty() {
        return 1.0;
    }
    if grams_a.is_empty() || grams_b.is_empty() {
        return 0.0;
    }
    let intersection = grams_a.intersection(&grams_b).count();
    let union = grams_a.union(&grams_b).count();
    intersection as f64 / union as f64
}

fn trigrams(s: &str) -> std::collections::HashSet<[char; 3]> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// Lightweight syntactic import check for Python and JS/TS sources.
/// Returns the first problem found, None when clean or not applicable.
pub fn check_imports(path: &Path, repo_root: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?;
    let content = std::fs::read_to_string(path).ok()?;
    match extension {
        "py" => check_python_imports(&content),
        "js" | "ts" | "jsx" | "tsx" => check_js_imports(&content, path, repo_root),
        _ => None,
    }
}

fn check_python_imports(content: &str) -> Option<String> {
    let import_re =
        regex::Regex::new(r"^\s*(import\s+[\w.]+(\s+as\s+\w+)?(\s*,\s*[\w.]+(\s+as\s+\w+)?)*|from\s+\.*[\w.]*\s+import\s+(\(|\*|\w))").unwrap();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            if !import_re.is_match(line) {
                return Some(format!("malformed import line: `{}`", line.trim()));
            }
        }
    }
    None
}

fn check_js_imports(content: &str, path: &Path, repo_root: &Path) -> Option<String> {
    let import_re = regex::Regex::new(r#"import\s+.*\s+from\s+['"](\.[^'"]*)['"]"#).unwrap();
    let dir = path.parent().unwrap_or(repo_root);
    for caps in import_re.captures_iter(content) {
        let spec = &caps[1];
        let base = dir.join(spec);
        let candidates = [
            base.clone(),
            base.with_extension("js"),
            base.with_extension("ts"),
            base.join("index.js"),
            base.join("index.ts"),
        ];
        if !candidates.iter().any(|c| c.exists()) {
            return Some(format!("unresolved relative import `{spec}`"));
        }
    }
    None
}
