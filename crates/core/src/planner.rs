use rev_provider::{ChatRequest, LmClient, Message, ToolChoice, ToolDefinition};
use serde_json::json;

use crate::failure::Failure;
use crate::goals::{derive_goals, Goal};
use crate::repo::RepoContext;
use crate::task::{ActionType, ExecutionPlan, Task};
use crate::verifier::trigram_similarity;

pub const PLAN_TOOL_NAME: &str = "submit_plan";

/// Name-level similarity at which a planned `add` is considered a
/// duplicate of an existing file and downgraded to `edit`.
const PATH_OVERLAP_THRESHOLD: f64 = 0.72;

/// The plan schema, bound as the forced tool-choice for planning calls.
pub fn plan_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: PLAN_TOOL_NAME.to_string(),
        description: "Submit the execution plan as an ordered list of atomic tasks.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "description": { "type": "string" },
                            "action_type": {
                                "type": "string",
                                "enum": ["add", "edit", "refactor", "test", "debug", "fix",
                                         "document", "research", "analyze", "review",
                                         "delete", "move"]
                            },
                            "dependencies": {
                                "type": "array",
                                "items": { "type": "string" }
                            },
                            "risk_level": {
                                "type": "string",
                                "enum": ["low", "medium", "high", "critical"]
                            },
                            "target_paths": {
                                "type": "array",
                                "items": { "type": "string" }
                            }
                        },
                        "required": ["id", "description", "action_type"]
                    }
                },
                "goals": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" }
                        },
                        "required": ["description"]
                    }
                }
            },
            "required": ["tasks"]
        }),
    }
}

pub struct Planner<'a> {
    client: &'a LmClient,
    model: String,
}

impl<'a> Planner<'a> {
    pub fn new(client: &'a LmClient) -> Self {
        let model = client.default_model().to_string();
        Self { client, model }
    }

    /// Produce a validated, fixed-up, topologically sorted plan. A
    /// malformed plan gets exactly one re-prompt with the problem spelled
    /// out before planning fails.
    pub async fn build_plan(
        &self,
        session_id: &str,
        request: &str,
        repo: &RepoContext,
        research_findings: Option<&str>,
        replan_reason: Option<&str>,
    ) -> Result<ExecutionPlan, Failure> {
        let prompt = self.build_prompt(request, repo, research_findings, replan_reason);
        let mut messages = vec![Message::user(prompt)];

        let mut attempt = 0u32;
        loop {
            let mut chat = ChatRequest::new(&self.model);
            chat.system = Some(PLANNER_SYSTEM_PROMPT.to_string());
            chat.messages = messages.clone();
            chat.tools = vec![plan_tool_definition()];
            chat.tool_choice = ToolChoice::Enforced;

            let response = self
                .client
                .chat(&chat)
                .await
                .map_err(|e| Failure::transport(format!("planning call failed: {e}")))?;

            let parsed = response
                .tool_calls
                .iter()
                .find(|c| c.name == PLAN_TOOL_NAME)
                .ok_or_else(|| "the submit_plan tool was not called".to_string())
                .and_then(|call| parse_plan_args(&call.arguments));

            match parsed {
                Ok((mut tasks, goals)) => {
                    enforce_reuse_first(&mut tasks, repo);
                    enforce_test_first(&mut tasks);
                    ensure_coverage(&mut tasks);

                    let mut plan = ExecutionPlan::new(session_id, tasks);
                    plan.goals = if goals.is_empty() {
                        derive_goals(request)
                    } else {
                        goals
                    };
                    plan.sort_topological()?;
                    return Ok(plan);
                }
                Err(problem) if attempt == 0 => {
                    tracing::warn!(%problem, "plan rejected; re-prompting once");
                    attempt += 1;
                    messages.push(Message::assistant("(submitted an invalid plan)"));
                    messages.push(Message::user(format!(
                        "The submitted plan was invalid: {problem}. \
                         Call {PLAN_TOOL_NAME} again with the corrected shape."
                    )));
                }
                Err(problem) => {
                    return Err(Failure::schema(
                        format!("planner produced an invalid plan twice: {problem}"),
                        "the request may need to be simplified",
                    ));
                }
            }
        }
    }

    fn build_prompt(
        &self,
        request: &str,
        repo: &RepoContext,
        research_findings: Option<&str>,
        replan_reason: Option<&str>,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str("User request:\n");
        prompt.push_str(request);
        prompt.push_str("\n\nRepository state:\n");
        prompt.push_str(&repo.digest(120));
        if let Some(findings) = research_findings {
            prompt.push_str("\nResearch findings:\n");
            prompt.push_str(findings);
            prompt.push('\n');
        }
        if let Some(reason) = replan_reason {
            prompt.push_str("\nThis is a replan. The previous plan tail was dropped because: ");
            prompt.push_str(reason);
            prompt.push_str("\nPlan only the remaining work given the current repository state.\n");
        }
        prompt
    }
}

const PLANNER_SYSTEM_PROMPT: &str = "You are the planning component of an \
autonomous coding agent. Decompose the request into atomic tasks with \
explicit dependencies and declare the files each task will touch in \
target_paths. Prefer editing existing files over adding new ones; never \
plan a new file whose purpose an existing file already serves. Write \
tests before implementation, and include a test run covering every code \
change. Keep tasks small enough that one focused agent can finish each.";

fn parse_plan_args(args: &serde_json::Value) -> Result<(Vec<Task>, Vec<Goal>), String> {
    let raw_tasks = args
        .get("tasks")
        .and_then(|t| t.as_array())
        .ok_or("`tasks` must be an array")?;
    if raw_tasks.is_empty() {
        return Err("`tasks` is empty".to_string());
    }

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (i, raw) in raw_tasks.iter().enumerate() {
        let id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("t{}", i + 1));
        let description = raw
            .get("description")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("task {id} is missing `description`"))?
            .to_string();
        let action_raw = raw
            .get("action_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("task {id} is missing `action_type`"))?;
        let action_type = ActionType::parse(action_raw).unwrap_or_else(|| {
            tracing::warn!(task = %id, action = action_raw, "unknown action type; treating as edit");
            ActionType::Edit
        });

        let mut task = Task::new(id, description, action_type);
        if let Some(deps) = raw.get("dependencies").and_then(|v| v.as_array()) {
            task.dependencies = deps
                .iter()
                .filter_map(|d| d.as_str())
                .map(String::from)
                .collect();
        }
        if let Some(risk) = raw.get("risk_level") {
            if let Ok(level) = serde_json::from_value(risk.clone()) {
                task.risk_level = level;
            }
        }
        if let Some(paths) = raw.get("target_paths").and_then(|v| v.as_array()) {
            task.target_paths = paths
                .iter()
                .filter_map(|p| p.as_str())
                .map(String::from)
                .collect();
        }
        // Declared paths are preferred; fall back to scanning the text.
        if task.target_paths.is_empty() {
            task.target_paths = extract_path_tokens(&task.description);
        }
        tasks.push(task);
    }

    let mut seen = std::collections::HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.clone()) {
            return Err(format!("duplicate task id {}", task.id));
        }
    }

    let goals = args
        .get("goals")
        .and_then(|g| g.as_array())
        .map(|raw_goals| {
            raw_goals
                .iter()
                .filter_map(|g| g.get("description").and_then(|d| d.as_str()))
                .map(|description| Goal {
                    description: description.to_string(),
                    metrics: vec![crate::goals::Metric {
                        name: "tasks_completed".into(),
                        evaluator: crate::goals::MetricEvaluator::TasksAllCompleted,
                        target: "all".into(),
                    }],
                })
                .collect()
        })
        .unwrap_or_default();

    Ok((tasks, goals))
}

/// Reuse-first: an `add` whose target substantially overlaps an existing
/// file becomes an `edit` of that file, with a rationale note.
pub fn enforce_reuse_first(tasks: &mut [Task], repo: &RepoContext) {
    for task in tasks.iter_mut() {
        if task.action_type != ActionType::Add {
            continue;
        }
        let mut downgrade: Option<(String, String)> = None;
        for target in &task.target_paths {
            if repo.contains_file(target) {
                downgrade = Some((target.clone(), target.clone()));
                break;
            }
            let target_stem = file_stem(target);
            for sibling in repo.sibling_files(target) {
                let score = trigram_similarity(&target_stem, &file_stem(sibling));
                if score >= PATH_OVERLAP_THRESHOLD {
                    downgrade = Some((target.clone(), sibling.to_string()));
                    break;
                }
            }
            if downgrade.is_some() {
                break;
            }
        }
        if let Some((planned, existing)) = downgrade {
            task.action_type = ActionType::Edit;
            if planned != existing {
                task.target_paths.retain(|p| p != &planned);
                if !task.target_paths.contains(&existing) {
                    task.target_paths.push(existing.clone());
                }
            }
            task.description.push_str(&format!(
                " [downgraded from add: {existing} already covers this]"
            ));
        }
    }
}

/// Test-first: implementation tasks referencing a target must depend on
/// the test-authoring task for the same target. Test tasks with declared
/// target paths author tests; test tasks without targets execute them.
pub fn enforce_test_first(tasks: &mut Vec<Task>) {
    let authoring: Vec<(String, Vec<String>)> = tasks
        .iter()
        .filter(|t| t.action_type == ActionType::Test && !t.target_paths.is_empty())
        .map(|t| (t.id.clone(), referenced_tokens(t)))
        .collect();
    if authoring.is_empty() {
        return;
    }

    let original: Vec<Vec<String>> = tasks.iter().map(|t| t.dependencies.clone()).collect();
    for task in tasks.iter_mut() {
        if !task.action_type.changes_code() {
            continue;
        }
        let impl_tokens = referenced_tokens(task);
        for (test_id, test_tokens) in &authoring {
            if *test_id == task.id || task.dependencies.contains(test_id) {
                continue;
            }
            if tokens_overlap(&impl_tokens, test_tokens) {
                task.dependencies.push(test_id.clone());
            }
        }
    }

    // A fix-up must not manufacture a cycle.
    let probe = ExecutionPlan::new("probe", tasks.clone());
    if probe.topological_order().is_err() {
        tracing::warn!("test-first fix-up would create a cycle; reverting added edges");
        for (task, deps) in tasks.iter_mut().zip(original) {
            task.dependencies = deps;
        }
    }
}

/// Coverage guarantee: every code-changing task must sit in the
/// dependency closure of some test-execution task. Uncovered changes get
/// one appended test run depending on them all.
pub fn ensure_coverage(tasks: &mut Vec<Task>) {
    let execution_ids: Vec<String> = tasks
        .iter()
        .filter(|t| t.action_type == ActionType::Test && t.target_paths.is_empty())
        .map(|t| t.id.clone())
        .collect();

    let mut covered: std::collections::HashSet<String> = std::collections::HashSet::new();
    for exec_id in &execution_ids {
        collect_closure(tasks, exec_id, &mut covered);
    }

    let uncovered: Vec<String> = tasks
        .iter()
        .filter(|t| t.action_type.changes_code() && !covered.contains(&t.id))
        .map(|t| t.id.clone())
        .collect();
    if uncovered.is_empty() {
        return;
    }

    let mut n = 1;
    let mut id = format!("cover{n}");
    while tasks.iter().any(|t| t.id == id) {
        n += 1;
        id = format!("cover{n}");
    }
    let mut cover = Task::new(id, "run the test suite to cover the code changes", ActionType::Test);
    cover.dependencies = uncovered;
    tasks.push(cover);
}

fn collect_closure(tasks: &[Task], id: &str, out: &mut std::collections::HashSet<String>) {
    let Some(task) = tasks.iter().find(|t| t.id == id) else {
        return;
    };
    for dep in &task.dependencies {
        if out.insert(dep.clone()) {
            collect_closure(tasks, dep, out);
        }
    }
}

fn referenced_tokens(task: &Task) -> Vec<String> {
    let mut tokens = task.target_paths.clone();
    tokens.extend(extract_path_tokens(&task.description));
    tokens
}

fn tokens_overlap(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| {
        b.iter()
            .any(|y| x == y || normalized_stem(x) == normalized_stem(y))
    })
}

fn file_stem(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| path.to_lowercase())
}

/// Stem with test-naming affixes stripped, so `tests/test_auth.py`
/// matches `src/auth.py`.
fn normalized_stem(path: &str) -> String {
    let stem = file_stem(path);
    stem.trim_start_matches("test_")
        .trim_end_matches("_test")
        .trim_end_matches(".test")
        .trim_end_matches(".spec")
        .to_string()
}

/// File-path-looking tokens in free text: anything with a slash or a
/// known source extension.
pub fn extract_path_tokens(text: &str) -> Vec<String> {
    let re = regex::Regex::new(r"[\w./-]+\.(?:py|rs|js|ts|jsx|tsx|go|java|rb|c|h|cpp|md|toml|json|yaml|yml)\b").unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for m in re.find_iter(text) {
        let token = m.as_str().trim_matches('.').to_string();
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_tokens_extract_from_prose() {
        let tokens =
            extract_path_tokens("Split lib/m.py into lib/m/a.py and lib/m/b.py, then remove it.");
        assert_eq!(tokens, vec!["lib/m.py", "lib/m/a.py", "lib/m/b.py"]);
    }

    #[test]
    fn parse_rejects_empty_and_duplicate_ids() {
        assert!(parse_plan_args(&json!({"tasks": []})).is_err());
        let dup = json!({"tasks": [
            {"id": "a", "description": "one", "action_type": "add"},
            {"id": "a", "description": "two", "action_type": "edit"},
        ]});
        assert!(parse_plan_args(&dup).unwrap_err().contains("duplicate"));
    }

    #[test]
    fn parse_falls_back_to_description_paths_and_unknown_action() {
        let args = json!({"tasks": [
            {"id": "a", "description": "update src/config.rs defaults", "action_type": "transmute"},
        ]});
        let (tasks, _) = parse_plan_args(&args).unwrap();
        assert_eq!(tasks[0].action_type, ActionType::Edit);
        assert_eq!(tasks[0].target_paths, vec!["src/config.rs"]);
    }

    fn repo_with(files: &[&str]) -> RepoContext {
        RepoContext {
            files: files.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn reuse_first_downgrades_exact_target_collision() {
        let repo = repo_with(&["tests/user.test.js"]);
        let mut tasks = vec![Task::new("a", "add tests", ActionType::Add)
            .with_targets(&["tests/user.test.js"])];
        enforce_reuse_first(&mut tasks, &repo);
        assert_eq!(tasks[0].action_type, ActionType::Edit);
        assert!(tasks[0].description.contains("downgraded from add"));
    }

    #[test]
    fn reuse_first_downgrades_near_name_collision() {
        let repo = repo_with(&["tests/user_auth.test.js"]);
        let mut tasks = vec![Task::new("a", "add auth tests", ActionType::Add)
            .with_targets(&["tests/user_auth_new.test.js"])];
        enforce_reuse_first(&mut tasks, &repo);
        assert_eq!(tasks[0].action_type, ActionType::Edit);
        assert_eq!(tasks[0].target_paths, vec!["tests/user_auth.test.js"]);
    }

    #[test]
    fn reuse_first_leaves_genuinely_new_files_alone() {
        let repo = repo_with(&["src/main.rs"]);
        let mut tasks = vec![Task::new("a", "add parser", ActionType::Add)
            .with_targets(&["src/parser.rs"])];
        enforce_reuse_first(&mut tasks, &repo);
        assert_eq!(tasks[0].action_type, ActionType::Add);
    }

    #[test]
    fn test_first_adds_dependency_on_test_authoring() {
        let mut tasks = vec![
            Task::new("impl", "implement src/auth.py login", ActionType::Add)
                .with_targets(&["src/auth.py"]),
            Task::new("tests", "write tests for auth", ActionType::Test)
                .with_targets(&["tests/test_auth.py"]),
        ];
        enforce_test_first(&mut tasks);
        let impl_task = tasks.iter().find(|t| t.id == "impl").unwrap();
        assert!(impl_task.dependencies.contains(&"tests".to_string()));
    }

    #[test]
    fn coverage_appends_a_test_run_for_uncovered_changes() {
        let mut tasks = vec![
            Task::new("a", "add feature", ActionType::Add).with_targets(&["src/f.py"]),
        ];
        ensure_coverage(&mut tasks);
        assert_eq!(tasks.len(), 2);
        let cover = &tasks[1];
        assert_eq!(cover.action_type, ActionType::Test);
        assert!(cover.target_paths.is_empty());
        assert_eq!(cover.dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn coverage_is_satisfied_by_an_existing_test_run() {
        let mut tasks = vec![
            Task::new("a", "add feature", ActionType::Add).with_targets(&["src/f.py"]),
            Task::new("run", "run tests", ActionType::Test).with_deps(&["a"]),
        ];
        ensure_coverage(&mut tasks);
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_authoring_token_overlap_uses_stems() {
        assert!(tokens_overlap(
            &["src/auth.py".to_string()],
            &["tests/auth.py".to_string()]
        ));
        assert!(!tokens_overlap(
            &["src/auth.py".to_string()],
            &["tests/billing.py".to_string()]
        ));
    }
}
