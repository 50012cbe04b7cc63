use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::failure::Failure;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Add,
    Edit,
    Refactor,
    Test,
    Debug,
    Fix,
    Document,
    Research,
    Analyze,
    Review,
    Delete,
    Move,
}

impl ActionType {
    /// Accepts the aliases models actually produce.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "add" | "create" => Some(ActionType::Add),
            "edit" | "modify" | "update" => Some(ActionType::Edit),
            "refactor" | "extract" => Some(ActionType::Refactor),
            "test" => Some(ActionType::Test),
            "debug" => Some(ActionType::Debug),
            "fix" => Some(ActionType::Fix),
            "document" | "docs" => Some(ActionType::Document),
            "research" | "investigate" => Some(ActionType::Research),
            "analyze" | "analyse" => Some(ActionType::Analyze),
            "review" => Some(ActionType::Review),
            "delete" | "remove" => Some(ActionType::Delete),
            "move" | "rename" => Some(ActionType::Move),
            _ => None,
        }
    }

    /// Destructive actions drive the per-task reevaluation gate: their
    /// file effects can strand later tasks that still reference the old
    /// layout.
    pub fn is_destructive(&self) -> bool {
        matches!(self, ActionType::Delete | ActionType::Move | ActionType::Refactor)
    }

    /// Code-changing actions must be covered by a test-execution task.
    pub fn changes_code(&self) -> bool {
        matches!(
            self,
            ActionType::Add | ActionType::Edit | ActionType::Refactor | ActionType::Fix
        )
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::Add => "add",
            ActionType::Edit => "edit",
            ActionType::Refactor => "refactor",
            ActionType::Test => "test",
            ActionType::Debug => "debug",
            ActionType::Fix => "fix",
            ActionType::Document => "document",
            ActionType::Research => "research",
            ActionType::Analyze => "analyze",
            ActionType::Review => "review",
            ActionType::Delete => "delete",
            ActionType::Move => "move",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Stopped,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Summary of one tool invocation a task performed. Pre-state for
/// rollback lives on the task's transaction; this log feeds the
/// reevaluation predicate and the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool: String,
    pub paths: Vec<String>,
    pub ok: bool,
    /// Exit code for command-running tools; None otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub action_type: ActionType,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub target_paths: Vec<String>,
    #[serde(default)]
    pub tool_events: Vec<ToolEvent>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<Failure>,
    #[serde(default)]
    pub retries: u32,
    /// Error-recovery hints appended for the next sub-agent invocation.
    #[serde(default)]
    pub hints: Vec<String>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, action: ActionType) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            action_type: action,
            status: TaskStatus::Pending,
            risk_level: RiskLevel::default(),
            dependencies: Vec::new(),
            target_paths: Vec::new(),
            tool_events: Vec::new(),
            result: None,
            error: None,
            retries: 0,
            hints: Vec::new(),
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.target_paths = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Paths this task touched, from its tool-event log.
    pub fn touched_paths(&self) -> Vec<&str> {
        self.tool_events
            .iter()
            .flat_map(|e| e.paths.iter().map(|p| p.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.stopped + self.skipped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub session_id: String,
    pub tasks: Vec<Task>,
    /// Next pending position to consider; monotonically non-decreasing
    /// between checkpoints.
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub goals: Vec<crate::goals::Goal>,
}

impl ExecutionPlan {
    pub fn new(session_id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            session_id: session_id.into(),
            tasks,
            current_index: 0,
            goals: Vec::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Stopped => counts.stopped += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Kahn's topological order over the dependency graph. Rejects
    /// cycles and references to missing tasks.
    pub fn topological_order(&self) -> Result<Vec<usize>, Failure> {
        let index_of: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let Some(&d) = index_of.get(dep.as_str()) else {
                    return Err(Failure::invariant(format!(
                        "task {} depends on unknown task {dep}",
                        task.id
                    )));
                };
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        // Seed in plan order so the sort is stable for independent tasks.
        let mut queue: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck: Vec<&str> = (0..self.tasks.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.tasks[i].id.as_str())
                .collect();
            return Err(Failure::invariant(format!(
                "dependency cycle involving tasks: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Reorder `tasks` into topological order in place.
    pub fn sort_topological(&mut self) -> Result<(), Failure> {
        let order = self.topological_order()?;
        let mut sorted = Vec::with_capacity(self.tasks.len());
        for i in &order {
            sorted.push(self.tasks[*i].clone());
        }
        self.tasks = sorted;
        Ok(())
    }

    /// A pending task is eligible when every dependency is completed.
    pub fn eligible_pending(&self) -> Vec<&Task> {
        let completed: HashSet<&str> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d.as_str())))
            .collect()
    }

    /// A pending task is stranded when some dependency already failed
    /// or was skipped; it can never become eligible.
    pub fn stranded_pending(&self) -> Vec<&Task> {
        let dead: HashSet<&str> = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
            .map(|t| t.id.as_str())
            .collect();
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().any(|d| dead.contains(d.as_str())))
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn has_work(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(tasks: Vec<Task>) -> ExecutionPlan {
        ExecutionPlan::new("s1", tasks)
    }

    #[test]
    fn action_type_aliases_parse() {
        assert_eq!(ActionType::parse("docs"), Some(ActionType::Document));
        assert_eq!(ActionType::parse("investigate"), Some(ActionType::Research));
        assert_eq!(ActionType::parse("REMOVE"), Some(ActionType::Delete));
        assert_eq!(ActionType::parse("transmogrify"), None);
    }

    #[test]
    fn destructive_classification() {
        assert!(ActionType::Delete.is_destructive());
        assert!(ActionType::Move.is_destructive());
        assert!(ActionType::Refactor.is_destructive());
        assert!(!ActionType::Edit.is_destructive());
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let p = plan(vec![
            Task::new("t3", "last", ActionType::Delete).with_deps(&["t1", "t2"]),
            Task::new("t1", "first", ActionType::Add),
            Task::new("t2", "second", ActionType::Edit).with_deps(&["t1"]),
        ]);
        let order = p.topological_order().unwrap();
        let ids: Vec<&str> = order.iter().map(|&i| p.tasks[i].id.as_str()).collect();
        let pos = |id: &str| ids.iter().position(|x| *x == id).unwrap();
        assert!(pos("t1") < pos("t2"));
        assert!(pos("t2") < pos("t3"));
    }

    #[test]
    fn cycle_is_rejected() {
        let p = plan(vec![
            Task::new("a", "a", ActionType::Add).with_deps(&["b"]),
            Task::new("b", "b", ActionType::Edit).with_deps(&["a"]),
        ]);
        let err = p.topological_order().unwrap_err();
        assert_eq!(err.kind, crate::failure::FailureKind::Invariant);
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let p = plan(vec![Task::new("a", "a", ActionType::Add).with_deps(&["ghost"])]);
        assert!(p.topological_order().is_err());
    }

    #[test]
    fn status_counts_always_sum_to_total() {
        let mut p = plan(vec![
            Task::new("a", "a", ActionType::Add),
            Task::new("b", "b", ActionType::Edit),
            Task::new("c", "c", ActionType::Test),
        ]);
        assert_eq!(p.status_counts().total(), 3);
        p.task_mut("a").unwrap().status = TaskStatus::Completed;
        p.task_mut("b").unwrap().status = TaskStatus::InProgress;
        let counts = p.status_counts();
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn eligibility_requires_completed_dependencies() {
        let mut p = plan(vec![
            Task::new("a", "a", ActionType::Add),
            Task::new("b", "b", ActionType::Edit).with_deps(&["a"]),
        ]);
        let eligible: Vec<&str> = p.eligible_pending().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(eligible, vec!["a"]);
        p.task_mut("a").unwrap().status = TaskStatus::Completed;
        let eligible: Vec<&str> = p.eligible_pending().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(eligible, vec!["b"]);
    }

    #[test]
    fn stranded_tasks_are_detected() {
        let mut p = plan(vec![
            Task::new("a", "a", ActionType::Add),
            Task::new("b", "b", ActionType::Edit).with_deps(&["a"]),
        ]);
        p.task_mut("a").unwrap().status = TaskStatus::Failed;
        let stranded: Vec<&str> = p.stranded_pending().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(stranded, vec!["b"]);
    }

    #[test]
    fn plan_serde_round_trip_is_equal() {
        let mut p = plan(vec![
            Task::new("a", "write the parser", ActionType::Add).with_targets(&["src/parse.rs"]),
            Task::new("b", "test the parser", ActionType::Test).with_deps(&["a"]),
        ]);
        p.task_mut("a").unwrap().tool_events.push(ToolEvent {
            tool: "write_file".into(),
            paths: vec!["src/parse.rs".into()],
            ok: true,
            exit_code: None,
        });
        let text = serde_json::to_string(&p).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&text).unwrap();
        assert_eq!(back.session_id, p.session_id);
        assert_eq!(back.tasks.len(), p.tasks.len());
        assert_eq!(back.tasks[0].target_paths, p.tasks[0].target_paths);
        assert_eq!(back.tasks[0].tool_events.len(), 1);
        assert_eq!(back.tasks[1].dependencies, vec!["a".to_string()]);
    }
}
