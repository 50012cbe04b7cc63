use std::collections::HashSet;

use crate::planner::extract_path_tokens;
use crate::task::Task;

/// The per-task reevaluation predicate: after a destructive task
/// completes, any pending task that still references a path it touched
/// means the rest of the plan was written against a layout that no
/// longer exists, so replan before continuing.
pub fn should_replan_after(completed: &Task, pending: &[&Task]) -> Option<String> {
    if !completed.action_type.is_destructive() {
        return None;
    }

    let mut modified: HashSet<String> = HashSet::new();
    for path in completed.touched_paths() {
        modified.insert(path.to_string());
    }
    for path in &completed.target_paths {
        modified.insert(path.clone());
    }
    for token in extract_path_tokens(&completed.description) {
        modified.insert(token);
    }

    for task in pending {
        let mut referenced: Vec<String> = task.target_paths.clone();
        referenced.extend(extract_path_tokens(&task.description));
        if let Some(shared) = referenced.iter().find(|p| modified.contains(*p)) {
            return Some(format!(
                "completed {} task {} modified {shared}, which pending task {} still references",
                completed.action_type, completed.id, task.id
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ActionType, Task, ToolEvent};

    fn refactor_touching(path: &str) -> Task {
        let mut task = Task::new("t1", format!("extract class A from {path}"), ActionType::Refactor);
        task.tool_events.push(ToolEvent {
            tool: "edit_file".into(),
            paths: vec![path.to_string()],
            ok: true,
            exit_code: None,
        });
        task
    }

    #[test]
    fn destructive_task_with_referencing_pending_triggers_replan() {
        let completed = refactor_touching("lib/m.py");
        let pending = Task::new("t2", "extract class B from lib/m.py", ActionType::Refactor);
        let reason = should_replan_after(&completed, &[&pending]);
        assert!(reason.is_some());
        assert!(reason.unwrap().contains("lib/m.py"));
    }

    #[test]
    fn non_destructive_task_never_triggers() {
        let mut completed = Task::new("t1", "edit lib/m.py", ActionType::Edit);
        completed.tool_events.push(ToolEvent {
            tool: "edit_file".into(),
            paths: vec!["lib/m.py".into()],
            ok: true,
            exit_code: None,
        });
        let pending = Task::new("t2", "edit lib/m.py again", ActionType::Edit);
        assert!(should_replan_after(&completed, &[&pending]).is_none());
    }

    #[test]
    fn unrelated_pending_tasks_do_not_trigger() {
        let completed = refactor_touching("lib/m.py");
        let pending = Task::new("t2", "document the README.md", ActionType::Document);
        assert!(should_replan_after(&completed, &[&pending]).is_none());
    }

    #[test]
    fn delete_task_matches_on_declared_targets() {
        let mut completed = Task::new("t1", "remove the legacy module", ActionType::Delete);
        completed.target_paths = vec!["src/legacy.rs".into()];
        let pending =
            Task::new("t2", "update callers of src/legacy.rs", ActionType::Edit);
        assert!(should_replan_after(&completed, &[&pending]).is_some());
    }
}
