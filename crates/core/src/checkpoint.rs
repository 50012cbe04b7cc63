use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::task::{ExecutionPlan, TaskStatus};

pub const CHECKPOINT_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub tasks_completed: usize,
    pub tasks_pending: usize,
    pub tasks_failed: usize,
    pub tasks_total: usize,
    pub next_task_description: Option<String>,
    pub progress_percent: f64,
}

impl ResumeInfo {
    pub fn from_plan(plan: &ExecutionPlan) -> Self {
        let counts = plan.status_counts();
        let total = counts.total();
        let next_task_description = plan
            .tasks
            .iter()
            .find(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .map(|t| t.description.clone());
        Self {
            tasks_completed: counts.completed,
            tasks_pending: counts.pending + counts.in_progress + counts.stopped,
            tasks_failed: counts.failed,
            tasks_total: total,
            next_task_description,
            progress_percent: if total == 0 {
                0.0
            } else {
                counts.completed as f64 * 100.0 / total as f64
            },
        }
    }
}

/// One self-describing checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub version: String,
    pub session_id: String,
    pub checkpoint_number: u32,
    /// ISO-8601.
    pub timestamp: String,
    pub plan: ExecutionPlan,
    pub resume_info: ResumeInfo,
}

pub struct CheckpointStore {
    dir: PathBuf,
    retain: usize,
    next_number: u32,
}

impl CheckpointStore {
    pub fn new(repo_root: &Path, settings: &rev_config::CheckpointSettings) -> Self {
        let dir = if settings.dir.is_absolute() {
            settings.dir.clone()
        } else {
            repo_root.join(&settings.dir)
        };
        Self {
            dir,
            retain: settings.retain.max(1),
            next_number: 1,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&mut self, plan: &ExecutionPlan) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let number = self.next_number;
        self.next_number += 1;

        let now = chrono::Utc::now();
        let document = CheckpointDocument {
            version: CHECKPOINT_VERSION.to_string(),
            session_id: plan.session_id.clone(),
            checkpoint_number: number,
            timestamp: now.to_rfc3339(),
            plan: plan.clone(),
            resume_info: ResumeInfo::from_plan(plan),
        };

        let filename = format!(
            "checkpoint_{}_{:04}_{}.json",
            plan.session_id,
            number,
            now.format("%Y%m%dT%H%M%S"),
        );
        let path = self.dir.join(filename);
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;

        self.prune()?;
        Ok(path)
    }

    /// Keep only the newest `retain` checkpoint files by name order
    /// (session, number, timestamp sort lexicographically).
    fn prune(&self) -> Result<()> {
        let mut files = self.checkpoint_files()?;
        if files.len() <= self.retain {
            return Ok(());
        }
        files.sort();
        let excess = files.len() - self.retain;
        for path in files.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), "could not prune checkpoint: {e}");
            }
        }
        Ok(())
    }

    fn checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("checkpoint_") && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    pub fn load_latest(&self) -> Result<Option<CheckpointDocument>> {
        let mut files = self.checkpoint_files()?;
        if files.is_empty() {
            return Ok(None);
        }
        files.sort();
        let path = files.last().expect("non-empty");
        Ok(Some(Self::load_file(path)?))
    }

    pub fn load_named(&self, name: &str) -> Result<CheckpointDocument> {
        Self::load_file(&self.dir.join(name))
    }

    fn load_file(path: &Path) -> Result<CheckpointDocument> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let document: CheckpointDocument =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(document)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut files = self.checkpoint_files()?;
        files.sort();
        Ok(files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect())
    }

    /// Continue numbering after the loaded checkpoint.
    pub fn resume_numbering(&mut self, document: &CheckpointDocument) {
        self.next_number = document.checkpoint_number + 1;
    }
}

/// Make a loaded plan executable again: in-flight and stopped tasks go
/// back to pending so the dispatcher picks them up.
pub fn prepare_resume(plan: &mut ExecutionPlan) {
    for task in &mut plan.tasks {
        if matches!(task.status, TaskStatus::InProgress | TaskStatus::Stopped) {
            task.status = TaskStatus::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ActionType, Task};

    fn plan_with_tasks(session: &str, n: usize) -> ExecutionPlan {
        let tasks = (0..n)
            .map(|i| Task::new(format!("t{i}"), format!("task {i}"), ActionType::Edit))
            .collect();
        ExecutionPlan::new(session, tasks)
    }

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir, &rev_config::CheckpointSettings::default())
    }

    #[test]
    fn save_writes_a_self_describing_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let mut plan = plan_with_tasks("sess1", 3);
        plan.task_mut("t0").unwrap().status = TaskStatus::Completed;

        let path = store.save(&plan).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("checkpoint_sess1_0001_"));

        let document = store.load_latest().unwrap().unwrap();
        assert_eq!(document.version, CHECKPOINT_VERSION);
        assert_eq!(document.session_id, "sess1");
        assert_eq!(document.checkpoint_number, 1);
        assert_eq!(document.resume_info.tasks_total, 3);
        assert_eq!(document.resume_info.tasks_completed, 1);
        assert!(document.resume_info.next_task_description.is_some());
        // RFC 3339 timestamps parse back.
        assert!(chrono::DateTime::parse_from_rfc3339(&document.timestamp).is_ok());
    }

    #[test]
    fn retention_keeps_only_the_newest_k() {
        let dir = tempfile::tempdir().unwrap();
        let settings = rev_config::CheckpointSettings {
            retain: 3,
            ..Default::default()
        };
        let mut store = CheckpointStore::new(dir.path(), &settings);
        let plan = plan_with_tasks("sess1", 1);
        for _ in 0..6 {
            store.save(&plan).unwrap();
        }
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].contains("_0004_"));
        assert!(listed[2].contains("_0006_"));
    }

    #[test]
    fn prepare_resume_resets_in_flight_tasks() {
        let mut plan = plan_with_tasks("sess1", 4);
        plan.task_mut("t0").unwrap().status = TaskStatus::Completed;
        plan.task_mut("t1").unwrap().status = TaskStatus::InProgress;
        plan.task_mut("t2").unwrap().status = TaskStatus::Stopped;

        prepare_resume(&mut plan);
        assert_eq!(plan.task("t0").unwrap().status, TaskStatus::Completed);
        assert_eq!(plan.task("t1").unwrap().status, TaskStatus::Pending);
        assert_eq!(plan.task("t2").unwrap().status, TaskStatus::Pending);
        assert_eq!(plan.task("t3").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn plan_round_trips_through_a_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let mut plan = plan_with_tasks("sess2", 2);
        plan.task_mut("t1").unwrap().dependencies = vec!["t0".into()];
        plan.goals = crate::goals::derive_goals("fix the bug");

        store.save(&plan).unwrap();
        let loaded = store.load_latest().unwrap().unwrap().plan;
        assert_eq!(loaded.tasks.len(), plan.tasks.len());
        assert_eq!(loaded.tasks[1].dependencies, vec!["t0".to_string()]);
        assert_eq!(loaded.goals.len(), plan.goals.len());
    }

    #[test]
    fn resume_numbering_continues_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let plan = plan_with_tasks("sess3", 1);
        store.save(&plan).unwrap();
        let document = store.load_latest().unwrap().unwrap();

        let mut fresh = CheckpointStore::new(dir.path(), &rev_config::CheckpointSettings::default());
        fresh.resume_numbering(&document);
        let path = fresh.save(&plan).unwrap();
        assert!(path.to_string_lossy().contains("_0002_"));
    }
}
