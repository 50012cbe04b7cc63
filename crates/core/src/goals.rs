use std::path::Path;

use serde::{Deserialize, Serialize};

/// Outcome of evaluating one metric against the post-execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricOutcome {
    Pass,
    Fail,
    Unknown,
}

/// What a metric actually checks. Evaluators are deliberately small and
/// deterministic; anything needing judgment belongs in the verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricEvaluator {
    FileExists { path: String },
    FileAbsent { path: String },
    FileContains { path: String, needle: String },
    TestsPass,
    TasksAllCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub evaluator: MetricEvaluator,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    pub metrics: Vec<Metric>,
}

/// Facts the evaluators may consult. `tests_passed: None` means no test
/// run was observed this run, which evaluates to `Unknown`, not `Fail`.
#[derive(Debug, Clone, Default)]
pub struct GoalContext {
    pub tests_passed: Option<bool>,
    pub all_tasks_completed: bool,
}

impl Metric {
    pub fn evaluate(&self, repo_root: &Path, ctx: &GoalContext) -> MetricOutcome {
        match &self.evaluator {
            MetricEvaluator::FileExists { path } => {
                if repo_root.join(path).exists() {
                    MetricOutcome::Pass
                } else {
                    MetricOutcome::Fail
                }
            }
            MetricEvaluator::FileAbsent { path } => {
                if repo_root.join(path).exists() {
                    MetricOutcome::Fail
                } else {
                    MetricOutcome::Pass
                }
            }
            MetricEvaluator::FileContains { path, needle } => {
                match std::fs::read_to_string(repo_root.join(path)) {
                    Ok(content) if content.contains(needle) => MetricOutcome::Pass,
                    Ok(_) => MetricOutcome::Fail,
                    Err(_) => MetricOutcome::Fail,
                }
            }
            MetricEvaluator::TestsPass => match ctx.tests_passed {
                Some(true) => MetricOutcome::Pass,
                Some(false) => MetricOutcome::Fail,
                None => MetricOutcome::Unknown,
            },
            MetricEvaluator::TasksAllCompleted => {
                if ctx.all_tasks_completed {
                    MetricOutcome::Pass
                } else {
                    MetricOutcome::Fail
                }
            }
        }
    }
}

impl Goal {
    /// A goal passes when every metric passes; any Unknown makes the
    /// goal Unknown rather than Fail.
    pub fn evaluate(&self, repo_root: &Path, ctx: &GoalContext) -> MetricOutcome {
        let mut saw_unknown = false;
        for metric in &self.metrics {
            match metric.evaluate(repo_root, ctx) {
                MetricOutcome::Fail => return MetricOutcome::Fail,
                MetricOutcome::Unknown => saw_unknown = true,
                MetricOutcome::Pass => {}
            }
        }
        if saw_unknown {
            MetricOutcome::Unknown
        } else {
            MetricOutcome::Pass
        }
    }
}

/// Rule-based goal derivation from the request text. Verbs like "fix"
/// and "add test" imply a passing-test goal; everything gets the
/// all-tasks-completed baseline.
pub fn derive_goals(request: &str) -> Vec<Goal> {
    let lower = request.to_lowercase();
    let mut goals = vec![Goal {
        description: "every planned task completes".into(),
        metrics: vec![Metric {
            name: "tasks_completed".into(),
            evaluator: MetricEvaluator::TasksAllCompleted,
            target: "all".into(),
        }],
    }];

    let wants_tests = ["fix", "add test", "write test", "passing", "bug"]
        .iter()
        .any(|kw| lower.contains(kw));
    if wants_tests {
        goals.push(Goal {
            description: "the test suite passes".into(),
            metrics: vec![Metric {
                name: "tests_pass".into(),
                evaluator: MetricEvaluator::TestsPass,
                target: "exit 0".into(),
            }],
        });
    }
    goals
}
