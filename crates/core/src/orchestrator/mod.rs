pub mod loop_guard;
pub mod reevaluate;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rev_provider::{ChatRequest, LmClient, Message, ToolChoice, ToolDefinition};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentKind, SubAgentRunner};
use crate::cache::{AnalysisCaches, FileStateCache};
use crate::checkpoint::{prepare_resume, CheckpointStore};
use crate::context::{AgentRequest, BudgetResource, SessionContext};
use crate::events::{channel, EventSender, RunEvent};
use crate::failure::{Failure, FailureKind};
use crate::goals::{GoalContext, MetricOutcome};
use crate::planner::Planner;
use crate::repo::RepoContext;
use crate::router;
use crate::task::{ActionType, ExecutionPlan, RiskLevel, Task, TaskStatus};
use crate::tools::{ToolContext, ToolRegistry};
use crate::transaction::Transaction;
use crate::verifier::{TaskSnapshot, Verifier};
use loop_guard::LoopGuard;

const MAX_REPLANS: u32 = 8;

/// States of the orchestrator's phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    Learning,
    Research,
    PromptOptimization,
    Planning,
    Review,
    Executing,
    Verifying,
    Replanning,
    Completed,
    Failed,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::Learning => "learning",
            Phase::Research => "research",
            Phase::PromptOptimization => "prompt-optimization",
            Phase::Planning => "planning",
            Phase::Review => "review",
            Phase::Executing => "executing",
            Phase::Verifying => "verifying",
            Phase::Replanning => "replanning",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted(BudgetResource),
    Interrupted,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Failed(Failure),
    Stopped(StopReason),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Failed(f) => match f.kind {
                FailureKind::Schema | FailureKind::Invariant => 2,
                FailureKind::Verification => 3,
                _ => 1,
            },
            RunOutcome::Stopped(StopReason::BudgetExhausted(_)) => 4,
            RunOutcome::Stopped(StopReason::Interrupted) => 5,
        }
    }
}

/// Per-task line of the user-visible run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub error_kind: Option<String>,
    pub recovery: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub session_id: String,
    pub tasks: Vec<TaskSummary>,
    pub goal_results: Vec<(String, MetricOutcome)>,
    pub steps_used: u32,
    pub tokens_used: u64,
    pub replans: u32,
    pub checkpoint: Option<PathBuf>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        for task in &self.tasks {
            let status = serde_json::to_value(task.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            out.push_str(&format!("[{status}] {} - {}", task.id, task.description));
            if let Some(kind) = &task.error_kind {
                out.push_str(&format!(" (error: {kind})"));
            }
            if let Some(recovery) = &task.recovery {
                out.push_str(&format!(" (recovery: {recovery})"));
            }
            out.push('\n');
        }
        for (goal, outcome) in &self.goal_results {
            let word = match outcome {
                MetricOutcome::Pass => "pass",
                MetricOutcome::Fail => "fail",
                MetricOutcome::Unknown => "unknown",
            };
            out.push_str(&format!("goal [{word}] {goal}\n"));
        }
        out.push_str(&format!(
            "steps: {}, tokens: {}, replans: {}\n",
            self.steps_used, self.tokens_used, self.replans
        ));
        out
    }
}

/// One LM client per phase. Provider and model always travel together;
/// phases only differ when the operator set a per-phase override.
pub struct PhaseClients {
    pub planning: Arc<LmClient>,
    pub execution: Arc<LmClient>,
    pub research: Arc<LmClient>,
    pub review: Arc<LmClient>,
}

impl PhaseClients {
    pub fn from_config(config: &rev_config::Config) -> Result<Self> {
        Ok(Self {
            planning: Arc::new(rev_provider::select::create_client(
                config,
                Some("planning"),
            )?),
            execution: Arc::new(rev_provider::select::create_client(
                config,
                Some("execution"),
            )?),
            research: Arc::new(rev_provider::select::create_client(
                config,
                Some("research"),
            )?),
            review: Arc::new(rev_provider::select::create_client(
                config,
                Some("verification"),
            )?),
        })
    }

    /// Every phase on one client; used when no per-phase overrides exist
    /// and throughout the tests.
    pub fn single(client: Arc<LmClient>) -> Self {
        Self {
            planning: Arc::clone(&client),
            execution: Arc::clone(&client),
            research: Arc::clone(&client),
            review: client,
        }
    }
}

/// Opaque handle to whatever persistent memory the host provides. The
/// learning phase reads it; research writes insights back.
pub trait InsightStore: Send + Sync {
    fn load(&self) -> HashMap<String, String>;
    fn save(&self, insights: &HashMap<String, String>);
}

enum TaskRunResult {
    Completed,
    Requeued,
    FailedHard,
    NeedsReplan(String),
    Interrupted,
    BudgetExhausted(BudgetResource),
}

pub struct Orchestrator {
    config: rev_config::Config,
    repo_root: PathBuf,
    clients: PhaseClients,
    registry: ToolRegistry,
    file_cache: Arc<FileStateCache>,
    analysis: Arc<AnalysisCaches>,
    session: Arc<SessionContext>,
    checkpoints: CheckpointStore,
    events: EventSender,
    cancel: CancellationToken,
    verifier: Verifier,
    loop_guard: LoopGuard,
    insights: Option<Arc<dyn InsightStore>>,
    phase: Phase,
    replans: u32,
    last_checkpoint: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        config: rev_config::Config,
        clients: PhaseClients,
        request: &str,
    ) -> Self {
        let repo_root = repo_root.into();
        let session = Arc::new(SessionContext::new(request, &config.budget));
        let checkpoints = CheckpointStore::new(&repo_root, &config.checkpoint);
        let verifier = Verifier::new(config.verifier.similarity_threshold);
        let (events, _) = channel();
        Self {
            config,
            repo_root,
            clients,
            registry: crate::tools::default_registry(),
            file_cache: Arc::new(FileStateCache::new()),
            analysis: Arc::new(AnalysisCaches::new()),
            session,
            checkpoints,
            events,
            cancel: CancellationToken::new(),
            verifier,
            loop_guard: LoopGuard::default(),
            insights: None,
            phase: Phase::Init,
            replans: 0,
            last_checkpoint: None,
        }
    }

    pub fn with_insight_store(mut self, store: Arc<dyn InsightStore>) -> Self {
        self.insights = Some(store);
        self
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session_id(&self) -> String {
        self.session.session_id.clone()
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.phase;
        if from != to {
            tracing::info!(%from, %to, "phase transition");
            let _ = self.events.send(RunEvent::PhaseChanged { from, to });
            self.phase = to;
        }
    }

    /// Run the session's request end to end.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.set_phase(Phase::Init);
        self.refresh_repo().await?;

        if let Some(store) = self.insights.clone() {
            self.set_phase(Phase::Learning);
            for (key, value) in store.load() {
                self.session.record_insight(key, value);
            }
        }

        let research_findings = if self.config.execution.research_enabled {
            self.set_phase(Phase::Research);
            self.run_research().await
        } else {
            None
        };

        if self.config.execution.prompt_optimization_enabled {
            self.set_phase(Phase::PromptOptimization);
            self.optimize_prompt().await;
        }

        self.set_phase(Phase::Planning);
        let request = self.session.request.read().unwrap().effective().to_string();
        if self.session.budgets.charge_step().is_err() {
            let empty = ExecutionPlan::new(self.session.session_id.clone(), Vec::new());
            return self.stop_budget(empty, BudgetResource::Steps);
        }
        let repo = self.session.repo();
        let planner = Planner::new(&self.clients.planning);
        let plan = match planner
            .build_plan(
                &self.session.session_id,
                &request,
                &repo,
                research_findings.as_deref(),
                None,
            )
            .await
        {
            Ok(plan) => plan,
            Err(failure) => return Ok(self.report_failed(None, failure)),
        };

        let plan = if self.config.execution.review_enabled {
            self.set_phase(Phase::Review);
            match self.review_plan(plan, &request).await {
                Ok(plan) => plan,
                Err(failure) => return Ok(self.report_failed(None, failure)),
            }
        } else {
            plan
        };

        self.execute_plan(plan).await
    }

    /// Load the latest checkpoint and continue executing.
    pub async fn resume(&mut self) -> Result<RunReport> {
        let Some(document) = self.checkpoints.load_latest()? else {
            anyhow::bail!("no checkpoint to resume from");
        };
        self.checkpoints.resume_numbering(&document);
        let mut plan = document.plan;
        prepare_resume(&mut plan);
        self.refresh_repo().await?;
        self.execute_plan(plan).await
    }

    async fn refresh_repo(&self) -> Result<()> {
        let repo = RepoContext::capture(&self.repo_root).await?;
        self.session.set_repo(repo);
        Ok(())
    }

    /// Response-cached chat for the deterministic phases (optimization,
    /// review). The cache key covers provider, model, messages, and tool
    /// schemas; a flush at any phase boundary empties it.
    async fn chat_cached(
        &self,
        client: &LmClient,
        request: &ChatRequest,
    ) -> Result<rev_provider::LmResponse> {
        let key = rev_provider::request_fingerprint(client.provider_name(), request);
        if let Some(cached) = self.analysis.response(&key) {
            if let Ok(response) = serde_json::from_str(&cached) {
                tracing::debug!("serving LM response from cache");
                return Ok(response);
            }
        }
        let response = client.chat(request).await?;
        if let Ok(serialized) = serde_json::to_string(&response) {
            self.analysis.store_response(key, serialized);
        }
        Ok(response)
    }

    async fn run_research(&mut self) -> Option<String> {
        let request = self.session.request.read().unwrap().original.clone();
        let mut task = Task::new(
            "research0",
            format!("Investigate the repository as relevant to: {request}"),
            ActionType::Research,
        );
        let ctx = self.tool_context(&task);
        let runner = SubAgentRunner {
            client: &self.clients.research,
            registry: &self.registry,
            session: &self.session,
            events: self.events.clone(),
            max_iterations: self.config.execution.max_task_iterations,
            loop_guard: Some(&self.loop_guard),
        };
        match runner.run(AgentKind::Research, &mut task, &ctx).await {
            Ok(outcome) if !outcome.result.is_empty() => {
                self.session.record_insight("research", outcome.result.clone());
                if let Some(store) = &self.insights {
                    store.save(&self.session.insights_snapshot());
                }
                Some(outcome.result)
            }
            Ok(_) => None,
            Err(failure) => {
                tracing::warn!(%failure, "research phase failed; continuing without findings");
                None
            }
        }
    }

    async fn optimize_prompt(&mut self) {
        if self.session.budgets.charge_step().is_err() {
            return;
        }
        let original = self.session.request.read().unwrap().original.clone();
        let mut chat = ChatRequest::new(self.clients.planning.default_model());
        chat.system = Some(
            "Rewrite the user's request as a precise, unambiguous instruction \
             for a coding agent. Keep every stated constraint. Reply with the \
             rewritten request only."
                .to_string(),
        );
        chat.messages = vec![Message::user(original)];
        chat.tool_choice = ToolChoice::None;
        match self.chat_cached(&self.clients.planning, &chat).await {
            Ok(response) if !response.text.trim().is_empty() => {
                if let Some(usage) = &response.usage {
                    self.session.budgets.charge_tokens(usage.total());
                }
                self.session.request.write().unwrap().optimized = Some(response.text);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("prompt optimization failed: {e}"),
        }
    }

    async fn review_plan(
        &mut self,
        plan: ExecutionPlan,
        request: &str,
    ) -> Result<ExecutionPlan, Failure> {
        self.session.budgets.charge_step()?;
        let review_tool = ToolDefinition {
            name: "submit_review".into(),
            description: "Submit the plan review verdict.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "verdict": { "type": "string", "enum": ["approve", "revise", "reject"] },
                    "feedback": { "type": "string" }
                },
                "required": ["verdict"]
            }),
        };
        let mut chat = ChatRequest::new(self.clients.review.default_model());
        chat.system = Some(
            "Review the execution plan against the request. Approve when it is \
             complete and safely ordered, request a revision with concrete \
             feedback when fixable, reject only when the request itself cannot \
             be planned."
                .to_string(),
        );
        chat.messages = vec![Message::user(format!(
            "Request:\n{request}\n\nPlan:\n{}",
            serde_json::to_string_pretty(&plan.tasks).unwrap_or_default()
        ))];
        chat.tools = vec![review_tool];
        chat.tool_choice = ToolChoice::Enforced;

        let response = self
            .chat_cached(&self.clients.review, &chat)
            .await
            .map_err(|e| Failure::transport(format!("review call failed: {e}")))?;
        if let Some(usage) = &response.usage {
            self.session.budgets.charge_tokens(usage.total());
        }

        let verdict = response
            .tool_calls
            .iter()
            .find(|c| c.name == "submit_review")
            .and_then(|c| c.arguments.get("verdict"))
            .and_then(|v| v.as_str())
            .unwrap_or("approve")
            .to_string();
        let feedback = response
            .tool_calls
            .first()
            .and_then(|c| c.arguments.get("feedback"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        match verdict.as_str() {
            "approve" => Ok(plan),
            "revise" => {
                self.set_phase(Phase::Planning);
                let repo = self.session.repo();
                let planner = Planner::new(&self.clients.planning);
                planner
                    .build_plan(
                        &self.session.session_id,
                        request,
                        &repo,
                        None,
                        Some(&format!("review requested changes: {feedback}")),
                    )
                    .await
            }
            _ => Err(Failure::invariant(format!(
                "plan rejected by review: {feedback}"
            ))),
        }
    }

    async fn execute_plan(&mut self, mut plan: ExecutionPlan) -> Result<RunReport> {
        self.set_phase(Phase::Executing);

        loop {
            if self.cancel.is_cancelled() {
                return self.stop_interrupted(plan);
            }
            if let Some(resource) = self.session.budgets.exhausted() {
                return self.stop_budget(plan, resource);
            }

            let mut replan_reason: Option<String> = self
                .session
                .drain_requests()
                .into_iter()
                .map(|AgentRequest::ReplanImmediately { reason }| reason)
                .next();

            if replan_reason.is_none() {
                // Pending tasks whose dependencies already failed can
                // never run; skip them so the plan terminates.
                let stranded: Vec<String> = plan
                    .stranded_pending()
                    .iter()
                    .map(|t| t.id.clone())
                    .collect();
                for id in stranded {
                    tracing::warn!(task = %id, "skipping task with failed dependency");
                    if let Some(task) = plan.task_mut(&id) {
                        task.status = TaskStatus::Skipped;
                    }
                }

                let eligible: Vec<String> = plan
                    .eligible_pending()
                    .iter()
                    .map(|t| t.id.clone())
                    .collect();
                if eligible.is_empty() {
                    match self.finish(&plan) {
                        FinishDecision::Done(report) => return Ok(report),
                        FinishDecision::Replan(reason) => replan_reason = Some(reason),
                    }
                } else {
                    let batch = self.select_batch(&plan, &eligible);
                    let results = self.run_batch(&mut plan, &batch).await;

                    // Any filesystem mutation in this batch invalidates
                    // the cross-file analyses before the next LM-facing
                    // phase sees them.
                    let mutated = batch
                        .iter()
                        .filter_map(|id| plan.task(id))
                        .flat_map(|t| t.tool_events.iter())
                        .any(|e| {
                            matches!(
                                e.tool.as_str(),
                                "write_file" | "edit_file" | "append_file" | "delete_file"
                                    | "move_file"
                            )
                        });
                    if mutated {
                        self.analysis.clear_all();
                    }

                    self.set_phase(Phase::Verifying);
                    for (task_id, result) in results {
                        match result {
                            TaskRunResult::Completed => {
                                // current_index advances to the next
                                // pending position, never backwards.
                                plan.current_index = plan.current_index.max(
                                    plan.tasks
                                        .iter()
                                        .position(|t| t.status == TaskStatus::Pending)
                                        .unwrap_or(plan.tasks.len()),
                                );
                                let completed = plan.task(&task_id).cloned();
                                if let (None, Some(task)) = (&replan_reason, completed) {
                                    let pending: Vec<&Task> = plan
                                        .tasks
                                        .iter()
                                        .filter(|t| t.status == TaskStatus::Pending)
                                        .collect();
                                    if let Some(reason) =
                                        reevaluate::should_replan_after(&task, &pending)
                                    {
                                        replan_reason = Some(reason);
                                    }
                                }
                            }
                            TaskRunResult::Requeued | TaskRunResult::FailedHard => {}
                            TaskRunResult::NeedsReplan(reason) => {
                                if replan_reason.is_none() {
                                    replan_reason = Some(reason);
                                }
                            }
                            TaskRunResult::Interrupted => {
                                return self.stop_interrupted(plan);
                            }
                            TaskRunResult::BudgetExhausted(resource) => {
                                return self.stop_budget(plan, resource);
                            }
                        }
                    }
                    self.set_phase(Phase::Executing);
                }
            }

            if let Some(reason) = replan_reason {
                if self.replans >= MAX_REPLANS {
                    return Ok(self.report_failed(
                        Some(&plan),
                        Failure::verification(format!(
                            "replan limit reached ({MAX_REPLANS}); last reason: {reason}"
                        )),
                    ));
                }
                plan = match self.replan(&plan, &reason).await {
                    Ok(new_plan) => new_plan,
                    Err(failure) if failure.kind == FailureKind::Budget => {
                        let resource = self
                            .session
                            .budgets
                            .exhausted()
                            .unwrap_or(BudgetResource::Steps);
                        return self.stop_budget(plan, resource);
                    }
                    Err(failure) => return Ok(self.report_failed(Some(&plan), failure)),
                };
                self.set_phase(Phase::Executing);
            }
        }
    }

    /// Eligible tasks to run now. One task when sequential; up to
    /// `workers` tasks with pairwise-disjoint target paths otherwise.
    fn select_batch(&self, plan: &ExecutionPlan, eligible: &[String]) -> Vec<String> {
        let workers = self.config.execution.workers.max(1);
        if workers == 1 {
            return eligible.iter().take(1).cloned().collect();
        }
        let mut batch: Vec<String> = Vec::new();
        let mut claimed: Vec<String> = Vec::new();
        for id in eligible {
            if batch.len() >= workers {
                break;
            }
            let Some(task) = plan.task(id) else { continue };
            let overlaps = task
                .target_paths
                .iter()
                .any(|p| claimed.iter().any(|c| c == p));
            if overlaps {
                continue;
            }
            claimed.extend(task.target_paths.iter().cloned());
            batch.push(id.clone());
        }
        batch
    }

    async fn run_batch(
        &self,
        plan: &mut ExecutionPlan,
        batch: &[String],
    ) -> Vec<(String, TaskRunResult)> {
        let mut tasks: Vec<Task> = Vec::new();
        for id in batch {
            if let Some(task) = plan.task_mut(id) {
                task.status = TaskStatus::InProgress;
                tasks.push(task.clone());
            }
        }

        let futures: Vec<_> = tasks.into_iter().map(|t| self.run_one(t)).collect();
        let finished = futures::future::join_all(futures).await;

        let mut results = Vec::with_capacity(finished.len());
        for (task, result) in finished {
            let id = task.id.clone();
            if let Some(slot) = plan.task_mut(&id) {
                *slot = task;
            }
            results.push((id, result));
        }
        results
    }

    fn tool_context(&self, task: &Task) -> ToolContext {
        ToolContext {
            repo_root: self.repo_root.clone(),
            file_cache: Arc::clone(&self.file_cache),
            session: Arc::clone(&self.session),
            transaction: Arc::new(tokio::sync::Mutex::new(Transaction::begin(&task.id))),
            cancel: self.cancel.clone(),
            allow_destructive: task.risk_level >= RiskLevel::High,
        }
    }

    /// Drive one task through its sub-agent and the verifier, applying
    /// the retry-with-hint and interrupt policies. The returned task
    /// carries all mutations and is written back into the plan.
    async fn run_one(&self, mut task: Task) -> (Task, TaskRunResult) {
        let _ = self.events.send(RunEvent::TaskStarted {
            task_id: task.id.clone(),
            description: task.description.clone(),
        });

        let snapshot = TaskSnapshot::capture(&self.repo_root, &task);
        let ctx = self.tool_context(&task);
        let runner = SubAgentRunner {
            client: &self.clients.execution,
            registry: &self.registry,
            session: &self.session,
            events: self.events.clone(),
            max_iterations: self.config.execution.max_task_iterations,
            loop_guard: Some(&self.loop_guard),
        };
        let kind = router::route(task.action_type);

        let outcome = runner.run(kind, &mut task, &ctx).await;

        match outcome {
            Err(failure) if failure.kind == FailureKind::Interrupted => {
                match self.config.execution.interrupt_policy {
                    rev_config::InterruptPolicy::Freeze => {
                        task.status = TaskStatus::Stopped;
                    }
                    rev_config::InterruptPolicy::Rollback => {
                        let mut tx = ctx.transaction.lock().await;
                        tx.rollback(&self.file_cache);
                        task.status = TaskStatus::Pending;
                    }
                }
                (task, TaskRunResult::Interrupted)
            }
            Err(failure) if failure.kind == FailureKind::Budget => {
                // Frozen, not failed: resume resets it to pending.
                task.status = TaskStatus::Stopped;
                let resource = self
                    .session
                    .budgets
                    .exhausted()
                    .unwrap_or(BudgetResource::Steps);
                (task, TaskRunResult::BudgetExhausted(resource))
            }
            Err(failure) => {
                let result = self.handle_task_failure(&mut task, failure, "sub-agent error");
                (task, result)
            }
            Ok(outcome) => {
                if let Some(hint) = outcome.replan_hint {
                    // Loop guard tripped: hand the decision back to the
                    // planner rather than burning more iterations.
                    task.status = TaskStatus::Pending;
                    task.hints.push(hint.clone());
                    self.loop_guard.reset();
                    return (task, TaskRunResult::NeedsReplan(hint));
                }
                task.result = Some(outcome.result);

                let verification = self.verifier.verify(&task, &self.repo_root, &snapshot);
                if verification.passed {
                    task.status = TaskStatus::Completed;
                    task.error = None;
                    ctx.transaction.lock().await.commit();
                    for path in &task.target_paths {
                        self.session
                            .note_completed_file(path, &task.action_type.to_string());
                    }
                    let _ = self.events.send(RunEvent::TaskCompleted {
                        task_id: task.id.clone(),
                    });
                    (task, TaskRunResult::Completed)
                } else if verification.should_replan {
                    task.status = TaskStatus::Failed;
                    task.error = Some(Failure::verification(verification.message.clone()));
                    let _ = self.events.send(RunEvent::TaskFailed {
                        task_id: task.id.clone(),
                        kind: "verification".into(),
                        message: verification.message.clone(),
                    });
                    let mut reason = verification.message.clone();
                    if let Some(suggestion) =
                        verification.details.get("suggestion").and_then(|s| s.as_str())
                    {
                        reason.push_str("; ");
                        reason.push_str(suggestion);
                    }
                    (task, TaskRunResult::NeedsReplan(reason))
                } else {
                    let failure = Failure::verification(verification.message.clone());
                    let result = self.handle_task_failure(
                        &mut task,
                        failure,
                        &verification.message,
                    );
                    (task, result)
                }
            }
        }
    }

    /// Bounded retry-with-hint, then hard failure. Recoverable failures
    /// re-queue the task with the error appended for the next attempt.
    fn handle_task_failure(
        &self,
        task: &mut Task,
        failure: Failure,
        hint_text: &str,
    ) -> TaskRunResult {
        if failure.recoverable && task.retries < self.config.execution.max_task_retries {
            task.retries += 1;
            task.status = TaskStatus::Pending;
            task.hints.push(hint_text.to_string());
            let _ = self.events.send(RunEvent::TaskRequeued {
                task_id: task.id.clone(),
                retries: task.retries,
                hint: hint_text.to_string(),
            });
            TaskRunResult::Requeued
        } else {
            task.status = TaskStatus::Failed;
            let _ = self.events.send(RunEvent::TaskFailed {
                task_id: task.id.clone(),
                kind: failure.kind.to_string(),
                message: failure.message.clone(),
            });
            task.error = Some(failure);
            TaskRunResult::FailedHard
        }
    }

    /// Drop the pending tail, refresh the world, and ask the planner for
    /// a new tail based on current repository state.
    async fn replan(
        &mut self,
        plan: &ExecutionPlan,
        reason: &str,
    ) -> Result<ExecutionPlan, Failure> {
        self.set_phase(Phase::Replanning);
        self.replans += 1;
        let _ = self.events.send(RunEvent::Replanning {
            reason: reason.to_string(),
        });
        self.session.budgets.charge_step()?;

        self.refresh_repo()
            .await
            .map_err(|e| Failure::transport(format!("context refresh failed: {e}")))?;
        self.analysis.clear_all();
        self.loop_guard.reset();

        let mut kept: Vec<Task> = plan
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal() || t.status == TaskStatus::InProgress)
            .cloned()
            .collect();
        // History superseded by this replan: recoverable failures become
        // skipped; the new tail owns their outcome now.
        for task in &mut kept {
            if task.status == TaskStatus::Failed
                && task.error.as_ref().map(|e| e.recoverable).unwrap_or(false)
            {
                task.status = TaskStatus::Skipped;
            }
        }

        let request = self.session.request.read().unwrap().effective().to_string();
        let repo = self.session.repo();
        let research = self.session.insights_snapshot().get("research").cloned();
        let planner = Planner::new(&self.clients.planning);
        let tail = planner
            .build_plan(
                &plan.session_id,
                &request,
                &repo,
                research.as_deref(),
                Some(reason),
            )
            .await?;

        let mut tasks = kept;
        let kept_ids: std::collections::HashSet<String> =
            tasks.iter().map(|t| t.id.clone()).collect();

        // Fresh tail ids may collide with kept history; rename them and
        // patch intra-tail dependency references to match.
        let mut renames: HashMap<String, String> = HashMap::new();
        let mut tail_tasks = tail.tasks;
        for task in &mut tail_tasks {
            if kept_ids.contains(&task.id) {
                let mut renamed = format!("{}r{}", task.id, self.replans);
                while kept_ids.contains(&renamed) {
                    renamed.push('x');
                }
                renames.insert(task.id.clone(), renamed.clone());
                task.id = renamed;
            }
        }
        let tail_ids: std::collections::HashSet<String> =
            tail_tasks.iter().map(|t| t.id.clone()).collect();
        for task in &mut tail_tasks {
            for dep in &mut task.dependencies {
                if let Some(renamed) = renames.get(dep) {
                    *dep = renamed.clone();
                }
            }
            // A tail task may only depend on kept history or the tail.
            task.dependencies
                .retain(|d| kept_ids.contains(d) || tail_ids.contains(d));
        }
        tasks.extend(tail_tasks);

        let mut new_plan = ExecutionPlan::new(plan.session_id.clone(), tasks);
        new_plan.goals = plan.goals.clone();
        new_plan.current_index = new_plan
            .tasks
            .iter()
            .position(|t| t.status == TaskStatus::Pending)
            .unwrap_or(0);
        new_plan.topological_order()?;
        Ok(new_plan)
    }

    fn finish(&mut self, plan: &ExecutionPlan) -> FinishDecision {
        let goal_ctx = self.goal_context(plan);
        let repo_root = self.repo_root.clone();
        let results: Vec<(String, MetricOutcome)> = plan
            .goals
            .iter()
            .map(|g| (g.description.clone(), g.evaluate(&repo_root, &goal_ctx)))
            .collect();

        let all_pass = !results.is_empty()
            && results.iter().all(|(_, o)| *o == MetricOutcome::Pass);
        let no_goals = results.is_empty();

        if all_pass || (no_goals && goal_ctx.all_tasks_completed) {
            self.set_phase(Phase::Completed);
            return FinishDecision::Done(self.build_report(
                plan,
                RunOutcome::Completed,
                results,
            ));
        }

        let budget_left = self.session.budgets.exhausted().is_none();
        if budget_left && self.replans < MAX_REPLANS {
            let unmet: Vec<&str> = results
                .iter()
                .filter(|(_, o)| *o != MetricOutcome::Pass)
                .map(|(d, _)| d.as_str())
                .collect();
            let reason = if unmet.is_empty() {
                "tasks remain unfinished".to_string()
            } else {
                format!("goals not yet met: {}", unmet.join("; "))
            };
            return FinishDecision::Replan(reason);
        }

        self.set_phase(Phase::Failed);
        FinishDecision::Done(self.build_report(
            plan,
            RunOutcome::Failed(Failure::verification("goals were not met")),
            results,
        ))
    }

    fn goal_context(&self, plan: &ExecutionPlan) -> GoalContext {
        let tests_passed = plan
            .tasks
            .iter()
            .flat_map(|t| t.tool_events.iter())
            .filter(|e| e.tool == "run_tests")
            .filter_map(|e| e.exit_code)
            .next_back()
            .map(|code| crate::tools::run_tests::classify_exit_code(code).passed());
        // Skipped tasks were superseded by a replan; the plan is done
        // when everything else completed and something actually ran.
        let all_tasks_completed = !plan.tasks.is_empty()
            && plan
                .tasks
                .iter()
                .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped))
            && plan.tasks.iter().any(|t| t.status == TaskStatus::Completed);
        GoalContext {
            tests_passed,
            all_tasks_completed,
        }
    }

    fn stop_budget(
        &mut self,
        mut plan: ExecutionPlan,
        resource: BudgetResource,
    ) -> Result<RunReport> {
        let _ = self.events.send(RunEvent::BudgetWarning {
            resource: resource.to_string(),
            used: match resource {
                BudgetResource::Steps => self.session.budgets.steps_used() as u64,
                _ => self.session.budgets.tokens_used(),
            },
            limit: match resource {
                BudgetResource::Steps => self.session.budgets.max_steps() as u64,
                _ => 0,
            },
        });
        // Freeze anything in flight so resume re-queues it.
        for task in &mut plan.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Stopped;
            }
        }
        self.save_checkpoint(&plan);
        self.set_phase(Phase::Stopped);
        let goal_results = plan
            .goals
            .iter()
            .map(|g| (g.description.clone(), MetricOutcome::Unknown))
            .collect();
        Ok(self.build_report(
            &plan,
            RunOutcome::Stopped(StopReason::BudgetExhausted(resource)),
            goal_results,
        ))
    }

    fn stop_interrupted(&mut self, mut plan: ExecutionPlan) -> Result<RunReport> {
        for task in &mut plan.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Stopped;
            }
        }
        self.save_checkpoint(&plan);
        self.set_phase(Phase::Stopped);
        let goal_results = plan
            .goals
            .iter()
            .map(|g| (g.description.clone(), MetricOutcome::Unknown))
            .collect();
        Ok(self.build_report(
            &plan,
            RunOutcome::Stopped(StopReason::Interrupted),
            goal_results,
        ))
    }

    fn save_checkpoint(&mut self, plan: &ExecutionPlan) {
        match self.checkpoints.save(plan) {
            Ok(path) => {
                let _ = self.events.send(RunEvent::CheckpointSaved {
                    path: path.display().to_string(),
                });
                self.last_checkpoint = Some(path);
            }
            Err(e) => tracing::error!("checkpoint save failed: {e}"),
        }
    }

    fn report_failed(&mut self, plan: Option<&ExecutionPlan>, failure: Failure) -> RunReport {
        self.set_phase(Phase::Failed);
        let empty = ExecutionPlan::new(self.session.session_id.clone(), Vec::new());
        let plan = plan.unwrap_or(&empty);
        self.build_report(plan, RunOutcome::Failed(failure), Vec::new())
    }

    fn build_report(
        &self,
        plan: &ExecutionPlan,
        outcome: RunOutcome,
        goal_results: Vec<(String, MetricOutcome)>,
    ) -> RunReport {
        let tasks = plan
            .tasks
            .iter()
            .map(|t| TaskSummary {
                id: t.id.clone(),
                description: t.description.clone(),
                status: t.status,
                error_kind: t.error.as_ref().map(|e| e.kind.to_string()),
                recovery: if t.retries > 0 {
                    Some(format!("retried {} time(s)", t.retries))
                } else {
                    None
                },
            })
            .collect();
        RunReport {
            outcome,
            session_id: plan.session_id.clone(),
            tasks,
            goal_results,
            steps_used: self.session.budgets.steps_used(),
            tokens_used: self.session.budgets.tokens_used(),
            replans: self.replans,
            checkpoint: self.last_checkpoint.clone(),
        }
    }
}

enum FinishDecision {
    Done(RunReport),
    Replan(String),
}
