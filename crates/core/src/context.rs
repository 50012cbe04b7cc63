use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::failure::Failure;
use crate::repo::RepoContext;

/// Cross-component signals. Components push; the orchestrator drains
/// between tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    ReplanImmediately { reason: String },
}

/// The resource a budget check found exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetResource {
    Steps,
    Tokens,
    Wallclock,
}

impl std::fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetResource::Steps => write!(f, "steps"),
            BudgetResource::Tokens => write!(f, "tokens"),
            BudgetResource::Wallclock => write!(f, "wallclock"),
        }
    }
}

/// Decrementing counters for the run. Every LM call and every tool call
/// charges a step; usage events charge tokens; wallclock accrues from
/// run start (timeouts included, since they burn real time).
#[derive(Debug)]
pub struct Budgets {
    max_steps: u32,
    max_tokens: u64,
    max_wallclock_secs: u64,
    steps_used: AtomicU32,
    tokens_used: AtomicU64,
    started_at: Instant,
}

impl Budgets {
    pub fn new(settings: &rev_config::BudgetSettings) -> Self {
        Self {
            max_steps: settings.max_steps,
            max_tokens: settings.max_tokens,
            max_wallclock_secs: settings.max_wallclock_secs,
            steps_used: AtomicU32::new(0),
            tokens_used: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Charge one step. Errors once the step budget is gone.
    pub fn charge_step(&self) -> Result<(), Failure> {
        let used = self.steps_used.fetch_add(1, Ordering::SeqCst) + 1;
        if used > self.max_steps {
            return Err(Failure::budget(format!(
                "step budget exhausted ({} of {})",
                used, self.max_steps
            )));
        }
        Ok(())
    }

    pub fn charge_tokens(&self, n: u64) {
        self.tokens_used.fetch_add(n, Ordering::SeqCst);
    }

    /// First exhausted resource, if any. Token and wallclock budgets are
    /// checked at suspension points rather than failing the charging
    /// call, so an in-flight LM response is never discarded.
    pub fn exhausted(&self) -> Option<BudgetResource> {
        if self.steps_used.load(Ordering::SeqCst) >= self.max_steps {
            return Some(BudgetResource::Steps);
        }
        if self.tokens_used.load(Ordering::SeqCst) >= self.max_tokens {
            return Some(BudgetResource::Tokens);
        }
        if self.started_at.elapsed().as_secs() >= self.max_wallclock_secs {
            return Some(BudgetResource::Wallclock);
        }
        None
    }

    pub fn steps_used(&self) -> u32 {
        self.steps_used.load(Ordering::SeqCst)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::SeqCst)
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }
}

/// The user's request, plus the optimized rewrite when the
/// prompt-optimization phase produced one.
#[derive(Debug, Clone, Default)]
pub struct UserRequest {
    pub original: String,
    pub optimized: Option<String>,
}

impl UserRequest {
    pub fn effective(&self) -> &str {
        self.optimized.as_deref().unwrap_or(&self.original)
    }
}

/// Orchestrator-scoped shared state. Everything mutable is behind its
/// own lock; no lock is held across an await.
pub struct SessionContext {
    pub session_id: String,
    pub request: RwLock<UserRequest>,
    repo: RwLock<Arc<RepoContext>>,
    agent_requests: Mutex<VecDeque<AgentRequest>>,
    insights: Mutex<HashMap<String, String>>,
    pub budgets: Budgets,
    files_inspected: Mutex<HashMap<String, u32>>,
    completed_files: Mutex<HashSet<(String, String)>>,
}

impl SessionContext {
    pub fn new(request: &str, budgets: &rev_config::BudgetSettings) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            request: RwLock::new(UserRequest {
                original: request.to_string(),
                optimized: None,
            }),
            repo: RwLock::new(Arc::new(RepoContext::default())),
            agent_requests: Mutex::new(VecDeque::new()),
            insights: Mutex::new(HashMap::new()),
            budgets: Budgets::new(budgets),
            files_inspected: Mutex::new(HashMap::new()),
            completed_files: Mutex::new(HashSet::new()),
        }
    }

    pub fn repo(&self) -> Arc<RepoContext> {
        Arc::clone(&self.repo.read().unwrap())
    }

    pub fn set_repo(&self, repo: RepoContext) {
        *self.repo.write().unwrap() = Arc::new(repo);
    }

    pub fn push_request(&self, request: AgentRequest) {
        self.agent_requests.lock().unwrap().push_back(request);
    }

    pub fn drain_requests(&self) -> Vec<AgentRequest> {
        self.agent_requests.lock().unwrap().drain(..).collect()
    }

    pub fn record_insight(&self, key: impl Into<String>, value: impl Into<String>) {
        self.insights.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn insights_snapshot(&self) -> HashMap<String, String> {
        self.insights.lock().unwrap().clone()
    }

    /// Multiset of inspected paths, surfaced to the LM to suppress
    /// redundant re-reads.
    pub fn note_inspected(&self, path: &str) -> u32 {
        let mut map = self.files_inspected.lock().unwrap();
        let count = map.entry(path.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn inspected_summary(&self, min_count: u32) -> Vec<(String, u32)> {
        let map = self.files_inspected.lock().unwrap();
        let mut v: Vec<(String, u32)> = map
            .iter()
            .filter(|(_, &c)| c >= min_count)
            .map(|(p, &c)| (p.clone(), c))
            .collect();
        v.sort();
        v
    }

    pub fn note_completed_file(&self, path: &str, operation: &str) {
        self.completed_files
            .lock()
            .unwrap()
            .insert((path.to_string(), operation.to_string()));
    }

    pub fn recently_completed(&self) -> Vec<(String, String)> {
        let set = self.completed_files.lock().unwrap();
        let mut v: Vec<(String, String)> = set.iter().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_budget(steps: u32) -> rev_config::BudgetSettings {
        rev_config::BudgetSettings {
            max_steps: steps,
            max_tokens: 1000,
            max_wallclock_secs: 3600,
        }
    }

    #[test]
    fn step_budget_exhausts_exactly_at_limit() {
        let budgets = Budgets::new(&small_budget(2));
        assert!(budgets.charge_step().is_ok());
        assert!(budgets.exhausted().is_none());
        assert!(budgets.charge_step().is_ok());
        assert_eq!(budgets.exhausted(), Some(BudgetResource::Steps));
        assert!(budgets.charge_step().is_err());
    }

    #[test]
    fn token_budget_checked_at_suspension_points() {
        let budgets = Budgets::new(&small_budget(100));
        budgets.charge_tokens(999);
        assert!(budgets.exhausted().is_none());
        budgets.charge_tokens(1);
        assert_eq!(budgets.exhausted(), Some(BudgetResource::Tokens));
    }

    #[test]
    fn inspected_multiset_counts_repeats() {
        let ctx = SessionContext::new("req", &small_budget(10));
        assert_eq!(ctx.note_inspected("src/a.rs"), 1);
        assert_eq!(ctx.note_inspected("src/a.rs"), 2);
        assert_eq!(ctx.note_inspected("src/b.rs"), 1);
        let summary = ctx.inspected_summary(2);
        assert_eq!(summary, vec![("src/a.rs".to_string(), 2)]);
    }

    #[test]
    fn agent_requests_drain_in_order() {
        let ctx = SessionContext::new("req", &small_budget(10));
        ctx.push_request(AgentRequest::ReplanImmediately {
            reason: "first".into(),
        });
        ctx.push_request(AgentRequest::ReplanImmediately {
            reason: "second".into(),
        });
        let drained = ctx.drain_requests();
        assert_eq!(drained.len(), 2);
        assert!(ctx.drain_requests().is_empty());
    }

    #[test]
    fn completed_files_deduplicate() {
        let ctx = SessionContext::new("req", &small_budget(10));
        ctx.note_completed_file("a.rs", "edit");
        ctx.note_completed_file("a.rs", "edit");
        ctx.note_completed_file("a.rs", "delete");
        assert_eq!(ctx.recently_completed().len(), 2);
    }
}
