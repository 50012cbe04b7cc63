use tokio::sync::broadcast;

use crate::orchestrator::Phase;

/// Progress events broadcast by the orchestrator and sub-agents. The CLI
/// subscribes to render progress; the core never touches a terminal.
#[derive(Debug, Clone)]
pub enum RunEvent {
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    TaskStarted {
        task_id: String,
        description: String,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        kind: String,
        message: String,
    },
    TaskRequeued {
        task_id: String,
        retries: u32,
        hint: String,
    },
    ToolCallStarted {
        task_id: String,
        tool: String,
    },
    ToolCallFinished {
        task_id: String,
        tool: String,
        ok: bool,
        elapsed_ms: u64,
    },
    Replanning {
        reason: String,
    },
    Retrying {
        attempt: u32,
        reason: String,
    },
    BudgetWarning {
        resource: String,
        used: u64,
        limit: u64,
    },
    CheckpointSaved {
        path: String,
    },
    SystemMessage(String),
}

pub type EventSender = broadcast::Sender<RunEvent>;

pub fn channel() -> (EventSender, broadcast::Receiver<RunEvent>) {
    broadcast::channel(1024)
}
