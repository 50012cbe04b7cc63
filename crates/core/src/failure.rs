use serde::{Deserialize, Serialize};

/// Error taxonomy used on every failure path. Carried as a value, never
/// as control flow: recoverable failures route back into retry or replan,
/// unrecoverable ones settle the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// LM unreachable, timed out, or mid-stream death.
    Transport,
    /// Malformed tool arguments or an invalid plan shape.
    Schema,
    /// A tool handler refused or failed (missing file, blocked command).
    Tool,
    /// The verifier judged a completed task wrong.
    Verification,
    /// Dependency cycle, path escape, unknown tool.
    Invariant,
    /// A step/token/wallclock budget ran out.
    Budget,
    /// Cooperative interrupt.
    Interrupted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transport => "transport",
            FailureKind::Schema => "schema",
            FailureKind::Tool => "tool",
            FailureKind::Verification => "verification",
            FailureKind::Invariant => "invariant",
            FailureKind::Budget => "budget",
            FailureKind::Interrupted => "interrupted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub recoverable: bool,
}

impl Failure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
            hint: None,
            recoverable: true,
        }
    }

    pub fn schema(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Schema,
            message: message.into(),
            hint: Some(hint.into()),
            recoverable: true,
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Tool,
            message: message.into(),
            hint: None,
            recoverable: true,
        }
    }

    pub fn verification(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Verification,
            message: message.into(),
            hint: None,
            recoverable: true,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Invariant,
            message: message.into(),
            hint: None,
            recoverable: false,
        }
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Budget,
            message: message.into(),
            hint: None,
            recoverable: false,
        }
    }

    pub fn interrupted() -> Self {
        Self {
            kind: FailureKind::Interrupted,
            message: "run interrupted".into(),
            hint: None,
            recoverable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}
