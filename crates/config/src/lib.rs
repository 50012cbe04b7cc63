use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default)]
    pub verifier: VerifierSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Explicit provider override. When unset, detection walks the
    /// credential-bearing providers in `BUILT_IN_PROVIDERS` order and
    /// falls back to the local provider.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Per-phase overrides, e.g. `planning = "deepseek"`. A phase not
    /// listed here uses the run's selected provider.
    #[serde(default)]
    pub phase_overrides: HashMap<String, String>,
    #[serde(default)]
    pub entries: HashMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ProviderConfig {
    pub fn entry(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.get(name)
    }

    pub fn provider_for_phase(&self, phase: &str) -> Option<&str> {
        self.phase_overrides.get(phase).map(|s| s.as_str())
    }
}

fn default_max_steps() -> u32 {
    200
}

fn default_max_tokens() -> u64 {
    2_000_000
}

fn default_max_wallclock_secs() -> u64 {
    3_600
}

/// Hard upper bounds for a run. Every LM call and tool call decrements
/// the live counters derived from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_max_wallclock_secs")]
    pub max_wallclock_secs: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_tokens: default_max_tokens(),
            max_wallclock_secs: default_max_wallclock_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_initial_timeout_secs() -> u64 {
    120
}

fn default_max_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_initial_timeout_secs")]
    pub initial_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            initial_timeout_secs: default_initial_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One generic agent executes every task.
    Single,
    /// Tasks route to role-specialized sub-agents.
    #[default]
    SubAgent,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Single => write!(f, "single"),
            ExecutionMode::SubAgent => write!(f, "subagent"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "single-agent" => Ok(ExecutionMode::Single),
            "subagent" | "sub-agent" | "sub_agent" => Ok(ExecutionMode::SubAgent),
            other => Err(format!(
                "unknown execution mode: {other} (use single or subagent)"
            )),
        }
    }
}

/// What happens to an in-flight task when the run is interrupted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptPolicy {
    /// Mark the task `stopped` and preserve its transaction (default).
    #[default]
    Freeze,
    /// Roll the current transaction back before checkpointing.
    Rollback,
}

impl FromStr for InterruptPolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "freeze" | "stop" => Ok(InterruptPolicy::Freeze),
            "rollback" | "roll-back" => Ok(InterruptPolicy::Rollback),
            other => Err(format!(
                "unknown interrupt policy: {other} (use freeze or rollback)"
            )),
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_max_task_iterations() -> u32 {
    24
}

fn default_max_task_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Parallel dispatch width for independent tasks. 1 = sequential.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// LM⇄tool iterations a single sub-agent may spend on one task.
    #[serde(default = "default_max_task_iterations")]
    pub max_task_iterations: u32,
    /// Re-queues of a task after verification failure before it fails hard.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    #[serde(default)]
    pub interrupt_policy: InterruptPolicy,
    #[serde(default)]
    pub review_enabled: bool,
    #[serde(default)]
    pub research_enabled: bool,
    #[serde(default)]
    pub prompt_optimization_enabled: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            workers: default_workers(),
            max_task_iterations: default_max_task_iterations(),
            max_task_retries: default_max_task_retries(),
            interrupt_policy: InterruptPolicy::default(),
            review_enabled: false,
            research_enabled: false,
            prompt_optimization_enabled: false,
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".rev_checkpoints")
}

fn default_retain() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// Relative paths resolve against the repository root.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_retain")]
    pub retain: usize,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            retain: default_retain(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.82
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierSettings {
    /// Trigram-Jaccard score at or above which a newly created file is
    /// considered a duplicate of an existing same-directory peer.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

impl Config {
    /// Load `rev.toml` from the repo root (or the user config dir as a
    /// fallback), then apply environment overrides on top.
    pub fn load(repo_root: &std::path::Path) -> Result<Self> {
        let mut config = Self::load_file(repo_root)?.unwrap_or_default();
        config.apply_env();
        Ok(config)
    }

    fn load_file(repo_root: &std::path::Path) -> Result<Option<Self>> {
        let candidates = [
            Some(repo_root.join("rev.toml")),
            dirs::config_dir().map(|d| d.join("rev").join("config.toml")),
        ];
        for path in candidates.into_iter().flatten() {
            if path.exists() {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let config: Config = toml::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                tracing::debug!(path = %path.display(), "loaded config");
                return Ok(Some(config));
            }
        }
        Ok(None)
    }

    /// Environment knobs recognized per the external-interface contract.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("REV_PROVIDER") {
            if !v.is_empty() {
                self.provider.default_provider = Some(v);
            }
        }
        for phase in ["planning", "research", "execution", "verification"] {
            let var = format!("REV_PROVIDER_{}", phase.to_uppercase());
            if let Ok(v) = std::env::var(&var) {
                if !v.is_empty() {
                    self.provider.phase_overrides.insert(phase.to_string(), v);
                }
            }
        }
        if let Some(v) = env_parse::<u32>("REV_MAX_STEPS") {
            self.budget.max_steps = v;
        }
        if let Some(v) = env_parse::<u64>("REV_MAX_TOKENS") {
            self.budget.max_tokens = v;
        }
        if let Some(v) = env_parse::<u64>("REV_MAX_WALLCLOCK_SECS") {
            self.budget.max_wallclock_secs = v;
        }
        if let Some(v) = env_parse::<u32>("REV_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("REV_INITIAL_TIMEOUT_SECS") {
            self.retry.initial_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("REV_MAX_TIMEOUT_SECS") {
            self.retry.max_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("REV_EXECUTION_MODE") {
            match v.parse() {
                Ok(mode) => self.execution.mode = mode,
                Err(e) => tracing::warn!("REV_EXECUTION_MODE ignored: {e}"),
            }
        }
        if let Some(v) = env_parse::<usize>("REV_WORKERS") {
            self.execution.workers = v.max(1);
        }
        if let Ok(v) = std::env::var("REV_INTERRUPT_ROLLBACK") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                self.execution.interrupt_policy = InterruptPolicy::Rollback;
            }
        }
        if let Ok(v) = std::env::var("REV_CHECKPOINT_DIR") {
            if !v.is_empty() {
                self.checkpoint.dir = PathBuf::from(v);
            }
        }
        if let Some(v) = env_parse::<f64>("REV_SIMILARITY_THRESHOLD") {
            if (0.0..=1.0).contains(&v) {
                self.verifier.similarity_threshold = v;
            } else {
                tracing::warn!("REV_SIMILARITY_THRESHOLD out of range, ignored");
            }
        }
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => match v.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("{var} has an unparseable value, ignored");
                None
            }
        },
        _ => None,
    }
}

/// Static descriptor for a known provider. Detection walks this table in
/// order; the first entry whose env var holds a credential wins. The
/// local provider carries no env var and is the unconditional fallback.
///
/// Every entry must speak the OpenAI chat-completions wire format at its
/// base URL, because that is the one transport the client ships. Vendors
/// with their own dialect only appear here through an official
/// OpenAI-compatible endpoint (Gemini); vendors without one are left out
/// rather than advertised and then sent a body they cannot parse.
#[derive(Debug, Clone)]
pub struct ProviderDef {
    pub id: &'static str,
    pub name: &'static str,
    pub env_var: &'static str,
    pub default_base_url: &'static str,
    pub default_model: &'static str,
    /// Tool-choice behavior class: "strict", "any", or "weak".
    pub tool_choice_class: &'static str,
    pub local: bool,
}

pub const BUILT_IN_PROVIDERS: &[ProviderDef] = &[
    ProviderDef {
        id: "openai",
        name: "OpenAI",
        env_var: "OPENAI_API_KEY",
        default_base_url: "https://api.openai.com/v1",
        default_model: "gpt-4.1",
        tool_choice_class: "strict",
        local: false,
    },
    ProviderDef {
        // Gemini's OpenAI-compatibility surface, not its native API.
        id: "gemini",
        name: "Gemini",
        env_var: "GEMINI_API_KEY",
        default_base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        default_model: "gemini-2.5-pro",
        tool_choice_class: "any",
        local: false,
    },
    ProviderDef {
        id: "deepseek",
        name: "DeepSeek",
        env_var: "DEEPSEEK_API_KEY",
        default_base_url: "https://api.deepseek.com/v1",
        default_model: "deepseek-chat",
        tool_choice_class: "weak",
        local: false,
    },
    ProviderDef {
        id: "ollama",
        name: "Ollama",
        env_var: "",
        default_base_url: "http://localhost:11434/v1",
        default_model: "qwen3:32b",
        tool_choice_class: "weak",
        local: true,
    },
];

pub fn find_provider_def(id: &str) -> Option<&'static ProviderDef> {
    BUILT_IN_PROVIDERS.iter().find(|d| d.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.budget.max_steps, 200);
        assert_eq!(config.execution.workers, 1);
        assert_eq!(config.checkpoint.dir, PathBuf::from(".rev_checkpoints"));
        assert_eq!(config.checkpoint.retain, 10);
        assert!((config.verifier.similarity_threshold - 0.82).abs() < f64::EPSILON);
        assert_eq!(config.execution.interrupt_policy, InterruptPolicy::Freeze);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [budget]
            max_steps = 10

            [provider]
            default_provider = "ollama"

            [provider.phase_overrides]
            planning = "deepseek"
            "#,
        )
        .unwrap();
        assert_eq!(config.budget.max_steps, 10);
        assert_eq!(config.budget.max_wallclock_secs, 3600);
        assert_eq!(config.provider.default_provider.as_deref(), Some("ollama"));
        assert_eq!(
            config.provider.provider_for_phase("planning"),
            Some("deepseek")
        );
        assert_eq!(config.provider.provider_for_phase("execution"), None);
    }

    #[test]
    fn execution_mode_from_str() {
        assert_eq!(
            "sub-agent".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::SubAgent
        );
        assert_eq!(
            "single".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Single
        );
        assert!("both".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn provider_table_has_exactly_one_local_fallback() {
        let locals: Vec<_> = BUILT_IN_PROVIDERS.iter().filter(|d| d.local).collect();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].id, "ollama");
        // the local fallback must come last so credentialed providers win
        assert!(BUILT_IN_PROVIDERS.last().unwrap().local);
    }

    #[test]
    fn provider_table_only_lists_chat_completions_surfaces() {
        // vendors without an OpenAI-compatible endpoint are not
        // advertised; gemini appears only through its compat surface
        assert!(find_provider_def("anthropic").is_none());
        let gemini = find_provider_def("gemini").unwrap();
        assert!(gemini.default_base_url.ends_with("/openai"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.budget.max_steps, config.budget.max_steps);
        assert_eq!(back.checkpoint.retain, config.checkpoint.retain);
    }
}
