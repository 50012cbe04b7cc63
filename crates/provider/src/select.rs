use anyhow::Result;

use rev_config::{find_provider_def, Config, ProviderDef, BUILT_IN_PROVIDERS};

use crate::openai_compat::OpenAiCompatProvider;
use crate::types::ToolChoiceStyle;
use crate::LmClient;

/// A resolved provider choice. Provider and model always travel together;
/// phases never mix providers unless the operator set a per-phase override.
#[derive(Debug, Clone)]
pub struct Selection {
    pub def: &'static ProviderDef,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Selection priority: explicit per-phase override, explicit run-level
/// override, first credential-bearing cloud provider in table order,
/// local provider as the unconditional default.
pub fn detect(config: &Config, phase: Option<&str>) -> Result<Selection> {
    detect_with_env(config, phase, |var| std::env::var(var).ok())
}

pub fn detect_with_env(
    config: &Config,
    phase: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Selection> {
    let explicit = phase
        .and_then(|p| config.provider.provider_for_phase(p))
        .or(config.provider.default_provider.as_deref());

    if let Some(name) = explicit {
        let def = find_provider_def(name)
            .ok_or_else(|| anyhow::anyhow!("unknown provider: {name}"))?;
        return Ok(resolve(def, config, &env));
    }

    for def in BUILT_IN_PROVIDERS {
        if def.local {
            continue;
        }
        let has_cred = config
            .provider
            .entry(def.id)
            .and_then(|e| e.api_key.as_deref())
            .map(|k| !k.is_empty())
            .unwrap_or(false)
            || env(def.env_var).map(|v| !v.is_empty()).unwrap_or(false);
        if has_cred {
            return Ok(resolve(def, config, &env));
        }
    }

    let local = BUILT_IN_PROVIDERS
        .iter()
        .find(|d| d.local)
        .expect("provider table always carries a local fallback");
    Ok(resolve(local, config, &env))
}

fn resolve(
    def: &'static ProviderDef,
    config: &Config,
    env: &impl Fn(&str) -> Option<String>,
) -> Selection {
    let entry = config.provider.entry(def.id);
    let api_key = entry
        .and_then(|e| e.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| {
            if def.env_var.is_empty() {
                None
            } else {
                env(def.env_var).filter(|v| !v.is_empty())
            }
        });
    Selection {
        def,
        model: entry
            .and_then(|e| e.model.clone())
            .unwrap_or_else(|| def.default_model.to_string()),
        base_url: entry
            .and_then(|e| e.base_url.clone())
            .unwrap_or_else(|| def.default_base_url.to_string()),
        api_key,
    }
}

/// Build the client for a phase. The returned client is bound to one
/// (provider, model) pair for its lifetime.
pub fn create_client(config: &Config, phase: Option<&str>) -> Result<LmClient> {
    let selection = detect(config, phase)?;
    tracing::info!(
        provider = selection.def.id,
        model = %selection.model,
        phase = phase.unwrap_or("run"),
        "selected provider"
    );
    let provider = OpenAiCompatProvider::new(
        selection.def.id,
        selection.base_url,
        selection.api_key,
        selection.model,
        ToolChoiceStyle::from_class(selection.def.tool_choice_class),
        config.retry.initial_timeout_secs,
    );
    Ok(LmClient::new(Box::new(provider), config.retry.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_with(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn no_credentials_falls_back_to_local() {
        let config = Config::default();
        let sel = detect_with_env(&config, None, env_with(&[])).unwrap();
        assert_eq!(sel.def.id, "ollama");
        assert!(sel.api_key.is_none());
        assert_eq!(sel.model, "qwen3:32b");
    }

    #[test]
    fn first_credential_bearing_provider_wins_in_table_order() {
        let config = Config::default();
        let sel = detect_with_env(
            &config,
            None,
            env_with(&[("GEMINI_API_KEY", "g"), ("DEEPSEEK_API_KEY", "d")]),
        )
        .unwrap();
        assert_eq!(sel.def.id, "gemini");
        assert_eq!(sel.api_key.as_deref(), Some("g"));
    }

    #[test]
    fn explicit_override_beats_credentials() {
        let mut config = Config::default();
        config.provider.default_provider = Some("ollama".into());
        let sel = detect_with_env(&config, None, env_with(&[("OPENAI_API_KEY", "sk-o")])).unwrap();
        assert_eq!(sel.def.id, "ollama");
    }

    #[test]
    fn phase_override_beats_run_default() {
        let mut config = Config::default();
        config.provider.default_provider = Some("ollama".into());
        config
            .provider
            .phase_overrides
            .insert("planning".into(), "deepseek".into());
        let sel = detect_with_env(
            &config,
            Some("planning"),
            env_with(&[("DEEPSEEK_API_KEY", "d")]),
        )
        .unwrap();
        assert_eq!(sel.def.id, "deepseek");
        let other = detect_with_env(
            &config,
            Some("execution"),
            env_with(&[("DEEPSEEK_API_KEY", "d")]),
        )
        .unwrap();
        assert_eq!(other.def.id, "ollama");
    }

    #[test]
    fn unknown_explicit_provider_errors() {
        let mut config = Config::default();
        config.provider.default_provider = Some("nonesuch".into());
        assert!(detect_with_env(&config, None, env_with(&[])).is_err());

        // vendors the transport cannot actually speak to are not in the
        // table, so selecting them is the same error
        config.provider.default_provider = Some("anthropic".into());
        assert!(detect_with_env(&config, None, env_with(&[])).is_err());
    }

    #[test]
    fn config_entry_overrides_model_and_base_url() {
        let mut config = Config::default();
        config.provider.default_provider = Some("ollama".into());
        config.provider.entries.insert(
            "ollama".into(),
            rev_config::ProviderEntry {
                base_url: Some("http://box:11434/v1".into()),
                model: Some("devstral:24b".into()),
                api_key: None,
            },
        );
        let sel = detect_with_env(&config, None, env_with(&[])).unwrap();
        assert_eq!(sel.base_url, "http://box:11434/v1");
        assert_eq!(sel.model, "devstral:24b");
    }
}
