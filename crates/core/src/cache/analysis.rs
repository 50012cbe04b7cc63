use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Imports and top-level definitions pulled from one source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSource {
    pub imports: Vec<String>,
    pub definitions: Vec<String>,
}

pub type DepGraph = HashMap<String, Vec<String>>;

/// The three wholesale-flushable caches: LM responses, AST parses, and
/// dependency graphs. None is per-file invalidated; a cross-file analysis
/// depends on many file identities, so coherence comes from flushing at
/// phase boundaries after any filesystem mutation.
#[derive(Debug, Default)]
pub struct AnalysisCaches {
    responses: Mutex<HashMap<String, String>>,
    asts: Mutex<HashMap<PathBuf, ParsedSource>>,
    dep_graphs: Mutex<HashMap<String, DepGraph>>,
}

impl AnalysisCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response(&self, key: &str) -> Option<String> {
        self.responses.lock().unwrap().get(key).cloned()
    }

    pub fn store_response(&self, key: impl Into<String>, value: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn ast(&self, path: &Path) -> Option<ParsedSource> {
        self.asts.lock().unwrap().get(path).cloned()
    }

    pub fn store_ast(&self, path: impl Into<PathBuf>, parsed: ParsedSource) {
        self.asts.lock().unwrap().insert(path.into(), parsed);
    }

    pub fn dep_graph(&self, key: &str) -> Option<DepGraph> {
        self.dep_graphs.lock().unwrap().get(key).cloned()
    }

    pub fn store_dep_graph(&self, key: impl Into<String>, graph: DepGraph) {
        self.dep_graphs.lock().unwrap().insert(key.into(), graph);
    }

    /// Flush everything. Idempotent; the orchestrator calls this after
    /// any task batch that mutated the filesystem, before the next
    /// planning/research/validation LM call.
    pub fn clear_all(&self) {
        self.responses.lock().unwrap().clear();
        self.asts.lock().unwrap().clear();
        self.dep_graphs.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.responses.lock().unwrap().is_empty()
            && self.asts.lock().unwrap().is_empty()
            && self.dep_graphs.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_serves_each_cache_kind() {
        let caches = AnalysisCaches::new();
        caches.store_response("k1", "cached reply");
        caches.store_ast(
            "src/a.py",
            ParsedSource {
                imports: vec!["os".into()],
                definitions: vec!["main".into()],
            },
        );
        caches.store_dep_graph("root", HashMap::from([("a".into(), vec!["b".into()])]));

        assert_eq!(caches.response("k1").as_deref(), Some("cached reply"));
        assert_eq!(
            caches.ast(Path::new("src/a.py")).unwrap().imports,
            vec!["os".to_string()]
        );
        assert_eq!(caches.dep_graph("root").unwrap()["a"], vec!["b".to_string()]);
    }

    #[test]
    fn clear_all_is_idempotent() {
        let caches = AnalysisCaches::new();
        caches.store_response("k", "v");
        caches.clear_all();
        assert!(caches.is_empty());
        // second flush is a no-op
        caches.clear_all();
        assert!(caches.is_empty());
        assert!(caches.response("k").is_none());
    }
}
