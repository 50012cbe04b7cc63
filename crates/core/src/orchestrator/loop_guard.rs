use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

const DEFAULT_MAX_REPEATS: u32 = 3;

/// Detects degenerate loops: the same tool called with identical
/// arguments over and over (which covers repeated reads of one path).
/// Once tripped it stays tripped until reset at the next replan.
#[derive(Debug)]
pub struct LoopGuard {
    max_repeats: u32,
    seen: Mutex<HashMap<String, u32>>,
    tripped: AtomicBool,
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPEATS)
    }
}

impl LoopGuard {
    pub fn new(max_repeats: u32) -> Self {
        Self {
            max_repeats: max_repeats.max(2),
            seen: Mutex::new(HashMap::new()),
            tripped: AtomicBool::new(false),
        }
    }

    /// Record one invocation. Returns true when the guard is tripped.
    pub fn record(&self, tool: &str, args: &serde_json::Value) -> bool {
        if self.tripped.load(Ordering::SeqCst) {
            return true;
        }
        let key = {
            let mut hasher = Sha256::new();
            hasher.update(tool.as_bytes());
            hasher.update(args.to_string().as_bytes());
            hex::encode(hasher.finalize())
        };
        let mut seen = self.seen.lock().unwrap();
        let count = seen.entry(key).or_insert(0);
        *count += 1;
        if *count >= self.max_repeats {
            self.tripped.store(true, Ordering::SeqCst);
            tracing::warn!(tool, repeats = *count, "loop guard tripped");
            return true;
        }
        false
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Fresh start after a replan.
    pub fn reset(&self) {
        self.seen.lock().unwrap().clear();
        self.tripped.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_calls_trip_at_the_threshold() {
        let guard = LoopGuard::new(3);
        let args = serde_json::json!({"path": "src/a.rs"});
        assert!(!guard.record("read_file", &args));
        assert!(!guard.record("read_file", &args));
        assert!(guard.record("read_file", &args));
        assert!(guard.is_tripped());
        // Stays tripped for unrelated calls until reset.
        assert!(guard.record("list_dir", &serde_json::json!({})));
    }

    #[test]
    fn distinct_arguments_do_not_trip() {
        let guard = LoopGuard::new(3);
        for i in 0..10 {
            let args = serde_json::json!({"path": format!("src/f{i}.rs")});
            assert!(!guard.record("read_file", &args));
        }
    }

    #[test]
    fn reset_clears_state() {
        let guard = LoopGuard::new(2);
        let args = serde_json::json!({});
        guard.record("list_dir", &args);
        guard.record("list_dir", &args);
        assert!(guard.is_tripped());
        guard.reset();
        assert!(!guard.is_tripped());
        assert!(!guard.record("list_dir", &args));
    }
}
