use std::collections::HashMap;

/// One indexed symbol: a function/class/struct name and where it lives.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub name: String,
    pub file: String,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct SymbolHit {
    pub name: String,
    pub file: String,
    pub line: usize,
    pub score: f32,
}

/// Hybrid TF-IDF + substring index over definition names. Small enough
/// to rebuild on every context refresh.
#[derive(Debug, Default, Clone)]
pub struct SymbolIndex {
    entries: Vec<SymbolEntry>,
    /// token → number of entries containing it
    doc_freq: HashMap<String, usize>,
}

impl SymbolIndex {
    pub fn build(entries: Vec<SymbolEntry>) -> Self {
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for entry in &entries {
            let mut seen = std::collections::HashSet::new();
            for token in tokenize(&entry.name) {
                if seen.insert(token.clone()) {
                    *doc_freq.entry(token).or_insert(0) += 1;
                }
            }
        }
        Self { entries, doc_freq }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn query(&self, query: &str, limit: usize) -> Vec<SymbolHit> {
        let query_lower = query.to_lowercase();
        let query_tokens = tokenize(query);
        let n = self.entries.len().max(1) as f32;

        let mut hits: Vec<SymbolHit> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let name_lower = entry.name.to_lowercase();
                let mut score = 0.0f32;

                // Substring component: exact name match dominates.
                if name_lower == query_lower {
                    score += 10.0;
                } else if name_lower.contains(&query_lower) {
                    score += 3.0;
                }

                // TF-IDF component over identifier tokens.
                let entry_tokens: Vec<String> = tokenize(&entry.name);
                for qt in &query_tokens {
                    if entry_tokens.iter().any(|t| t == qt) {
                        let df = *self.doc_freq.get(qt).unwrap_or(&1) as f32;
                        score += (n / df).ln().max(0.1);
                    }
                }

                if score > 0.0 {
                    Some(SymbolHit {
                        name: entry.name.clone(),
                        file: entry.file.clone(),
                        line: entry.line,
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        hits
    }
}

/// Split an identifier into lowercase tokens on case and separator
/// boundaries: `parseHttpRequest` → [parse, http, request].
pub fn tokenize(identifier: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in identifier.chars() {
        if c == '_' || c == '-' || c == '.' || c == ':' || c.is_whitespace() || c == '/' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens.retain(|t| !t.is_empty());
    tokens
}

/// Pull definition lines out of source text. Line-anchored heuristics in
/// the common languages the tools operate on; nothing resembling a full
/// parse is needed for ranking.
pub fn extract_symbols(file: &str, content: &str) -> Vec<SymbolEntry> {
    let mut entries = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        let name = if let Some(rest) = trimmed
            .strip_prefix("pub fn ")
            .or_else(|| trimmed.strip_prefix("fn "))
            .or_else(|| trimmed.strip_prefix("async fn "))
            .or_else(|| trimmed.strip_prefix("pub async fn "))
        {
            ident_prefix(rest)
        } else if let Some(rest) = trimmed
            .strip_prefix("pub struct ")
            .or_else(|| trimmed.strip_prefix("struct "))
            .or_else(|| trimmed.strip_prefix("pub enum "))
            .or_else(|| trimmed.strip_prefix("enum "))
            .or_else(|| trimmed.strip_prefix("pub trait "))
            .or_else(|| trimmed.strip_prefix("trait "))
        {
            ident_prefix(rest)
        } else if let Some(rest) = trimmed
            .strip_prefix("def ")
            .or_else(|| trimmed.strip_prefix("class "))
            .or_else(|| trimmed.strip_prefix("async def "))
        {
            ident_prefix(rest)
        } else if let Some(rest) = trimmed
            .strip_prefix("function ")
            .or_else(|| trimmed.strip_prefix("export function "))
            .or_else(|| trimmed.strip_prefix("export async function "))
        {
            ident_prefix(rest)
        } else {
            None
        };
        if let Some(name) = name {
            entries.push(SymbolEntry {
                name,
                file: file.to_string(),
                line: i + 1,
            });
        }
    }
    entries
}

fn ident_prefix(rest: &str) -> Option<String> {
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_case_and_separators() {
        assert_eq!(tokenize("parseHttpRequest"), vec!["parse", "http", "request"]);
        assert_eq!(tokenize("user_auth_token"), vec!["user", "auth", "token"]);
        assert_eq!(tokenize("HTTPServer"), vec!["httpserver"]);
    }

    #[test]
    fn exact_match_ranks_above_token_overlap() {
        let index = SymbolIndex::build(vec![
            SymbolEntry {
                name: "parse_request".into(),
                file: "a.rs".into(),
                line: 1,
            },
            SymbolEntry {
                name: "parse_request_headers".into(),
                file: "b.rs".into(),
                line: 1,
            },
            SymbolEntry {
                name: "render_response".into(),
                file: "c.rs".into(),
                line: 1,
            },
        ]);
        let hits = index.query("parse_request", 10);
        assert_eq!(hits[0].name, "parse_request");
        assert!(hits.len() >= 2);
        assert!(!hits.iter().any(|h| h.name == "render_response"));
    }

    #[test]
    fn rare_tokens_outrank_common_ones() {
        let index = SymbolIndex::build(vec![
            SymbolEntry { name: "get_user".into(), file: "a.rs".into(), line: 1 },
            SymbolEntry { name: "get_item".into(), file: "b.rs".into(), line: 1 },
            SymbolEntry { name: "get_order".into(), file: "c.rs".into(), line: 1 },
            SymbolEntry { name: "checksum_user".into(), file: "d.rs".into(), line: 1 },
        ]);
        let hits = index.query("checksum", 10);
        assert_eq!(hits[0].name, "checksum_user");
    }

    #[test]
    fn extracts_rust_python_and_js_definitions() {
        let rust = extract_symbols("a.rs", "pub fn alpha() {}\nstruct Beta {\n");
        assert_eq!(rust.len(), 2);
        assert_eq!(rust[0].name, "alpha");
        assert_eq!(rust[1].name, "Beta");
        assert_eq!(rust[1].line, 2);

        let py = extract_symbols("b.py", "class Gamma:\n    def delta(self):\n        pass\n");
        let names: Vec<&str> = py.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Gamma", "delta"]);

        let js = extract_symbols("c.js", "export function epsilon() {}\n");
        assert_eq!(js[0].name, "epsilon");
    }
}
