pub mod symbols;

use std::path::{Path, PathBuf};

use anyhow::Result;

use symbols::{SymbolEntry, SymbolIndex};

const MAX_LISTING_DEPTH: usize = 6;
const MAX_LISTED_FILES: usize = 2_000;
const RECENT_COMMITS: usize = 10;

const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
    ".rev_checkpoints",
];

const INDEXED_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "jsx", "tsx", "go", "java", "rb", "c", "h", "cpp", "hpp",
];

/// Immutable snapshot of the repository: file listing, short status,
/// recent commit subjects, a directory summary, and the symbol index.
/// The orchestrator refreshes it explicitly after each task batch and
/// after any verification-triggered mutation; nothing mutates one in
/// place.
#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    pub root: PathBuf,
    pub files: Vec<String>,
    pub status: String,
    pub recent_commits: Vec<String>,
    pub dir_summary: String,
    pub symbols: SymbolIndex,
}

impl RepoContext {
    pub async fn capture(root: &Path) -> Result<Self> {
        let files = list_files(root);
        let status = git_output(root, &["status", "--short"]).await;
        let recent_commits = git_output(root, &["log", "--format=%s", "-n", "10"])
            .await
            .lines()
            .take(RECENT_COMMITS)
            .map(String::from)
            .collect();
        let dir_summary = summarize_dirs(&files);
        let symbols = build_symbol_index(root, &files);

        Ok(Self {
            root: root.to_path_buf(),
            files,
            status,
            recent_commits,
            dir_summary,
            symbols,
        })
    }

    pub fn contains_file(&self, rel_path: &str) -> bool {
        self.files.iter().any(|f| f == rel_path)
    }

    /// Files sitting in the same directory as `rel_path`.
    pub fn sibling_files(&self, rel_path: &str) -> Vec<&str> {
        let dir = Path::new(rel_path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        self.files
            .iter()
            .filter(|f| {
                Path::new(f)
                    .parent()
                    .map(|p| p.to_string_lossy() == dir)
                    .unwrap_or(dir.is_empty())
            })
            .filter(|f| f.as_str() != rel_path)
            .map(|f| f.as_str())
            .collect()
    }

    /// Compact digest for LM prompts: structure plus state, bounded.
    pub fn digest(&self, max_files: usize) -> String {
        let mut out = String::new();
        out.push_str("Directory summary:\n");
        out.push_str(&self.dir_summary);
        out.push_str("\nFiles:\n");
        for f in self.files.iter().take(max_files) {
            out.push_str("  ");
            out.push_str(f);
            out.push('\n');
        }
        if self.files.len() > max_files {
            out.push_str(&format!("  ... and {} more\n", self.files.len() - max_files));
        }
        if !self.status.trim().is_empty() {
            out.push_str("Git status:\n");
            out.push_str(&self.status);
        }
        if !self.recent_commits.is_empty() {
            out.push_str("Recent commits:\n");
            for c in &self.recent_commits {
                out.push_str("  ");
                out.push_str(c);
                out.push('\n');
            }
        }
        out
    }
}

async fn git_output(root: &Path, args: &[&str]) -> String {
    match tokio::process::Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).to_string()
        }
        _ => String::new(),
    }
}

fn list_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    walk(root, root, 0, &mut files);
    files.sort();
    files.truncate(MAX_LISTED_FILES);
    files
}

fn walk(root: &Path, dir: &Path, depth: usize, out: &mut Vec<String>) {
    if depth > MAX_LISTING_DEPTH || out.len() >= MAX_LISTED_FILES {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_str()) || name.starts_with('.') {
                continue;
            }
            walk(root, &path, depth + 1, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().to_string());
        }
    }
}

fn summarize_dirs(files: &[String]) -> String {
    let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for f in files {
        let top = Path::new(f)
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .unwrap_or_default();
        let key = if Path::new(f).components().count() > 1 {
            format!("{top}/")
        } else {
            "(root)".to_string()
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(dir, n)| format!("  {dir} ({n} files)"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_symbol_index(root: &Path, files: &[String]) -> SymbolIndex {
    let mut entries: Vec<SymbolEntry> = Vec::new();
    for rel in files {
        let ext = Path::new(rel)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        if !INDEXED_EXTENSIONS.contains(&ext) {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(root.join(rel)) {
            entries.extend(symbols::extract_symbols(rel, &content));
        }
    }
    SymbolIndex::build(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_lists_files_and_symbols() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn entry() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# readme\n").unwrap();

        let ctx = RepoContext::capture(dir.path()).await.unwrap();
        assert!(ctx.contains_file("src/lib.rs"));
        assert!(ctx.contains_file("README.md"));
        assert_eq!(ctx.symbols.query("entry", 5).len(), 1);
        assert!(ctx.dir_summary.contains("src/"));
    }

    #[tokio::test]
    async fn skip_dirs_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::write(dir.path().join("main.js"), "y").unwrap();

        let ctx = RepoContext::capture(dir.path()).await.unwrap();
        assert_eq!(ctx.files, vec!["main.js".to_string()]);
    }

    #[tokio::test]
    async fn sibling_files_share_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        std::fs::write(dir.path().join("tests/user.test.js"), "a").unwrap();
        std::fs::write(dir.path().join("tests/auth.test.js"), "b").unwrap();
        std::fs::write(dir.path().join("index.js"), "c").unwrap();

        let ctx = RepoContext::capture(dir.path()).await.unwrap();
        let siblings = ctx.sibling_files("tests/user.test.js");
        assert_eq!(siblings, vec!["tests/auth.test.js"]);
    }

    #[tokio::test]
    async fn digest_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let ctx = RepoContext::capture(dir.path()).await.unwrap();
        let digest = ctx.digest(5);
        assert!(digest.contains("and 15 more"));
    }
}
