use std::path::{Component, Path, PathBuf};

use crate::failure::Failure;

/// Resolve a tool-supplied path against the repository root, rejecting
/// anything that escapes it. Symlinks inside the repo are normalized via
/// the parent directory (the leaf may not exist yet for writes).
pub fn resolve_repo_path(repo_root: &Path, raw: &str) -> Result<PathBuf, Failure> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        repo_root.join(candidate)
    };

    let normalized = normalize(&joined);

    // Canonicalize the deepest existing ancestor so symlinks can't smuggle
    // the path outside the root.
    let root = repo_root
        .canonicalize()
        .map_err(|e| Failure::invariant(format!("repository root unreadable: {e}")))?;
    let checked = canonicalize_existing_prefix(&normalized);

    if !checked.starts_with(&root) {
        return Err(Failure::invariant(format!(
            "path escapes the repository root: {raw}"
        ))
        .with_hint("use a path inside the project"));
    }
    Ok(normalized)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => break,
        }
    }
    let mut out = existing.canonicalize().unwrap_or(existing);
    for name in tail.into_iter().rev() {
        out.push(name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_repo_path(dir.path(), "src/lib.rs").unwrap();
        assert!(resolved.starts_with(dir.path()));
        assert!(resolved.ends_with("src/lib.rs"));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let err = resolve_repo_path(dir.path(), "sub/../../outside.txt").unwrap_err();
        assert_eq!(err.kind, crate::failure::FailureKind::Invariant);
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_repo_path(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn absolute_path_inside_root_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("a.txt");
        let raw = inside.to_string_lossy().to_string();
        assert!(resolve_repo_path(dir.path(), &raw).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        assert!(resolve_repo_path(dir.path(), "link/secret.txt").is_err());
    }
}
