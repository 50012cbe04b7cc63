use std::fmt::Write;

/// Compact unified-style diff used for tool-result previews. One hunk
/// per contiguous change run; identical inputs produce an empty string.
pub fn unified_diff(path: &str, old: &str, new: &str, context: usize) -> String {
    if old == new {
        return String::new();
    }
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    // Trim the common prefix and suffix; everything between is the change.
    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let ctx_start = prefix.saturating_sub(context);
    let old_end = old_lines.len() - suffix;
    let new_end = new_lines.len() - suffix;
    let ctx_end_old = (old_end + context).min(old_lines.len());

    let mut out = String::new();
    let _ = writeln!(out, "--- a/{path}");
    let _ = writeln!(out, "+++ b/{path}");
    let _ = writeln!(
        out,
        "@@ -{},{} +{},{} @@",
        ctx_start + 1,
        ctx_end_old - ctx_start,
        ctx_start + 1,
        (new_end + context).min(new_lines.len()) - ctx_start,
    );
    for line in &old_lines[ctx_start..prefix] {
        let _ = writeln!(out, " {line}");
    }
    for line in &old_lines[prefix..old_end] {
        let _ = writeln!(out, "-{line}");
    }
    for line in &new_lines[prefix..new_end] {
        let _ = writeln!(out, "+{line}");
    }
    for line in &old_lines[old_end..ctx_end_old] {
        let _ = writeln!(out, " {line}");
    }
    out
}

pub fn truncate_diff(diff: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = diff.lines().collect();
    if lines.len() <= max_lines {
        return diff.to_string();
    }
    let mut out: String = lines[..max_lines].join("\n");
    let _ = write!(out, "\n... ({} more lines)", lines.len() - max_lines);
    out
}
