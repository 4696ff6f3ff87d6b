use std::path::{Component, Path, PathBuf};

use crate::error::TestgenError;

/// Maximum bytes of context file content placed in a prompt.
pub const MAX_CONTEXT_BYTES: usize = 256 * 1024;

/// Maximum number of context files per run.
pub const MAX_CONTEXT_FILES: usize = 32;

/// A read-only file shown to the model as a style reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    /// Path relative to the project root, as shown in the prompt.
    pub name: String,
    pub content: String,
}

/// Result of reading context files, with skip metadata.
#[derive(Debug, Default)]
pub struct ContextResult {
    pub files: Vec<ContextFile>,
    /// Files skipped because the byte budget ran out (name, size in bytes).
    pub skipped: Vec<(String, usize)>,
    /// Files that do not exist or could not be read.
    pub missing: Vec<String>,
}

/// Validate that a path is safe: relative, no `..` components.
fn validate_path(path: &Path) -> Result<(), TestgenError> {
    if path.is_absolute() {
        return Err(TestgenError::Context(format!(
            "absolute path not allowed: {}",
            path.display()
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(TestgenError::Context(format!(
            "path traversal not allowed: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Read context files relative to `root`.
///
/// Traversal attempts reject the whole set. Missing or unreadable files are
/// skipped (the model simply sees less context). Files that do not fit the
/// remaining budget are skipped whole rather than truncated.
pub async fn read_context_files(
    root: &Path,
    paths: &[PathBuf],
    budget: usize,
) -> Result<ContextResult, TestgenError> {
    if paths.len() > MAX_CONTEXT_FILES {
        return Err(TestgenError::Context(format!(
            "too many context files: {} (max {MAX_CONTEXT_FILES})",
            paths.len()
        )));
    }
    for p in paths {
        validate_path(p)?;
    }

    let mut result = ContextResult::default();
    let mut used = 0usize;

    for rel in paths {
        let name = rel.to_string_lossy().replace('\\', "/");
        let full = root.join(rel);

        let size = match tokio::fs::metadata(&full).await {
            Ok(m) if m.is_file() => m.len() as usize,
            Ok(_) | Err(_) => {
                tracing::debug!(file = %name, "context file not found, skipping");
                result.missing.push(name);
                continue;
            }
        };

        if size > budget.saturating_sub(used) {
            result.skipped.push((name, size));
            continue;
        }

        match tokio::fs::read_to_string(&full).await {
            Ok(content) => {
                used += content.len();
                result.files.push(ContextFile { name, content });
            }
            Err(e) => {
                tracing::debug!(file = %name, "context file unreadable: {e}");
                result.missing.push(name);
            }
        }
    }

    if !result.skipped.is_empty() {
        tracing::warn!(skipped = ?result.skipped, "context budget exhausted, files skipped");
    }

    Ok(result)
}

/// Render context files as `---FILE:<name>---` sections separated by blank lines.
pub fn render_context(files: &[ContextFile]) -> String {
    files
        .iter()
        .map(|f| format!("---FILE:{}---\n{}", f.name, f.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// At most `max` bytes of `s`, cut on a char boundary.
pub fn preview(s: &str, max: usize) -> &str {
    &s[..floor_char_boundary(s, max)]
}

/// Find the largest byte index ≤ `index` that is a valid UTF-8 char boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
