use std::path::{Component, Path, PathBuf};

use crate::error::TestgenError;
use crate::parser::GeneratedTest;

/// Writes test records under the project root.
///
/// `relativeDir` is resolved against the root; a missing or unsafe value
/// (absolute, or escaping with `..`) lands in the default output directory.
pub struct Writer {
    root_dir: PathBuf,
    default_dir: PathBuf,
}

impl Writer {
    /// `default_dir` is relative to `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>, default_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            default_dir: default_dir.into(),
        }
    }

    /// Directory a record will be written to.
    pub fn target_dir(&self, record: &GeneratedTest) -> PathBuf {
        match record.relative_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() && is_safe_relative(Path::new(dir)) => {
                self.root_dir.join(dir)
            }
            Some(dir) if !dir.is_empty() => {
                tracing::warn!(relative_dir = dir, "unsafe relativeDir, using default output dir");
                self.root_dir.join(&self.default_dir)
            }
            _ => self.root_dir.join(&self.default_dir),
        }
    }

    /// Write one record, overwriting any existing file. Returns the final path.
    pub async fn write(&self, record: &GeneratedTest) -> Result<PathBuf, TestgenError> {
        let name = sanitize_file_name(&record.file_name);
        if name.is_empty() || name == "." || name == ".." {
            return Err(TestgenError::Write {
                path: record.file_name.clone(),
                message: "file name is empty after sanitization".to_string(),
            });
        }

        let dir = self.target_dir(record);
        let path = dir.join(&name);
        let write_err = |e: std::io::Error| TestgenError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        tokio::fs::create_dir_all(&dir).await.map_err(write_err)?;
        atomic_write(&path, &record.code).await.map_err(write_err)?;

        tracing::info!(path = %path.display(), bytes = record.code.len(), "generated");
        Ok(path)
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn is_safe_relative(path: &Path) -> bool {
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Write to a temp file, then rename over the target.
async fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, content.as_bytes()).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}
