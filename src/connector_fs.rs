use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Globs applied to files found under directory arguments.
pub const DEFAULT_INCLUDE_GLOBS: &[&str] = &["**/*.md", "**/*.txt", "**/*.rst"];

const DEFAULT_EXCLUDE_GLOBS: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// A text file ready to enqueue.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Label recorded as the document's `file_path`.
    pub label: String,
    pub content: String,
}

/// Collect text files from `paths`.
///
/// File arguments are taken as-is. Directory arguments are walked and
/// filtered by `include_globs` (matched against the path relative to the
/// directory). Files that are not valid UTF-8 or are blank are skipped.
pub fn scan_paths(paths: &[PathBuf], include_globs: &[String]) -> Result<Vec<SourceFile>> {
    let include_set = if include_globs.is_empty() {
        let defaults: Vec<String> = DEFAULT_INCLUDE_GLOBS.iter().map(|s| s.to_string()).collect();
        build_globset(&defaults)?
    } else {
        build_globset(include_globs)?
    };
    let exclude_set = build_globset(
        &DEFAULT_EXCLUDE_GLOBS
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
    )?;

    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            if let Some(file) = read_source(root, &root.display().to_string())? {
                files.push(file);
            }
            continue;
        }
        if !root.is_dir() {
            bail!("Path does not exist: {}", root.display());
        }

        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            if let Some(file) = read_source(path, &path.display().to_string())? {
                files.push(file);
            }
        }
    }

    files.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(files)
}

fn read_source(path: &Path, label: &str) -> Result<Option<SourceFile>> {
    let bytes = std::fs::read(path)?;
    let Ok(content) = String::from_utf8(bytes) else {
        tracing::warn!(path = %path.display(), "skipping non-UTF-8 file");
        return Ok(None);
    };
    if content.trim().is_empty() {
        tracing::debug!(path = %path.display(), "skipping blank file");
        return Ok(None);
    }
    Ok(Some(SourceFile {
        label: label.to_string(),
        content,
    }))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_directory_applies_globs() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# A\n\nalpha").unwrap();
        std::fs::write(tmp.path().join("b.rs"), "fn main() {}").unwrap();
        std::fs::write(tmp.path().join("blank.txt"), "   \n").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/c.txt"), "gamma").unwrap();

        let files = scan_paths(&[tmp.path().to_path_buf()], &[]).unwrap();
        let names: Vec<&str> = files
            .iter()
            .map(|f| f.label.rsplit('/').next().unwrap())
            .collect();
        assert_eq!(names, vec!["a.md", "c.txt"]);

        let only_rs = scan_paths(&[tmp.path().to_path_buf()], &["**/*.rs".to_string()]).unwrap();
        assert_eq!(only_rs.len(), 1);
    }

    #[test]
    fn test_file_argument_bypasses_globs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notes.log");
        std::fs::write(&path, "log line").unwrap();
        let files = scan_paths(&[path], &[]).unwrap();
        assert_eq!(files[0].content, "log line");
    }

    #[test]
    fn test_missing_path_errors() {
        assert!(scan_paths(&[PathBuf::from("/definitely/not/here")], &[]).is_err());
    }
}
