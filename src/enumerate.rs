//! Recursive file enumeration under the configured source root.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use docindex_core::models::FileRow;

use crate::config::SourceConfig;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// List every recognized document under `source.root`, sorted by path.
///
/// Returned paths are absolute. Directories are never returned.
pub fn enumerate_files(source: &SourceConfig) -> Result<Vec<FileRow>> {
    let root = &source.root;
    if !root.exists() {
        bail!("Source root does not exist: {}", root.display());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve source root: {}", root.display()))?;

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(source.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut rows = Vec::new();
    let walker = WalkDir::new(&root).follow_links(source.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        if exclude_set.is_match(relative) {
            continue;
        }
        if !has_recognized_extension(path, &source.extensions) {
            continue;
        }

        rows.push(FileRow::new(path));
    }

    rows.sort();
    tracing::info!(root = %root.display(), files = rows.len(), "enumerated source files");
    Ok(rows)
}

/// Case-insensitive extension check. Leading dots in `extensions` are ignored.
pub fn has_recognized_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn source(root: PathBuf) -> SourceConfig {
        SourceConfig {
            root,
            extensions: vec!["md".to_string()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }

    #[test]
    fn lists_markdown_recursively_and_sorted() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("guide/deep")).unwrap();
        fs::write(root.join("b.md"), "b").unwrap();
        fs::write(root.join("a.MD"), "a").unwrap();
        fs::write(root.join("guide/deep/c.md"), "c").unwrap();
        fs::write(root.join("notes.txt"), "skip").unwrap();
        fs::create_dir_all(root.join("dir.md")).unwrap();

        let rows = enumerate_files(&source(root.to_path_buf())).unwrap();
        let names: Vec<String> = rows
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.MD", "b.md", "c.md"]);
        assert!(rows.iter().all(|r| r.path.is_absolute()));
    }

    #[test]
    fn applies_default_and_configured_excludes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join("drafts")).unwrap();
        fs::write(root.join("node_modules/pkg/readme.md"), "x").unwrap();
        fs::write(root.join("drafts/wip.md"), "x").unwrap();
        fs::write(root.join("keep.md"), "x").unwrap();

        let mut cfg = source(root.to_path_buf());
        cfg.exclude_globs = vec!["drafts/**".to_string()];
        let rows = enumerate_files(&cfg).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].path.ends_with("keep.md"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = enumerate_files(&source(PathBuf::from("/definitely/not/here"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn extension_match_ignores_case_and_dot() {
        let exts = vec![".md".to_string(), "markdown".to_string()];
        assert!(has_recognized_extension(Path::new("x/README.MD"), &exts));
        assert!(has_recognized_extension(Path::new("x/y.markdown"), &exts));
        assert!(!has_recognized_extension(Path::new("x/y.txt"), &exts));
        assert!(!has_recognized_extension(Path::new("x/Makefile"), &exts));
    }
}
