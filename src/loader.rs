//! Markdown document loading.
//!
//! Turns one enumerated file into zero or one [`Document`]. The text is
//! lightly cleaned before splitting: YAML front matter is dropped, images are
//! removed and hyperlinks are reduced to their label. Fenced code blocks are
//! left untouched.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use docindex_core::models::{Document, FileRow};

use crate::enumerate::has_recognized_extension;

/// Load and clean a single file.
///
/// Directories, unrecognized extensions and whitespace-only files yield an
/// empty vector rather than an error.
pub fn load_and_parse_file(row: &FileRow, extensions: &[String]) -> Result<Vec<Document>> {
    let path = &row.path;
    if path.is_dir() || !has_recognized_extension(path, extensions) {
        return Ok(Vec::new());
    }

    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let raw = String::from_utf8_lossy(&bytes);
    let text = clean_markdown(&raw);
    if text.trim().is_empty() {
        tracing::debug!(path = %path.display(), "skipping empty document");
        return Ok(Vec::new());
    }

    let updated_at: DateTime<Utc> = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(vec![Document::from_path(path, text, updated_at)])
}

/// Strip front matter, images and link targets from markdown text.
pub fn clean_markdown(raw: &str) -> String {
    let body = strip_front_matter(raw);
    let mut out = String::with_capacity(body.len());
    let mut in_fence: Option<&str> = None;

    for line in body.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if let Some(marker) = in_fence {
            if trimmed.starts_with(marker) {
                in_fence = None;
            }
            out.push_str(line);
            continue;
        }
        if trimmed.starts_with("```") {
            in_fence = Some("```");
            out.push_str(line);
            continue;
        }
        if trimmed.starts_with("~~~") {
            in_fence = Some("~~~");
            out.push_str(line);
            continue;
        }
        out.push_str(&strip_links(line));
    }
    out
}

fn strip_front_matter(raw: &str) -> &str {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return raw;
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        let marker = line.trim_end();
        if marker == "---" || marker == "..." {
            return &rest[offset..];
        }
    }
    // Unterminated front matter: keep the document as-is.
    raw
}

/// Drop `![alt](src)` entirely and reduce `[label](url)` to `label`.
fn strip_links(line: &str) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        let is_image = bytes[i] == b'!' && bytes.get(i + 1) == Some(&b'[');
        let open = if is_image { i + 1 } else { i };
        if bytes[open] == b'[' {
            if let Some((label_end, end)) = find_link(line, open) {
                out.push_str(&line[copied..i]);
                if !is_image {
                    out.push_str(&line[open + 1..label_end]);
                }
                i = end;
                copied = end;
                continue;
            }
        }
        i += 1;
    }
    out.push_str(&line[copied..]);
    out
}

/// For a `[` at `open`, return (index of `]`, index just past `)`).
fn find_link(line: &str, open: usize) -> Option<(usize, usize)> {
    let label_end = open + 1 + line[open + 1..].find(']')?;
    if line.as_bytes().get(label_end + 1) != Some(&b'(') {
        return None;
    }
    let target_start = label_end + 2;
    let close = target_start + line[target_start..].find(')')?;
    Some((label_end, close + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn md() -> Vec<String> {
        vec!["md".to_string()]
    }

    #[test]
    fn loads_one_document_with_path_metadata() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("intro.md");
        fs::write(&path, "# Intro\n\nHello world.\n").unwrap();

        let docs = load_and_parse_file(&FileRow::new(&path), &md()).unwrap();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.metadata["path"], path.display().to_string());
        assert_eq!(doc.metadata["file_name"], "intro.md");
        assert!(doc.text.contains("Hello world."));
    }

    #[test]
    fn directories_and_other_files_yield_nothing() {
        let tmp = TempDir::new().unwrap();
        let txt = tmp.path().join("notes.txt");
        fs::write(&txt, "plain").unwrap();
        assert!(load_and_parse_file(&FileRow::new(tmp.path()), &md())
            .unwrap()
            .is_empty());
        assert!(load_and_parse_file(&FileRow::new(&txt), &md())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn whitespace_only_file_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.md");
        fs::write(&path, "  \n\n").unwrap();
        assert!(load_and_parse_file(&FileRow::new(&path), &md())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn front_matter_is_removed() {
        let cleaned = clean_markdown("---\ntitle: Setup\nslug: /setup\n---\n# Setup\nBody\n");
        assert_eq!(cleaned, "# Setup\nBody\n");
    }

    #[test]
    fn unterminated_front_matter_is_kept() {
        let raw = "---\ntitle: x\n# Heading\n";
        assert_eq!(clean_markdown(raw), raw);
    }

    #[test]
    fn images_dropped_and_links_reduced() {
        let cleaned = clean_markdown(
            "See ![diagram](img/arch.png) the [install guide](https://example.com/install) now.\n",
        );
        assert_eq!(cleaned, "See  the install guide now.\n");
    }

    #[test]
    fn brackets_without_target_are_kept() {
        assert_eq!(clean_markdown("array[0] and [note]\n"), "array[0] and [note]\n");
    }

    #[test]
    fn fenced_code_is_untouched() {
        let raw = "```md\n[keep](this)\n```\n[drop](that)\n";
        assert_eq!(clean_markdown(raw), "```md\n[keep](this)\n```\ndrop\n");
    }
}
