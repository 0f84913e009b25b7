//! Markdown-aware node splitter.
//!
//! Splits a [`Document`] into [`Node`]s at ATX heading boundaries
//! (`#` through `######`). Each node keeps its heading line, and its
//! metadata records the enclosing heading hierarchy as `header_path`
//! (e.g. `"/Getting Started/Install/"`) plus the node's own `header`.
//!
//! Sections that exceed `max_tokens` fall back to paragraph-boundary
//! packing and, for single oversized paragraphs, hard splits at the nearest
//! newline or space.

use uuid::Uuid;

use crate::models::{hash_text, Document, Node};

/// Approximate chars-per-token ratio used to turn `max_tokens` into a size cap.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug)]
struct Section {
    header: Option<String>,
    header_path: String,
    text: String,
}

/// Split a document into nodes with contiguous indices starting at 0.
///
/// Whitespace-only sections are dropped. A document with non-empty text
/// always yields at least one node.
pub fn split_document(doc: &Document, max_tokens: usize) -> Vec<Node> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut nodes = Vec::new();

    for section in parse_sections(&doc.text) {
        for piece in pack_section(&section.text, max_chars) {
            let mut metadata = doc.metadata.clone();
            metadata.insert("header_path".to_string(), section.header_path.clone());
            if let Some(ref header) = section.header {
                metadata.insert("header".to_string(), header.clone());
            }
            nodes.push(make_node(&doc.id, nodes.len() as i64, &piece, metadata));
        }
    }

    if nodes.is_empty() && !doc.text.trim().is_empty() {
        let mut metadata = doc.metadata.clone();
        metadata.insert("header_path".to_string(), "/".to_string());
        nodes.push(make_node(&doc.id, 0, doc.text.trim(), metadata));
    }

    nodes
}

fn make_node(document_id: &str, index: i64, text: &str, metadata: crate::models::Metadata) -> Node {
    Node {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        node_index: index,
        text: text.to_string(),
        hash: hash_text(text),
        metadata,
        embedding: None,
    }
}

/// Parse `# Heading` lines outside fenced code blocks.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    // More than three spaces of indentation is a code block, not a heading.
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim().to_string();
    Some((level, title))
}

/// The fence marker a line opens or closes, if any.
fn fence_marker(line: &str) -> Option<&'static str> {
    let t = line.trim_start();
    if t.starts_with("```") {
        Some("```")
    } else if t.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn parse_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = Section {
        header: None,
        header_path: "/".to_string(),
        text: String::new(),
    };
    // A fence is closed only by the marker that opened it.
    let mut in_fence: Option<&str> = None;

    for line in text.lines() {
        let marker = fence_marker(line);
        let heading = match (in_fence, marker) {
            (Some(open), Some(m)) if open == m => {
                in_fence = None;
                None
            }
            (Some(_), _) => None,
            (None, Some(m)) => {
                in_fence = Some(m);
                None
            }
            (None, None) => parse_heading(line),
        };

        if let Some((level, title)) = heading {
            flush_section(&mut sections, &mut current);

            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            current.header_path = header_path(&stack);
            current.header = Some(title.clone());
            stack.push((level, title));
        }

        current.text.push_str(line);
        current.text.push('\n');
    }

    flush_section(&mut sections, &mut current);
    sections
}

fn flush_section(sections: &mut Vec<Section>, current: &mut Section) {
    let text = std::mem::take(&mut current.text);
    if text.trim().is_empty() {
        return;
    }
    sections.push(Section {
        header: current.header.clone(),
        header_path: current.header_path.clone(),
        text: text.trim().to_string(),
    });
}

fn header_path(stack: &[(usize, String)]) -> String {
    let mut path = String::from("/");
    for (_, title) in stack {
        path.push_str(title);
        path.push('/');
    }
    path
}

/// Keep a section whole when it fits, otherwise pack its paragraphs.
fn pack_section(text: &str, max_chars: usize) -> Vec<String> {
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let para_chars = char_len(trimmed);
        let would_be = if buf.is_empty() {
            para_chars
        } else {
            char_len(&buf) + 2 + para_chars
        };

        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para_chars > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

fn hard_split(text: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = text;
    while !remaining.is_empty() {
        let split_at = if char_len(remaining) <= max_chars {
            remaining.len()
        } else {
            let limit = byte_offset_of_char(remaining, max_chars);
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit.max(next_char_len(remaining)))
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`th char, or the string length if it is shorter.
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

fn next_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(0)
}
