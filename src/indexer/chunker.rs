//! Flattens a [`DeclTree`] into addressable [`Chunk`] records.
//!
//! Every class, every top-level function and every method becomes a chunk.
//! Methods are also kept inside their class's text, so spans may overlap.
//! Code outside any declaration is gathered into one synthetic module chunk
//! that also serves as the root of the `parent_id` chain.
use sha2::{Digest, Sha256};

use super::code_parser::{DeclId, DeclTree, Declaration};
use crate::models::{Chunk, SymbolKind};

pub const DEFAULT_MAX_CHUNK_CHARS: usize = 1000;

/// Space kept free for the elision marker when truncating.
const MARKER_RESERVE: usize = 32;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Character budget for a chunk's `text`.
    pub max_chunk_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }
}

/// Build the chunks of one file. The module chunk always comes first.
pub fn build_chunks(
    source: &str,
    file_path: &str,
    tree: &DeclTree,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    let lines: Vec<&str> = source.lines().collect();
    let mut ids: Vec<Option<String>> = vec![None; tree.len()];
    let mut chunks = Vec::new();

    for (decl_id, decl) in tree.iter() {
        if !is_chunked(tree, decl) {
            continue;
        }

        let (text, truncated, id) = if decl.kind == SymbolKind::Module {
            let (text, truncated) = module_text(&lines, tree, config.max_chunk_chars);
            let id = chunk_id(file_path, decl.kind, &decl.qualified_name, 1, source);
            (text, truncated, id)
        } else {
            let slice = span_lines(&lines, decl.start_line, decl.end_line);
            let keep = decl
                .header_end_line
                .max(decl.docstring_end_line.unwrap_or(0))
                .saturating_sub(decl.start_line)
                + 1;
            let (text, truncated) = truncate_lines(slice, keep, config.max_chunk_chars);
            let id = chunk_id(
                file_path,
                decl.kind,
                &decl.qualified_name,
                decl.start_line,
                &slice.join("\n"),
            );
            (text, truncated, id)
        };

        ids[decl_id] = Some(id.clone());
        chunks.push(Chunk {
            id,
            file_path: file_path.to_string(),
            start_line: decl.start_line,
            end_line: decl.end_line.max(decl.start_line),
            kind: decl.kind,
            qualified_name: decl.qualified_name.clone(),
            docstring: decl.docstring.clone(),
            signature: decl.signature.clone(),
            metadata: decl.metadata.clone(),
            text,
            truncated,
            parent_id: nearest_chunked_ancestor(tree, decl_id, &ids),
        });
    }

    chunks
}

/// Stable chunk identifier over path, kind, qualified name, start line and the
/// verbatim declaration source.
pub fn chunk_id(
    file_path: &str,
    kind: SymbolKind,
    qualified_name: &str,
    start_line: usize,
    source: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        file_path,
        kind.as_str(),
        qualified_name,
        &start_line.to_string(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(source.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

fn is_chunked(tree: &DeclTree, decl: &Declaration) -> bool {
    match decl.kind {
        SymbolKind::Module | SymbolKind::Class | SymbolKind::Method => true,
        SymbolKind::Function => decl
            .parent
            .and_then(|p| tree.get(p))
            .is_some_and(|p| p.kind == SymbolKind::Module),
    }
}

fn nearest_chunked_ancestor(
    tree: &DeclTree,
    decl_id: DeclId,
    ids: &[Option<String>],
) -> Option<String> {
    let mut current = tree.get(decl_id)?.parent;
    while let Some(p) = current {
        if let Some(id) = &ids[p] {
            return Some(id.clone());
        }
        current = tree.get(p)?.parent;
    }
    None
}

fn span_lines<'a>(lines: &'a [&'a str], start: usize, end: usize) -> &'a [&'a str] {
    let from = start.saturating_sub(1).min(lines.len());
    let to = end.min(lines.len()).max(from);
    &lines[from..to]
}

/// File text with the module's own declarations cut out.
fn module_text(lines: &[&str], tree: &DeclTree, budget: usize) -> (String, bool) {
    let module = tree.module();
    let spans: Vec<(usize, usize)> = module
        .children
        .iter()
        .filter_map(|c| tree.get(*c))
        .map(|d| (d.start_line, d.end_line))
        .collect();

    let mut kept = Vec::new();
    let mut keep = 0;
    for (idx, line) in lines.iter().enumerate() {
        let lineno = idx + 1;
        if spans.iter().any(|(s, e)| *s <= lineno && lineno <= *e) {
            continue;
        }
        kept.push(*line);
        if module.docstring_end_line.is_some_and(|end| lineno <= end) {
            keep = kept.len();
        }
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    truncate_lines(&kept, keep, budget)
}

/// Join `lines`, cutting at a line boundary once `budget` characters are
/// exceeded. The first `keep` lines always survive; the cut is marked.
fn truncate_lines(lines: &[&str], keep: usize, budget: usize) -> (String, bool) {
    let full = lines.join("\n");
    if full.chars().count() <= budget {
        return (full, false);
    }

    let keep = keep.min(lines.len());
    let indent = marker_indent(lines, keep);
    let mut out: Vec<String> = lines[..keep].iter().map(|l| l.to_string()).collect();
    let mut used: usize = out.iter().map(|l| l.chars().count() + 1).sum();

    let rest = &lines[keep..];
    let mut taken = 0;
    for line in rest {
        let cost = line.chars().count() + 1;
        if used + cost + indent.len() + MARKER_RESERVE > budget {
            break;
        }
        out.push(line.to_string());
        used += cost;
        taken += 1;
    }

    let elided = rest.len() - taken;
    if elided == 0 {
        return (full, false);
    }
    out.push(format!("{indent}# ... {elided} lines elided"));
    (out.join("\n"), true)
}

fn marker_indent(lines: &[&str], keep: usize) -> String {
    let leading = |l: &str| l[..l.len() - l.trim_start().len()].to_string();
    if let Some(body) = lines[keep..].iter().find(|l| !l.trim().is_empty()) {
        return leading(*body);
    }
    match lines.first() {
        Some(first) if keep > 0 => format!("{}    ", leading(*first)),
        _ => String::new(),
    }
}
