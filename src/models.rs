//! Chunk records shared by the chunker, the vector index, and the snapshot store.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of code unit a chunk was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Module,
    Class,
    Function,
    Method,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::Module => "module",
            SymbolKind::Class => "class",
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SymbolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module" => Ok(SymbolKind::Module),
            "class" => Ok(SymbolKind::Class),
            "function" => Ok(SymbolKind::Function),
            "method" => Ok(SymbolKind::Method),
            other => Err(format!("unknown symbol kind: {other}")),
        }
    }
}

/// One formal parameter of a function or method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Name including any `*` / `**` prefix. Bare `*` and `/` separators are kept as-is.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Structured declaration header: parameters, decorators and bases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub decorators: Vec<String>,
    #[serde(default)]
    pub bases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_annotation: Option<String>,
    #[serde(default)]
    pub is_async: bool,
}

/// Static facts gathered from the declaration body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMetadata {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub calls: Vec<String>,
    /// Number of `if`/`elif`/`for`/`while`/`try` statements.
    #[serde(default)]
    pub branches: usize,
}

/// An addressable unit of source code, the retrieval granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: SymbolKind,
    pub qualified_name: String,
    pub docstring: Option<String>,
    pub signature: Signature,
    pub metadata: CodeMetadata,
    pub text: String,
    pub truncated: bool,
    /// Enclosing chunk, for context expansion only.
    pub parent_id: Option<String>,
}

impl Chunk {
    /// Text handed to the embedder, prefixed with kind and qualified name.
    pub fn embedding_text(&self) -> String {
        format!("{} {}: {}", self.kind, self.qualified_name, self.text)
    }

    /// Whether `other` lies entirely within this chunk's span in the same file.
    pub fn contains_span(&self, other: &Chunk) -> bool {
        self.file_path == other.file_path
            && self.start_line <= other.start_line
            && other.end_line <= self.end_line
    }

    pub fn line_count(&self) -> usize {
        self.end_line - self.start_line + 1
    }
}

/// A chunk paired with its embedding, the input to a generation build.
///
/// `vector` is `None` when embedding failed after retries; such chunks are
/// kept in the generation but never returned by search.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, start: usize, end: usize) -> Chunk {
        Chunk {
            id: format!("{path}:{start}"),
            file_path: path.to_string(),
            start_line: start,
            end_line: end,
            kind: SymbolKind::Function,
            qualified_name: "m.f".to_string(),
            docstring: None,
            signature: Signature::default(),
            metadata: CodeMetadata::default(),
            text: "def f(): pass".to_string(),
            truncated: false,
            parent_id: None,
        }
    }

    #[test]
    fn test_symbol_kind_parse_and_display() {
        for kind in [
            SymbolKind::Module,
            SymbolKind::Class,
            SymbolKind::Function,
            SymbolKind::Method,
        ] {
            assert_eq!(kind.to_string().parse::<SymbolKind>().unwrap(), kind);
        }
        assert!("struct".parse::<SymbolKind>().is_err());
    }

    #[test]
    fn test_contains_span_requires_same_file() {
        let outer = chunk("a.py", 1, 20);
        let inner = chunk("a.py", 3, 5);
        let elsewhere = chunk("b.py", 3, 5);
        assert!(outer.contains_span(&inner));
        assert!(!inner.contains_span(&outer));
        assert!(!outer.contains_span(&elsewhere));
    }

    #[test]
    fn test_embedding_text_prefix() {
        let c = chunk("a.py", 1, 1);
        assert_eq!(c.embedding_text(), "function m.f: def f(): pass");
        assert_eq!(c.line_count(), 1);
    }
}
