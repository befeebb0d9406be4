//! Structural extraction of Python declarations using Tree-sitter.
//!
//! A file is parsed into a [`DeclTree`]: an arena of [`Declaration`]s whose
//! first entry is the module itself. Containment is stored as explicit
//! parent/child indices, and every node keeps its inclusive line span so the
//! same nesting can be recovered from line ranges alone.
use thiserror::Error;
use tree_sitter::{Language, Node, Parser};

use crate::models::{CodeMetadata, Parameter, Signature, SymbolKind};

/// Index of a declaration inside its [`DeclTree`].
pub type DeclId = usize;

/// Syntactically invalid source. Scoped to one file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub kind: SymbolKind,
    pub name: String,
    pub qualified_name: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Last line of the `def`/`class` header (the line holding the body colon).
    /// Zero for the module.
    pub header_end_line: usize,
    pub docstring: Option<String>,
    pub docstring_end_line: Option<usize>,
    pub signature: Signature,
    pub metadata: CodeMetadata,
    pub parent: Option<DeclId>,
    pub children: Vec<DeclId>,
}

/// Declarations of one file; index 0 is always the module.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclTree {
    pub decls: Vec<Declaration>,
}

impl DeclTree {
    pub fn module(&self) -> &Declaration {
        &self.decls[0]
    }

    pub fn get(&self, id: DeclId) -> Option<&Declaration> {
        self.decls.get(id)
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeclId, &Declaration)> {
        self.decls.iter().enumerate()
    }

    /// Innermost earlier declaration whose span contains `id`'s span, computed
    /// from line ranges and declaration order only.
    pub fn enclosing_by_span(&self, id: DeclId) -> Option<DeclId> {
        let target = self.decls.get(id)?;
        self.iter()
            .filter(|(other, d)| {
                *other < id && d.start_line <= target.start_line && target.end_line <= d.end_line
            })
            .min_by_key(|(other, d)| (d.end_line - d.start_line, std::cmp::Reverse(*other)))
            .map(|(other, _)| other)
    }
}

/// Python structure extractor.
pub struct CodeParser {
    language: Language,
}

impl Default for CodeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeParser {
    pub fn new() -> Self {
        Self {
            language: tree_sitter_python::LANGUAGE.into(),
        }
    }

    /// Parse `source` into a declaration tree rooted at `module_name`.
    pub fn parse_source(&self, source: &str, module_name: &str) -> Result<DeclTree, ParseError> {
        let mut parser = Parser::new();
        parser.set_language(&self.language).map_err(|e| ParseError {
            line: 0,
            column: 0,
            message: format!("language setup failed: {e}"),
        })?;

        let tree = parser.parse(source, None).ok_or_else(|| ParseError {
            line: 0,
            column: 0,
            message: "parser produced no tree".to_string(),
        })?;
        let root = tree.root_node();
        let bytes = source.as_bytes();

        if root.has_error() {
            return Err(first_error(root, bytes).unwrap_or(ParseError {
                line: 1,
                column: 1,
                message: "invalid syntax".to_string(),
            }));
        }

        let line_count = source.lines().count().max(1);
        let (docstring, docstring_end_line) = match docstring_of(root, bytes) {
            Some((text, end)) => (Some(text), Some(end)),
            None => (None, None),
        };
        let name = module_name
            .rsplit('.')
            .next()
            .unwrap_or(module_name)
            .to_string();

        let mut decls = DeclTree {
            decls: vec![Declaration {
                kind: SymbolKind::Module,
                name,
                qualified_name: module_name.to_string(),
                start_line: 1,
                end_line: line_count,
                header_end_line: 0,
                docstring,
                docstring_end_line,
                signature: Signature::default(),
                metadata: collect_metadata(root, bytes),
                parent: None,
                children: Vec::new(),
            }],
        };

        collect(root, bytes, 0, &mut decls);
        Ok(decls)
    }
}

/// Dotted module name for a project-relative path (`pkg/sub/mod.py` → `pkg.sub.mod`).
pub fn module_name_for(rel_path: &str) -> String {
    let trimmed = rel_path.trim_start_matches("./");
    let without_ext = trimmed
        .strip_suffix(".py")
        .or_else(|| trimmed.strip_suffix(".pyi"))
        .unwrap_or(trimmed);
    let mut parts: Vec<&str> = without_ext
        .split(['/', '\\'])
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() > 1 && parts.last() == Some(&"__init__") {
        parts.pop();
    }
    if parts.is_empty() {
        return "__main__".to_string();
    }
    parts.join(".")
}

fn collect(node: Node, source: &[u8], scope: DeclId, tree: &mut DeclTree) {
    let mut cursor = node.walk();
    let children: Vec<Node> = node.named_children(&mut cursor).collect();
    for child in children {
        match child.kind() {
            "function_definition" | "class_definition" => {
                if let Some(id) = declare(child, child, source, scope, tree) {
                    if let Some(body) = child.child_by_field_name("body") {
                        collect(body, source, id, tree);
                    }
                }
            }
            "decorated_definition" => {
                let Some(def) = child.child_by_field_name("definition") else {
                    continue;
                };
                if let Some(id) = declare(child, def, source, scope, tree) {
                    if let Some(body) = def.child_by_field_name("body") {
                        collect(body, source, id, tree);
                    }
                }
            }
            // Conditional and compound statements: keep walking in the same scope.
            _ => collect(child, source, scope, tree),
        }
    }
}

/// Record one declaration. `outer` carries the span (decorators included),
/// `def` is the `function_definition` / `class_definition` node itself.
fn declare(
    outer: Node,
    def: Node,
    source: &[u8],
    scope: DeclId,
    tree: &mut DeclTree,
) -> Option<DeclId> {
    let name = text_of(def.child_by_field_name("name")?, source).to_string();
    let parent = &tree.decls[scope];

    let kind = if def.kind() == "class_definition" {
        SymbolKind::Class
    } else if parent.kind == SymbolKind::Class {
        SymbolKind::Method
    } else {
        SymbolKind::Function
    };
    let qualified_name = format!("{}.{}", parent.qualified_name, name);

    let mut cursor = def.walk();
    let tokens: Vec<Node> = def.children(&mut cursor).collect();
    let start_line = outer.start_position().row + 1;
    let header_end_line = tokens
        .iter()
        .find(|t| t.kind() == ":")
        .map(|t| t.start_position().row + 1)
        .unwrap_or(start_line);

    let body = def.child_by_field_name("body");
    let (docstring, docstring_end_line) = match body.and_then(|b| docstring_of(b, source)) {
        Some((text, end)) => (Some(text), Some(end)),
        None => (None, None),
    };

    let mut signature = Signature {
        is_async: tokens.iter().any(|t| t.kind() == "async"),
        return_annotation: def
            .child_by_field_name("return_type")
            .map(|n| text_of(n, source).to_string()),
        ..Signature::default()
    };
    if outer.kind() == "decorated_definition" {
        let mut c = outer.walk();
        signature.decorators = outer
            .named_children(&mut c)
            .filter(|n| n.kind() == "decorator")
            .map(|n| text_of(n, source).trim_start_matches('@').trim().to_string())
            .collect();
    }
    if let Some(params) = def.child_by_field_name("parameters") {
        signature.parameters = parse_parameters(params, source);
    }
    if let Some(bases) = def.child_by_field_name("superclasses") {
        let mut c = bases.walk();
        signature.bases = bases
            .named_children(&mut c)
            .filter(|n| n.kind() != "comment")
            .map(|n| text_of(n, source).to_string())
            .collect();
    }

    let id = tree.decls.len();
    tree.decls.push(Declaration {
        kind,
        name,
        qualified_name,
        start_line,
        end_line: end_line_of(outer),
        header_end_line,
        docstring,
        docstring_end_line,
        signature,
        metadata: body
            .map(|b| collect_metadata(b, source))
            .unwrap_or_default(),
        parent: Some(scope),
        children: Vec::new(),
    });
    tree.decls[scope].children.push(id);
    Some(id)
}

fn parse_parameters(params: Node, source: &[u8]) -> Vec<Parameter> {
    let field = |n: Node, name: &str| n.child_by_field_name(name).map(|f| text_of(f, source).to_string());

    let mut cursor = params.walk();
    let children: Vec<Node> = params.named_children(&mut cursor).collect();
    let mut out = Vec::with_capacity(children.len());
    for p in children {
        let param = match p.kind() {
            "comment" => continue,
            "typed_parameter" => {
                let mut c = p.walk();
                let name = p
                    .named_children(&mut c)
                    .next()
                    .map(|n| text_of(n, source).to_string())
                    .unwrap_or_default();
                Parameter {
                    name,
                    annotation: field(p, "type"),
                    default: None,
                }
            }
            "default_parameter" | "typed_default_parameter" => Parameter {
                name: field(p, "name").unwrap_or_default(),
                annotation: field(p, "type"),
                default: field(p, "value"),
            },
            _ => Parameter {
                name: text_of(p, source).to_string(),
                annotation: None,
                default: None,
            },
        };
        out.push(param);
    }
    out
}

/// Docstring of a `module` or `block`: the first statement, if it is a bare string.
fn docstring_of(container: Node, source: &[u8]) -> Option<(String, usize)> {
    let mut cursor = container.walk();
    let first = container
        .named_children(&mut cursor)
        .find(|n| n.kind() != "comment")?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let mut c = first.walk();
    let mut inner = first.named_children(&mut c);
    let literal = inner.next()?;
    if literal.kind() != "string" || inner.next().is_some() {
        return None;
    }
    let cleaned = clean_docstring(strip_quotes(text_of(literal, source)))?;
    Some((cleaned, end_line_of(first)))
}

fn strip_quotes(literal: &str) -> &str {
    let body = literal.trim_start_matches(|c: char| "rRuUbBfF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if body.len() >= 2 * quote.len() && body.starts_with(quote) && body.ends_with(quote) {
            return &body[quote.len()..body.len() - quote.len()];
        }
    }
    body
}

/// Remove the common indentation of continuation lines and surrounding blank lines.
fn clean_docstring(raw: &str) -> Option<String> {
    let mut lines = raw.lines();
    let first = lines.next().unwrap_or("").trim().to_string();
    let rest: Vec<&str> = lines.collect();
    let indent = rest
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| ascii_indent(l))
        .min()
        .unwrap_or(0);

    let mut cleaned = vec![first];
    for line in rest {
        let stripped = &line[ascii_indent(line).min(indent)..];
        cleaned.push(stripped.trim_end().to_string());
    }
    while cleaned.first().is_some_and(|l| l.is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.is_empty()) {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.join("\n"))
    }
}

/// Leading spaces and tabs, in bytes. Other Unicode whitespace is content.
fn ascii_indent(line: &str) -> usize {
    line.bytes().take_while(|b| matches!(b, b' ' | b'\t')).count()
}

fn collect_metadata(root: Node, source: &[u8]) -> CodeMetadata {
    let mut meta = CodeMetadata::default();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "call" => {
                let callee = node.child_by_field_name("function").and_then(|f| match f.kind() {
                    "identifier" => Some(f),
                    "attribute" => f.child_by_field_name("attribute"),
                    _ => None,
                });
                if let Some(callee) = callee {
                    push_unique(&mut meta.calls, text_of(callee, source));
                }
            }
            "if_statement" | "elif_clause" | "for_statement" | "while_statement"
            | "try_statement" => meta.branches += 1,
            "import_statement" => {
                let mut c = node.walk();
                for name in node.children_by_field_name("name", &mut c) {
                    push_unique(&mut meta.imports, import_target(name, source));
                }
            }
            "import_from_statement" => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(|m| text_of(m, source))
                    .unwrap_or("");
                let mut c = node.walk();
                let mut names: Vec<&str> = node
                    .children_by_field_name("name", &mut c)
                    .map(|n| import_target(n, source))
                    .collect();
                let mut c = node.walk();
                if node.named_children(&mut c).any(|n| n.kind() == "wildcard_import") {
                    names.push("*");
                }
                for name in names {
                    push_unique(&mut meta.imports, &format!("{module}.{name}"));
                }
            }
            _ => {}
        }
        let mut c = node.walk();
        let children: Vec<Node> = node.named_children(&mut c).collect();
        stack.extend(children.into_iter().rev());
    }
    meta
}

fn import_target<'a>(name: Node, source: &'a [u8]) -> &'a str {
    if name.kind() == "aliased_import" {
        if let Some(inner) = name.child_by_field_name("name") {
            return text_of(inner, source);
        }
    }
    text_of(name, source)
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn first_error(node: Node, source: &[u8]) -> Option<ParseError> {
    if node.is_error() || node.is_missing() {
        let pos = node.start_position();
        let message = if node.is_missing() {
            format!("missing `{}`", node.kind())
        } else {
            let snippet: String = text_of(node, source).chars().take(40).collect();
            format!("unexpected `{}`", snippet.lines().next().unwrap_or(""))
        };
        return Some(ParseError {
            line: pos.row + 1,
            column: pos.column + 1,
            message,
        });
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children.into_iter().find_map(|c| first_error(c, source))
}

fn end_line_of(node: Node) -> usize {
    let end = node.end_position();
    if end.column == 0 && end.row > node.start_position().row {
        end.row
    } else {
        end.row + 1
    }
}

fn text_of<'a>(node: Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> DeclTree {
        CodeParser::new()
            .parse_source(src, "app.models")
            .expect("source should parse")
    }

    fn find<'a>(tree: &'a DeclTree, qname: &str) -> (DeclId, &'a Declaration) {
        tree.iter()
            .find(|(_, d)| d.qualified_name == qname)
            .unwrap_or_else(|| panic!("missing declaration {qname}"))
    }

    #[test]
    fn test_parse_python_classes_and_functions() {
        let src = r#"class User:
    def __init__(self, name):
        self.name = name

def load_users():
    return [User("a")]
"#;
        let tree = parse(src);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.module().kind, SymbolKind::Module);
        assert_eq!(tree.module().qualified_name, "app.models");
        assert_eq!(tree.module().end_line, 6);

        let (user_id, user) = find(&tree, "app.models.User");
        assert_eq!(user.kind, SymbolKind::Class);
        assert_eq!((user.start_line, user.end_line), (1, 3));
        assert_eq!(user.parent, Some(0));

        let (_, init) = find(&tree, "app.models.User.__init__");
        assert_eq!(init.kind, SymbolKind::Method);
        assert_eq!(init.parent, Some(user_id));
        let names: Vec<&str> = init.signature.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["self", "name"]);

        let (_, load) = find(&tree, "app.models.load_users");
        assert_eq!(load.kind, SymbolKind::Function);
        assert_eq!((load.start_line, load.end_line), (5, 6));
        assert!(load.metadata.calls.contains(&"User".to_string()));
    }

    #[test]
    fn test_docstring_with_unicode_indentation() {
        let src = "def f():\n    \"\"\"Doc.\n     x\n    \u{a0}y\n    \"\"\"\n    pass\n";
        let tree = parse(src);
        let (_, f) = find(&tree, "app.models.f");
        assert_eq!(f.docstring.as_deref(), Some("Doc.\n x\n\u{a0}y"));
    }

    #[test]
    fn test_decorators_docstring_and_annotations() {
        let src = r#"import os
from typing import List as L

class Repo(Base, metaclass=Meta):
    """Stores things.

    Details here.
        Indented detail.
    """

    @staticmethod
    @cached(ttl=10)
    async def fetch(key: str, *args, limit: int = 5, **kw) -> L:
        '''Fetch one.'''
        if key:
            return os.getenv(key)
        for _ in args:
            pass
"#;
        let tree = parse(src);
        assert_eq!(tree.module().metadata.imports, vec!["os", "typing.List"]);

        let (_, repo) = find(&tree, "app.models.Repo");
        assert_eq!(repo.signature.bases, vec!["Base", "metaclass=Meta"]);
        assert_eq!(
            repo.docstring.as_deref(),
            Some("Stores things.\n\nDetails here.\n    Indented detail.")
        );
        assert_eq!(repo.docstring_end_line, Some(9));

        let (_, fetch) = find(&tree, "app.models.Repo.fetch");
        assert_eq!(fetch.kind, SymbolKind::Method);
        assert_eq!(fetch.start_line, 11, "span starts at the first decorator");
        assert_eq!(fetch.header_end_line, 13);
        assert_eq!(fetch.signature.decorators, vec!["staticmethod", "cached(ttl=10)"]);
        assert!(fetch.signature.is_async);
        assert_eq!(fetch.signature.return_annotation.as_deref(), Some("L"));
        assert_eq!(fetch.docstring.as_deref(), Some("Fetch one."));
        assert_eq!(fetch.metadata.branches, 2);
        assert!(fetch.metadata.calls.contains(&"getenv".to_string()));

        let params = &fetch.signature.parameters;
        assert_eq!(params[0].name, "key");
        assert_eq!(params[0].annotation.as_deref(), Some("str"));
        assert_eq!(params[1].name, "*args");
        assert_eq!(params[2].name, "limit");
        assert_eq!(params[2].default.as_deref(), Some("5"));
        assert_eq!(params[3].name, "**kw");
    }

    #[test]
    fn test_conditional_and_nested_definitions() {
        let src = r#"try:
    import ujson as json
except ImportError:
    def dumps(x):
        return str(x)

if True:
    def helper():
        def inner():
            return 1
        return inner()
"#;
        let tree = parse(src);
        let (_, dumps) = find(&tree, "app.models.dumps");
        assert_eq!(dumps.kind, SymbolKind::Function);
        assert_eq!(dumps.parent, Some(0));

        let (helper_id, helper) = find(&tree, "app.models.helper");
        assert_eq!(helper.parent, Some(0));
        let (_, inner) = find(&tree, "app.models.helper.inner");
        assert_eq!(inner.kind, SymbolKind::Function);
        assert_eq!(inner.parent, Some(helper_id));
    }

    #[test]
    fn test_expression_only_file_is_single_module() {
        let tree = parse("print('hi')\nx = 1 + 2\n");
        assert_eq!(tree.len(), 1);
        assert!(tree.module().children.is_empty());
        assert_eq!(tree.module().end_line, 2);

        let empty = parse("");
        assert_eq!(empty.len(), 1);
        assert_eq!((empty.module().start_line, empty.module().end_line), (1, 1));
    }

    #[test]
    fn test_syntax_error_reports_location() {
        let err = CodeParser::new()
            .parse_source("def broken(:\n    pass\n", "bad")
            .unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_containment_recoverable_from_spans() {
        let src = r#"class Outer:
    class Inner:
        def method(self):
            pass

    def other(self):
        pass

def top():
    pass
"#;
        let tree = parse(src);
        for (id, decl) in tree.iter().skip(1) {
            assert_eq!(
                tree.enclosing_by_span(id),
                decl.parent,
                "span containment disagrees for {}",
                decl.qualified_name
            );
        }
    }

    #[test]
    fn test_module_name_for() {
        assert_eq!(module_name_for("pkg/sub/mod.py"), "pkg.sub.mod");
        assert_eq!(module_name_for("pkg/__init__.py"), "pkg");
        assert_eq!(module_name_for("./main.py"), "main");
        assert_eq!(module_name_for("__init__.py"), "__init__");
    }
}
