//! Parser backend adapter.
//!
//! The engine never talks to tree-sitter directly; it goes through a
//! capability-typed [`ParserBackend`]. Two backends ship: the native
//! tree-sitter backend (feature `treesitter`) and the regex line-scan
//! "snapshot" backend that is always compiled in. Backend init is
//! priority-ordered; a backend that fails to initialize is replaced by the
//! next candidate and its resources dropped.

use crate::types::{LanguageId, SourceRange, SymbolKind, SymbolRecord, TypeRelation};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// What a backend can produce. Callers check capabilities before asking for
/// call-graph or type-graph data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserCapabilities {
    /// Precise tree queries (full AST walking).
    pub supports_queries: bool,
    /// Call-site extraction from function bodies.
    pub supports_call_sites: bool,
    /// extends/implements relations.
    pub supports_type_relations: bool,
}

/// A call site found inside a file: `caller` is the enclosing symbol name
/// when known, `callee` the referenced name.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub caller: Option<String>,
    pub callee: String,
}

/// Everything a backend extracts from one file in one pass.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub symbols: Vec<SymbolRecord>,
    /// Import specifiers as written (`./a`, `react`, `crate::config`).
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub call_sites: Vec<CallSite>,
    /// (subtype, supertype, relation)
    pub type_relations: Vec<(String, String, TypeRelation)>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported language for {0}")]
    UnsupportedLanguage(String),
    #[error("parse failed for {0}: {1}")]
    Failed(String, String),
}

pub trait ParserBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> ParserCapabilities;
    fn language_for(&self, path: &str) -> Option<LanguageId>;
    fn parse(&self, path: &str, content: &str) -> Result<ParsedFile, ParseError>;
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Build the backend for a preference, falling through the priority order
/// when a candidate fails to initialize.
pub fn select_backend(pref: crate::config::BackendPreference) -> Arc<dyn ParserBackend> {
    use crate::config::BackendPreference;
    let order: &[&str] = match pref {
        BackendPreference::Native => &["native"],
        BackendPreference::Snapshot => &["snapshot"],
        BackendPreference::Auto => &["native", "snapshot"],
    };
    for candidate in order {
        match *candidate {
            #[cfg(feature = "treesitter")]
            "native" => {
                debug!(backend = "native", "parser backend selected");
                return Arc::new(TreeSitterBackend);
            }
            #[cfg(not(feature = "treesitter"))]
            "native" => continue,
            _ => {
                debug!(backend = "snapshot", "parser backend selected");
                return Arc::new(LineScanBackend::new());
            }
        }
    }
    Arc::new(LineScanBackend::new())
}

// ---------------------------------------------------------------------------
// Topology scanning (shared by the snapshot backend and LOD 1)
// ---------------------------------------------------------------------------

/// A cheap symbol sighting: name plus a rough line range (end unknown until
/// a deeper tier runs).
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub line: usize,
    pub exported: bool,
    pub container: Option<String>,
    pub signature: String,
}

/// LOD-1 output: imports and top-level symbol sightings from a line scan.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub symbols: Vec<TopologySymbol>,
}

struct TopologyPatterns {
    rust_use: Regex,
    rust_sym: Regex,
    js_import: Regex,
    js_sym: Regex,
    py_import: Regex,
    py_sym: Regex,
    go_import: Regex,
    go_sym: Regex,
    c_include: Regex,
    c_sym: Regex,
    java_import: Regex,
    java_sym: Regex,
}

impl TopologyPatterns {
    fn new() -> TopologyPatterns {
        TopologyPatterns {
            rust_use: Regex::new(r"^\s*(?:pub\s+)?use\s+([\w:]+)").unwrap(),
            rust_sym: Regex::new(
                r"^\s*(pub(?:\([^)]*\))?\s+)?(fn|struct|enum|trait|type|const|static|mod)\s+([A-Za-z_][A-Za-z0-9_]*)",
            )
            .unwrap(),
            js_import: Regex::new(
                r#"(?:from\s+['"]([^'"]+)['"]|require\s*\(\s*['"]([^'"]+)['"]\s*\)|^\s*import\s+['"]([^'"]+)['"])"#,
            )
            .unwrap(),
            js_sym: Regex::new(
                r"^\s*(export\s+)?(?:default\s+)?(?:async\s+)?(function|class|interface|type|const|let|var|enum)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
            )
            .unwrap(),
            py_import: Regex::new(r"^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))").unwrap(),
            py_sym: Regex::new(r"^(\s*)(?:async\s+)?(def|class)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
            go_import: Regex::new(r#""([^"]+)""#).unwrap(),
            go_sym: Regex::new(
                r"^\s*(func|type|const|var)\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)",
            )
            .unwrap(),
            c_include: Regex::new(r#"^\s*#\s*include\s+[<"]([^>"]+)[>"]"#).unwrap(),
            c_sym: Regex::new(
                r"^(?:[A-Za-z_][\w\s\*]*\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*\([^;]*\)\s*\{?\s*$",
            )
            .unwrap(),
            java_import: Regex::new(r"^\s*import\s+(?:static\s+)?([\w.]+)\s*;").unwrap(),
            java_sym: Regex::new(
                r"^\s*(?:public|protected|private)?\s*(?:static\s+|final\s+|abstract\s+)*(class|interface|enum)\s+([A-Za-z_][A-Za-z0-9_]*)",
            )
            .unwrap(),
        }
    }
}

fn js_symbol_kind(keyword: &str) -> SymbolKind {
    match keyword {
        "function" => SymbolKind::Function,
        "class" => SymbolKind::Class,
        "interface" => SymbolKind::Interface,
        "type" => SymbolKind::TypeAlias,
        "enum" => SymbolKind::Enum,
        _ => SymbolKind::Variable,
    }
}

fn rust_symbol_kind(keyword: &str) -> SymbolKind {
    match keyword {
        "fn" => SymbolKind::Function,
        "struct" => SymbolKind::Struct,
        "enum" => SymbolKind::Enum,
        "trait" => SymbolKind::Trait,
        "type" => SymbolKind::TypeAlias,
        "const" | "static" => SymbolKind::Constant,
        _ => SymbolKind::Variable,
    }
}

/// Line-scan topology extraction. Target: ≤ 2 ms per typical source file —
/// one pass, no tree construction.
pub fn scan_topology(content: &str, lang: LanguageId) -> Topology {
    let patterns = topology_patterns();
    let mut topo = Topology::default();
    let mut in_go_import_block = false;

    for (idx, line) in content.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim_start();
        // Indented declarations are members or locals; LOD 1 only records
        // top-level symbols (the deeper tiers attribute the rest).
        let top_level = !line.starts_with(' ') && !line.starts_with('\t');
        match lang {
            LanguageId::Rust => {
                if let Some(cap) = patterns.rust_use.captures(line) {
                    topo.imports.push(cap[1].to_string());
                    continue;
                }
                if let Some(cap) = patterns.rust_sym.captures(line) {
                    if !top_level {
                        continue;
                    }
                    let exported = cap.get(1).is_some();
                    let name = cap[3].to_string();
                    if exported {
                        topo.exports.push(name.clone());
                    }
                    topo.symbols.push(TopologySymbol {
                        name,
                        kind: rust_symbol_kind(&cap[2]),
                        line: lineno,
                        exported,
                        container: None,
                        signature: trimmed.trim_end_matches('{').trim_end().to_string(),
                    });
                }
            }
            LanguageId::TypeScript | LanguageId::JavaScript => {
                if let Some(cap) = patterns.js_import.captures(line) {
                    let spec = cap
                        .get(1)
                        .or_else(|| cap.get(2))
                        .or_else(|| cap.get(3))
                        .map(|m| m.as_str().to_string());
                    if let Some(s) = spec {
                        topo.imports.push(s);
                        continue;
                    }
                }
                if let Some(cap) = patterns.js_sym.captures(line) {
                    if !top_level {
                        continue;
                    }
                    let exported = cap.get(1).is_some();
                    let name = cap[3].to_string();
                    if exported {
                        topo.exports.push(name.clone());
                    }
                    topo.symbols.push(TopologySymbol {
                        name,
                        kind: js_symbol_kind(&cap[2]),
                        line: lineno,
                        exported,
                        container: None,
                        signature: trimmed.trim_end_matches('{').trim_end().to_string(),
                    });
                }
            }
            LanguageId::Python => {
                if let Some(cap) = patterns.py_import.captures(line) {
                    let spec = cap.get(1).or_else(|| cap.get(2)).map(|m| m.as_str().to_string());
                    if let Some(s) = spec {
                        topo.imports.push(s);
                        continue;
                    }
                }
                if let Some(cap) = patterns.py_sym.captures(line) {
                    // Only top-level definitions at LOD 1; nested defs need the AST.
                    if cap[1].is_empty() {
                        let name = cap[3].to_string();
                        let kind = if &cap[2] == "class" {
                            SymbolKind::Class
                        } else {
                            SymbolKind::Function
                        };
                        topo.symbols.push(TopologySymbol {
                            name: name.clone(),
                            kind,
                            line: lineno,
                            exported: !name.starts_with('_'),
                            container: None,
                            signature: trimmed.trim_end_matches(':').to_string(),
                        });
                    }
                }
            }
            LanguageId::Go => {
                if trimmed.starts_with("import (") {
                    in_go_import_block = true;
                    continue;
                }
                if in_go_import_block {
                    if trimmed.starts_with(')') {
                        in_go_import_block = false;
                    } else if let Some(cap) = patterns.go_import.captures(line) {
                        topo.imports.push(cap[1].to_string());
                    }
                    continue;
                }
                if trimmed.starts_with("import ") {
                    if let Some(cap) = patterns.go_import.captures(line) {
                        topo.imports.push(cap[1].to_string());
                    }
                    continue;
                }
                if let Some(cap) = patterns.go_sym.captures(line) {
                    if !top_level {
                        continue;
                    }
                    let name = cap[2].to_string();
                    let kind = match &cap[1] {
                        "func" => SymbolKind::Function,
                        "type" => SymbolKind::TypeAlias,
                        _ => SymbolKind::Variable,
                    };
                    let exported = name.chars().next().is_some_and(|c| c.is_uppercase());
                    topo.symbols.push(TopologySymbol {
                        name,
                        kind,
                        line: lineno,
                        exported,
                        container: None,
                        signature: trimmed.trim_end_matches('{').trim_end().to_string(),
                    });
                }
            }
            LanguageId::C | LanguageId::Cpp => {
                if let Some(cap) = patterns.c_include.captures(line) {
                    topo.imports.push(cap[1].to_string());
                    continue;
                }
                if trimmed.starts_with("//") || trimmed.starts_with('*') || trimmed.starts_with('#')
                {
                    continue;
                }
                if let Some(cap) = patterns.c_sym.captures(trimmed) {
                    if !top_level {
                        continue;
                    }
                    let name = cap[1].to_string();
                    if !matches!(name.as_str(), "if" | "for" | "while" | "switch" | "return") {
                        topo.symbols.push(TopologySymbol {
                            name,
                            kind: SymbolKind::Function,
                            line: lineno,
                            exported: true,
                            container: None,
                            signature: trimmed.trim_end_matches('{').trim_end().to_string(),
                        });
                    }
                }
            }
            LanguageId::Java => {
                if let Some(cap) = patterns.java_import.captures(line) {
                    topo.imports.push(cap[1].to_string());
                    continue;
                }
                if let Some(cap) = patterns.java_sym.captures(line) {
                    if !top_level {
                        continue;
                    }
                    let kind = match &cap[1] {
                        "interface" => SymbolKind::Interface,
                        "enum" => SymbolKind::Enum,
                        _ => SymbolKind::Class,
                    };
                    topo.symbols.push(TopologySymbol {
                        name: cap[2].to_string(),
                        kind,
                        line: lineno,
                        exported: trimmed.starts_with("public"),
                        container: None,
                        signature: trimmed.trim_end_matches('{').trim_end().to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    topo
}

fn topology_patterns() -> &'static TopologyPatterns {
    use std::sync::OnceLock;
    static PATTERNS: OnceLock<TopologyPatterns> = OnceLock::new();
    PATTERNS.get_or_init(TopologyPatterns::new)
}

// ---------------------------------------------------------------------------
// Snapshot backend (regex line scan, always available)
// ---------------------------------------------------------------------------

/// Regex-based backend. No queries, no call sites — good enough for
/// topology and a degraded skeleton when tree-sitter is unavailable.
pub struct LineScanBackend;

impl LineScanBackend {
    pub fn new() -> LineScanBackend {
        LineScanBackend
    }
}

impl Default for LineScanBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserBackend for LineScanBackend {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn capabilities(&self) -> ParserCapabilities {
        ParserCapabilities {
            supports_queries: false,
            supports_call_sites: false,
            supports_type_relations: false,
        }
    }

    fn language_for(&self, path: &str) -> Option<LanguageId> {
        let lang = LanguageId::from_path(path);
        lang.is_code().then_some(lang)
    }

    fn parse(&self, path: &str, content: &str) -> Result<ParsedFile, ParseError> {
        let lang = self
            .language_for(path)
            .ok_or_else(|| ParseError::UnsupportedLanguage(path.to_string()))?;
        let topo = scan_topology(content, lang);
        let total_lines = content.lines().count().max(1);

        let mut symbols: Vec<SymbolRecord> = Vec::with_capacity(topo.symbols.len());
        for (i, t) in topo.symbols.iter().enumerate() {
            // Rough range: up to the line before the next sighting.
            let end_line = topo
                .symbols
                .get(i + 1)
                .map(|n| n.line.saturating_sub(1).max(t.line))
                .unwrap_or(total_lines);
            symbols.push(SymbolRecord {
                file: path.to_string(),
                name: t.name.clone(),
                container: t.container.clone(),
                kind: t.kind,
                range: SourceRange { start_line: t.line, end_line, start_byte: 0, end_byte: 0 },
                signature: t.signature.clone(),
                doc: None,
                exported: t.exported,
            });
        }

        Ok(ParsedFile {
            symbols,
            imports: topo.imports,
            exports: topo.exports,
            call_sites: Vec::new(),
            type_relations: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tree-sitter backend (feature `treesitter`)
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
pub use ts_backend::TreeSitterBackend;

#[cfg(feature = "treesitter")]
mod ts_backend {
    use super::*;
    use tree_sitter::{Language, Node, Parser};

    pub struct TreeSitterBackend;

    fn language_of(lang: LanguageId) -> Option<Language> {
        match lang {
            LanguageId::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            LanguageId::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            LanguageId::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            LanguageId::Python => Some(tree_sitter_python::LANGUAGE.into()),
            LanguageId::Go => Some(tree_sitter_go::LANGUAGE.into()),
            LanguageId::C => Some(tree_sitter_c::LANGUAGE.into()),
            LanguageId::Cpp => Some(tree_sitter_cpp::LANGUAGE.into()),
            LanguageId::Java => Some(tree_sitter_java::LANGUAGE.into()),
            _ => None,
        }
    }

    fn classify(kind: &str) -> Option<SymbolKind> {
        match kind {
            "function_item" | "function_declaration" | "function_definition" => {
                Some(SymbolKind::Function)
            }
            "struct_item" | "struct_specifier" => Some(SymbolKind::Struct),
            "enum_item" | "enum_declaration" | "enum_specifier" => Some(SymbolKind::Enum),
            "trait_item" => Some(SymbolKind::Trait),
            "type_item" | "type_alias_declaration" | "type_spec" => Some(SymbolKind::TypeAlias),
            "const_item" | "static_item" => Some(SymbolKind::Constant),
            "class_declaration" | "class_definition" | "class_specifier" => Some(SymbolKind::Class),
            "interface_declaration" => Some(SymbolKind::Interface),
            "method_definition" | "method_declaration" => Some(SymbolKind::Method),
            _ => None,
        }
    }

    /// Container node kinds whose children become member symbols.
    fn is_container(kind: &str) -> bool {
        matches!(
            kind,
            "impl_item"
                | "class_declaration"
                | "class_definition"
                | "class_specifier"
                | "trait_item"
                | "interface_declaration"
        )
    }

    fn node_name(node: &Node, source: &[u8]) -> Option<String> {
        for field in ["name", "type"] {
            if let Some(n) = node.child_by_field_name(field) {
                if let Ok(text) = n.utf8_text(source) {
                    let name = text.trim();
                    if !name.is_empty() {
                        return Some(name.to_string());
                    }
                }
            }
        }
        if node.kind() == "type_spec" {
            if let Some(child) = node.named_child(0) {
                if let Ok(text) = child.utf8_text(source) {
                    return Some(text.trim().to_string());
                }
            }
        }
        None
    }

    fn signature_of(node: &Node, source: &[u8]) -> String {
        let text = node.utf8_text(source).unwrap_or("");
        let first = text.lines().next().unwrap_or("").trim();
        let sig = match first.find('{') {
            Some(pos) => first[..pos].trim_end(),
            None => first,
        };
        if sig.len() > 200 {
            let mut end = 200;
            while !sig.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &sig[..end])
        } else {
            sig.to_string()
        }
    }

    /// Doc comment directly above a node: consecutive `///`, `//!`, `#`, or
    /// `/** */` lines.
    fn doc_above(node: &Node, lines: &[&str]) -> Option<String> {
        let start = node.start_position().row;
        let mut collected: Vec<&str> = Vec::new();
        let mut row = start;
        while row > 0 {
            row -= 1;
            let t = lines.get(row)?.trim();
            if t.starts_with("///") || t.starts_with("//!") || t.starts_with("#")
                || t.starts_with("*") || t.starts_with("/**") || t.starts_with("//")
            {
                collected.push(t);
            } else {
                break;
            }
        }
        if collected.is_empty() {
            return None;
        }
        collected.reverse();
        let doc = collected
            .iter()
            .map(|l| {
                l.trim_start_matches("///")
                    .trim_start_matches("//!")
                    .trim_start_matches("/**")
                    .trim_start_matches("//")
                    .trim_start_matches('#')
                    .trim_start_matches('*')
                    .trim()
            })
            .filter(|l| !l.is_empty() && *l != "/")
            .collect::<Vec<_>>()
            .join(" ");
        (!doc.is_empty()).then_some(doc)
    }

    fn is_exported(node: &Node, source: &[u8], lang: LanguageId, name: &str) -> bool {
        match lang {
            LanguageId::Rust => node
                .utf8_text(source)
                .map(|t| t.trim_start().starts_with("pub"))
                .unwrap_or(false),
            LanguageId::Go => name.chars().next().is_some_and(|c| c.is_uppercase()),
            LanguageId::Python => !name.starts_with('_'),
            LanguageId::TypeScript | LanguageId::JavaScript => node
                .parent()
                .map(|p| p.kind() == "export_statement")
                .unwrap_or(false),
            _ => true,
        }
    }

    fn callee_name(node: &Node, source: &[u8]) -> Option<String> {
        let func = node
            .child_by_field_name("function")
            .or_else(|| node.child_by_field_name("name"))?;
        let text = func.utf8_text(source).ok()?.trim();
        let name = text
            .rsplit_once("::")
            .map(|(_, n)| n)
            .or_else(|| text.rsplit_once('.').map(|(_, n)| n))
            .unwrap_or(text);
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        Some(name.to_string())
    }

    fn collect_calls(node: &Node, source: &[u8], out: &mut Vec<String>) {
        if matches!(node.kind(), "call_expression" | "call" | "method_invocation") {
            if let Some(name) = callee_name(node, source) {
                out.push(name);
            }
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect_calls(&child, source, out);
        }
    }

    /// extends/implements targets of a class-like node.
    fn inheritance_of(
        node: &Node,
        source: &[u8],
        lang: LanguageId,
    ) -> Vec<(String, TypeRelation)> {
        let mut out = Vec::new();
        match lang {
            LanguageId::Rust => {
                if node.kind() == "impl_item" {
                    if let Some(trait_node) = node.child_by_field_name("trait") {
                        if let Ok(text) = trait_node.utf8_text(source) {
                            out.push((text.trim().to_string(), TypeRelation::Implements));
                        }
                    }
                }
            }
            LanguageId::Python => {
                if let Some(supers) = node.child_by_field_name("superclasses") {
                    let mut cursor = supers.walk();
                    for child in supers.children(&mut cursor) {
                        if matches!(child.kind(), "identifier" | "attribute") {
                            if let Ok(text) = child.utf8_text(source) {
                                let name = text.rsplit_once('.').map(|(_, n)| n).unwrap_or(text);
                                if !name.is_empty() && name != "object" {
                                    out.push((name.trim().to_string(), TypeRelation::Extends));
                                }
                            }
                        }
                    }
                }
            }
            _ => {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    let ck = child.kind();
                    if ck == "class_heritage" || ck == "extends_clause" || ck == "superclass"
                        || ck == "super_interfaces" || ck == "implements_clause"
                    {
                        let relation = if ck.contains("implements") || ck == "super_interfaces" {
                            TypeRelation::Implements
                        } else {
                            TypeRelation::Extends
                        };
                        collect_heritage_names(&child, source, relation, &mut out);
                    }
                }
            }
        }
        out
    }

    fn collect_heritage_names(
        node: &Node,
        source: &[u8],
        relation: TypeRelation,
        out: &mut Vec<(String, TypeRelation)>,
    ) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            let ck = child.kind();
            if ck == "type_identifier" || ck == "identifier" {
                if let Ok(text) = child.utf8_text(source) {
                    let t = text.trim().to_string();
                    if !t.is_empty() && !out.iter().any(|(n, _)| n == &t) {
                        out.push((t, relation));
                    }
                }
            } else if ck == "implements_clause" {
                collect_heritage_names(&child, source, TypeRelation::Implements, out);
            } else if ck == "extends_clause" {
                collect_heritage_names(&child, source, TypeRelation::Extends, out);
            } else if child.named_child_count() > 0 {
                collect_heritage_names(&child, source, relation, out);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        node: &Node,
        source: &[u8],
        lines: &[&str],
        lang: LanguageId,
        path: &str,
        container: Option<&str>,
        out: &mut ParsedFile,
    ) {
        let kind = node.kind();

        if let Some(sym_kind) = classify(kind) {
            let name = node_name(node, source).unwrap_or_default();
            if !name.is_empty() {
                let final_kind = if container.is_some() && sym_kind == SymbolKind::Function {
                    SymbolKind::Method
                } else {
                    sym_kind
                };
                let exported = is_exported(node, source, lang, &name);
                if exported {
                    out.exports.push(name.clone());
                }
                out.symbols.push(SymbolRecord {
                    file: path.to_string(),
                    name: name.clone(),
                    container: container.map(|c| c.to_string()),
                    kind: final_kind,
                    range: SourceRange {
                        start_line: node.start_position().row + 1,
                        end_line: node.end_position().row + 1,
                        start_byte: node.start_byte(),
                        end_byte: node.end_byte(),
                    },
                    signature: signature_of(node, source),
                    doc: doc_above(node, lines),
                    exported,
                });

                if final_kind.is_callable() {
                    let mut calls = Vec::new();
                    if let Some(body) = node.child_by_field_name("body") {
                        collect_calls(&body, source, &mut calls);
                    }
                    calls.sort();
                    calls.dedup();
                    for callee in calls {
                        if callee != name {
                            out.call_sites
                                .push(CallSite { caller: Some(name.clone()), callee });
                        }
                    }
                }

                if final_kind.is_type_like() || kind == "class_definition" {
                    for (target, relation) in inheritance_of(node, source, lang) {
                        out.type_relations.push((name.clone(), target, relation));
                    }
                }
            }
        }

        // impl blocks carry Implements relations even though the impl itself
        // is not recorded as a symbol.
        if kind == "impl_item" {
            if let Some(type_node) = node.child_by_field_name("type") {
                if let Ok(type_name) = type_node.utf8_text(source) {
                    for (target, relation) in inheritance_of(node, source, lang) {
                        out.type_relations
                            .push((type_name.trim().to_string(), target, relation));
                    }
                    let mut cursor = node.walk();
                    for child in node.children(&mut cursor) {
                        walk(&child, source, lines, lang, path, Some(type_name.trim()), out);
                    }
                    return;
                }
            }
        }

        let next_container = if is_container(kind) {
            node_name(node, source)
        } else {
            None
        };
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk(
                &child,
                source,
                lines,
                lang,
                path,
                next_container.as_deref().or(container),
                out,
            );
        }
    }

    impl ParserBackend for TreeSitterBackend {
        fn name(&self) -> &'static str {
            "native"
        }

        fn capabilities(&self) -> ParserCapabilities {
            ParserCapabilities {
                supports_queries: true,
                supports_call_sites: true,
                supports_type_relations: true,
            }
        }

        fn language_for(&self, path: &str) -> Option<LanguageId> {
            let lang = LanguageId::from_path(path);
            language_of(lang).map(|_| lang)
        }

        fn parse(&self, path: &str, content: &str) -> Result<ParsedFile, ParseError> {
            let lang = LanguageId::from_path(path);
            let ts_lang = language_of(lang)
                .ok_or_else(|| ParseError::UnsupportedLanguage(path.to_string()))?;

            let mut parser = Parser::new();
            parser
                .set_language(&ts_lang)
                .map_err(|e| ParseError::Failed(path.to_string(), e.to_string()))?;
            let tree = parser
                .parse(content, None)
                .ok_or_else(|| ParseError::Failed(path.to_string(), "no tree".into()))?;

            let mut out = ParsedFile::default();
            // Imports come from the same line scan the topology tier uses;
            // the tree adds symbols, calls, and type relations.
            let topo = scan_topology(content, lang);
            out.imports = topo.imports;

            let source = content.as_bytes();
            let lines: Vec<&str> = content.lines().collect();
            let root = tree.root_node();
            let mut cursor = root.walk();
            for child in root.children(&mut cursor) {
                walk(&child, source, &lines, lang, path, None, &mut out);
            }
            Ok(out)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
