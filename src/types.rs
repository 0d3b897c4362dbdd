use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum file size (in bytes) that will be read into memory for analysis.
pub const MAX_FILE_READ: usize = 512 * 1024;

/// Current on-disk schema version shared by the trigram snapshot and the
/// relational store. Bump on incompatible layout changes.
pub const STORAGE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Normalize a path relative to the workspace root: forward slashes, no
/// leading `./`. Normalized relative paths are the identity of a file.
pub fn normalize_rel_path(path: &str) -> String {
    let p = path.replace('\\', "/");
    let p = p.strip_prefix("./").unwrap_or(&p);
    p.trim_start_matches('/').to_string()
}

/// Compute the normalized relative path of `abs` under `root`, or `None`
/// when `abs` lies outside the root.
pub fn rel_path_of(root: &Path, abs: &Path) -> Option<String> {
    abs.strip_prefix(root)
        .ok()
        .map(|p| normalize_rel_path(&p.to_string_lossy()))
}

/// Validate a workspace-relative path and resolve it under the root.
///
/// Traversal is detected on path components, so a `..` segment is rejected
/// while a literal `..` inside a file name (`a..b.rs`) is not. The resolved
/// path is canonicalized and re-checked against the root, which also catches
/// symlinks pointing outside the workspace.
pub fn validate_path(root: &Path, rel_path: &str) -> Result<PathBuf, &'static str> {
    if rel_path.is_empty() {
        return Err("empty path");
    }
    let rel = Path::new(rel_path);
    for component in rel.components() {
        match component {
            Component::ParentDir => return Err("path traversal detected"),
            Component::Prefix(_) | Component::RootDir => return Err("absolute path"),
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    let canonical = root.join(rel).canonicalize().map_err(|_| "file not found")?;
    let root_canonical = root.canonicalize().map_err(|_| "root not found")?;
    if !canonical.starts_with(&root_canonical) {
        return Err("escapes workspace root");
    }
    Ok(canonical)
}

// ---------------------------------------------------------------------------
// Level of detail
// ---------------------------------------------------------------------------

/// How deeply a file has been analyzed. Promotion is lazy and additive;
/// the tier only decreases through explicit invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lod {
    #[default]
    Unknown,
    Topology,
    Skeleton,
    FullAst,
}

impl Lod {
    pub fn as_u8(self) -> u8 {
        match self {
            Lod::Unknown => 0,
            Lod::Topology => 1,
            Lod::Skeleton => 2,
            Lod::FullAst => 3,
        }
    }

    pub fn from_u8(v: u8) -> Lod {
        match v {
            0 => Lod::Unknown,
            1 => Lod::Topology,
            2 => Lod::Skeleton,
            _ => Lod::FullAst,
        }
    }

    /// The next tier up, or `None` at the top.
    pub fn next(self) -> Option<Lod> {
        match self {
            Lod::Unknown => Some(Lod::Topology),
            Lod::Topology => Some(Lod::Skeleton),
            Lod::Skeleton => Some(Lod::FullAst),
            Lod::FullAst => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Interface,
    Trait,
    TypeAlias,
    Variable,
    Constant,
    Import,
    Export,
}

impl SymbolKind {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Class => "class",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Interface => "interface",
            SymbolKind::Trait => "trait",
            SymbolKind::TypeAlias => "type_alias",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Import => "import",
            SymbolKind::Export => "export",
        }
    }

    pub fn parse(s: &str) -> Option<SymbolKind> {
        match s {
            "function" => Some(SymbolKind::Function),
            "method" => Some(SymbolKind::Method),
            "class" => Some(SymbolKind::Class),
            "struct" => Some(SymbolKind::Struct),
            "enum" => Some(SymbolKind::Enum),
            "interface" => Some(SymbolKind::Interface),
            "trait" => Some(SymbolKind::Trait),
            "type_alias" => Some(SymbolKind::TypeAlias),
            "variable" => Some(SymbolKind::Variable),
            "constant" => Some(SymbolKind::Constant),
            "import" => Some(SymbolKind::Import),
            "export" => Some(SymbolKind::Export),
            _ => None,
        }
    }

    /// Kinds that define a callable body.
    pub fn is_callable(&self) -> bool {
        matches!(self, SymbolKind::Function | SymbolKind::Method)
    }

    /// Kinds that participate in the type hierarchy.
    pub fn is_type_like(&self) -> bool {
        matches!(
            self,
            SymbolKind::Class
                | SymbolKind::Struct
                | SymbolKind::Enum
                | SymbolKind::Interface
                | SymbolKind::Trait
                | SymbolKind::TypeAlias
        )
    }
}

/// Byte+line span of a symbol or chunk. Lines are 1-based inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRange {
    #[serde(rename = "startLine")]
    pub start_line: usize,
    #[serde(rename = "endLine")]
    pub end_line: usize,
    #[serde(rename = "startByte")]
    pub start_byte: usize,
    #[serde(rename = "endByte")]
    pub end_byte: usize,
}

/// A symbol owned by a file. `(file, name, container)` is the identity;
/// the whole set is replaced atomically on re-index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub file: String,
    pub name: String,
    /// Enclosing class/impl/module name, when nested.
    pub container: Option<String>,
    pub kind: SymbolKind,
    pub range: SourceRange,
    pub signature: String,
    pub doc: Option<String>,
    pub exported: bool,
}

impl SymbolRecord {
    /// Stable id used for graph edges: `file#name` or `file#container.name`.
    pub fn symbol_id(&self) -> String {
        match &self.container {
            Some(c) => format!("{}#{}.{}", self.file, c, self.name),
            None => format!("{}#{}", self.file, self.name),
        }
    }
}

/// A symbol observed in a prior index state whose definition disappeared.
/// Pruned once older than the configured max age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostSymbol {
    pub name: String,
    #[serde(rename = "lastSeenPath")]
    pub last_seen_path: String,
    pub kind: SymbolKind,
    pub signature: String,
    #[serde(rename = "deletedAt")]
    pub deleted_at: u64,
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepKind {
    Import,
    Include,
    Reexport,
}

/// Dependency edge from a source file to either a resolved workspace file or
/// an unresolved specifier (external package, broken path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: String,
    /// Resolved workspace-relative path, when resolution succeeded.
    pub target: Option<String>,
    /// The literal specifier as written in the source.
    pub specifier: String,
    pub kind: DepKind,
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// Call / type relations (materialized per file by full-AST analysis)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeRelation {
    Extends,
    Implements,
}

// ---------------------------------------------------------------------------
// Workspace fingerprint
// ---------------------------------------------------------------------------

/// Fingerprint of the indexed workspace. Evidence packs record it at creation
/// time; a mismatch on follow-up forces regeneration.
pub fn workspace_fingerprint(root: &Path, indexed_files: usize, generation: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.to_string_lossy().as_bytes());
    hasher.update(indexed_files.to_le_bytes());
    hasher.update(generation.to_le_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

/// Lowercase hex of the first `n` bytes of a digest.
pub fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

/// SHA-256 hex digest of arbitrary content, used for chunk and skeleton hashes.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_prefix(&hasher.finalize(), 32)
}

// ---------------------------------------------------------------------------
// Sensitive-file policy
// ---------------------------------------------------------------------------

/// Files denied full reads unless the caller passes `allowSensitive=true`.
pub fn is_sensitive_path(rel_path: &str) -> bool {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let lower = name.to_lowercase();
    if lower == ".env" || lower.starts_with(".env.") {
        return true;
    }
    if lower == "id_rsa" || lower == "id_ed25519" || lower.ends_with(".pem") || lower.ends_with(".key")
    {
        return true;
    }
    let path_lower = rel_path.to_lowercase();
    path_lower.contains("secret")
        || path_lower.contains("credential")
        || path_lower.contains("private_key")
}

// ---------------------------------------------------------------------------
// Language identification
// ---------------------------------------------------------------------------

/// Coarse language id derived from the file extension. Drives parser backend
/// selection and the topology scanner's import patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageId {
    Rust,
    TypeScript,
    JavaScript,
    Python,
    Go,
    C,
    Cpp,
    Java,
    Markdown,
    Mdx,
    Html,
    Text,
    #[default]
    Other,
}

impl LanguageId {
    pub fn from_ext(ext: &str) -> LanguageId {
        match ext {
            "rs" => LanguageId::Rust,
            "ts" | "tsx" => LanguageId::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => LanguageId::JavaScript,
            "py" | "pyi" => LanguageId::Python,
            "go" => LanguageId::Go,
            "c" | "h" => LanguageId::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => LanguageId::Cpp,
            "java" => LanguageId::Java,
            "md" | "markdown" => LanguageId::Markdown,
            "mdx" => LanguageId::Mdx,
            "html" | "htm" => LanguageId::Html,
            "txt" | "rst" | "adoc" => LanguageId::Text,
            _ => LanguageId::Other,
        }
    }

    pub fn from_path(path: &str) -> LanguageId {
        let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        LanguageId::from_ext(ext)
    }

    /// Is this a source language the code analyzer handles (vs a document)?
    pub fn is_code(&self) -> bool {
        !matches!(
            self,
            LanguageId::Markdown | LanguageId::Mdx | LanguageId::Html | LanguageId::Text | LanguageId::Other
        )
    }

    /// Languages whose identifiers are ASCII-only; non-ASCII identifier
    /// characters there are a structural-doubt signal for the line scanner.
    pub fn ascii_identifiers(&self) -> bool {
        matches!(self, LanguageId::Rust | LanguageId::Go | LanguageId::C | LanguageId::Cpp)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(normalize_rel_path("./src\\main.rs"), "src/main.rs");
        assert_eq!(normalize_rel_path("/src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_rel_path("a/b.ts"), "a/b.ts");
    }

    #[test]
    fn test_validate_path_rejects_traversal_not_dotted_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/ok.rs"), "pub fn ok() {}").unwrap();
        std::fs::write(dir.path().join("src/a..b.rs"), "pub fn odd() {}").unwrap();

        assert!(validate_path(dir.path(), "src/ok.rs").is_ok());
        // dots inside a segment are a file name, not traversal
        assert!(validate_path(dir.path(), "src/a..b.rs").is_ok());

        assert_eq!(validate_path(dir.path(), ""), Err("empty path"));
        assert_eq!(
            validate_path(dir.path(), "../outside.rs"),
            Err("path traversal detected")
        );
        assert_eq!(
            validate_path(dir.path(), "src/../../etc/passwd"),
            Err("path traversal detected")
        );
        assert_eq!(validate_path(dir.path(), "/etc/passwd"), Err("absolute path"));
    }

    #[test]
    fn test_lod_ordering() {
        assert!(Lod::Unknown < Lod::Topology);
        assert!(Lod::Skeleton < Lod::FullAst);
        assert_eq!(Lod::Topology.next(), Some(Lod::Skeleton));
        assert_eq!(Lod::FullAst.next(), None);
        assert_eq!(Lod::from_u8(Lod::Skeleton.as_u8()), Lod::Skeleton);
    }

    #[test]
    fn test_symbol_id_includes_container() {
        let sym = SymbolRecord {
            file: "src/app.ts".into(),
            name: "run".into(),
            container: Some("App".into()),
            kind: SymbolKind::Method,
            range: SourceRange::default(),
            signature: "run(): void".into(),
            doc: None,
            exported: true,
        };
        assert_eq!(sym.symbol_id(), "src/app.ts#App.run");
    }

    #[test]
    fn test_sensitive_paths() {
        assert!(is_sensitive_path(".env"));
        assert!(is_sensitive_path("config/.env.local"));
        assert!(is_sensitive_path("deploy/id_rsa"));
        assert!(is_sensitive_path("ops/aws_credentials.json"));
        assert!(!is_sensitive_path("src/main.rs"));
        assert!(!is_sensitive_path("docs/environment.md"));
    }

    #[test]
    fn test_fingerprint_changes_with_generation() {
        let root = Path::new("/tmp/ws");
        let a = workspace_fingerprint(root, 10, 1);
        let b = workspace_fingerprint(root, 10, 2);
        assert_ne!(a, b);
        assert_eq!(a, workspace_fingerprint(root, 10, 1));
    }
}
