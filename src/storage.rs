//! Durable key-addressed tables over SQLite.
//!
//! One store per workspace root, holding files, symbols, ghost symbols,
//! dependency edges, document chunks, embedding metadata, chunk summaries,
//! and evidence packs. Vector blobs live in the pack files (`vecpack`), not
//! here — the `embeddings` table only carries the metadata needed to enforce
//! cascade deletes and the chunk↔embedding invariants.
//!
//! Opening the on-disk database can fail (corruption, permissions). The store
//! then demotes itself to an in-memory connection and keeps serving; callers
//! observe `is_ephemeral()` and the warning log.

use crate::error::{EngineError, Result};
use crate::types::{
    DepKind, DependencyEdge, GhostSymbol, Lod, SourceRange, SymbolKind, SymbolRecord,
    STORAGE_VERSION,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Persisted per-file state.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRow {
    pub path: String,
    pub mtime: u64,
    pub language: String,
    pub lod: Lod,
    pub skeleton: Option<String>,
}

/// Persisted document chunk (see `chunker`).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: String,
    pub file: String,
    pub kind: String,
    pub section_path: String,
    pub heading: Option<String>,
    pub heading_level: u32,
    pub range: SourceRange,
    pub text: String,
    pub content_hash: String,
}

/// Embedding metadata row. The vector itself lives in the pack.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    pub chunk_id: String,
    pub provider: String,
    pub model: String,
    pub dims: usize,
    pub norm: f32,
    pub format: String,
}

pub fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
    ephemeral: bool,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    mtime INTEGER NOT NULL,
    language TEXT NOT NULL,
    lod INTEGER NOT NULL,
    skeleton TEXT
);
CREATE TABLE IF NOT EXISTS symbols (
    file TEXT NOT NULL,
    name TEXT NOT NULL,
    container TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    start_byte INTEGER NOT NULL,
    end_byte INTEGER NOT NULL,
    signature TEXT NOT NULL,
    doc TEXT,
    exported INTEGER NOT NULL,
    PRIMARY KEY (file, name, container)
);
CREATE TABLE IF NOT EXISTS ghost_symbols (
    name TEXT PRIMARY KEY,
    last_seen_path TEXT NOT NULL,
    kind TEXT NOT NULL,
    signature TEXT NOT NULL,
    deleted_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS dependencies (
    source TEXT NOT NULL,
    target TEXT,
    specifier TEXT NOT NULL,
    kind TEXT NOT NULL,
    weight REAL NOT NULL,
    PRIMARY KEY (source, specifier, kind)
);
CREATE TABLE IF NOT EXISTS doc_chunks (
    id TEXT PRIMARY KEY,
    file TEXT NOT NULL,
    kind TEXT NOT NULL,
    section_path TEXT NOT NULL,
    heading TEXT,
    heading_level INTEGER NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    start_byte INTEGER NOT NULL,
    end_byte INTEGER NOT NULL,
    text TEXT NOT NULL,
    content_hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_doc_chunks_file ON doc_chunks(file);
CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT NOT NULL REFERENCES doc_chunks(id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    dims INTEGER NOT NULL,
    norm REAL NOT NULL,
    format TEXT NOT NULL,
    PRIMARY KEY (chunk_id, provider, model)
);
CREATE TABLE IF NOT EXISTS chunk_summaries (
    chunk_id TEXT NOT NULL REFERENCES doc_chunks(id) ON DELETE CASCADE,
    style TEXT NOT NULL,
    summary TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    PRIMARY KEY (chunk_id, style)
);
CREATE TABLE IF NOT EXISTS evidence_packs (
    pack_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
";

impl Store {
    /// Open the store at `dir/index.db`, demoting to in-memory on failure.
    pub fn open(dir: &Path) -> Store {
        match Self::open_disk(dir) {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "store unavailable on disk, demoting to in-memory");
                Store::open_memory()
            }
        }
    }

    fn open_disk(dir: &Path) -> Result<Store> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("index.db"))?;
        Self::init(&conn)?;
        Ok(Store { conn: Mutex::new(conn), ephemeral: false })
    }

    /// Purely in-memory store, used for tests and as the fatal-error fallback.
    pub fn open_memory() -> Store {
        let conn = Connection::open_in_memory().expect("in-memory sqlite must open");
        Self::init(&conn).expect("schema init must succeed in memory");
        Store { conn: Mutex::new(conn), ephemeral: true }
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |r| r.get(0))
            .optional()?;
        match version {
            Some(v) if v != STORAGE_VERSION.to_string() => {
                // Incompatible schema: wipe and restart at the current version.
                debug!(found = %v, expected = STORAGE_VERSION, "storage version mismatch, resetting");
                conn.execute_batch(
                    "DELETE FROM files; DELETE FROM symbols; DELETE FROM ghost_symbols;
                     DELETE FROM dependencies; DELETE FROM doc_chunks;
                     DELETE FROM evidence_packs; DELETE FROM meta;",
                )?;
            }
            _ => {}
        }
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?1)",
            params![STORAGE_VERSION.to_string()],
        )?;
        Ok(())
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    pub fn upsert_file(&self, row: &FileRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files (path, mtime, language, lod, skeleton)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                 mtime = excluded.mtime,
                 language = excluded.language,
                 lod = excluded.lod,
                 skeleton = excluded.skeleton",
            params![row.path, row.mtime as i64, row.language, row.lod.as_u8(), row.skeleton],
        )?;
        Ok(())
    }

    pub fn get_file(&self, path: &str) -> Result<Option<FileRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT path, mtime, language, lod, skeleton FROM files WHERE path = ?1",
                params![path],
                |r| {
                    Ok(FileRow {
                        path: r.get(0)?,
                        mtime: r.get::<_, i64>(1)? as u64,
                        language: r.get(2)?,
                        lod: Lod::from_u8(r.get::<_, u8>(3)?),
                        skeleton: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn file_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Delete a file and everything owned by it. Chunk deletion cascades to
    /// embeddings and summaries through foreign keys.
    pub fn delete_file(&self, path: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM symbols WHERE file = ?1", params![path])?;
        tx.execute("DELETE FROM dependencies WHERE source = ?1", params![path])?;
        tx.execute("DELETE FROM doc_chunks WHERE file = ?1", params![path])?;
        tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every file whose path starts with `prefix` (directory prune).
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let paths: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT path FROM files WHERE path LIKE ?1")?;
            let rows = stmt.query_map(params![format!("{prefix}%")], |r| r.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for p in &paths {
            self.delete_file(p)?;
        }
        Ok(paths.len())
    }

    // -----------------------------------------------------------------------
    // Symbols + ghosts
    // -----------------------------------------------------------------------

    /// Replace a file's symbol set atomically. Symbols that disappear become
    /// ghost symbols; names that reappear anywhere clear their ghost.
    pub fn replace_symbols(&self, file: &str, symbols: &[SymbolRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let previous: Vec<(String, String, String)> = {
            let mut stmt =
                tx.prepare("SELECT name, kind, signature FROM symbols WHERE file = ?1")?;
            let rows = stmt.query_map(params![file], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        tx.execute("DELETE FROM symbols WHERE file = ?1", params![file])?;
        for sym in symbols {
            tx.execute(
                "INSERT OR REPLACE INTO symbols
                 (file, name, container, kind, start_line, end_line, start_byte, end_byte,
                  signature, doc, exported)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    sym.file,
                    sym.name,
                    sym.container.clone().unwrap_or_default(),
                    sym.kind.label(),
                    sym.range.start_line,
                    sym.range.end_line,
                    sym.range.start_byte,
                    sym.range.end_byte,
                    sym.signature,
                    sym.doc,
                    sym.exported as i64,
                ],
            )?;
        }

        // Ghosts: previously-present names that vanished from this file and
        // are not defined anywhere else right now.
        let now = now_secs();
        for (name, kind, signature) in previous {
            if symbols.iter().any(|s| s.name == name) {
                continue;
            }
            let live_elsewhere: i64 = tx.query_row(
                "SELECT COUNT(*) FROM symbols WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )?;
            if live_elsewhere == 0 {
                tx.execute(
                    "INSERT OR REPLACE INTO ghost_symbols
                     (name, last_seen_path, kind, signature, deleted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![name, file, kind, signature, now as i64],
                )?;
            }
        }
        // Live symbols and ghosts stay disjoint by name.
        for sym in symbols {
            tx.execute("DELETE FROM ghost_symbols WHERE name = ?1", params![sym.name])?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn symbols_for_file(&self, file: &str) -> Result<Vec<SymbolRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT file, name, container, kind, start_line, end_line, start_byte, end_byte,
                    signature, doc, exported
             FROM symbols WHERE file = ?1 ORDER BY start_line",
        )?;
        let rows = stmt.query_map(params![file], row_to_symbol)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn symbols_named(&self, name: &str) -> Result<Vec<SymbolRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT file, name, container, kind, start_line, end_line, start_byte, end_byte,
                    signature, doc, exported
             FROM symbols WHERE name = ?1",
        )?;
        let rows = stmt.query_map(params![name], row_to_symbol)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn ghost(&self, name: &str) -> Result<Option<GhostSymbol>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT name, last_seen_path, kind, signature, deleted_at
                 FROM ghost_symbols WHERE name = ?1",
                params![name],
                |r| {
                    Ok(GhostSymbol {
                        name: r.get(0)?,
                        last_seen_path: r.get(1)?,
                        kind: SymbolKind::parse(&r.get::<_, String>(2)?)
                            .unwrap_or(SymbolKind::Function),
                        signature: r.get(3)?,
                        deleted_at: r.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Drop ghosts older than `max_age_secs`. Returns the number pruned.
    pub fn prune_ghosts(&self, max_age_secs: u64) -> Result<usize> {
        let cutoff = now_secs().saturating_sub(max_age_secs);
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute("DELETE FROM ghost_symbols WHERE deleted_at < ?1", params![cutoff as i64])?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Replace all outgoing dependency edges of a source file.
    pub fn replace_deps(&self, source: &str, edges: &[DependencyEdge]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM dependencies WHERE source = ?1", params![source])?;
        for edge in edges {
            tx.execute(
                "INSERT OR REPLACE INTO dependencies (source, target, specifier, kind, weight)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    edge.source,
                    edge.target,
                    edge.specifier,
                    dep_kind_label(edge.kind),
                    edge.weight
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn deps_of(&self, source: &str) -> Result<Vec<DependencyEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source, target, specifier, kind, weight FROM dependencies WHERE source = ?1",
        )?;
        let rows = stmt.query_map(params![source], row_to_dep)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn dependents_of(&self, target: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT source FROM dependencies WHERE target = ?1")?;
        let rows = stmt.query_map(params![target], |r| r.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Document chunks, embeddings, summaries
    // -----------------------------------------------------------------------

    /// Replace a file's chunks. Embeddings and summaries of dropped chunks
    /// cascade-delete.
    pub fn replace_chunks(&self, file: &str, chunks: &[ChunkRow]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM doc_chunks WHERE file = ?1", params![file])?;
        for c in chunks {
            tx.execute(
                "INSERT OR REPLACE INTO doc_chunks
                 (id, file, kind, section_path, heading, heading_level,
                  start_line, end_line, start_byte, end_byte, text, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    c.id,
                    c.file,
                    c.kind,
                    c.section_path,
                    c.heading,
                    c.heading_level,
                    c.range.start_line,
                    c.range.end_line,
                    c.range.start_byte,
                    c.range.end_byte,
                    c.text,
                    c.content_hash,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn chunk(&self, id: &str) -> Result<Option<ChunkRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, file, kind, section_path, heading, heading_level,
                        start_line, end_line, start_byte, end_byte, text, content_hash
                 FROM doc_chunks WHERE id = ?1",
                params![id],
                row_to_chunk,
            )
            .optional()?;
        Ok(row)
    }

    pub fn chunks_for_file(&self, file: &str) -> Result<Vec<ChunkRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, file, kind, section_path, heading, heading_level,
                    start_line, end_line, start_byte, end_byte, text, content_hash
             FROM doc_chunks WHERE file = ?1 ORDER BY start_line",
        )?;
        let rows = stmt.query_map(params![file], row_to_chunk)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn all_chunks(&self) -> Result<Vec<ChunkRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, file, kind, section_path, heading, heading_level,
                    start_line, end_line, start_byte, end_byte, text, content_hash
             FROM doc_chunks ORDER BY file, start_line",
        )?;
        let rows = stmt.query_map([], row_to_chunk)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn upsert_embedding(&self, row: &EmbeddingRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR REPLACE INTO embeddings (chunk_id, provider, model, dims, norm, format)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE EXISTS (SELECT 1 FROM doc_chunks WHERE id = ?1)",
            params![row.chunk_id, row.provider, row.model, row.dims, row.norm, row.format],
        )?;
        if inserted == 0 {
            return Err(EngineError::NotFound(format!("chunk {} for embedding", row.chunk_id)));
        }
        Ok(())
    }

    pub fn embedding(&self, chunk_id: &str, provider: &str, model: &str) -> Result<Option<EmbeddingRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT chunk_id, provider, model, dims, norm, format
                 FROM embeddings WHERE chunk_id = ?1 AND provider = ?2 AND model = ?3",
                params![chunk_id, provider, model],
                |r| {
                    Ok(EmbeddingRow {
                        chunk_id: r.get(0)?,
                        provider: r.get(1)?,
                        model: r.get(2)?,
                        dims: r.get::<_, i64>(3)? as usize,
                        norm: r.get(4)?,
                        format: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Store a summary unless one with the same content hash already exists.
    pub fn upsert_summary(
        &self,
        chunk_id: &str,
        style: &str,
        summary: &str,
        chunk_content_hash: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row(
                "SELECT content_hash FROM chunk_summaries WHERE chunk_id = ?1 AND style = ?2",
                params![chunk_id, style],
                |r| r.get(0),
            )
            .optional()?;
        if current.as_deref() == Some(chunk_content_hash) {
            return Ok(false);
        }
        conn.execute(
            "INSERT OR REPLACE INTO chunk_summaries (chunk_id, style, summary, content_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![chunk_id, style, summary, chunk_content_hash],
        )?;
        Ok(true)
    }

    pub fn summary(&self, chunk_id: &str, style: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT summary FROM chunk_summaries WHERE chunk_id = ?1 AND style = ?2",
                params![chunk_id, style],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Evidence packs
    // -----------------------------------------------------------------------

    pub fn put_pack(&self, pack_id: &str, payload: &str, created_at: u64, expires_at: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO evidence_packs (pack_id, payload, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![pack_id, payload, created_at as i64, expires_at as i64],
        )?;
        Ok(())
    }

    pub fn get_pack(&self, pack_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT payload FROM evidence_packs WHERE pack_id = ?1 AND expires_at >= ?2",
                params![pack_id, now_secs() as i64],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn purge_expired_packs(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM evidence_packs WHERE expires_at < ?1",
            params![now_secs() as i64],
        )?;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_symbol(r: &rusqlite::Row<'_>) -> rusqlite::Result<SymbolRecord> {
    let container: String = r.get(2)?;
    Ok(SymbolRecord {
        file: r.get(0)?,
        name: r.get(1)?,
        container: if container.is_empty() { None } else { Some(container) },
        kind: SymbolKind::parse(&r.get::<_, String>(3)?).unwrap_or(SymbolKind::Function),
        range: SourceRange {
            start_line: r.get::<_, i64>(4)? as usize,
            end_line: r.get::<_, i64>(5)? as usize,
            start_byte: r.get::<_, i64>(6)? as usize,
            end_byte: r.get::<_, i64>(7)? as usize,
        },
        signature: r.get(8)?,
        doc: r.get(9)?,
        exported: r.get::<_, i64>(10)? != 0,
    })
}

fn row_to_dep(r: &rusqlite::Row<'_>) -> rusqlite::Result<DependencyEdge> {
    Ok(DependencyEdge {
        source: r.get(0)?,
        target: r.get(1)?,
        specifier: r.get(2)?,
        kind: match r.get::<_, String>(3)?.as_str() {
            "include" => DepKind::Include,
            "reexport" => DepKind::Reexport,
            _ => DepKind::Import,
        },
        weight: r.get(4)?,
    })
}

fn row_to_chunk(r: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        id: r.get(0)?,
        file: r.get(1)?,
        kind: r.get(2)?,
        section_path: r.get(3)?,
        heading: r.get(4)?,
        heading_level: r.get::<_, i64>(5)? as u32,
        range: SourceRange {
            start_line: r.get::<_, i64>(6)? as usize,
            end_line: r.get::<_, i64>(7)? as usize,
            start_byte: r.get::<_, i64>(8)? as usize,
            end_byte: r.get::<_, i64>(9)? as usize,
        },
        text: r.get(10)?,
        content_hash: r.get(11)?,
    })
}

fn dep_kind_label(kind: DepKind) -> &'static str {
    match kind {
        DepKind::Import => "import",
        DepKind::Include => "include",
        DepKind::Reexport => "reexport",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(file: &str, name: &str) -> SymbolRecord {
        SymbolRecord {
            file: file.into(),
            name: name.into(),
            container: None,
            kind: SymbolKind::Function,
            range: SourceRange { start_line: 1, end_line: 3, start_byte: 0, end_byte: 40 },
            signature: format!("fn {name}()"),
            doc: None,
            exported: true,
        }
    }

    fn chunk(id: &str, file: &str, text: &str) -> ChunkRow {
        ChunkRow {
            id: id.into(),
            file: file.into(),
            kind: "markdown".into(),
            section_path: "Intro".into(),
            heading: Some("Intro".into()),
            heading_level: 1,
            range: SourceRange { start_line: 1, end_line: 4, start_byte: 0, end_byte: text.len() },
            text: text.into(),
            content_hash: crate::types::content_hash(text),
        }
    }

    #[test]
    fn test_file_upsert_and_delete() {
        let store = Store::open_memory();
        let row = FileRow {
            path: "src/a.ts".into(),
            mtime: 100,
            language: "typescript".into(),
            lod: Lod::Skeleton,
            skeleton: Some("export const a".into()),
        };
        store.upsert_file(&row).unwrap();
        assert_eq!(store.get_file("src/a.ts").unwrap().unwrap(), row);

        store.delete_file("src/a.ts").unwrap();
        assert!(store.get_file("src/a.ts").unwrap().is_none());
    }

    #[test]
    fn test_symbol_replacement_creates_ghosts() {
        let store = Store::open_memory();
        store
            .replace_symbols("src/a.ts", &[sym("src/a.ts", "foo"), sym("src/a.ts", "bar")])
            .unwrap();

        // bar disappears
        store.replace_symbols("src/a.ts", &[sym("src/a.ts", "foo")]).unwrap();
        let ghost = store.ghost("bar").unwrap().expect("bar should be a ghost");
        assert_eq!(ghost.last_seen_path, "src/a.ts");

        // live and ghost sets stay disjoint: bar comes back
        store
            .replace_symbols("src/a.ts", &[sym("src/a.ts", "foo"), sym("src/a.ts", "bar")])
            .unwrap();
        assert!(store.ghost("bar").unwrap().is_none());
    }

    #[test]
    fn test_ghost_not_created_when_live_elsewhere() {
        let store = Store::open_memory();
        store.replace_symbols("src/a.ts", &[sym("src/a.ts", "shared")]).unwrap();
        store.replace_symbols("src/b.ts", &[sym("src/b.ts", "shared")]).unwrap();

        store.replace_symbols("src/a.ts", &[]).unwrap();
        assert!(store.ghost("shared").unwrap().is_none(), "still defined in b.ts");
    }

    #[test]
    fn test_ghost_pruning() {
        let store = Store::open_memory();
        store.replace_symbols("src/a.ts", &[sym("src/a.ts", "gone")]).unwrap();
        store.replace_symbols("src/a.ts", &[]).unwrap();
        assert!(store.ghost("gone").unwrap().is_some());

        assert_eq!(store.prune_ghosts(3600).unwrap(), 0, "fresh ghost survives");
        assert_eq!(store.prune_ghosts(0).unwrap(), 1, "zero max-age prunes everything");
    }

    #[test]
    fn test_chunk_cascade_deletes_embeddings() {
        let store = Store::open_memory();
        store.replace_chunks("docs/a.md", &[chunk("c1", "docs/a.md", "hello world")]).unwrap();
        store
            .upsert_embedding(&EmbeddingRow {
                chunk_id: "c1".into(),
                provider: "local".into(),
                model: "hash-256".into(),
                dims: 256,
                norm: 1.0,
                format: "f32".into(),
            })
            .unwrap();
        assert!(store.embedding("c1", "local", "hash-256").unwrap().is_some());

        // Re-chunk without c1 — embedding must cascade away.
        store.replace_chunks("docs/a.md", &[chunk("c2", "docs/a.md", "different")]).unwrap();
        assert!(store.embedding("c1", "local", "hash-256").unwrap().is_none());
        assert!(store.chunk("c2").unwrap().is_some());
    }

    #[test]
    fn test_embedding_requires_existing_chunk() {
        let store = Store::open_memory();
        let err = store.upsert_embedding(&EmbeddingRow {
            chunk_id: "nope".into(),
            provider: "local".into(),
            model: "m".into(),
            dims: 4,
            norm: 1.0,
            format: "f32".into(),
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_summary_skips_unchanged_hash() {
        let store = Store::open_memory();
        store.replace_chunks("docs/a.md", &[chunk("c1", "docs/a.md", "text body")]).unwrap();
        let hash = crate::types::content_hash("text body");
        assert!(store.upsert_summary("c1", "preview", "text…", &hash).unwrap());
        assert!(!store.upsert_summary("c1", "preview", "text…", &hash).unwrap());
        assert!(store.upsert_summary("c1", "preview", "new", "other-hash").unwrap());
    }

    #[test]
    fn test_deps_replaced_whole_cloth() {
        let store = Store::open_memory();
        let edge = |spec: &str, target: Option<&str>| DependencyEdge {
            source: "src/b.ts".into(),
            target: target.map(|t| t.to_string()),
            specifier: spec.into(),
            kind: DepKind::Import,
            weight: 1.0,
        };
        store.replace_deps("src/b.ts", &[edge("./a", Some("src/a.ts")), edge("react", None)]).unwrap();
        assert_eq!(store.deps_of("src/b.ts").unwrap().len(), 2);
        assert_eq!(store.dependents_of("src/a.ts").unwrap(), vec!["src/b.ts".to_string()]);

        store.replace_deps("src/b.ts", &[edge("./a", Some("src/a.ts"))]).unwrap();
        assert_eq!(store.deps_of("src/b.ts").unwrap().len(), 1);
    }

    #[test]
    fn test_pack_expiry() {
        let store = Store::open_memory();
        let now = now_secs();
        store.put_pack("p1", "{}", now, now + 60).unwrap();
        store.put_pack("p2", "{}", now.saturating_sub(120), now.saturating_sub(60)).unwrap();
        assert!(store.get_pack("p1").unwrap().is_some());
        assert!(store.get_pack("p2").unwrap().is_none(), "expired pack is invisible");
        assert_eq!(store.purge_expired_packs().unwrap(), 1);
    }
}
