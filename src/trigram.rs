//! Persistent trigram inverted index.
//!
//! Text is normalized (lowercased, non-alphanumerics to spaces, runs
//! collapsed) and sliced into overlapping 3-grams per whitespace token.
//! Per file we keep a trigram→count map and the total trigram count; the
//! global postings map trigram→{path→count}. The two views agree by
//! construction: a path appears in `postings[t]` iff its own freq map has a
//! nonzero count for `t`.
//!
//! The index snapshots to versioned JSON under the workspace cache dir.
//! Loads validate version and root; corrupted snapshots are deleted and the
//! index rebuilt. Mutations set a dirty flag picked up by a debounced
//! persistence pass; persisting mid-build is deferred until the build ends.

use crate::config::TrigramConfig;
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Snapshot format version; mismatches discard the snapshot.
const SNAPSHOT_VERSION: u32 = 2;

/// Debounce window between a mutation and the background persist.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_secs(5);

/// The doc-freq filter only kicks in past this corpus size; tiny workspaces
/// would otherwise lose every meaningful trigram.
const DOC_FREQ_MIN_FILES: usize = 50;

// ---------------------------------------------------------------------------
// Normalization and trigram extraction
// ---------------------------------------------------------------------------

/// Lowercase, non-alphanumeric → space, collapse runs.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Overlapping 3-grams of each whitespace token of the normalized text.
pub fn trigram_counts(text: &str) -> HashMap<String, u32> {
    let normalized = normalize(text);
    let mut counts: HashMap<String, u32> = HashMap::new();
    for token in normalized.split(' ') {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() < 3 {
            continue;
        }
        for window in chars.windows(3) {
            let gram: String = window.iter().collect();
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

// ---------------------------------------------------------------------------
// Index structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    mtime: u64,
    #[serde(rename = "trigramCount")]
    trigram_count: u32,
    #[serde(rename = "trigramFreq")]
    trigram_freq: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrigramHit {
    pub path: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrigramStats {
    pub files: usize,
    #[serde(rename = "distinctTrigrams")]
    pub distinct_trigrams: usize,
    pub generation: u64,
}

/// On-disk snapshot. Postings are rebuilt from the per-file maps on load,
/// which keeps the two views agreeing by construction.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    root: String,
    files: HashMap<String, FileEntry>,
}

pub struct TrigramIndex {
    root: PathBuf,
    options: TrigramConfig,
    files: HashMap<String, FileEntry>,
    postings: HashMap<String, HashMap<String, u32>>,
    generation: u64,
    dirty: AtomicBool,
    building: AtomicBool,
}

impl TrigramIndex {
    pub fn new(root: PathBuf, options: TrigramConfig) -> TrigramIndex {
        TrigramIndex {
            root,
            options,
            files: HashMap::new(),
            postings: HashMap::new(),
            generation: 0,
            dirty: AtomicBool::new(false),
            building: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn known_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn stats(&self) -> TrigramStats {
        TrigramStats {
            files: self.files.len(),
            distinct_trigrams: self.postings.len(),
            generation: self.generation,
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// (Re-)index one file's content. Applies the per-file distinct-trigram
    /// cap, keeping the highest-frequency grams.
    pub fn index_file(&mut self, path: &str, content: &str, mtime: u64) {
        let mut freq = trigram_counts(content);

        if freq.len() > self.options.max_trigrams_per_file {
            let mut by_count: Vec<(String, u32)> = freq.into_iter().collect();
            by_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            by_count.truncate(self.options.max_trigrams_per_file);
            freq = by_count.into_iter().collect();
        }

        self.remove_postings(path);
        let trigram_count: u32 = freq.values().sum();
        for (gram, count) in &freq {
            self.postings
                .entry(gram.clone())
                .or_default()
                .insert(path.to_string(), *count);
        }
        self.files
            .insert(path.to_string(), FileEntry { mtime, trigram_count, trigram_freq: freq });
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn remove_file(&mut self, path: &str) {
        if self.files.remove(path).is_some() {
            self.remove_postings(path);
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    fn remove_postings(&mut self, path: &str) {
        if let Some(entry) = self.files.get(path) {
            for gram in entry.trigram_freq.keys() {
                if let Some(paths) = self.postings.get_mut(gram) {
                    paths.remove(path);
                    if paths.is_empty() {
                        self.postings.remove(gram);
                    }
                }
            }
        }
    }

    /// Drop trigrams present in more than the configured fraction of files.
    /// Applied once per build, after the walk; skipped for tiny corpora.
    fn apply_doc_freq_filter(&mut self) {
        let total = self.files.len();
        if total < DOC_FREQ_MIN_FILES {
            return;
        }
        let cutoff = (total as f64 * self.options.max_doc_freq_ratio) as usize;
        let stop_grams: Vec<String> = self
            .postings
            .iter()
            .filter(|(_, paths)| paths.len() > cutoff)
            .map(|(g, _)| g.clone())
            .collect();
        for gram in &stop_grams {
            if let Some(paths) = self.postings.remove(gram) {
                for path in paths.keys() {
                    if let Some(entry) = self.files.get_mut(path) {
                        if let Some(count) = entry.trigram_freq.remove(gram) {
                            entry.trigram_count = entry.trigram_count.saturating_sub(count);
                        }
                    }
                }
            }
        }
        if !stop_grams.is_empty() {
            debug!(dropped = stop_grams.len(), "doc-freq filter applied");
        }
    }

    // -----------------------------------------------------------------------
    // Building
    // -----------------------------------------------------------------------

    /// Full (incremental) build: walk the tree honoring `.gitignore` and
    /// `.mcpignore`, skip files whose mtime matches the snapshot, prune
    /// entries not visited, then apply the doc-freq filter.
    pub fn build<F: FnMut(usize, usize)>(&mut self, mut progress: F) {
        self.building.store(true, Ordering::SeqCst);
        let candidates = self.collect_candidates();
        let total = candidates.len();

        // Read + trigram in parallel, skipping unchanged files.
        let work: Vec<(String, u64)> = candidates
            .into_iter()
            .filter(|(path, mtime)| {
                self.files.get(path).map(|e| e.mtime != *mtime).unwrap_or(true)
            })
            .collect();

        let read: Vec<(String, u64, String)> = work
            .par_iter()
            .filter_map(|(path, mtime)| {
                let content = std::fs::read_to_string(self.root.join(path)).ok()?;
                Some((path.clone(), *mtime, content))
            })
            .collect();

        let mut done = 0usize;
        for (path, mtime, content) in read {
            self.index_file(&path, &content, mtime);
            done += 1;
            progress(done, total);
        }

        // Prune entries whose file disappeared or no longer qualifies.
        let visited: HashSet<String> = self.collect_candidates().into_iter().map(|(p, _)| p).collect();
        let stale: Vec<String> = self
            .files
            .keys()
            .filter(|p| !visited.contains(*p))
            .cloned()
            .collect();
        for path in stale {
            self.remove_file(&path);
        }

        self.apply_doc_freq_filter();
        self.generation += 1;
        self.dirty.store(true, Ordering::Relaxed);
        self.building.store(false, Ordering::SeqCst);
        debug!(files = self.files.len(), generation = self.generation, "trigram index built");
    }

    fn collect_candidates(&self) -> Vec<(String, u64)> {
        let ext_whitelist: Option<HashSet<&str>> = if self.options.include_extensions.is_empty() {
            None
        } else {
            Some(self.options.include_extensions.iter().map(|s| s.as_str()).collect())
        };

        let mut out = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .git_global(false)
            .git_exclude(false)
            .add_custom_ignore_filename(".mcpignore")
            .build();
        for entry in walker.flatten() {
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let abs = entry.path();
            let ext = abs.extension().and_then(|e| e.to_str()).unwrap_or("");
            if let Some(whitelist) = &ext_whitelist {
                if !whitelist.contains(ext) {
                    continue;
                }
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() > self.options.max_file_bytes {
                continue;
            }
            let Some(rel) = crate::types::rel_path_of(&self.root, abs) else { continue };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            out.push((rel, mtime));
        }
        out.sort();
        out
    }

    // -----------------------------------------------------------------------
    // Query
    // -----------------------------------------------------------------------

    /// Search the index. Queries shorter than three characters fall back to
    /// substring matching over known paths. Otherwise, each file scores the
    /// matched trigram occurrences (capped at the query's own counts) over
    /// its total trigram count — overlap normalized by document length.
    pub fn search(&self, query: &str, limit: usize) -> Vec<TrigramHit> {
        let trimmed = query.trim();
        if trimmed.chars().count() < 3 {
            let needle = trimmed.to_lowercase();
            let mut hits: Vec<TrigramHit> = self
                .files
                .keys()
                .filter(|p| p.to_lowercase().contains(&needle))
                .map(|p| TrigramHit { path: p.clone(), score: 1.0 })
                .collect();
            hits.sort_by(|a, b| a.path.cmp(&b.path));
            hits.truncate(limit);
            return hits;
        }

        let qgrams = trigram_counts(trimmed);
        if qgrams.is_empty() {
            return Vec::new();
        }

        let mut matched: HashMap<&str, u32> = HashMap::new();
        for (gram, qcount) in &qgrams {
            if let Some(paths) = self.postings.get(gram) {
                for (path, fcount) in paths {
                    *matched.entry(path.as_str()).or_insert(0) += (*fcount).min(*qcount);
                }
            }
        }

        let mut hits: Vec<TrigramHit> = matched
            .into_iter()
            .filter_map(|(path, overlap)| {
                let entry = self.files.get(path)?;
                if entry.trigram_count == 0 {
                    return None;
                }
                Some(TrigramHit {
                    path: path.to_string(),
                    score: overlap as f64 / entry.trigram_count as f64,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        hits.truncate(limit);
        hits
    }

    /// Per-file frequency of a trigram; used by invariant tests.
    pub fn file_trigram_freq(&self, path: &str, gram: &str) -> u32 {
        self.files
            .get(path)
            .and_then(|e| e.trigram_freq.get(gram).copied())
            .unwrap_or(0)
    }

    pub fn posting_paths(&self, gram: &str) -> Vec<String> {
        self.postings
            .get(gram)
            .map(|m| {
                let mut v: Vec<String> = m.keys().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn snapshot_path(cache_dir: &Path) -> PathBuf {
        cache_dir.join("trigram-index.json")
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Persist if dirty and not mid-build. A build in flight defers the
    /// write to the next debounce tick.
    pub fn persist_if_dirty(&self, cache_dir: &Path) -> bool {
        if self.building.load(Ordering::SeqCst) || !self.dirty.load(Ordering::Relaxed) {
            return false;
        }
        match self.save(cache_dir) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(error = %e, "trigram snapshot persist failed");
                false
            }
        }
    }

    /// Atomic snapshot write: `*.tmp-<pid>-<ts>` then rename.
    pub fn save(&self, cache_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(cache_dir)?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            root: self.root.to_string_lossy().to_string(),
            files: self.files.clone(),
        };
        let target = Self::snapshot_path(cache_dir);
        let tmp = cache_dir.join(format!(
            "trigram-index.json.tmp-{}-{}",
            std::process::id(),
            crate::storage::now_secs()
        ));
        std::fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Load a snapshot for `root`. Version or root mismatches discard it;
    /// corrupted files are deleted from disk.
    pub fn load(cache_dir: &Path, root: &Path, options: TrigramConfig) -> Option<TrigramIndex> {
        let path = Self::snapshot_path(cache_dir);
        let bytes = std::fs::read(&path).ok()?;
        let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "corrupted trigram snapshot, deleting");
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };
        if snapshot.version != SNAPSHOT_VERSION
            || snapshot.root != root.to_string_lossy()
        {
            debug!("trigram snapshot version/root mismatch, ignoring");
            return None;
        }

        let mut index = TrigramIndex::new(root.to_path_buf(), options);
        for (path, entry) in &snapshot.files {
            for (gram, count) in &entry.trigram_freq {
                index
                    .postings
                    .entry(gram.clone())
                    .or_default()
                    .insert(path.clone(), *count);
            }
        }
        index.files = snapshot.files;
        Some(index)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(files: &[(&str, &str)]) -> TrigramIndex {
        let mut index = TrigramIndex::new(PathBuf::from("/ws"), TrigramConfig::default());
        for (path, content) in files {
            index.index_file(path, content, 1);
        }
        index
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Hello, World!"), "hello world");
        assert_eq!(normalize("foo_bar-baz"), "foo bar baz");
        assert_eq!(normalize("  a  b  "), "a b");
    }

    #[test]
    fn test_trigram_counts_per_token() {
        let counts = trigram_counts("foobar foo");
        assert_eq!(counts.get("foo").copied(), Some(2));
        assert_eq!(counts.get("oob").copied(), Some(1));
        // no trigram spans the token boundary
        assert!(counts.get("arf").is_none());
        // short tokens contribute nothing
        assert!(trigram_counts("ab cd").is_empty());
    }

    #[test]
    fn test_postings_agree_with_file_freqs() {
        let mut index = index_with(&[
            ("a.ts", "export const foo = 1"),
            ("b.ts", "function foobar() { return foo; }"),
        ]);
        for gram in ["foo", "oob", "exp", "ret"] {
            let posted = index.posting_paths(gram);
            for path in ["a.ts", "b.ts"] {
                let freq = index.file_trigram_freq(path, gram);
                assert_eq!(
                    posted.contains(&path.to_string()),
                    freq > 0,
                    "postings/freq disagree for {gram} in {path}"
                );
            }
        }
        // removal keeps the invariant
        index.remove_file("b.ts");
        assert_eq!(index.posting_paths("oob"), Vec::<String>::new());
    }

    #[test]
    fn test_search_ranks_definition_first() {
        let index = index_with(&[
            ("a.ts", "export const foo = 1"),
            ("b.ts", "function foobar() { return foo; }"),
        ]);
        let hits = index.search("foo", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "a.ts");
        assert_eq!(hits[1].path, "b.ts");
    }

    #[test]
    fn test_short_query_substring_fallback() {
        let index = index_with(&[("src/db.rs", "fn open() {}"), ("src/api.rs", "fn serve() {}")]);
        let hits = index.search("db", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/db.rs");
    }

    #[test]
    fn test_reindex_replaces_postings() {
        let mut index = index_with(&[("a.ts", "alpha beta gamma")]);
        assert!(!index.posting_paths("alp").is_empty());
        index.index_file("a.ts", "delta epsilon", 2);
        assert!(index.posting_paths("alp").is_empty());
        assert!(!index.posting_paths("del").is_empty());
    }

    #[test]
    fn test_per_file_trigram_cap() {
        let mut options = TrigramConfig::default();
        options.max_trigrams_per_file = 2;
        let mut index = TrigramIndex::new(PathBuf::from("/ws"), options);
        index.index_file("a.txt", "aaaa bbbb cccc dddd", 1);
        let entry = index.files.get("a.txt").unwrap();
        assert_eq!(entry.trigram_freq.len(), 2, "cap keeps highest-frequency grams");
    }

    #[test]
    fn test_doc_freq_filter_respects_min_corpus() {
        let mut index = index_with(&[("a.ts", "shared foo"), ("b.ts", "shared bar")]);
        index.apply_doc_freq_filter();
        // 2 files < DOC_FREQ_MIN_FILES: nothing dropped
        assert!(!index.posting_paths("sha").is_empty());
    }

    #[test]
    fn test_doc_freq_filter_drops_ubiquitous_grams() {
        let mut options = TrigramConfig::default();
        options.max_doc_freq_ratio = 0.5;
        let mut index = TrigramIndex::new(PathBuf::from("/ws"), options);
        for i in 0..60 {
            // "common" everywhere, "unique<i>" in one file each
            index.index_file(&format!("f{i}.txt"), &format!("common unique{i:03}"), 1);
        }
        index.apply_doc_freq_filter();
        assert!(index.posting_paths("com").is_empty(), "ubiquitous gram dropped");
        assert!(!index.posting_paths("uni").is_empty() || !index.posting_paths("niq").is_empty());
        // freq maps were updated alongside postings
        assert_eq!(index.file_trigram_freq("f0.txt", "com"), 0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir_all(&root).unwrap();
        let cache = dir.path().join("cache");

        let mut index = TrigramIndex::new(root.clone(), TrigramConfig::default());
        index.index_file("a.ts", "export const foo = 1", 1);
        index.index_file("b.ts", "function foobar() { return foo; }", 1);
        index.save(&cache).unwrap();

        let reloaded = TrigramIndex::load(&cache, &root, TrigramConfig::default())
            .expect("snapshot should load");
        let hits = reloaded.search("foo", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "a.ts");
    }

    #[test]
    fn test_snapshot_root_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let index = TrigramIndex::new(PathBuf::from("/ws/one"), TrigramConfig::default());
        index.save(&cache).unwrap();
        assert!(TrigramIndex::load(&cache, Path::new("/ws/two"), TrigramConfig::default())
            .is_none());
    }

    #[test]
    fn test_corrupted_snapshot_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().to_path_buf();
        std::fs::write(TrigramIndex::snapshot_path(&cache), b"{ not json").unwrap();
        assert!(TrigramIndex::load(&cache, Path::new("/ws"), TrigramConfig::default()).is_none());
        assert!(!TrigramIndex::snapshot_path(&cache).exists(), "corrupt snapshot removed");
    }

    #[test]
    fn test_build_walks_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/keep.rs"), "pub fn keep() {}").unwrap();
        std::fs::write(root.join("src/gone.rs"), "pub fn gone() {}").unwrap();

        let mut index = TrigramIndex::new(root.to_path_buf(), TrigramConfig::default());
        index.build(|_, _| {});
        assert!(index.contains("src/keep.rs"));
        assert!(index.contains("src/gone.rs"));
        let gen1 = index.generation();

        std::fs::remove_file(root.join("src/gone.rs")).unwrap();
        index.build(|_, _| {});
        assert!(index.contains("src/keep.rs"));
        assert!(!index.contains("src/gone.rs"), "deleted file pruned");
        assert_eq!(index.generation(), gen1 + 1);
    }

    #[test]
    fn test_build_honors_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join(".gitignore"), "ignored/\n").unwrap();
        std::fs::create_dir_all(root.join("ignored")).unwrap();
        std::fs::write(root.join("ignored/skip.rs"), "pub fn skip() {}").unwrap();
        std::fs::write(root.join("keep.rs"), "pub fn keep() {}").unwrap();

        let mut index = TrigramIndex::new(root.to_path_buf(), TrigramConfig::default());
        index.build(|_, _| {});
        assert!(index.contains("keep.rs"));
        assert!(!index.contains("ignored/skip.rs"));
    }

    #[test]
    fn test_persist_deferred_during_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = TrigramIndex::new(dir.path().to_path_buf(), TrigramConfig::default());
        index.index_file("a.ts", "alpha beta", 1);
        index.building.store(true, Ordering::SeqCst);
        assert!(!index.persist_if_dirty(dir.path()), "mid-build persist deferred");
        index.building.store(false, Ordering::SeqCst);
        assert!(index.persist_if_dirty(dir.path()));
        assert!(!index.is_dirty());
    }
}
