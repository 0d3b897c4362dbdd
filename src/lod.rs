//! Adaptive level-of-detail analyzer.
//!
//! Files are promoted lazily through four tiers: unknown (0), topology (1),
//! skeleton (2), full AST (3). `ensure_lod` walks the missing tiers in order,
//! records per-transition timings, and falls back to a forced full-AST parse
//! when the line scanner is structurally in doubt about a file. Demotion only
//! happens through `invalidate`.

use crate::config::{EngineConfig, FlagSnapshot};
use crate::error::Result;
use crate::parser::{scan_topology, ParsedFile, ParserBackend, Topology};
use crate::storage::{FileRow, Store};
use crate::types::{
    content_hash, DepKind, DependencyEdge, LanguageId, Lod, SymbolRecord, TypeRelation,
};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Results and stats
// ---------------------------------------------------------------------------

/// Outcome of an `ensure_lod` call.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LodOutcome {
    #[serde(rename = "previousLOD")]
    pub previous_lod: u8,
    #[serde(rename = "currentLOD")]
    pub current_lod: u8,
    #[serde(rename = "requestedLOD")]
    pub requested_lod: u8,
    pub promoted: bool,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
    #[serde(rename = "fallbackUsed")]
    pub fallback_used: bool,
    /// 1.0 when the result is authoritative; lower when a step degraded.
    pub confidence: f64,
}

/// Rolling per-transition statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PromotionStats {
    pub counts: [u64; 3],
    #[serde(rename = "avgMs")]
    pub avg_ms: [f64; 3],
    pub fallbacks: u64,
    #[serde(rename = "totalPromotions")]
    pub total_promotions: u64,
}

impl PromotionStats {
    fn record(&mut self, transition: usize, ms: f64) {
        let n = self.counts[transition] as f64;
        self.avg_ms[transition] = (self.avg_ms[transition] * n + ms) / (n + 1.0);
        self.counts[transition] += 1;
        self.total_promotions += 1;
    }

    pub fn fallback_rate(&self) -> f64 {
        if self.total_promotions == 0 {
            0.0
        } else {
            self.fallbacks as f64 / self.total_promotions as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Per-file analysis state
// ---------------------------------------------------------------------------

/// Everything the analyzer knows about a file at its current tier.
#[derive(Debug, Clone, Default)]
pub struct FileAnalysis {
    pub lod: Lod,
    pub mtime: u64,
    pub language: LanguageId,
    pub topology: Option<Topology>,
    pub symbols: Vec<SymbolRecord>,
    pub deps: Vec<DependencyEdge>,
    pub skeleton: Option<String>,
    /// (caller symbol name, callee symbol name) pairs from the last full parse.
    pub call_sites: Vec<(Option<String>, String)>,
    pub type_relations: Vec<(String, String, TypeRelation)>,
}

// ---------------------------------------------------------------------------
// Structural doubt
// ---------------------------------------------------------------------------

/// Is regex-level extraction unsafe for this content? True forces a full-AST
/// parse. The predicate is deliberately testable: bracket imbalance, NUL
/// bytes, non-ASCII identifier characters in ASCII-identifier languages, or
/// an explicit opt-out extension.
pub fn structural_doubt(
    content: &str,
    lang: LanguageId,
    ext: &str,
    opt_out: &HashSet<String>,
) -> bool {
    if opt_out.contains(ext) {
        return true;
    }
    if content.contains('\0') {
        return true;
    }
    if lang.ascii_identifiers() && content.chars().any(|c| c.is_alphabetic() && !c.is_ascii()) {
        return true;
    }

    // Bracket imbalance at EOF. Strings are not tracked; a hard imbalance
    // after a whole-file count is still a strong malformed-source signal.
    let (mut braces, mut parens, mut squares) = (0i64, 0i64, 0i64);
    for c in content.chars() {
        match c {
            '{' => braces += 1,
            '}' => braces -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            '[' => squares += 1,
            ']' => squares -= 1,
            _ => {}
        }
    }
    braces != 0 || parens.abs() > 2 || squares.abs() > 2
}

// ---------------------------------------------------------------------------
// Module resolution
// ---------------------------------------------------------------------------

/// Resolves import specifiers to workspace-relative paths. Holds a
/// stem→paths lookup rebuilt whenever the file set changes.
pub struct ModuleResolver {
    stem_to_paths: RwLock<HashMap<String, Vec<String>>>,
    known: RwLock<HashSet<String>>,
}

impl ModuleResolver {
    pub fn new() -> ModuleResolver {
        ModuleResolver { stem_to_paths: RwLock::new(HashMap::new()), known: RwLock::new(HashSet::new()) }
    }

    pub fn set_files<I: IntoIterator<Item = String>>(&self, files: I) {
        let mut stems: HashMap<String, Vec<String>> = HashMap::new();
        let mut known = HashSet::new();
        for path in files {
            let filename = path.rsplit('/').next().unwrap_or(&path);
            let stem = filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(filename);
            stems.entry(stem.to_string()).or_default().push(path.clone());
            known.insert(path);
        }
        for list in stems.values_mut() {
            list.sort();
        }
        *self.stem_to_paths.write().unwrap() = stems;
        *self.known.write().unwrap() = known;
    }

    /// Resolve a specifier relative to `source`. Relative specifiers try the
    /// usual extension/index suffixes; everything else matches on the final
    /// path-segment stem, preferring the candidate closest to the importer.
    pub fn resolve(&self, source: &str, specifier: &str) -> Option<String> {
        let known = self.known.read().unwrap();
        if specifier.starts_with("./") || specifier.starts_with("../") {
            let dir = source.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
            let joined = join_normalized(dir, specifier);
            if known.contains(&joined) {
                return Some(joined);
            }
            const SUFFIXES: &[&str] = &[
                ".ts", ".tsx", ".js", ".jsx", ".mjs", ".rs", ".py", ".go",
                "/index.ts", "/index.js", "/mod.rs", "/__init__.py",
            ];
            for suffix in SUFFIXES {
                let candidate = format!("{joined}{suffix}");
                if known.contains(&candidate) {
                    return Some(candidate);
                }
            }
            return None;
        }

        // crate::foo::bar / pkg.module / bare package — match last segment.
        let last = specifier.rsplit(['/', '.', ':']).find(|s| !s.is_empty())?;
        let stems = self.stem_to_paths.read().unwrap();
        let candidates = stems.get(last)?;
        if candidates.len() == 1 {
            return Some(candidates[0].clone());
        }
        let src_dir = source.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        candidates
            .iter()
            .max_by_key(|c| {
                let dir = c.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
                dir.chars().zip(src_dir.chars()).take_while(|(a, b)| a == b).count()
            })
            .cloned()
    }
}

impl Default for ModuleResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn join_normalized(dir: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = if dir.is_empty() { Vec::new() } else { dir.split('/').collect() };
    for seg in rel.split('/') {
        match seg {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct LodAnalyzer {
    root: PathBuf,
    backend: Arc<dyn ParserBackend>,
    store: Arc<Store>,
    pub resolver: Arc<ModuleResolver>,
    files: DashMap<String, FileAnalysis>,
    /// target path -> files importing it; maintained at skeleton promotion.
    reverse_imports: DashMap<String, HashSet<String>>,
    stats: Mutex<PromotionStats>,
    opt_out: HashSet<String>,
    flags: FlagSnapshot,
    /// Legacy skeleton hashes for dual-write validation.
    legacy_skeletons: DashMap<String, String>,
}

impl LodAnalyzer {
    pub fn new(
        root: PathBuf,
        backend: Arc<dyn ParserBackend>,
        store: Arc<Store>,
        config: &EngineConfig,
    ) -> LodAnalyzer {
        LodAnalyzer {
            root,
            backend,
            store,
            resolver: Arc::new(ModuleResolver::new()),
            files: DashMap::new(),
            reverse_imports: DashMap::new(),
            stats: Mutex::new(PromotionStats::default()),
            opt_out: config.topology_opt_out_set(),
            flags: config.flag_snapshot(),
            legacy_skeletons: DashMap::new(),
        }
    }

    pub fn current_lod(&self, path: &str) -> Lod {
        self.files.get(path).map(|f| f.lod).unwrap_or(Lod::Unknown)
    }

    pub fn analysis(&self, path: &str) -> Option<FileAnalysis> {
        self.files.get(path).map(|f| f.clone())
    }

    pub fn tracked_files(&self) -> Vec<String> {
        self.files.iter().map(|e| e.key().to_string()).collect()
    }

    pub fn promotion_stats(&self) -> PromotionStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn importers_of(&self, path: &str) -> Vec<String> {
        self.reverse_imports
            .get(path)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a legacy-cache skeleton for dual-write validation.
    pub fn record_legacy_skeleton(&self, path: &str, skeleton: &str) {
        self.legacy_skeletons.insert(path.to_string(), content_hash(skeleton));
    }

    /// Promote `path` to at least `min`. No-op (aside from the mtime check)
    /// when the file is already at or above the requested tier.
    pub fn ensure_lod(&self, path: &str, min: Lod) -> Result<LodOutcome> {
        let started = Instant::now();
        let abs = self.root.join(path);
        let meta = std::fs::metadata(&abs).map_err(|_| {
            crate::error::EngineError::NotFound(format!("file {path}"))
        })?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        // External mutation resets the tier before promotion runs.
        let previous = {
            let mut entry = self.files.entry(path.to_string()).or_default();
            if entry.mtime != 0 && entry.mtime != mtime {
                *entry = FileAnalysis::default();
            }
            entry.mtime = mtime;
            entry.lod
        };

        if previous >= min {
            return Ok(LodOutcome {
                previous_lod: previous.as_u8(),
                current_lod: previous.as_u8(),
                requested_lod: min.as_u8(),
                promoted: false,
                duration_ms: elapsed_ms(started),
                fallback_used: false,
                confidence: 1.0,
            });
        }

        let content = std::fs::read_to_string(&abs).map_err(|_| {
            crate::error::EngineError::IndexStale(format!("unreadable content for {path}"))
        })?;
        let lang = LanguageId::from_path(path);
        let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");

        let mut fallback_used = false;
        let mut confidence = 1.0_f64;
        let mut current = previous;

        while current < min {
            let step_start = Instant::now();
            let target = current.next().expect("tier below FullAst always has a next");

            let step_result = match target {
                Lod::Topology => self.promote_topology(path, &content, lang, ext),
                Lod::Skeleton => self.promote_skeleton(path, &content, mtime, lang),
                Lod::FullAst => self.promote_full(path, &content, mtime, lang),
                Lod::Unknown => unreachable!(),
            };

            match step_result {
                StepResult::Ok => {
                    let ms = elapsed_ms(step_start);
                    self.stats.lock().unwrap().record(current.as_u8() as usize, ms);
                    current = target;
                }
                StepResult::StructuralDoubt => {
                    // Force a full parse from raw contents; the result is
                    // authoritative even though the cheap path refused.
                    let fb_start = Instant::now();
                    self.fallback_to_full_ast(path, &content, mtime, lang);
                    let ms = elapsed_ms(fb_start);
                    let mut stats = self.stats.lock().unwrap();
                    stats.record(current.as_u8() as usize, ms);
                    stats.fallbacks += 1;
                    drop(stats);
                    fallback_used = true;
                    current = Lod::FullAst;
                }
                StepResult::Degraded => {
                    // Backend could not deliver the tier; keep what we have
                    // and report reduced confidence.
                    confidence = 0.5;
                    current = target;
                }
            }
            self.files.entry(path.to_string()).or_default().lod = current;
        }

        debug!(
            path,
            from = previous.as_u8(),
            to = current.as_u8(),
            fallback = fallback_used,
            time_ms = elapsed_ms(started) as u64,
            "lod promoted"
        );

        Ok(LodOutcome {
            previous_lod: previous.as_u8(),
            current_lod: current.as_u8(),
            requested_lod: min.as_u8(),
            promoted: current > previous,
            duration_ms: elapsed_ms(started),
            fallback_used,
            confidence,
        })
    }

    fn promote_topology(
        &self,
        path: &str,
        content: &str,
        lang: LanguageId,
        ext: &str,
    ) -> StepResult {
        if !self.flags.flags.topology_scanner_enabled {
            return StepResult::StructuralDoubt;
        }
        if structural_doubt(content, lang, ext, &self.opt_out) {
            return StepResult::StructuralDoubt;
        }
        let topo = scan_topology(content, lang);
        let mut entry = self.files.entry(path.to_string()).or_default();
        entry.language = lang;
        entry.topology = Some(topo);
        StepResult::Ok
    }

    fn promote_skeleton(
        &self,
        path: &str,
        content: &str,
        mtime: u64,
        lang: LanguageId,
    ) -> StepResult {
        let parsed = match self.backend.parse(path, content) {
            Ok(p) => p,
            Err(_) => return StepResult::StructuralDoubt,
        };
        self.apply_skeleton(path, content, mtime, lang, &parsed);
        StepResult::Ok
    }

    fn promote_full(&self, path: &str, content: &str, mtime: u64, lang: LanguageId) -> StepResult {
        let caps = self.backend.capabilities();
        let parsed = match self.backend.parse(path, content) {
            Ok(p) => p,
            Err(_) => return StepResult::StructuralDoubt,
        };
        self.apply_full(path, content, mtime, lang, &parsed);
        if caps.supports_call_sites {
            StepResult::Ok
        } else {
            StepResult::Degraded
        }
    }

    fn fallback_to_full_ast(&self, path: &str, content: &str, mtime: u64, lang: LanguageId) {
        match self.backend.parse(path, content) {
            Ok(parsed) => self.apply_full(path, content, mtime, lang, &parsed),
            Err(e) => {
                // Even the fallback failed; record an empty full analysis so
                // the tier contract holds and queries see an indexed file.
                warn!(path, error = %e, "full-AST fallback parse failed");
                let mut entry = self.files.entry(path.to_string()).or_default();
                entry.language = lang;
                entry.mtime = mtime;
                entry.skeleton = Some(String::new());
            }
        }
    }

    /// Skeleton tier: symbol table, resolved deps, skeleton text, persistence.
    fn apply_skeleton(
        &self,
        path: &str,
        content: &str,
        mtime: u64,
        lang: LanguageId,
        parsed: &ParsedFile,
    ) {
        let skeleton = build_skeleton_text(&parsed.symbols);
        let deps: Vec<DependencyEdge> = parsed
            .imports
            .iter()
            .map(|spec| {
                let target = self.resolver.resolve(path, spec);
                DependencyEdge {
                    source: path.to_string(),
                    target,
                    specifier: spec.clone(),
                    kind: DepKind::Import,
                    weight: 1.0,
                }
            })
            .collect();

        for dep in &deps {
            if let Some(target) = &dep.target {
                self.reverse_imports
                    .entry(target.clone())
                    .or_default()
                    .insert(path.to_string());
            }
        }

        if self.flags.flags.dual_write_validation {
            if let Some(legacy) = self.legacy_skeletons.get(path) {
                let fresh = content_hash(&skeleton);
                if *legacy != fresh {
                    warn!(path, "dual-write skeleton mismatch (legacy cache vs ucg)");
                }
            }
        }

        if let Err(e) = self.persist(path, mtime, lang, &skeleton, &parsed.symbols, &deps) {
            warn!(path, error = %e, "skeleton persistence failed");
        }

        let mut entry = self.files.entry(path.to_string()).or_default();
        entry.language = lang;
        entry.symbols = parsed.symbols.clone();
        entry.deps = deps;
        entry.skeleton = Some(skeleton);
        if entry.topology.is_none() {
            entry.topology = Some(scan_topology(content, lang));
        }
    }

    /// Full tier: skeleton plus call sites and type relations. The backing
    /// tree is released as soon as the derived edges are captured.
    fn apply_full(
        &self,
        path: &str,
        content: &str,
        mtime: u64,
        lang: LanguageId,
        parsed: &ParsedFile,
    ) {
        self.apply_skeleton(path, content, mtime, lang, parsed);
        let mut entry = self.files.entry(path.to_string()).or_default();
        entry.call_sites = parsed
            .call_sites
            .iter()
            .map(|c| (c.caller.clone(), c.callee.clone()))
            .collect();
        entry.type_relations = parsed.type_relations.clone();
    }

    fn persist(
        &self,
        path: &str,
        mtime: u64,
        lang: LanguageId,
        skeleton: &str,
        symbols: &[SymbolRecord],
        deps: &[DependencyEdge],
    ) -> Result<()> {
        self.store.upsert_file(&FileRow {
            path: path.to_string(),
            mtime,
            language: format!("{lang:?}").to_lowercase(),
            lod: self.current_lod(path).max(Lod::Skeleton),
            skeleton: Some(skeleton.to_string()),
        })?;
        self.store.replace_symbols(path, symbols)?;
        self.store.replace_deps(path, deps)?;
        Ok(())
    }

    /// Reset a file to LOD 0. With `cascade`, every transitive importer is
    /// demoted to at most topology so dependency resolution re-runs on the
    /// next `ensure_lod`. Each node is demoted at most once; cycles are fine.
    pub fn invalidate(&self, path: &str, cascade: bool) -> Vec<String> {
        if let Some(mut entry) = self.files.get_mut(path) {
            *entry = FileAnalysis::default();
        }
        let mut demoted = Vec::new();
        if !cascade {
            return demoted;
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(path.to_string());
        let mut stack: Vec<String> = self.importers_of(path);
        while let Some(importer) = stack.pop() {
            if !visited.insert(importer.clone()) {
                continue;
            }
            if let Some(mut entry) = self.files.get_mut(&importer) {
                if entry.lod > Lod::Topology {
                    entry.lod = Lod::Topology;
                    entry.symbols.clear();
                    entry.deps.clear();
                    entry.skeleton = None;
                    entry.call_sites.clear();
                    entry.type_relations.clear();
                    demoted.push(importer.clone());
                }
            }
            stack.extend(self.importers_of(&importer));
        }
        demoted
    }

    /// Drop a file entirely (watcher-reported deletion).
    pub fn remove(&self, path: &str) {
        self.files.remove(path);
        self.reverse_imports.remove(path);
        for mut entry in self.reverse_imports.iter_mut() {
            entry.value_mut().remove(path);
        }
    }
}

enum StepResult {
    Ok,
    StructuralDoubt,
    Degraded,
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Skeleton text: docs + signatures in source order, bodies elided.
fn build_skeleton_text(symbols: &[SymbolRecord]) -> String {
    let mut out = String::new();
    let mut ordered: Vec<&SymbolRecord> = symbols.iter().collect();
    ordered.sort_by_key(|s| s.range.start_line);
    for sym in ordered {
        if let Some(doc) = &sym.doc {
            out.push_str("/// ");
            out.push_str(doc);
            out.push('\n');
        }
        if sym.container.is_some() {
            out.push_str("    ");
        }
        out.push_str(&sym.signature);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::select_backend;
    use std::fs;

    fn analyzer_for(dir: &std::path::Path) -> LodAnalyzer {
        let config = EngineConfig::default();
        let backend = select_backend(crate::config::BackendPreference::Auto);
        LodAnalyzer::new(dir.to_path_buf(), backend, Arc::new(Store::open_memory()), &config)
    }

    fn write(dir: &std::path::Path, rel: &str, content: &str) {
        let p = dir.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    #[test]
    fn test_ensure_lod_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.ts", "export function alpha() { return 1; }\n");
        let analyzer = analyzer_for(dir.path());
        analyzer.resolver.set_files(vec!["src/a.ts".to_string()]);

        let out = analyzer.ensure_lod("src/a.ts", Lod::Topology).unwrap();
        assert!(out.promoted);
        assert_eq!(out.current_lod, 1);

        let out = analyzer.ensure_lod("src/a.ts", Lod::FullAst).unwrap();
        assert!(out.current_lod >= 3 || out.fallback_used);
        assert_eq!(analyzer.current_lod("src/a.ts"), Lod::FullAst);

        // Requesting a lower tier never demotes.
        let out = analyzer.ensure_lod("src/a.ts", Lod::Topology).unwrap();
        assert!(!out.promoted);
        assert_eq!(out.current_lod, 3);
    }

    #[test]
    fn test_topology_and_full_agree_on_names() {
        let dir = tempfile::tempdir().unwrap();
        let src = "export function alpha() { return 1; }\nexport class Beta {}\n";
        write(dir.path(), "src/a.ts", src);
        let analyzer = analyzer_for(dir.path());
        analyzer.resolver.set_files(vec!["src/a.ts".to_string()]);

        analyzer.ensure_lod("src/a.ts", Lod::Topology).unwrap();
        let topo_names: Vec<String> = analyzer
            .analysis("src/a.ts")
            .unwrap()
            .topology
            .unwrap()
            .symbols
            .iter()
            .map(|s| s.name.clone())
            .collect();

        analyzer.invalidate("src/a.ts", false);
        analyzer.ensure_lod("src/a.ts", Lod::FullAst).unwrap();
        let full_names: Vec<String> = analyzer
            .analysis("src/a.ts")
            .unwrap()
            .symbols
            .iter()
            .filter(|s| s.container.is_none())
            .map(|s| s.name.clone())
            .collect();

        for name in &topo_names {
            assert!(full_names.contains(name), "{name} missing from full parse: {full_names:?}");
        }
    }

    #[test]
    fn test_structural_doubt_predicate() {
        let empty = HashSet::new();
        assert!(structural_doubt("fn broken() {", LanguageId::Rust, "rs", &empty));
        assert!(structural_doubt("fn ok() {}\0", LanguageId::Rust, "rs", &empty));
        assert!(structural_doubt("fn naïve() {}", LanguageId::Rust, "rs", &empty));
        assert!(!structural_doubt("fn ok() {}", LanguageId::Rust, "rs", &empty));
        // non-ASCII identifiers are fine in Python
        assert!(!structural_doubt("def naïve():\n    pass\n", LanguageId::Python, "py", &empty));

        let mut opt_out = HashSet::new();
        opt_out.insert("rs".to_string());
        assert!(structural_doubt("fn ok() {}", LanguageId::Rust, "rs", &opt_out));
    }

    #[test]
    fn test_doubt_forces_fallback_to_full_ast() {
        let dir = tempfile::tempdir().unwrap();
        // unbalanced braces → topology refuses, fallback parses what it can
        write(dir.path(), "src/odd.ts", "export function broken() {\n  if (x) {\n");
        let analyzer = analyzer_for(dir.path());
        analyzer.resolver.set_files(vec!["src/odd.ts".to_string()]);

        let out = analyzer.ensure_lod("src/odd.ts", Lod::Topology).unwrap();
        assert!(out.fallback_used);
        assert_eq!(out.current_lod, 3, "fallback lands on full AST");
        assert_eq!(analyzer.current_lod("src/odd.ts"), Lod::FullAst);
        assert_eq!(analyzer.promotion_stats().fallbacks, 1);
    }

    #[test]
    fn test_cascade_invalidate_demotes_importers() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.ts", "export const a = 1;\n");
        write(dir.path(), "b.ts", "import { a } from \"./a\";\nexport const b = a;\n");
        write(dir.path(), "c.ts", "import { b } from \"./b\";\nexport const c = b;\n");
        let analyzer = analyzer_for(dir.path());
        analyzer.resolver.set_files(vec!["a.ts".into(), "b.ts".into(), "c.ts".into()]);

        for f in ["a.ts", "b.ts", "c.ts"] {
            analyzer.ensure_lod(f, Lod::Skeleton).unwrap();
        }
        assert_eq!(analyzer.current_lod("c.ts"), Lod::Skeleton);

        let demoted = analyzer.invalidate("a.ts", true);
        assert_eq!(analyzer.current_lod("a.ts"), Lod::Unknown);
        assert!(analyzer.current_lod("b.ts") <= Lod::Topology);
        assert!(analyzer.current_lod("c.ts") <= Lod::Topology, "transitive importer demoted");
        assert_eq!(demoted.len(), 2);
    }

    #[test]
    fn test_invalidate_handles_import_cycles() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.ts", "import { y } from \"./y\";\nexport const x = 1;\n");
        write(dir.path(), "y.ts", "import { x } from \"./x\";\nexport const y = 1;\n");
        let analyzer = analyzer_for(dir.path());
        analyzer.resolver.set_files(vec!["x.ts".into(), "y.ts".into()]);
        analyzer.ensure_lod("x.ts", Lod::Skeleton).unwrap();
        analyzer.ensure_lod("y.ts", Lod::Skeleton).unwrap();

        // Must terminate despite the cycle.
        let demoted = analyzer.invalidate("x.ts", true);
        assert!(demoted.contains(&"y.ts".to_string()));
    }

    #[test]
    fn test_mtime_change_resets_tier() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.ts", "export const a = 1;\n");
        let analyzer = analyzer_for(dir.path());
        analyzer.resolver.set_files(vec!["a.ts".to_string()]);
        analyzer.ensure_lod("a.ts", Lod::Skeleton).unwrap();

        // Force a different mtime, then re-request: previous must read as 0.
        let abs = dir.path().join("a.ts");
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::write(&abs, "export const a = 2;\n").unwrap();
        let file = fs::OpenOptions::new().write(true).open(&abs).unwrap();
        file.set_modified(past).unwrap();

        let out = analyzer.ensure_lod("a.ts", Lod::Topology).unwrap();
        assert_eq!(out.previous_lod, 0, "external mutation resets the tier");
        assert_eq!(out.current_lod, 1);
    }

    #[test]
    fn test_promotion_stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.ts", "export const a = 1;\n");
        write(dir.path(), "b.ts", "export const b = 2;\n");
        let analyzer = analyzer_for(dir.path());
        analyzer.resolver.set_files(vec!["a.ts".into(), "b.ts".into()]);

        analyzer.ensure_lod("a.ts", Lod::Skeleton).unwrap();
        analyzer.ensure_lod("b.ts", Lod::Topology).unwrap();
        let stats = analyzer.promotion_stats();
        assert_eq!(stats.counts[0], 2, "two 0→1 transitions");
        assert_eq!(stats.counts[1], 1, "one 1→2 transition");
        assert_eq!(stats.fallback_rate(), 0.0);
    }

    #[test]
    fn test_module_resolver_relative_and_bare() {
        let resolver = ModuleResolver::new();
        resolver.set_files(vec![
            "src/app/main.ts".to_string(),
            "src/app/util.ts".to_string(),
            "src/lib/util.ts".to_string(),
        ]);
        assert_eq!(
            resolver.resolve("src/app/main.ts", "./util"),
            Some("src/app/util.ts".to_string())
        );
        assert_eq!(
            resolver.resolve("src/app/main.ts", "../lib/util"),
            Some("src/lib/util.ts".to_string())
        );
        // bare specifier prefers the closest directory
        assert_eq!(
            resolver.resolve("src/app/main.ts", "util"),
            Some("src/app/util.ts".to_string())
        );
        assert_eq!(resolver.resolve("src/app/main.ts", "./missing"), None);
    }
}
