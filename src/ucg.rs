//! Unified Context Graph.
//!
//! One instance per workspace root. File and symbol nodes live in the LOD
//! analyzer's per-file state; the UCG owns the cross-file edges derived from
//! it — imports, calls, extends/implements — with forward and reverse
//! indices, and the invalidation cascade that keeps them honest.

use crate::error::Result;
use crate::lod::{LodAnalyzer, LodOutcome};
use crate::types::{Lod, SymbolKind, SymbolRecord, TypeRelation};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::debug;

// ---------------------------------------------------------------------------
// Edge types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEdge {
    #[serde(rename = "callerFile")]
    pub caller_file: String,
    #[serde(rename = "callerSymbol")]
    pub caller_symbol: String,
    #[serde(rename = "calleeFile")]
    pub callee_file: String,
    #[serde(rename = "calleeSymbol")]
    pub callee_symbol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeEdge {
    #[serde(rename = "subFile")]
    pub sub_file: String,
    #[serde(rename = "subSymbol")]
    pub sub_symbol: String,
    #[serde(rename = "superFile")]
    pub super_file: String,
    #[serde(rename = "superSymbol")]
    pub super_symbol: String,
    pub relation: TypeRelation,
}

/// A file node as seen by callers of `get_node`.
#[derive(Debug, Clone, Serialize)]
pub struct UcgNode {
    pub path: String,
    pub lod: u8,
    #[serde(rename = "symbolCount")]
    pub symbol_count: usize,
    pub imports: Vec<String>,
    #[serde(rename = "importedBy")]
    pub imported_by: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UcgStats {
    pub files: usize,
    pub symbols: usize,
    #[serde(rename = "importEdges")]
    pub import_edges: usize,
    #[serde(rename = "callEdges")]
    pub call_edges: usize,
    #[serde(rename = "typeEdges")]
    pub type_edges: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LodRequest<'a> {
    pub path: &'a str,
    pub min_lod: Lod,
}

// ---------------------------------------------------------------------------
// Edge storage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EdgeStore {
    call_edges: Vec<CallEdge>,
    type_edges: Vec<TypeEdge>,
    /// name -> (file, kind) sightings, for call/type resolution.
    symbol_lookup: HashMap<String, Vec<(String, SymbolKind)>>,
}

impl EdgeStore {
    fn drop_file(&mut self, path: &str) {
        self.call_edges
            .retain(|e| e.caller_file != path && e.callee_file != path);
        self.type_edges.retain(|e| e.sub_file != path && e.super_file != path);
        for sightings in self.symbol_lookup.values_mut() {
            sightings.retain(|(file, _)| file != path);
        }
        self.symbol_lookup.retain(|_, v| !v.is_empty());
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

pub struct ContextGraph {
    analyzer: Arc<LodAnalyzer>,
    edges: RwLock<EdgeStore>,
}

impl ContextGraph {
    pub fn new(analyzer: Arc<LodAnalyzer>) -> ContextGraph {
        ContextGraph { analyzer, edges: RwLock::new(EdgeStore::default()) }
    }

    pub fn analyzer(&self) -> &Arc<LodAnalyzer> {
        &self.analyzer
    }

    /// O(1) node lookup over the analyzer's current state.
    pub fn get_node(&self, path: &str) -> Option<UcgNode> {
        let analysis = self.analyzer.analysis(path)?;
        Some(UcgNode {
            path: path.to_string(),
            lod: analysis.lod.as_u8(),
            symbol_count: analysis.symbols.len(),
            imports: analysis
                .deps
                .iter()
                .filter_map(|d| d.target.clone())
                .collect(),
            imported_by: self.analyzer.importers_of(path),
        })
    }

    /// Promote a file and fold its derived edges into the graph. The graph
    /// owns persistence of the node's edge state; per-file symbol and
    /// dependency rows are written by the analyzer during promotion.
    pub fn ensure_lod(&self, request: LodRequest<'_>) -> Result<LodOutcome> {
        let outcome = self.analyzer.ensure_lod(request.path, request.min_lod)?;
        if outcome.promoted {
            self.sync_file(request.path);
        }
        Ok(outcome)
    }

    /// Rebuild the edges owned by one file from the analyzer's state.
    pub fn sync_file(&self, path: &str) {
        let Some(analysis) = self.analyzer.analysis(path) else {
            return;
        };
        let mut edges = self.edges.write().unwrap();

        // Refresh symbol sightings for this file.
        for sightings in edges.symbol_lookup.values_mut() {
            sightings.retain(|(file, _)| file != path);
        }
        for sym in &analysis.symbols {
            edges
                .symbol_lookup
                .entry(sym.name.clone())
                .or_default()
                .push((path.to_string(), sym.kind));
        }

        // Replace call/type edges originating here.
        edges.call_edges.retain(|e| e.caller_file != path);
        edges.type_edges.retain(|e| e.sub_file != path);

        let imported: HashSet<String> = analysis
            .deps
            .iter()
            .filter_map(|d| d.target.clone())
            .collect();

        let resolve = |edges: &EdgeStore, name: &str, want_callable: bool| -> Option<(String, SymbolKind)> {
            let sightings = edges.symbol_lookup.get(name)?;
            let eligible: Vec<&(String, SymbolKind)> = sightings
                .iter()
                .filter(|(_, k)| if want_callable { k.is_callable() } else { k.is_type_like() })
                .collect();
            if eligible.is_empty() {
                return None;
            }
            // same file > imported file > anything
            eligible
                .iter()
                .find(|(file, _)| file == path)
                .or_else(|| eligible.iter().find(|(file, _)| imported.contains(file)))
                .or_else(|| eligible.first())
                .map(|(f, k)| (f.clone(), *k))
        };

        let mut new_calls = Vec::new();
        for (caller, callee) in &analysis.call_sites {
            if let Some((callee_file, _)) = resolve(&edges, callee, true) {
                new_calls.push(CallEdge {
                    caller_file: path.to_string(),
                    caller_symbol: caller.clone().unwrap_or_else(|| "<module>".to_string()),
                    callee_file,
                    callee_symbol: callee.clone(),
                });
            }
        }
        let mut new_types = Vec::new();
        for (sub, sup, relation) in &analysis.type_relations {
            if let Some((super_file, _)) = resolve(&edges, sup, false) {
                new_types.push(TypeEdge {
                    sub_file: path.to_string(),
                    sub_symbol: sub.clone(),
                    super_file,
                    super_symbol: sup.clone(),
                    relation: *relation,
                });
            }
        }
        edges.call_edges.extend(new_calls);
        edges.type_edges.extend(new_types);
    }

    /// Invalidate a file: drop every call/type edge touching it, then demote
    /// it (and with `cascade`, its transitive importers) in the analyzer.
    /// The walk is depth-first over reverse imports with a visited set, so a
    /// node is demoted at most once and cycles terminate.
    pub fn invalidate(&self, path: &str, cascade: bool) -> Vec<String> {
        {
            let mut edges = self.edges.write().unwrap();
            edges.drop_file(path);
        }
        let demoted = self.analyzer.invalidate(path, cascade);
        if cascade {
            let mut edges = self.edges.write().unwrap();
            for file in &demoted {
                edges.drop_file(file);
            }
        }
        debug!(path, cascade, demoted = demoted.len(), "ucg invalidated");
        demoted
    }

    /// Remove a deleted file entirely.
    pub fn remove(&self, path: &str) {
        self.edges.write().unwrap().drop_file(path);
        self.analyzer.remove(path);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn callers_of(&self, file: &str, symbol: &str) -> Vec<CallEdge> {
        let edges = self.edges.read().unwrap();
        edges
            .call_edges
            .iter()
            .filter(|e| e.callee_file == file && e.callee_symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn callees_of(&self, file: &str, symbol: &str) -> Vec<CallEdge> {
        let edges = self.edges.read().unwrap();
        edges
            .call_edges
            .iter()
            .filter(|e| e.caller_file == file && e.caller_symbol == symbol)
            .cloned()
            .collect()
    }

    /// Supertypes and subtypes one hop around a symbol.
    pub fn type_family_of(&self, file: &str, symbol: &str) -> Vec<TypeEdge> {
        let edges = self.edges.read().unwrap();
        edges
            .type_edges
            .iter()
            .filter(|e| {
                (e.sub_file == file && e.sub_symbol == symbol)
                    || (e.super_file == file && e.super_symbol == symbol)
            })
            .cloned()
            .collect()
    }

    /// Call-graph shape signals for the BM25F boost: in/out degree and
    /// entry-point-ness per symbol of a file.
    pub fn call_signals(&self, file: &str) -> HashMap<String, crate::rank::CallSignal> {
        let edges = self.edges.read().unwrap();
        let mut out: HashMap<String, crate::rank::CallSignal> = HashMap::new();
        for e in &edges.call_edges {
            if e.caller_file == file {
                out.entry(e.caller_symbol.clone()).or_default().out_degree += 1;
            }
            if e.callee_file == file {
                out.entry(e.callee_symbol.clone()).or_default().in_degree += 1;
            }
        }
        for (name, signal) in out.iter_mut() {
            signal.is_entry_point = signal.in_degree == 0
                && (name == "main" || name.contains("handler") || signal.out_degree >= 3);
        }
        out
    }

    /// Other symbols defined in the same file, excluding the seed.
    pub fn colocated_symbols(&self, file: &str, except: &str) -> Vec<SymbolRecord> {
        self.analyzer
            .analysis(file)
            .map(|a| {
                a.symbols
                    .into_iter()
                    .filter(|s| s.name != except)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sibling files: same directory, or directly import-adjacent.
    pub fn sibling_files(&self, file: &str) -> Vec<String> {
        let dir = file.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let mut siblings: Vec<String> = self
            .analyzer
            .tracked_files()
            .into_iter()
            .filter(|f| {
                f != file && f.rsplit_once('/').map(|(d, _)| d).unwrap_or("") == dir
            })
            .collect();
        if let Some(analysis) = self.analyzer.analysis(file) {
            for dep in analysis.deps.iter().filter_map(|d| d.target.clone()) {
                if dep != file && !siblings.contains(&dep) {
                    siblings.push(dep);
                }
            }
        }
        siblings.sort();
        siblings
    }

    pub fn get_stats(&self) -> UcgStats {
        let edges = self.edges.read().unwrap();
        let files = self.analyzer.tracked_files();
        let symbols = files
            .iter()
            .filter_map(|f| self.analyzer.analysis(f))
            .map(|a| a.symbols.len())
            .sum();
        let import_edges = files
            .iter()
            .filter_map(|f| self.analyzer.analysis(f))
            .map(|a| a.deps.iter().filter(|d| d.target.is_some()).count())
            .sum();
        UcgStats {
            files: files.len(),
            symbols,
            import_edges,
            call_edges: edges.call_edges.len(),
            type_edges: edges.type_edges.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::parser::select_backend;
    use crate::storage::Store;
    use std::fs;

    fn graph_for(dir: &std::path::Path, files: &[(&str, &str)]) -> ContextGraph {
        for (rel, content) in files {
            let p = dir.join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, content).unwrap();
        }
        let config = EngineConfig::default();
        let backend = select_backend(crate::config::BackendPreference::Auto);
        let analyzer = Arc::new(LodAnalyzer::new(
            dir.to_path_buf(),
            backend,
            Arc::new(Store::open_memory()),
            &config,
        ));
        analyzer
            .resolver
            .set_files(files.iter().map(|(rel, _)| rel.to_string()).collect::<Vec<_>>());
        ContextGraph::new(analyzer)
    }

    #[cfg(feature = "treesitter")]
    #[test]
    fn test_call_edges_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_for(
            dir.path(),
            &[
                ("src/app.rs", "use crate::util::helper;\n\npub fn run() {\n    helper();\n}\n"),
                ("src/util.rs", "pub fn helper() {}\n"),
            ],
        );
        graph.ensure_lod(LodRequest { path: "src/util.rs", min_lod: Lod::FullAst }).unwrap();
        graph.ensure_lod(LodRequest { path: "src/app.rs", min_lod: Lod::FullAst }).unwrap();

        let callers = graph.callers_of("src/util.rs", "helper");
        assert!(
            callers.iter().any(|e| e.caller_file == "src/app.rs" && e.caller_symbol == "run"),
            "callers: {callers:?}"
        );
        let callees = graph.callees_of("src/app.rs", "run");
        assert!(callees.iter().any(|e| e.callee_symbol == "helper"));
    }

    #[cfg(feature = "treesitter")]
    #[test]
    fn test_type_family() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_for(
            dir.path(),
            &[("src/animals.ts", "export class Animal {}\nexport class Dog extends Animal {}\n")],
        );
        graph
            .ensure_lod(LodRequest { path: "src/animals.ts", min_lod: Lod::FullAst })
            .unwrap();
        let family = graph.type_family_of("src/animals.ts", "Animal");
        assert!(family.iter().any(|e| e.sub_symbol == "Dog"));
    }

    #[test]
    fn test_invalidate_drops_edges_and_demotes() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_for(
            dir.path(),
            &[
                ("a.ts", "export const a = 1;\n"),
                ("b.ts", "import { a } from \"./a\";\nexport const b = a;\n"),
            ],
        );
        graph.ensure_lod(LodRequest { path: "a.ts", min_lod: Lod::Skeleton }).unwrap();
        graph.ensure_lod(LodRequest { path: "b.ts", min_lod: Lod::Skeleton }).unwrap();

        graph.invalidate("a.ts", true);
        assert_eq!(graph.analyzer().current_lod("a.ts"), Lod::Unknown);
        assert!(graph.analyzer().current_lod("b.ts") <= Lod::Topology);

        let stats = graph.get_stats();
        assert_eq!(stats.call_edges, 0);
    }

    #[test]
    fn test_get_node_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_for(
            dir.path(),
            &[
                ("a.ts", "export const a = 1;\n"),
                ("b.ts", "import { a } from \"./a\";\nexport const b = a;\n"),
            ],
        );
        graph.ensure_lod(LodRequest { path: "a.ts", min_lod: Lod::Skeleton }).unwrap();
        graph.ensure_lod(LodRequest { path: "b.ts", min_lod: Lod::Skeleton }).unwrap();

        let node = graph.get_node("b.ts").expect("node exists");
        assert_eq!(node.lod, 2);
        assert_eq!(node.imports, vec!["a.ts".to_string()]);

        let a_node = graph.get_node("a.ts").unwrap();
        assert_eq!(a_node.imported_by, vec!["b.ts".to_string()]);

        let stats = graph.get_stats();
        assert_eq!(stats.files, 2);
        assert!(stats.symbols >= 2);
        assert_eq!(stats.import_edges, 1);
    }

    #[test]
    fn test_sibling_files_same_directory() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_for(
            dir.path(),
            &[
                ("src/a.ts", "export const a = 1;\n"),
                ("src/b.ts", "export const b = 1;\n"),
                ("other/c.ts", "export const c = 1;\n"),
            ],
        );
        for f in ["src/a.ts", "src/b.ts", "other/c.ts"] {
            graph.ensure_lod(LodRequest { path: f, min_lod: Lod::Skeleton }).unwrap();
        }
        let siblings = graph.sibling_files("src/a.ts");
        assert!(siblings.contains(&"src/b.ts".to_string()));
        assert!(!siblings.contains(&"other/c.ts".to_string()));
    }
}
