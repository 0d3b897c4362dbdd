//! End-to-end scenarios for the analysis and index layers: LOD promotion
//! cost, trigram snapshot round-trips, q8 pack fidelity, and chunker
//! determinism across engine instances.

mod helpers;

use helpers::TestHarness;
use scopegraph::config::{PackFormat, TrigramConfig};
use scopegraph::trigram::TrigramIndex;
use scopegraph::types::Lod;
use scopegraph::ucg::LodRequest;
use scopegraph::vecpack::{l2_norm, q8_scale, PackStore};
use std::collections::BTreeSet;
use std::time::Instant;

// ---------------------------------------------------------------------------
// LOD promotion cost
// ---------------------------------------------------------------------------

fn synthetic_ts_file(i: usize) -> String {
    let mut src = String::new();
    src.push_str(&format!("import {{ dep{} }} from \"./file{:02}\";\n\n", i, (i + 1) % 50));
    for f in 0..8 {
        src.push_str(&format!(
            "export function fn{i}_{f}(input: string): string {{\n    const out = input + \"{f}\";\n    return out.trim();\n}}\n\n"
        ));
    }
    src.push_str(&format!("export class Service{i} {{\n    run(): void {{}}\n}}\n"));
    src
}

#[test]
fn test_topology_tier_is_cheaper_than_full_and_agrees_on_names() {
    let files: Vec<(String, String)> =
        (0..50).map(|i| (format!("src/file{i:02}.ts"), synthetic_ts_file(i))).collect();
    let fixture: Vec<(&str, &str)> =
        files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();

    // Scenario A: straight to the full tier.
    let full = TestHarness::with_files(&fixture);
    let a_start = Instant::now();
    for (path, _) in &fixture {
        full.engine
            .graph
            .ensure_lod(LodRequest { path, min_lod: Lod::FullAst })
            .unwrap();
    }
    let a_total = a_start.elapsed();

    // Scenario B: topology only.
    let topo = TestHarness::with_files(&fixture);
    let b_start = Instant::now();
    for (path, _) in &fixture {
        topo.engine
            .graph
            .ensure_lod(LodRequest { path, min_lod: Lod::Topology })
            .unwrap();
    }
    let b_total = b_start.elapsed();

    // Same top-level symbol names from both tiers.
    for (path, _) in &fixture {
        let full_names: BTreeSet<String> = full
            .engine
            .graph
            .analyzer()
            .analysis(path)
            .unwrap()
            .symbols
            .iter()
            .filter(|s| s.container.is_none())
            .map(|s| s.name.clone())
            .collect();
        let topo_names: BTreeSet<String> = topo
            .engine
            .graph
            .analyzer()
            .analysis(path)
            .unwrap()
            .topology
            .unwrap()
            .symbols
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(topo_names, full_names, "tier disagreement in {path}");
    }

    // The line scan must undercut the full parse by at least 5x in total,
    // and average under 2 ms per file.
    assert!(
        b_total * 5 <= a_total,
        "topology ({b_total:?}) should be at least 5x cheaper than full AST ({a_total:?})"
    );
    let avg_ms = b_total.as_secs_f64() * 1000.0 / 50.0;
    assert!(avg_ms < 2.0, "average topology scan took {avg_ms:.2} ms");

    let stats = topo.engine.graph.analyzer().promotion_stats();
    assert_eq!(stats.counts[0], 50);
    assert_eq!(stats.fallback_rate(), 0.0);
}

// ---------------------------------------------------------------------------
// Trigram persistence
// ---------------------------------------------------------------------------

#[test]
fn test_trigram_snapshot_round_trip_over_fixture() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("a.ts"), "export const foo = 1").unwrap();
    std::fs::write(
        workspace.path().join("b.ts"),
        "function foobar() { return foo; }",
    )
    .unwrap();
    let cache = tempfile::tempdir().unwrap();

    let mut index = TrigramIndex::new(workspace.path().to_path_buf(), TrigramConfig::default());
    index.build(|_, _| {});
    index.save(cache.path()).unwrap();

    let reloaded =
        TrigramIndex::load(cache.path(), workspace.path(), TrigramConfig::default())
            .expect("snapshot must load for the same root");
    let hits = reloaded.search("foo", 10);
    let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
    assert_eq!(paths, vec!["a.ts", "b.ts"], "both files found, definition first");
}

// ---------------------------------------------------------------------------
// q8 fidelity
// ---------------------------------------------------------------------------

#[test]
fn test_q8_pack_fidelity_on_reference_vector() {
    let dir = tempfile::tempdir().unwrap();
    let pack = PackStore::open(dir.path(), 4, PackFormat::Q8, 1, 1024 * 1024).unwrap();

    let v = [1.0f32, 0.0, -1.0, 0.5];
    let scale = q8_scale(&v);
    assert!((scale - 1.0 / 127.0).abs() < 1e-7, "scale = max|v|/127");

    pack.upsert("reference", &v).unwrap();
    pack.flush_if_dirty().unwrap();

    // Survives a reopen from disk.
    let reopened = PackStore::open(dir.path(), 4, PackFormat::Q8, 1, 1024 * 1024).unwrap();
    let got = reopened.get("reference").expect("vector readable after reopen");
    for (orig, retrieved) in v.iter().zip(got.iter()) {
        assert!(
            (orig - retrieved).abs() <= scale,
            "component {orig} drifted to {retrieved}"
        );
    }
    let norm_error = (l2_norm(&v) - l2_norm(&got)).abs() / l2_norm(&v);
    assert!(norm_error < 0.01, "norm drift {norm_error}");
}

// ---------------------------------------------------------------------------
// Chunker determinism across engines
// ---------------------------------------------------------------------------

#[test]
fn test_chunk_ids_stable_across_engine_instances() {
    let doc = "# Guide\n\nA reasonably long introduction that says what the tool is for.\n\n## Usage\n\n```sh\nscopegraph index\n```\n\nRun it from the workspace root.\n";
    let ids = |h: &TestHarness| -> Vec<String> {
        h.engine
            .store
            .chunks_for_file("docs/guide.md")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect()
    };

    let first = TestHarness::with_files(&[("docs/guide.md", doc)]);
    let second = TestHarness::with_files(&[("docs/guide.md", doc)]);
    let a = ids(&first);
    let b = ids(&second);
    assert!(!a.is_empty());
    assert_eq!(a, b, "same file + options ⇒ same chunk ids");
}

// ---------------------------------------------------------------------------
// Incremental reindex keeps indexes coherent
// ---------------------------------------------------------------------------

#[test]
fn test_reindex_file_updates_search_results() {
    let h = TestHarness::with_files(&[("src/a.ts", "export const alpha = 1;\n")]);
    let before = h.engine.trigram.read().unwrap().search("zeta", 10);
    assert!(before.is_empty());

    h.write_file("src/a.ts", "export const zeta = 1;\n");
    let after = h.engine.trigram.read().unwrap().search("zeta", 10);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].path, "src/a.ts");

    let gone = h.engine.trigram.read().unwrap().search("alpha", 10);
    assert!(gone.is_empty(), "old content dropped from postings");
}
