//! The per-workspace engine: owns the store, context graph, trigram index,
//! vector pack, and evidence store, and composes them into hybrid search
//! responses. One engine per workspace root; mutable state is serialized
//! behind the engine's locks and the index queue, and readers work from
//! snapshots.

use crate::chunker::{self, ChunkOptions, DocKind};
use crate::cluster::{self, ClusterSeed, SearchCluster};
use crate::config::{cache_dir_for_root, pack_dir, EngineConfig, EngineMode};
use crate::embed::{self, EmbeddingProvider};
use crate::error::{EngineError, Result};
use crate::evidence::{
    apply_token_budget, BudgetOutcome, EvidenceItem, EvidencePack, EvidenceStore, ItemRole,
    ItemSection, PackLookup, ScoreBreakdown,
};
use crate::hnsw::{HnswIndex, HnswParams};
use crate::indexer::{IndexQueue, Priority, TaskKind};
use crate::lod::LodAnalyzer;
use crate::parser::select_backend;
use crate::rank::{Bm25fRanker, FieldType, RankDoc};
use crate::search::{mmr_diversify, path_similarity, rrf_fuse, FusedHit, Lane, LaneHit};
use crate::storage::{now_secs, ChunkRow, Store};
use crate::tokenizer::{create_tokenizer, Tokenizer};
use crate::trigram::{TrigramIndex, PERSIST_DEBOUNCE};
use crate::types::{
    is_sensitive_path, workspace_fingerprint, LanguageId, Lod,
};
use crate::ucg::{ContextGraph, LodRequest};
use crate::vecpack::PackStore;
use crate::watch::{start_watcher, WatchHooks};
use notify::RecommendedWatcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// How many fused seeds become clusters.
const MAX_SEEDS: usize = 8;

/// Default response token budget when the caller does not pass one.
pub const DEFAULT_TOKEN_BUDGET: usize = 6_000;

// ---------------------------------------------------------------------------
// Search output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SearchOptions {
    pub limit: usize,
    #[serde(rename = "expandRelationships")]
    pub expand_relationships: bool,
    #[serde(rename = "tokenBudget")]
    pub token_budget: usize,
    #[serde(rename = "includeDocs")]
    pub include_docs: bool,
    #[serde(rename = "includeComments")]
    pub include_comments: bool,
    #[serde(rename = "allowSensitive")]
    pub allow_sensitive: bool,
    /// Deadline for the whole query; expiry returns a `timeout` error
    /// without mutating any index state.
    #[serde(rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 10,
            expand_relationships: false,
            token_budget: DEFAULT_TOKEN_BUDGET,
            include_docs: true,
            include_comments: true,
            allow_sensitive: false,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub clusters: Vec<SearchCluster>,
    #[serde(rename = "expansionHints")]
    pub expansion_hints: ExpansionHints,
    pub budget: BudgetOutcome,
    #[serde(rename = "packId")]
    pub pack_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpansionHints {
    #[serde(rename = "recommendedExpansions")]
    pub recommended_expansions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub ucg: crate::ucg::UcgStats,
    pub lod: crate::lod::PromotionStats,
    pub trigram: crate::trigram::TrigramStats,
    #[serde(rename = "packHealth")]
    pub pack_health: crate::vecpack::PackHealth,
    #[serde(rename = "storeEphemeral")]
    pub store_ephemeral: bool,
    pub activity: Option<crate::indexer::ActivitySnapshot>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    root: PathBuf,
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub graph: Arc<ContextGraph>,
    pub trigram: RwLock<TrigramIndex>,
    pub pack: Arc<PackStore>,
    provider: Arc<dyn EmbeddingProvider>,
    pub evidence: EvidenceStore,
    pub tokenizer: Arc<dyn Tokenizer>,
    hnsw: RwLock<Option<HnswIndex>>,
    chunk_options: ChunkOptions,
    queue: Mutex<Option<Arc<IndexQueue>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    cache_dir: PathBuf,
    generation: AtomicU64,
    disposed: AtomicBool,
}

impl Engine {
    pub fn open(root: &Path, config: EngineConfig) -> Result<Arc<Engine>> {
        let root = root
            .canonicalize()
            .map_err(|e| EngineError::InvalidArgs(format!("workspace root: {e}")))?;
        let cache_dir = cache_dir_for_root(&root);

        let store = if config.mode == EngineMode::Test {
            Arc::new(Store::open_memory())
        } else {
            Arc::new(Store::open(&cache_dir))
        };

        let backend = select_backend(config.parser_backend);
        let analyzer =
            Arc::new(LodAnalyzer::new(root.clone(), backend, Arc::clone(&store), &config));
        let graph = Arc::new(ContextGraph::new(analyzer));

        let trigram = TrigramIndex::load(&cache_dir, &root, config.trigram.clone())
            .unwrap_or_else(|| TrigramIndex::new(root.clone(), config.trigram.clone()));

        let provider = embed::create_provider(&config.vector.provider, &config.vector.model);
        let pdir = pack_dir(&cache_dir, provider.provider_name(), provider.model_name());
        let pack = Arc::new(PackStore::open(
            &pdir,
            provider.dims(),
            config.vector.pack_format,
            config.vector.shards,
            config.vector.cache_bytes,
        )?);
        if let Some(reason) = pack.health().reason {
            warn!(reason = %reason, "vector pack degraded");
        }

        let evidence = EvidenceStore::new(Arc::clone(&store), config.pack_ttl_secs);
        let tokenizer = create_tokenizer("estimate");

        Ok(Arc::new(Engine {
            root,
            store,
            graph,
            trigram: RwLock::new(trigram),
            pack,
            provider,
            evidence,
            tokenizer,
            hnsw: RwLock::new(None),
            chunk_options: ChunkOptions::default(),
            queue: Mutex::new(None),
            watcher: Mutex::new(None),
            cache_dir,
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            config,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current workspace fingerprint; recorded on evidence packs.
    pub fn fingerprint(&self) -> String {
        let files = self.trigram.read().unwrap().file_count();
        workspace_fingerprint(&self.root, files, self.generation.load(Ordering::Relaxed))
    }

    // -----------------------------------------------------------------------
    // Indexing
    // -----------------------------------------------------------------------

    /// Full workspace pass: trigram build, module-resolver refresh, document
    /// chunking, and (optionally) eager chunk embedding.
    pub fn index_workspace(&self) -> Result<()> {
        let started = std::time::Instant::now();
        {
            let mut trigram = self.trigram.write().unwrap();
            trigram.build(|done, total| {
                if done % 500 == 0 {
                    debug!(done, total, "trigram build progress");
                }
            });
            self.graph.analyzer().resolver.set_files(trigram.known_paths());
        }
        self.generation.fetch_add(1, Ordering::Relaxed);

        let paths = self.trigram.read().unwrap().known_paths();
        let mut chunked = 0usize;
        for path in &paths {
            if LanguageId::from_path(path).is_code() {
                continue;
            }
            if self.chunk_document_file(path)? {
                chunked += 1;
            }
        }

        if self.config.vector.eager_doc_embedding {
            let chunks = self.store.all_chunks()?;
            if let Err(e) = embed::embed_chunks(self.provider.as_ref(), &self.pack, &self.store, &chunks)
            {
                warn!(error = %e, "eager embedding failed");
            }
            self.rebuild_hnsw();
        }

        self.store.prune_ghosts(self.config.ghost_max_age_secs)?;
        self.evidence.purge_expired()?;
        info!(
            files = paths.len(),
            documents = chunked,
            time_ms = started.elapsed().as_millis() as u64,
            "workspace indexed"
        );
        Ok(())
    }

    /// Chunk one document file into the store. Returns false for non-docs.
    fn chunk_document_file(&self, path: &str) -> Result<bool> {
        let kind = DocKind::from_path(path);
        let abs = self.root.join(path);
        let Ok(raw) = std::fs::read_to_string(&abs) else {
            return Ok(false);
        };
        let doc = &self.config.document;
        let (text, truncated) = chunker::sample_document(&raw, doc.max_bytes, doc.head_bytes, doc.tail_bytes);
        if truncated {
            debug!(path, "document sampled head+tail before chunking");
        }
        let chunks = chunker::chunk_document(path, &text, kind, &self.chunk_options);
        if chunks.is_empty() {
            return Ok(false);
        }
        self.store.replace_chunks(path, &chunks)?;
        // Summaries are cheap derivations keyed by content hash; unchanged
        // chunks skip the write.
        for chunk in &chunks {
            let preview = preview_of(&chunk.text, 200);
            self.store.upsert_summary(&chunk.id, "preview", &preview, &chunk.content_hash)?;
            let summary = summarize_chunk(&chunk.section_path, &chunk.text);
            self.store.upsert_summary(&chunk.id, "summary", &summary, &chunk.content_hash)?;
        }
        Ok(true)
    }

    /// Incremental single-file refresh (watcher / queue handler).
    pub fn reindex_file(&self, path: &str) -> Result<()> {
        let abs = self.root.join(path);
        let Ok(meta) = std::fs::metadata(&abs) else {
            self.remove_file(path);
            return Ok(());
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if let Ok(content) = std::fs::read_to_string(&abs) {
            self.trigram.write().unwrap().index_file(path, &content, mtime);
        }
        self.graph.invalidate(path, true);
        if LanguageId::from_path(path).is_code() {
            self.graph.ensure_lod(LodRequest { path, min_lod: Lod::Skeleton })?;
            // Doc comments double as searchable chunks.
            if let Some(analysis) = self.graph.analyzer().analysis(path) {
                let comments = chunker::comment_chunks(path, &analysis.symbols);
                if !comments.is_empty() {
                    self.store.replace_chunks(path, &comments)?;
                }
            }
        } else {
            self.chunk_document_file(path)?;
        }
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn remove_file(&self, path: &str) {
        self.trigram.write().unwrap().remove_file(path);
        self.graph.remove(path);
        if let Ok(chunks) = self.store.chunks_for_file(path) {
            for chunk in &chunks {
                self.pack.delete(&chunk.id);
            }
        }
        let _ = self.store.delete_file(path);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    fn rebuild_hnsw(&self) {
        if !self.config.vector.hnsw_enabled {
            return;
        }
        let mut index = HnswIndex::new(HnswParams {
            m: self.config.vector.hnsw_m,
            ef_construction: self.config.vector.hnsw_ef_construction,
            ef_search: self.config.vector.hnsw_ef_search,
        });
        for id in self.pack.live_ids() {
            if let Some(vector) = self.pack.get(&id) {
                index.insert(&id, vector);
            }
        }
        debug!(vectors = index.len(), "hnsw index rebuilt");
        *self.hnsw.write().unwrap() = Some(index);
    }

    // -----------------------------------------------------------------------
    // Background machinery
    // -----------------------------------------------------------------------

    /// Start the index queue, the watcher, and the debounced persistence
    /// thread. Idempotent per engine.
    pub fn start_background(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let queue = Arc::new(IndexQueue::start(
            2,
            Arc::new(move |task| {
                let Some(engine) = weak.upgrade() else {
                    return Err("engine gone".to_string());
                };
                match task.kind {
                    TaskKind::Reindex => engine.reindex_file(&task.path).map_err(|e| e.to_string()),
                    TaskKind::Remove => {
                        engine.remove_file(&task.path);
                        Ok(())
                    }
                }
            }),
        ));
        *self.queue.lock().unwrap() = Some(Arc::clone(&queue));

        let change_queue = Arc::clone(&queue);
        let remove_queue = Arc::clone(&queue);
        let config_queue = queue;
        let watcher = start_watcher(
            &self.root,
            WatchHooks {
                on_change: Box::new(move |path| {
                    change_queue.submit(path, Priority::High, TaskKind::Reindex);
                }),
                on_remove: Box::new(move |path| {
                    remove_queue.submit(path, Priority::High, TaskKind::Remove);
                }),
                on_config_change: Box::new(move |path| {
                    // Config drift re-runs the cheap part of the build.
                    config_queue.submit(path, Priority::Low, TaskKind::Reindex);
                }),
            },
        );
        *self.watcher.lock().unwrap() = watcher;

        let weak = Arc::downgrade(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(PERSIST_DEBOUNCE);
            let Some(engine) = weak.upgrade() else { return };
            if engine.disposed.load(Ordering::Relaxed) {
                return;
            }
            engine.trigram.read().unwrap().persist_if_dirty(&engine.cache_dir);
            if let Err(e) = engine.pack.flush_if_dirty() {
                warn!(error = %e, "pack flush failed");
            }
        });
    }

    /// Async-safe teardown: stop the queue and watcher, persist everything.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(queue) = self.queue.lock().unwrap().take() {
            queue.dispose();
        }
        *self.watcher.lock().unwrap() = None;
        self.trigram.read().unwrap().persist_if_dirty(&self.cache_dir);
        if let Err(e) = self.pack.flush_if_dirty() {
            warn!(error = %e, "pack flush on dispose failed");
        }
    }

    pub fn activity_snapshot(&self) -> Option<crate::indexer::ActivitySnapshot> {
        self.queue.lock().unwrap().as_ref().map(|q| q.activity_snapshot())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ucg: self.graph.get_stats(),
            lod: self.graph.analyzer().promotion_stats(),
            trigram: self.trigram.read().unwrap().stats(),
            pack_health: self.pack.health(),
            store_ephemeral: self.store.is_ephemeral(),
            activity: self.activity_snapshot(),
        }
    }

    // -----------------------------------------------------------------------
    // Hybrid search
    // -----------------------------------------------------------------------

    /// Lexical lane: trigram recall, BM25F precision over filename, symbol
    /// definitions, and skeleton content, with the call-graph boost.
    fn lexical_lane(&self, query: &str) -> Vec<LaneHit> {
        let depth = self.config.search.rrf_depth;
        let recall = self.trigram.read().unwrap().search(query, depth);
        if recall.is_empty() {
            return Vec::new();
        }

        let mut docs = Vec::with_capacity(recall.len());
        let mut signals = std::collections::HashMap::new();
        for hit in recall.iter().take(16) {
            // Skeleton-level analysis for the precision fields; documents
            // have no skeleton tier and rank on filename + raw content.
            let analysis = if LanguageId::from_path(&hit.path).is_code() {
                let _ = self
                    .graph
                    .ensure_lod(LodRequest { path: &hit.path, min_lod: Lod::Skeleton });
                self.graph.analyzer().analysis(&hit.path)
            } else {
                None
            };
            let filename = hit.path.rsplit('/').next().unwrap_or(&hit.path).to_string();
            let symbols = analysis
                .as_ref()
                .map(|a| {
                    a.symbols
                        .iter()
                        .map(|s| s.signature.clone())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            let content = analysis
                .and_then(|a| a.skeleton)
                .unwrap_or_else(|| self.read_head(&hit.path, 4096));
            docs.push(RankDoc {
                id: hit.path.clone(),
                fields: vec![
                    (FieldType::Filename, filename),
                    (FieldType::SymbolDefinition, symbols),
                    (FieldType::Content, content),
                ],
            });
            // Strongest symbol signal of the file carries the boost.
            if let Some(best) = self
                .graph
                .call_signals(&hit.path)
                .into_values()
                .max_by_key(|s| s.in_degree)
            {
                signals.insert(hit.path.clone(), best);
            }
        }

        let ranked = Bm25fRanker::new(&self.config.search).rank(query, &docs, &signals);
        if ranked.is_empty() {
            // BM25F can be empty when the query only matches trigram-level
            // fragments; fall back to recall order.
            return recall
                .into_iter()
                .map(|h| LaneHit { id: h.path, score: h.score, lane: Lane::Lexical })
                .collect();
        }
        ranked
            .into_iter()
            .map(|h| LaneHit { id: h.id, score: h.score, lane: Lane::Lexical })
            .collect()
    }

    /// Vector lane over embedded chunks; ids are mapped back to files.
    fn vector_lane(&self, query: &str) -> Vec<LaneHit> {
        if self.pack.is_empty() {
            return Vec::new();
        }
        let Ok(embedded) = self.provider.embed(&[query]) else {
            return Vec::new();
        };
        let query_vec = &embedded[0];
        let depth = self.config.search.rrf_depth;

        let chunk_hits: Vec<(String, f32)> = {
            let guard = self.hnsw.read().unwrap();
            match guard.as_ref() {
                Some(index) if self.config.vector.hnsw_enabled => index.search(query_vec, depth),
                _ => self.pack.search_flat(query_vec, depth),
            }
        };

        // Collapse chunk hits to their owning file, best score wins.
        let mut per_file: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        for (chunk_id, score) in chunk_hits {
            let Ok(Some(chunk)) = self.store.chunk(&chunk_id) else { continue };
            let entry = per_file.entry(chunk.file).or_insert(f64::MIN);
            *entry = entry.max(score as f64);
        }
        let mut hits: Vec<LaneHit> = per_file
            .into_iter()
            .map(|(file, score)| LaneHit { id: file, score, lane: Lane::Vector })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits
    }

    fn read_head(&self, path: &str, cap: usize) -> String {
        let Ok(raw) = std::fs::read_to_string(self.root.join(path)) else {
            return String::new();
        };
        if raw.len() <= cap {
            return raw;
        }
        let mut end = cap;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        raw[..end].to_string()
    }

    /// The full pipeline: lanes → RRF → MMR → clusters → budget → pack.
    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        if query.trim().is_empty() {
            return Err(EngineError::InvalidArgs("query must not be empty".into()));
        }
        let started = std::time::Instant::now();
        let check_deadline = |stage: &str| -> Result<()> {
            if let Some(ms) = options.timeout_ms {
                if started.elapsed().as_millis() as u64 > ms {
                    return Err(EngineError::Timeout(format!(
                        "search exceeded {ms} ms during {stage}"
                    )));
                }
            }
            Ok(())
        };

        let lexical = self.lexical_lane(query);
        check_deadline("lexical lane")?;
        let vector = self.vector_lane(query);
        check_deadline("vector lane")?;
        let lanes: Vec<Vec<LaneHit>> = [lexical, vector]
            .into_iter()
            .filter(|lane| !lane.is_empty())
            .collect();
        let fused = rrf_fuse(&lanes, self.config.search.rrf_k, self.config.search.rrf_depth);
        // Clusters are code context; document hits stay in the docs section
        // of the evidence pack.
        let code_only: Vec<FusedHit> = fused
            .iter()
            .filter(|h| LanguageId::from_path(&h.id).is_code())
            .cloned()
            .collect();
        let diversified = mmr_diversify(
            &code_only,
            self.config.search.mmr_lambda,
            options.limit.max(1).min(MAX_SEEDS),
            path_similarity,
        );

        // Seeds become clusters around their best-matching symbol.
        let query_tokens: Vec<String> = crate::trigram::normalize(query)
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();
        if options.expand_relationships {
            // Call/type containers need the full tier on the seed files.
            for hit in &diversified {
                if LanguageId::from_path(&hit.id).is_code() {
                    let _ = self
                        .graph
                        .ensure_lod(LodRequest { path: &hit.id, min_lod: Lod::FullAst });
                }
            }
        }
        let mut clusters: Vec<SearchCluster> = diversified
            .iter()
            .map(|hit| {
                let symbol = self.best_symbol_for(&hit.id, &query_tokens);
                let preview = self.preview_for(&hit.id, symbol.as_deref());
                cluster::build_cluster(
                    &self.graph,
                    ClusterSeed {
                        file: hit.id.clone(),
                        symbol,
                        score: hit.score,
                        preview,
                    },
                    options.expand_relationships,
                )
            })
            .collect();
        check_deadline("cluster build")?;
        cluster::rank_clusters(&mut clusters);

        let (clusters, budget) = apply_token_budget(clusters, options.token_budget);

        let recommended: Vec<String> = clusters
            .first()
            .map(|c| {
                cluster::recommended_expansions(c)
                    .into_iter()
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let pack = self.build_pack(query, options, &clusters, &fused)?;
        let pack_id = pack.pack_id.clone();
        self.evidence.put(&pack)?;

        Ok(SearchResponse {
            clusters,
            expansion_hints: ExpansionHints { recommended_expansions: recommended },
            budget,
            pack_id,
        })
    }

    fn best_symbol_for(&self, path: &str, query_tokens: &[String]) -> Option<String> {
        let analysis = self.graph.analyzer().analysis(path)?;
        let lowered: Vec<(String, String)> = analysis
            .symbols
            .iter()
            .map(|s| (s.name.clone(), s.name.to_lowercase()))
            .collect();
        for token in query_tokens {
            if let Some((name, _)) = lowered.iter().find(|(_, l)| l.contains(token.as_str())) {
                return Some(name.clone());
            }
        }
        analysis.symbols.first().map(|s| s.name.clone())
    }

    fn preview_for(&self, path: &str, symbol: Option<&str>) -> String {
        if let (Some(symbol), Some(analysis)) = (symbol, self.graph.analyzer().analysis(path)) {
            if let Some(sym) = analysis.symbols.iter().find(|s| s.name == symbol) {
                return sym.signature.clone();
            }
        }
        preview_of(&self.read_head(path, 400), 200)
    }

    /// Docs lane for evidence items: chunk-level token overlap plus vector
    /// scores when embeddings exist.
    fn doc_items(
        &self,
        query: &str,
        limit: usize,
        include_comments: bool,
    ) -> Result<Vec<EvidenceItem>> {
        let tokens: Vec<String> = crate::trigram::normalize(query)
            .split(' ')
            .filter(|t| t.len() >= 2)
            .map(|t| t.to_string())
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.store.all_chunks()?;
        let query_vec = self.provider.embed(&[query]).ok().map(|mut v| v.remove(0));
        let mut scored: Vec<(f64, &ChunkRow)> = chunks
            .iter()
            .filter_map(|chunk| {
                if !include_comments && chunk.kind == "code_comment" {
                    return None;
                }
                let text = chunk.text.to_lowercase();
                let overlap = tokens.iter().filter(|t| text.contains(t.as_str())).count();
                if overlap == 0 {
                    return None;
                }
                let lexical = overlap as f64 / tokens.len() as f64;
                let vector = match (&query_vec, self.pack.get(&chunk.id)) {
                    (Some(q), Some(v)) => crate::vecpack::cosine(q, &v) as f64,
                    _ => 0.0,
                };
                Some((lexical + vector, chunk))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(rank, (score, chunk))| EvidenceItem {
                role: if rank == 0 { ItemRole::Result } else { ItemRole::Evidence },
                section: ItemSection::Docs,
                rank,
                chunk_id: Some(chunk.id.clone()),
                file: chunk.file.clone(),
                symbol: None,
                preview: preview_of(&chunk.text, 200),
                range: chunk.range,
                score: ScoreBreakdown { lexical: Some(score), vector: None, fused: score },
            })
            .collect())
    }

    fn build_pack(
        &self,
        query: &str,
        options: &SearchOptions,
        clusters: &[SearchCluster],
        fused: &[FusedHit],
    ) -> Result<EvidencePack> {
        let mut items: Vec<EvidenceItem> = Vec::new();
        if options.include_docs {
            items.extend(self.doc_items(query, options.limit.max(3), options.include_comments)?);
        }
        for (rank, cluster) in clusters.iter().enumerate() {
            let fused_hit = fused.iter().find(|f| f.id == cluster.seed.file);
            let range = cluster
                .seed
                .symbol
                .as_deref()
                .and_then(|symbol| {
                    self.graph
                        .analyzer()
                        .analysis(&cluster.seed.file)
                        .and_then(|a| a.symbols.iter().find(|s| s.name == symbol).map(|s| s.range))
                })
                .unwrap_or_default();
            items.push(EvidenceItem {
                role: if rank == 0 { ItemRole::Result } else { ItemRole::Evidence },
                section: ItemSection::Code,
                rank,
                chunk_id: None,
                file: cluster.seed.file.clone(),
                symbol: cluster.seed.symbol.clone(),
                preview: cluster.seed.preview.clone(),
                range,
                score: ScoreBreakdown {
                    lexical: fused_hit
                        .and_then(|f| f.lane_ranks.get("lexical").map(|r| 1.0 / *r as f64)),
                    vector: fused_hit
                        .and_then(|f| f.lane_ranks.get("vector").map(|r| 1.0 / *r as f64)),
                    fused: cluster.relevance_score,
                },
            });
        }

        let now = now_secs();
        Ok(EvidencePack {
            pack_id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            created_at: now,
            expires_at: now + self.evidence.ttl_secs(),
            root_fingerprint: self.fingerprint(),
            options: serde_json::to_value(options)?,
            meta: serde_json::json!({
                "clusterCount": clusters.len(),
                "fusedCandidates": fused.len(),
            }),
            items,
        })
    }

    /// Look up a pack for cursor-paged follow-ups.
    pub fn pack_lookup(&self, pack_id: &str) -> Result<PackLookup> {
        self.evidence.get(pack_id, &self.fingerprint())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read file content for a response. Full views of sensitive files are
    /// blocked unless allowed by the call or the config.
    pub fn read_code(
        &self,
        path: &str,
        range: Option<(usize, usize)>,
        full: bool,
        allow_sensitive: bool,
    ) -> Result<String> {
        if full && is_sensitive_path(path) && !allow_sensitive && !self.config.allow_sensitive {
            return Err(EngineError::Blocked(format!("sensitive file {path}")));
        }
        let abs = crate::types::validate_path(&self.root, path)
            .map_err(|e| EngineError::NotFound(format!("{path}: {e}")))?;
        let raw = std::fs::read_to_string(abs)?;
        let text = match range {
            Some((start, end)) => {
                let lines: Vec<&str> = raw.lines().collect();
                let start = start.max(1);
                let end = end.min(lines.len());
                if start > end {
                    return Err(EngineError::InvalidArgs(format!(
                        "line range {start}..{end} out of bounds"
                    )));
                }
                lines[start - 1..end].join("\n")
            }
            None => raw,
        };
        if full {
            Ok(text)
        } else {
            Ok(preview_of(&text, 600))
        }
    }

    /// Files under any of the given paths (path prefixes), sensitive-aware.
    pub fn files_under(&self, prefixes: &[String]) -> Vec<String> {
        let trigram = self.trigram.read().unwrap();
        trigram
            .known_paths()
            .into_iter()
            .filter(|p| {
                prefixes.is_empty()
                    || prefixes.iter().any(|prefix| {
                        prefix == "." || p == prefix || p.starts_with(&format!("{prefix}/"))
                    })
            })
            .collect()
    }

    /// Workspace files that are sensitive under the policy; used by pillars
    /// to refuse full-view path reads.
    pub fn sensitive_files_under(&self, prefixes: &[String]) -> Vec<String> {
        // The trigram walk skips dotfiles, so policy paths like `.env` are
        // checked on disk instead.
        let mut hits: Vec<String> = self
            .files_under(prefixes)
            .into_iter()
            .filter(|p| is_sensitive_path(p))
            .collect();
        for prefix in prefixes {
            let dir = if prefix == "." { self.root.clone() } else { self.root.join(prefix) };
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    if let Some(rel) = crate::types::rel_path_of(&self.root, &entry.path()) {
                        if is_sensitive_path(&rel) && !hits.contains(&rel) {
                            hits.push(rel);
                        }
                    }
                }
            }
        }
        hits.sort();
        hits
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Heading trail plus the first sentence of the chunk body.
fn summarize_chunk(section_path: &str, text: &str) -> String {
    let first_sentence = text
        .lines()
        .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .map(|l| {
            let t = l.trim();
            match t.find(". ") {
                Some(pos) => &t[..=pos],
                None => t,
            }
        })
        .unwrap_or("");
    if section_path.is_empty() {
        first_sentence.to_string()
    } else {
        format!("{section_path} — {first_sentence}")
    }
}

/// First `cap` characters on a char boundary, whitespace-normalized tail.
pub fn preview_of(text: &str, cap: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= cap {
        return trimmed.to_string();
    }
    let mut end = cap;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
