//! Pillar orchestration.
//!
//! A pillar call (`explore`, `understand`, `change`, `manage`, `write`)
//! parses into an intent, runs through the internal tool registry, and comes
//! back as a `{success, status, data, pack, next, guidance}` envelope. Every
//! step is logged on the request's [`OrchestrationContext`]; the guidance
//! generator reads that log to propose next steps and warnings.

use crate::engine::{Engine, SearchOptions, DEFAULT_TOKEN_BUDGET};
use crate::error::{EngineError, Result};
use crate::evidence::{content_targets, page_items, Cursor, ItemSection, PackLookup};
use crate::types::content_hash;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentCategory {
    Explore,
    Understand,
    Change,
    Manage,
    Write,
}

impl IntentCategory {
    pub fn parse(verb: &str) -> Option<IntentCategory> {
        match verb {
            "explore" => Some(IntentCategory::Explore),
            "understand" => Some(IntentCategory::Understand),
            "change" => Some(IntentCategory::Change),
            "manage" => Some(IntentCategory::Manage),
            "write" => Some(IntentCategory::Write),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParsedIntent {
    pub category: IntentCategory,
    /// Query terms or explicit paths the call is about.
    pub targets: Vec<String>,
    /// Constraints like `view=full` or `depth=deep`.
    pub constraints: Vec<String>,
    pub confidence: f64,
}

/// Derive the intent from the verb and its arguments. Confidence drops when
/// the call is ambiguous (neither query nor paths).
pub fn parse_intent(verb: &str, args: &Value) -> Result<ParsedIntent> {
    let category = IntentCategory::parse(verb)
        .ok_or_else(|| EngineError::InvalidArgs(format!("unknown pillar verb '{verb}'")))?;

    let mut targets = Vec::new();
    if let Some(query) = args.get("query").and_then(|v| v.as_str()) {
        targets.extend(query.split_whitespace().map(|s| s.to_string()));
    }
    if let Some(paths) = args.get("paths").and_then(|v| v.as_array()) {
        targets.extend(paths.iter().filter_map(|p| p.as_str().map(|s| s.to_string())));
    }
    if let Some(path) = args.get("path").and_then(|v| v.as_str()) {
        targets.push(path.to_string());
    }

    let mut constraints = Vec::new();
    if let Some(view) = args.get("view").and_then(|v| v.as_str()) {
        constraints.push(format!("view={view}"));
    }
    if let Some(depth) = args.get("depth").and_then(|v| v.as_str()) {
        constraints.push(format!("depth={depth}"));
    }

    let confidence = if targets.is_empty() { 0.3 } else { 0.9 };
    Ok(ParsedIntent { category, targets, constraints, confidence })
}

// ---------------------------------------------------------------------------
// Orchestration context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct StepRecord {
    pub tool: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
    pub ok: bool,
}

pub struct OrchestrationContext {
    pub request_id: String,
    pub flags: crate::config::FlagSnapshot,
    pub steps: Vec<StepRecord>,
    /// Error codes seen during the request, for guidance warnings.
    pub error_codes: Vec<String>,
    /// Hot-spot files discovered by eager loading.
    pub hotspots: Vec<String>,
}

impl OrchestrationContext {
    pub fn new(flags: crate::config::FlagSnapshot) -> OrchestrationContext {
        OrchestrationContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            flags,
            steps: Vec::new(),
            error_codes: Vec::new(),
            hotspots: Vec::new(),
        }
    }

    pub fn ran(&self, tool: &str) -> bool {
        self.steps.iter().any(|s| s.tool == tool && s.ok)
    }
}

// ---------------------------------------------------------------------------
// Internal tool registry
// ---------------------------------------------------------------------------

pub type ToolHandler =
    Arc<dyn Fn(&Engine, &mut OrchestrationContext, &Value) -> Result<Value> + Send + Sync>;

pub struct InternalToolRegistry {
    tools: HashMap<&'static str, ToolHandler>,
}

impl InternalToolRegistry {
    pub fn with_defaults() -> InternalToolRegistry {
        let mut registry = InternalToolRegistry { tools: HashMap::new() };
        registry.register("search_project", Arc::new(tool_search_project));
        registry.register("doc_search", Arc::new(tool_doc_search));
        registry.register("read_code", Arc::new(tool_read_code));
        registry.register("analyze_relationship", Arc::new(tool_analyze_relationship));
        registry.register("file_profiler", Arc::new(tool_file_profiler));
        registry.register("hotspot_detector", Arc::new(tool_hotspot_detector));
        registry.register("edit_coordinator", Arc::new(tool_edit_coordinator));
        registry
    }

    pub fn register(&mut self, name: &'static str, handler: ToolHandler) {
        self.tools.insert(name, handler);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tools.keys().copied().collect();
        names.sort();
        names
    }

    /// Dispatch a tool, timing it into the context's step log.
    pub fn call(
        &self,
        name: &str,
        engine: &Engine,
        context: &mut OrchestrationContext,
        args: &Value,
    ) -> Result<Value> {
        let handler = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("internal tool '{name}'")))?;
        let started = Instant::now();
        let result = handler(engine, context, args);
        let record = StepRecord {
            tool: name.to_string(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            ok: result.is_ok(),
        };
        if let Err(e) = &result {
            context.error_codes.push(e.code().to_string());
        }
        context.steps.push(record);
        result
    }
}

// ---------------------------------------------------------------------------
// Internal tools
// ---------------------------------------------------------------------------

fn search_options_from(args: &Value) -> SearchOptions {
    let limits = args.get("limits").cloned().unwrap_or(Value::Null);
    SearchOptions {
        // `limits.maxResults` only windows the response page; the pack keeps
        // the full cluster set for cursor follow-ups.
        limit: args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize).unwrap_or(10),
        expand_relationships: args
            .get("expandRelationships")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        token_budget: limits
            .get("maxChars")
            .and_then(|v| v.as_u64())
            .map(|v| (v as usize) / 4)
            .unwrap_or(DEFAULT_TOKEN_BUDGET),
        include_docs: args
            .get("include")
            .and_then(|i| i.get("docs"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        include_comments: args
            .get("include")
            .and_then(|i| i.get("comments"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        allow_sensitive: args.get("allowSensitive").and_then(|v| v.as_bool()).unwrap_or(false),
        timeout_ms: limits.get("timeoutMs").and_then(|v| v.as_u64()),
    }
}

fn tool_search_project(
    engine: &Engine,
    _context: &mut OrchestrationContext,
    args: &Value,
) -> Result<Value> {
    let query = args
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidArgs("search_project requires 'query'".into()))?;
    let response = engine.search(query, &search_options_from(args))?;
    Ok(serde_json::to_value(response)?)
}

fn tool_doc_search(
    engine: &Engine,
    _context: &mut OrchestrationContext,
    args: &Value,
) -> Result<Value> {
    let query = args
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidArgs("doc_search requires 'query'".into()))?;
    // Document-only view of the pack pipeline: run the search, keep docs.
    let response = engine.search(query, &search_options_from(args))?;
    let pack = match engine.pack_lookup(&response.pack_id)? {
        PackLookup::Hit(pack) => pack,
        _ => return Err(EngineError::NotFound("pack vanished mid-request".into())),
    };
    let docs: Vec<Value> = pack
        .items_in(ItemSection::Docs)
        .into_iter()
        .map(|i| serde_json::to_value(i).unwrap_or(Value::Null))
        .collect();
    Ok(json!({ "docs": docs, "packId": response.pack_id }))
}

fn tool_read_code(
    engine: &Engine,
    _context: &mut OrchestrationContext,
    args: &Value,
) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidArgs("read_code requires 'path'".into()))?;
    let full = args.get("view").and_then(|v| v.as_str()).map(|v| v == "full").unwrap_or(false);
    let range = match (
        args.get("startLine").and_then(|v| v.as_u64()),
        args.get("endLine").and_then(|v| v.as_u64()),
    ) {
        (Some(start), Some(end)) => Some((start as usize, end as usize)),
        _ => None,
    };
    let allow = args.get("allowSensitive").and_then(|v| v.as_bool()).unwrap_or(false);
    let content = engine.read_code(path, range, full, allow)?;
    Ok(json!({
        "path": path,
        "tokens": engine.tokenizer.count_tokens(&content),
        "content": content,
        "contentHash": content_hash(&content),
        "view": if full { "full" } else { "preview" },
    }))
}

fn tool_analyze_relationship(
    engine: &Engine,
    _context: &mut OrchestrationContext,
    args: &Value,
) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidArgs("analyze_relationship requires 'path'".into()))?;
    engine
        .graph
        .ensure_lod(crate::ucg::LodRequest { path, min_lod: crate::types::Lod::FullAst })?;

    match args.get("symbol").and_then(|v| v.as_str()) {
        Some(symbol) => Ok(json!({
            "callers": engine.graph.callers_of(path, symbol),
            "callees": engine.graph.callees_of(path, symbol),
            "typeFamily": engine.graph.type_family_of(path, symbol),
        })),
        None => {
            let node = engine
                .graph
                .get_node(path)
                .ok_or_else(|| EngineError::NotFound(format!("file {path}")))?;
            Ok(json!({ "imports": node.imports, "importedBy": node.imported_by }))
        }
    }
}

fn tool_file_profiler(
    engine: &Engine,
    _context: &mut OrchestrationContext,
    args: &Value,
) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidArgs("file_profiler requires 'path'".into()))?;
    engine
        .graph
        .ensure_lod(crate::ucg::LodRequest { path, min_lod: crate::types::Lod::Skeleton })?;
    let node = engine
        .graph
        .get_node(path)
        .ok_or_else(|| EngineError::NotFound(format!("file {path}")))?;
    let analysis = engine.graph.analyzer().analysis(path);
    Ok(json!({
        "path": path,
        "lod": node.lod,
        "symbolCount": node.symbol_count,
        "imports": node.imports,
        "importedBy": node.imported_by,
        "skeleton": analysis.and_then(|a| a.skeleton),
    }))
}

fn tool_hotspot_detector(
    engine: &Engine,
    context: &mut OrchestrationContext,
    args: &Value,
) -> Result<Value> {
    let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
    // Importer counts only exist once dependency resolution has run.
    for path in engine.files_under(&[]).iter().take(200) {
        if crate::types::LanguageId::from_path(path).is_code() {
            let _ = engine
                .graph
                .ensure_lod(crate::ucg::LodRequest { path, min_lod: crate::types::Lod::Skeleton });
        }
    }
    let mut counted: Vec<(String, usize)> = engine
        .files_under(&[])
        .into_iter()
        .map(|path| {
            let importers = engine.graph.analyzer().importers_of(&path).len();
            (path, importers)
        })
        .filter(|(_, n)| *n > 0)
        .collect();
    counted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counted.truncate(limit);
    context.hotspots = counted.iter().map(|(p, _)| p.clone()).collect();
    Ok(json!({
        "hotspots": counted
            .iter()
            .map(|(path, importers)| json!({ "path": path, "importers": importers }))
            .collect::<Vec<_>>()
    }))
}

/// Edit resolver: locate a snippet inside a file and return an edit plan.
/// Zero candidates → `no_match` with guidance; several → `ambiguous_match`
/// with a narrower suggestion; content drift → `hash_mismatch`.
fn tool_edit_coordinator(
    engine: &Engine,
    _context: &mut OrchestrationContext,
    args: &Value,
) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidArgs("edit_coordinator requires 'path'".into()))?;
    let snippet = args
        .get("snippet")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidArgs("edit_coordinator requires 'snippet'".into()))?;
    if snippet.is_empty() {
        return Err(EngineError::InvalidArgs("snippet must not be empty".into()));
    }

    let content = engine.read_code(path, None, true, true)?;
    if let Some(expected) = args.get("expectedHash").and_then(|v| v.as_str()) {
        let actual = content_hash(&content);
        if actual != expected {
            return Err(EngineError::HashMismatch(format!(
                "{path} drifted since planning (expected {expected}, found {actual})"
            )));
        }
    }

    let matches: Vec<usize> = content
        .match_indices(snippet)
        .map(|(byte, _)| content[..byte].matches('\n').count() + 1)
        .collect();
    match matches.len() {
        0 => Err(EngineError::NoMatch(format!(
            "snippet not found in {path}; re-read the file and anchor on an exact line"
        ))),
        1 => {
            let start_line = matches[0];
            let end_line = start_line + snippet.matches('\n').count();
            Ok(json!({
                "path": path,
                "startLine": start_line,
                "endLine": end_line,
                "contentHash": content_hash(&content),
            }))
        }
        n => Err(EngineError::AmbiguousMatch(format!(
            "snippet occurs {n} times in {path} (lines {:?}); narrow the range or extend the snippet",
            matches
        ))),
    }
}

// ---------------------------------------------------------------------------
// Eager loading
// ---------------------------------------------------------------------------

/// Pre-fetches guarded by intent: hot-spots for `understand`, profiles for
/// path-targeted exploration, and dependency/call-graph expansion when the
/// request is deep or the workspace is hot-spot heavy. Explicit include /
/// exclude flags always win.
pub struct EagerLoadingStrategy;

impl EagerLoadingStrategy {
    pub fn run(
        engine: &Engine,
        registry: &InternalToolRegistry,
        context: &mut OrchestrationContext,
        intent: &ParsedIntent,
        args: &Value,
    ) {
        if !context.flags.flags.adaptive_flow_enabled {
            return;
        }
        let include = args.get("include").cloned().unwrap_or(Value::Null);
        let excluded =
            |name: &str| include.get(name).and_then(|v| v.as_bool()).is_some_and(|v| !v);

        if intent.category == IntentCategory::Understand && !excluded("hotspots") {
            let _ = registry.call("hotspot_detector", engine, context, &json!({ "limit": 8 }));
        }

        if intent.category == IntentCategory::Explore && !excluded("profiles") {
            for target in intent.targets.iter().take(3) {
                if target.contains('/') || target.contains('.') {
                    let _ = registry
                        .call("file_profiler", engine, context, &json!({ "path": target }));
                }
            }
        }

        let deep = intent.constraints.iter().any(|c| c == "depth=deep");
        if (deep || context.hotspots.len() >= 5) && !excluded("dependencies") {
            if let Some(path) = context.hotspots.first().cloned() {
                let _ = registry
                    .call("analyze_relationship", engine, context, &json!({ "path": path }));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Guidance
// ---------------------------------------------------------------------------

pub struct GuidanceGenerator;

impl GuidanceGenerator {
    /// Structured next-step payload from the request history.
    pub fn generate(context: &OrchestrationContext, intent: &ParsedIntent, targets: &[String]) -> Value {
        let mut next_steps: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        if context.ran("search_project") && !context.ran("read_code") {
            next_steps.push("read the top result with view=full before editing".to_string());
        }
        if context.ran("hotspot_detector") && !context.ran("analyze_relationship") {
            next_steps.push("analyze_relationship on a hotspot to see its blast radius".to_string());
        }
        if intent.category == IntentCategory::Change && !context.ran("edit_coordinator") {
            next_steps.push("resolve the edit target before applying a patch".to_string());
        }

        // High-risk: a change touching many files at once.
        if intent.category == IntentCategory::Change && targets.len() > 3 {
            warnings.push(format!("high risk: change touches {} targets", targets.len()));
        }
        // Hot-spot overlap: editing a file many others depend on.
        let overlap: Vec<&String> =
            targets.iter().filter(|t| context.hotspots.contains(t)).collect();
        if !overlap.is_empty() {
            warnings.push(format!(
                "hotspot overlap: {} are widely imported",
                overlap.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
        // Integrity conflicts seen during the request.
        if context.error_codes.iter().any(|c| c == "hash_mismatch") {
            warnings.push("integrity conflict: file drifted between plan and apply".to_string());
        }

        json!({
            "nextSteps": next_steps,
            "warnings": warnings,
            "confidence": intent.confidence,
        })
    }
}

// ---------------------------------------------------------------------------
// Pillar dispatch
// ---------------------------------------------------------------------------

pub struct Pillar {
    registry: InternalToolRegistry,
}

impl Default for Pillar {
    fn default() -> Self {
        Self::new()
    }
}

impl Pillar {
    pub fn new() -> Pillar {
        Pillar { registry: InternalToolRegistry::with_defaults() }
    }

    pub fn registry(&self) -> &InternalToolRegistry {
        &self.registry
    }

    /// Entry point for a pillar verb. Never panics; errors become the
    /// structured envelope.
    pub fn handle(&self, engine: &Engine, verb: &str, args: &Value) -> Value {
        let mut context = OrchestrationContext::new(engine.config.flag_snapshot());
        match self.dispatch(engine, &mut context, verb, args) {
            Ok(value) => value,
            Err(e) => {
                let wire = e.to_wire();
                let guidance = parse_intent(verb, args)
                    .map(|intent| {
                        GuidanceGenerator::generate(&context, &intent, &intent.targets)
                    })
                    .unwrap_or(Value::Null);
                json!({
                    "success": false,
                    "status": wire.status,
                    "error": wire,
                    "guidance": guidance,
                })
            }
        }
    }

    fn dispatch(
        &self,
        engine: &Engine,
        context: &mut OrchestrationContext,
        verb: &str,
        args: &Value,
    ) -> Result<Value> {
        let intent = parse_intent(verb, args)?;
        debug!(verb, confidence = intent.confidence, request = %context.request_id, "pillar call");

        EagerLoadingStrategy::run(engine, &self.registry, context, &intent, args);

        let result = match intent.category {
            IntentCategory::Explore => self.explore(engine, context, args),
            IntentCategory::Understand => self.understand(engine, context, args),
            IntentCategory::Change => self.change(engine, context, args),
            IntentCategory::Manage => self.manage(engine, context, args),
            IntentCategory::Write => self.write(engine, context, args),
        }?;

        let mut envelope = result;
        if let Some(obj) = envelope.as_object_mut() {
            obj.entry("success").or_insert(json!(true));
            obj.entry("status").or_insert(json!("ok"));
            obj.insert(
                "guidance".to_string(),
                GuidanceGenerator::generate(context, &intent, &intent.targets),
            );
        }
        Ok(envelope)
    }

    /// `explore`: query or path listing, with pack-addressed cursor paging.
    fn explore(
        &self,
        engine: &Engine,
        context: &mut OrchestrationContext,
        args: &Value,
    ) -> Result<Value> {
        // Follow-up on an existing pack: no search tools run at all.
        if let Some(pack_id) = args.get("packId").and_then(|v| v.as_str()) {
            return self.explore_follow_up(engine, pack_id, args);
        }

        if let Some(query) = args.get("query").and_then(|v| v.as_str()) {
            let search = self.registry.call("search_project", engine, context, args)?;
            let pack_id = search
                .get("packId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::Fatal("search response missing packId".into()))?
                .to_string();
            let pack = match engine.pack_lookup(&pack_id)? {
                PackLookup::Hit(pack) => pack,
                _ => return Err(EngineError::Fatal("pack vanished mid-request".into())),
            };
            let max_results = args
                .get("limits")
                .and_then(|l| l.get("maxResults"))
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(5);
            let page = page_items(&pack, None, max_results)?;
            return Ok(json!({
                "success": true,
                "status": "ok",
                "data": { "docs": page.docs, "code": page.code },
                "clusters": search.get("clusters"),
                "expansionHints": search.get("expansionHints"),
                "budget": search.get("budget"),
                "pack": { "packId": pack_id, "hit": false },
                "next": { "itemsCursor": page.next_cursor },
                "query": query,
            }));
        }

        // Path-oriented exploration.
        let paths: Vec<String> = args
            .get("paths")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|p| p.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default();
        if paths.is_empty() {
            return Err(EngineError::InvalidArgs("explore needs 'query' or 'paths'".into()));
        }
        let full = args.get("view").and_then(|v| v.as_str()).map(|v| v == "full").unwrap_or(false);
        let allow = args.get("allowSensitive").and_then(|v| v.as_bool()).unwrap_or(false)
            || engine.config.allow_sensitive;
        if full && !allow {
            let sensitive = engine.sensitive_files_under(&paths);
            if !sensitive.is_empty() {
                return Err(EngineError::Blocked(format!(
                    "full view over sensitive files: {}",
                    sensitive.join(", ")
                )));
            }
        }

        let files = engine.files_under(&paths);
        let max_items = args
            .get("limits")
            .and_then(|l| l.get("maxResults"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(50);
        let mut code = Vec::new();
        for path in files.iter().take(max_items) {
            let entry = self.registry.call(
                "read_code",
                engine,
                context,
                &json!({ "path": path, "view": if full { "full" } else { "preview" }, "allowSensitive": allow }),
            )?;
            code.push(entry);
        }
        Ok(json!({
            "success": true,
            "status": "ok",
            "data": { "docs": [], "code": code },
            "pack": Value::Null,
            "next": Value::Null,
        }))
    }

    fn explore_follow_up(&self, engine: &Engine, pack_id: &str, args: &Value) -> Result<Value> {
        let pack = match engine.pack_lookup(pack_id)? {
            PackLookup::Hit(pack) => pack,
            PackLookup::Miss => {
                return Err(EngineError::NotFound(format!("pack {pack_id}")));
            }
            PackLookup::Stale(reason) => {
                return Err(EngineError::IndexStale(format!(
                    "pack {pack_id} unusable ({reason}); re-run the query"
                )));
            }
        };

        let cursor_raw = args
            .get("cursor")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::InvalidArgs("pack follow-up requires 'cursor'".into()))?;
        let cursor = Cursor::decode(cursor_raw)?;

        match cursor {
            Cursor::Items { .. } => {
                let max_results = args
                    .get("limits")
                    .and_then(|l| l.get("maxResults"))
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize)
                    .unwrap_or(5);
                let page = page_items(&pack, Some(cursor), max_results)?;
                Ok(json!({
                    "success": true,
                    "status": "ok",
                    "data": { "docs": page.docs, "code": page.code },
                    "pack": { "packId": pack_id, "hit": true },
                    "next": { "itemsCursor": page.next_cursor },
                }))
            }
            Cursor::Content { .. } => {
                let allow =
                    args.get("allowSensitive").and_then(|v| v.as_bool()).unwrap_or(false);
                let mut expanded = Vec::new();
                for item in content_targets(&pack, cursor)? {
                    let content = match &item.chunk_id {
                        Some(chunk_id) => self
                            .chunk_content(engine, chunk_id)?
                            .unwrap_or_else(|| item.preview.clone()),
                        None => engine.read_code(
                            &item.file,
                            (item.range.start_line > 0)
                                .then_some((item.range.start_line, item.range.end_line)),
                            true,
                            allow,
                        )?,
                    };
                    expanded.push(json!({
                        "file": item.file,
                        "range": item.range,
                        "content": content,
                        "contentHash": content_hash(&content),
                    }));
                }
                Ok(json!({
                    "success": true,
                    "status": "ok",
                    "data": { "expanded": expanded },
                    "pack": { "packId": pack_id, "hit": true },
                    "next": Value::Null,
                }))
            }
        }
    }

    fn chunk_content(&self, engine: &Engine, chunk_id: &str) -> Result<Option<String>> {
        Ok(engine.store.chunk(chunk_id)?.map(|c| c.text))
    }

    /// `understand`: expanded search plus the eager hot-spot context.
    fn understand(
        &self,
        engine: &Engine,
        context: &mut OrchestrationContext,
        args: &Value,
    ) -> Result<Value> {
        let mut enriched = args.clone();
        if let Some(obj) = enriched.as_object_mut() {
            obj.insert("expandRelationships".to_string(), json!(true));
        }
        let search = self.registry.call("search_project", engine, context, &enriched)?;
        Ok(json!({
            "success": true,
            "status": "ok",
            "data": {
                "clusters": search.get("clusters"),
                "hotspots": context.hotspots,
                "expansionHints": search.get("expansionHints"),
            },
            "budget": search.get("budget"),
            "pack": { "packId": search.get("packId"), "hit": false },
            "next": Value::Null,
        }))
    }

    /// `change`: resolve the edit target into a plan.
    fn change(
        &self,
        engine: &Engine,
        context: &mut OrchestrationContext,
        args: &Value,
    ) -> Result<Value> {
        let plan = self.registry.call("edit_coordinator", engine, context, args)?;
        Ok(json!({
            "success": true,
            "status": "ok",
            "data": { "plan": plan },
            "pack": Value::Null,
            "next": Value::Null,
        }))
    }

    /// `manage`: stats, invalidation, compaction.
    fn manage(
        &self,
        engine: &Engine,
        _context: &mut OrchestrationContext,
        args: &Value,
    ) -> Result<Value> {
        let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("stats");
        let data = match action {
            "stats" => serde_json::to_value(engine.stats())?,
            "invalidate" => {
                let path = args
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| EngineError::InvalidArgs("invalidate requires 'path'".into()))?;
                let cascade = args.get("cascade").and_then(|v| v.as_bool()).unwrap_or(true);
                let demoted = engine.graph.invalidate(path, cascade);
                json!({ "invalidated": path, "demoted": demoted })
            }
            "compact" => {
                let kept = engine.pack.compact()?;
                json!({ "compacted": true, "liveVectors": kept })
            }
            "reindex" => {
                engine.index_workspace()?;
                serde_json::to_value(engine.stats())?
            }
            other => {
                return Err(EngineError::InvalidArgs(format!("unknown manage action '{other}'")))
            }
        };
        Ok(json!({
            "success": true,
            "status": "ok",
            "data": data,
            "pack": Value::Null,
            "next": Value::Null,
        }))
    }

    /// `write`: plan-only surface — validates the destination and returns
    /// the content hash an applier must present.
    fn write(
        &self,
        engine: &Engine,
        _context: &mut OrchestrationContext,
        args: &Value,
    ) -> Result<Value> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::InvalidArgs("write requires 'path'".into()))?;
        if crate::types::is_sensitive_path(path) && !engine.config.allow_sensitive {
            return Err(EngineError::Blocked(format!("write to sensitive file {path}")));
        }
        let exists = engine.root().join(path).exists();
        let base_hash = if exists {
            Some(content_hash(&engine.read_code(path, None, true, true)?))
        } else {
            None
        };
        Ok(json!({
            "success": true,
            "status": "ok",
            "data": { "path": path, "exists": exists, "baseHash": base_hash },
            "pack": Value::Null,
            "next": Value::Null,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
