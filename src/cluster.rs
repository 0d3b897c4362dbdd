//! Search clusters: a seed hit plus its structural neighborhood.
//!
//! Each cluster carries five relationship containers. The cheap ones
//! (`colocated`, `siblings`) are filled from the symbol index eagerly; the
//! expensive ones (`callers`, `callees`, `typeFamily`) stay `NOT_LOADED`
//! until the caller opts in via `expandRelationships`, and surface in the
//! expansion hints instead. Every container enforces a hard cap and reports
//! `TRUNCATED` with the real total when it overflows.

use crate::types::hex_prefix;
use crate::ucg::{CallEdge, ContextGraph, TypeEdge};
use serde::Serialize;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

pub const COLOCATED_CAP: usize = 10;
pub const SIBLINGS_CAP: usize = 6;
pub const CALL_RELATIONS_CAP: usize = 15;
pub const TYPE_RELATIONS_CAP: usize = 10;

/// Token-estimate constants per section; the cluster estimate is their sum.
const SEED_TOKENS: usize = 200;
const CALL_ITEM_TOKENS: usize = 40;
const TYPE_ITEM_TOKENS: usize = 30;
const COLOCATED_ITEM_TOKENS: usize = 30;
const SIBLING_ITEM_TOKENS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    NotLoaded,
    Loaded,
    Truncated,
    Failed,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipContainer<T: Serialize> {
    pub state: ContainerState,
    pub items: Vec<T>,
    #[serde(rename = "totalCount", skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
}

impl<T: Serialize> RelationshipContainer<T> {
    pub fn not_loaded() -> Self {
        RelationshipContainer { state: ContainerState::NotLoaded, items: Vec::new(), total_count: None }
    }

    pub fn failed() -> Self {
        RelationshipContainer { state: ContainerState::Failed, items: Vec::new(), total_count: None }
    }

    /// Load items under a cap; overflow truncates and records the total.
    pub fn loaded(mut items: Vec<T>, cap: usize) -> Self {
        let total = items.len();
        if total == 0 {
            return RelationshipContainer {
                state: ContainerState::Empty,
                items,
                total_count: Some(0),
            };
        }
        if total > cap {
            items.truncate(cap);
            return RelationshipContainer {
                state: ContainerState::Truncated,
                items,
                total_count: Some(total),
            };
        }
        RelationshipContainer { state: ContainerState::Loaded, items, total_count: Some(total) }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Cluster types and ranking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterType {
    FunctionChain,
    TypeHierarchy,
    ModuleBoundary,
    Mixed,
}

impl ClusterType {
    /// Ranking weight: function-chain > type-hierarchy > module-boundary > mixed.
    pub fn weight(&self) -> u8 {
        match self {
            ClusterType::FunctionChain => 3,
            ClusterType::TypeHierarchy => 2,
            ClusterType::ModuleBoundary => 1,
            ClusterType::Mixed => 0,
        }
    }
}

/// A colocated symbol, reduced to what the response needs.
#[derive(Debug, Clone, Serialize)]
pub struct ColocatedSymbol {
    pub name: String,
    pub kind: String,
    #[serde(rename = "startLine")]
    pub start_line: usize,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSeed {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub score: f64,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchCluster {
    #[serde(rename = "clusterId")]
    pub cluster_id: String,
    pub seed: ClusterSeed,
    pub callers: RelationshipContainer<CallEdge>,
    pub callees: RelationshipContainer<CallEdge>,
    #[serde(rename = "typeFamily")]
    pub type_family: RelationshipContainer<TypeEdge>,
    pub colocated: RelationshipContainer<ColocatedSymbol>,
    pub siblings: RelationshipContainer<String>,
    #[serde(rename = "clusterType")]
    pub cluster_type: ClusterType,
    #[serde(rename = "relevanceScore")]
    pub relevance_score: f64,
    #[serde(rename = "tokenEstimate")]
    pub token_estimate: usize,
}

/// Deterministic cluster id: SHA-256 prefix of `filePath:symbolName`.
pub fn cluster_id(file: &str, symbol: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file.as_bytes());
    hasher.update(b":");
    hasher.update(symbol.unwrap_or("").as_bytes());
    hex_prefix(&hasher.finalize(), 10)
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Build one cluster around a seed. `expand_relationships` opts into the
/// expensive containers; otherwise they stay `NOT_LOADED` and appear in the
/// expansion hints.
pub fn build_cluster(
    graph: &ContextGraph,
    seed: ClusterSeed,
    expand_relationships: bool,
) -> SearchCluster {
    let symbol = seed.symbol.clone().unwrap_or_default();

    // Cheap containers come from the seed file's symbol table.
    let colocated_items: Vec<ColocatedSymbol> = graph
        .colocated_symbols(&seed.file, &symbol)
        .into_iter()
        .map(|s| ColocatedSymbol {
            name: s.name,
            kind: s.kind.label().to_string(),
            start_line: s.range.start_line,
            signature: s.signature,
        })
        .collect();
    let colocated = RelationshipContainer::loaded(colocated_items, COLOCATED_CAP);
    let siblings = RelationshipContainer::loaded(graph.sibling_files(&seed.file), SIBLINGS_CAP);

    let (callers, callees, type_family) = if expand_relationships {
        // A symbol-less seed (whole-file hit) has no call neighborhood; the
        // expansion was still honored, so the containers read Empty rather
        // than NotLoaded.
        (
            RelationshipContainer::loaded(graph.callers_of(&seed.file, &symbol), CALL_RELATIONS_CAP),
            RelationshipContainer::loaded(graph.callees_of(&seed.file, &symbol), CALL_RELATIONS_CAP),
            RelationshipContainer::loaded(
                graph.type_family_of(&seed.file, &symbol),
                TYPE_RELATIONS_CAP,
            ),
        )
    } else {
        (
            RelationshipContainer::not_loaded(),
            RelationshipContainer::not_loaded(),
            RelationshipContainer::not_loaded(),
        )
    };

    let cluster_type = classify(&callers, &callees, &type_family, &colocated, &siblings);
    let token_estimate = SEED_TOKENS
        + (callers.len() + callees.len()) * CALL_ITEM_TOKENS
        + type_family.len() * TYPE_ITEM_TOKENS
        + colocated.len() * COLOCATED_ITEM_TOKENS
        + siblings.len() * SIBLING_ITEM_TOKENS;

    SearchCluster {
        cluster_id: cluster_id(&seed.file, seed.symbol.as_deref()),
        relevance_score: seed.score,
        seed,
        callers,
        callees,
        type_family,
        colocated,
        siblings,
        cluster_type,
        token_estimate,
    }
}

fn classify(
    callers: &RelationshipContainer<CallEdge>,
    callees: &RelationshipContainer<CallEdge>,
    type_family: &RelationshipContainer<TypeEdge>,
    colocated: &RelationshipContainer<ColocatedSymbol>,
    siblings: &RelationshipContainer<String>,
) -> ClusterType {
    let calls = callers.len() + callees.len();
    let types = type_family.len();
    let module = colocated.len() + siblings.len();
    if calls > types && calls >= 1 {
        ClusterType::FunctionChain
    } else if types > calls && types >= 1 {
        ClusterType::TypeHierarchy
    } else if module >= 1 && calls == 0 && types == 0 {
        ClusterType::ModuleBoundary
    } else {
        ClusterType::Mixed
    }
}

/// Containers a follow-up call could expand.
pub fn recommended_expansions(cluster: &SearchCluster) -> Vec<&'static str> {
    let mut out = Vec::new();
    if cluster.callers.state == ContainerState::NotLoaded {
        out.push("callers");
    }
    if cluster.callees.state == ContainerState::NotLoaded {
        out.push("callees");
    }
    if cluster.type_family.state == ContainerState::NotLoaded {
        out.push("typeFamily");
    }
    out
}

/// Order clusters: relevance, then cluster-type weight, then id.
pub fn rank_clusters(clusters: &mut [SearchCluster]) {
    clusters.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.cluster_type.weight().cmp(&a.cluster_type.weight()))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
