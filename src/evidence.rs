//! Evidence pack store.
//!
//! A pack is the durable record of one search response: the query, options,
//! workspace fingerprint, and the ordered items with their roles and score
//! breakdowns. Packs are addressable for cursor-paged follow-ups — the
//! `items` cursor advances the window, the `content` cursor expands one
//! (docs, code) position to full content — without re-running the search.
//! Packs expire after a TTL, and a fingerprint that no longer matches the
//! workspace forces regeneration.

use crate::cluster::SearchCluster;
use crate::error::{EngineError, Result};
use crate::storage::{now_secs, Store};
use crate::types::SourceRange;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Pack shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    Result,
    Evidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSection {
    Docs,
    Code,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<f64>,
    pub fused: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub role: ItemRole,
    pub section: ItemSection,
    pub rank: usize,
    #[serde(rename = "chunkId", skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub preview: String,
    pub range: SourceRange,
    pub score: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePack {
    #[serde(rename = "packId")]
    pub pack_id: String,
    pub query: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
    #[serde(rename = "rootFingerprint")]
    pub root_fingerprint: String,
    pub options: serde_json::Value,
    pub meta: serde_json::Value,
    pub items: Vec<EvidenceItem>,
}

impl EvidencePack {
    pub fn items_in(&self, section: ItemSection) -> Vec<&EvidenceItem> {
        self.items.iter().filter(|i| i.section == section).collect()
    }
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Opaque-but-stable cursor strings: `items:<docs>:<code>` advances the
/// window, `content:<docs>:<code>` requests full content for one position
/// per section (`-` = none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Items { docs: usize, code: usize },
    Content { docs: Option<usize>, code: Option<usize> },
}

impl Cursor {
    pub fn encode(&self) -> String {
        match self {
            Cursor::Items { docs, code } => format!("items:{docs}:{code}"),
            Cursor::Content { docs, code } => format!(
                "content:{}:{}",
                docs.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            ),
        }
    }

    pub fn decode(raw: &str) -> Result<Cursor> {
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            ["items", docs, code] => {
                let docs = docs.parse().map_err(|_| bad_cursor(raw))?;
                let code = code.parse().map_err(|_| bad_cursor(raw))?;
                Ok(Cursor::Items { docs, code })
            }
            ["content", docs, code] => {
                let parse = |s: &str| -> Result<Option<usize>> {
                    if s == "-" {
                        Ok(None)
                    } else {
                        s.parse().map(Some).map_err(|_| bad_cursor(raw))
                    }
                };
                Ok(Cursor::Content { docs: parse(docs)?, code: parse(code)? })
            }
            _ => Err(bad_cursor(raw)),
        }
    }
}

fn bad_cursor(raw: &str) -> EngineError {
    EngineError::InvalidArgs(format!("unparseable cursor '{raw}'"))
}

/// One page of a pack: the per-section windows plus the cursor for the next
/// page, if any section has more.
#[derive(Debug, Clone, Serialize)]
pub struct ItemsPage {
    pub docs: Vec<EvidenceItem>,
    pub code: Vec<EvidenceItem>,
    #[serde(rename = "itemsCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Page through a pack's items. Paging is deterministic: the same cursor
/// always yields byte-identical items.
pub fn page_items(pack: &EvidencePack, cursor: Option<Cursor>, max_results: usize) -> Result<ItemsPage> {
    let (docs_offset, code_offset) = match cursor {
        None => (0, 0),
        Some(Cursor::Items { docs, code }) => (docs, code),
        Some(Cursor::Content { .. }) => {
            return Err(EngineError::InvalidArgs(
                "content cursor passed where an items cursor was expected".into(),
            ))
        }
    };
    let per_section = max_results.max(1);

    let all_docs = pack.items_in(ItemSection::Docs);
    let all_code = pack.items_in(ItemSection::Code);
    let docs: Vec<EvidenceItem> = all_docs
        .iter()
        .skip(docs_offset)
        .take(per_section)
        .map(|i| (*i).clone())
        .collect();
    let code: Vec<EvidenceItem> = all_code
        .iter()
        .skip(code_offset)
        .take(per_section)
        .map(|i| (*i).clone())
        .collect();

    let next_docs = docs_offset + docs.len();
    let next_code = code_offset + code.len();
    let more = next_docs < all_docs.len() || next_code < all_code.len();
    Ok(ItemsPage {
        docs,
        code,
        next_cursor: more.then(|| Cursor::Items { docs: next_docs, code: next_code }.encode()),
    })
}

/// Resolve a content cursor to the addressed items.
pub fn content_targets<'a>(
    pack: &'a EvidencePack,
    cursor: Cursor,
) -> Result<Vec<&'a EvidenceItem>> {
    let Cursor::Content { docs, code } = cursor else {
        return Err(EngineError::InvalidArgs(
            "items cursor passed where a content cursor was expected".into(),
        ));
    };
    let mut out = Vec::new();
    if let Some(idx) = docs {
        let items = pack.items_in(ItemSection::Docs);
        out.push(*items.get(idx).ok_or_else(|| {
            EngineError::NotFound(format!("docs index {idx} out of range"))
        })?);
    }
    if let Some(idx) = code {
        let items = pack.items_in(ItemSection::Code);
        out.push(*items.get(idx).ok_or_else(|| {
            EngineError::NotFound(format!("code index {idx} out of range"))
        })?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub enum PackLookup {
    Hit(Box<EvidencePack>),
    Miss,
    /// Present but unusable: expired or fingerprint drift.
    Stale(&'static str),
}

pub struct EvidenceStore {
    store: Arc<Store>,
    memory: DashMap<String, EvidencePack>,
    ttl_secs: u64,
}

impl EvidenceStore {
    pub fn new(store: Arc<Store>, ttl_secs: u64) -> EvidenceStore {
        EvidenceStore { store, memory: DashMap::new(), ttl_secs }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn put(&self, pack: &EvidencePack) -> Result<()> {
        let payload = serde_json::to_string(pack)?;
        self.store.put_pack(&pack.pack_id, &payload, pack.created_at, pack.expires_at)?;
        self.memory.insert(pack.pack_id.clone(), pack.clone());
        debug!(pack = %pack.pack_id, items = pack.items.len(), "evidence pack stored");
        Ok(())
    }

    /// Fetch a pack for a follow-up. The fingerprint must still describe the
    /// workspace; otherwise the caller regenerates.
    pub fn get(&self, pack_id: &str, current_fingerprint: &str) -> Result<PackLookup> {
        let pack = match self.memory.get(pack_id) {
            Some(p) => Some(p.clone()),
            None => match self.store.get_pack(pack_id)? {
                Some(payload) => Some(serde_json::from_str::<EvidencePack>(&payload)?),
                None => None,
            },
        };
        let Some(pack) = pack else {
            return Ok(PackLookup::Miss);
        };
        if pack.expires_at < now_secs() {
            self.memory.remove(pack_id);
            return Ok(PackLookup::Stale("expired"));
        }
        if pack.root_fingerprint != current_fingerprint {
            return Ok(PackLookup::Stale("fingerprint_mismatch"));
        }
        Ok(PackLookup::Hit(Box::new(pack)))
    }

    pub fn purge_expired(&self) -> Result<usize> {
        let now = now_secs();
        self.memory.retain(|_, p| p.expires_at >= now);
        self.store.purge_expired_packs()
    }
}

// ---------------------------------------------------------------------------
// Token budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BudgetOutcome {
    pub degraded: bool,
    pub reasons: Vec<String>,
    #[serde(rename = "estimatedTokens")]
    pub estimated_tokens: usize,
}

/// Truncate the cluster tail so the summed estimates fit the budget. The
/// head cluster always survives; if even it blows the budget the response
/// is degraded rather than empty.
pub fn apply_token_budget(
    clusters: Vec<SearchCluster>,
    budget: usize,
) -> (Vec<SearchCluster>, BudgetOutcome) {
    let mut kept = Vec::with_capacity(clusters.len());
    let mut total = 0usize;
    let mut dropped = 0usize;
    for cluster in clusters {
        if kept.is_empty() || total + cluster.token_estimate <= budget {
            total += cluster.token_estimate;
            kept.push(cluster);
        } else {
            dropped += 1;
        }
    }
    let over_budget = total > budget;
    let degraded = dropped > 0 || over_budget;
    let mut reasons = Vec::new();
    if degraded {
        reasons.push("budget_exceeded".to_string());
    }
    (kept, BudgetOutcome { degraded, reasons, estimated_tokens: total })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn item(section: ItemSection, rank: usize, file: &str) -> EvidenceItem {
        EvidenceItem {
            role: if rank == 0 { ItemRole::Result } else { ItemRole::Evidence },
            section,
            rank,
            chunk_id: Some(format!("chunk-{file}-{rank}")),
            file: file.to_string(),
            symbol: None,
            preview: format!("preview {rank} of {file}"),
            range: SourceRange { start_line: 1, end_line: 5, start_byte: 0, end_byte: 80 },
            score: ScoreBreakdown { lexical: Some(0.5), vector: None, fused: 0.5 },
        }
    }

    fn pack(id: &str, fingerprint: &str, ttl: i64) -> EvidencePack {
        let now = now_secs();
        EvidencePack {
            pack_id: id.to_string(),
            query: "auth".into(),
            created_at: now,
            expires_at: (now as i64 + ttl).max(0) as u64,
            root_fingerprint: fingerprint.to_string(),
            options: serde_json::json!({"view": "preview"}),
            meta: serde_json::json!({}),
            items: vec![
                item(ItemSection::Docs, 0, "docs/auth.md"),
                item(ItemSection::Docs, 1, "docs/tokens.md"),
                item(ItemSection::Docs, 2, "docs/sessions.md"),
                item(ItemSection::Code, 0, "src/auth.rs"),
                item(ItemSection::Code, 1, "src/token.rs"),
                item(ItemSection::Code, 2, "src/session.rs"),
            ],
        }
    }

    #[test]
    fn test_cursor_round_trip() {
        for cursor in [
            Cursor::Items { docs: 3, code: 7 },
            Cursor::Content { docs: Some(1), code: None },
            Cursor::Content { docs: None, code: Some(0) },
        ] {
            assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
        }
        assert!(Cursor::decode("bogus").is_err());
        assert!(Cursor::decode("items:x:1").is_err());
    }

    #[test]
    fn test_paging_walks_both_sections() {
        let pack = pack("p1", "fp", 600);
        let first = page_items(&pack, None, 1).unwrap();
        assert_eq!(first.docs.len(), 1);
        assert_eq!(first.code.len(), 1);
        assert_eq!(first.docs[0].file, "docs/auth.md");
        let next = first.next_cursor.expect("more pages");

        let second = page_items(&pack, Some(Cursor::decode(&next).unwrap()), 1).unwrap();
        assert_eq!(second.docs[0].file, "docs/tokens.md");
        assert_eq!(second.code[0].file, "src/token.rs");

        let third_cursor = second.next_cursor.expect("one more page");
        let third = page_items(&pack, Some(Cursor::decode(&third_cursor).unwrap()), 1).unwrap();
        assert!(third.next_cursor.is_none(), "exhausted");
    }

    #[test]
    fn test_paging_is_idempotent() {
        let pack = pack("p1", "fp", 600);
        let cursor = Some(Cursor::Items { docs: 1, code: 1 });
        let a = serde_json::to_string(&page_items(&pack, cursor, 2).unwrap()).unwrap();
        let b = serde_json::to_string(&page_items(&pack, cursor, 2).unwrap()).unwrap();
        assert_eq!(a, b, "same cursor must produce byte-identical items");
    }

    #[test]
    fn test_content_cursor_addresses_items() {
        let pack = pack("p1", "fp", 600);
        let targets =
            content_targets(&pack, Cursor::Content { docs: Some(1), code: Some(2) }).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].file, "docs/tokens.md");
        assert_eq!(targets[1].file, "src/session.rs");

        assert!(content_targets(&pack, Cursor::Content { docs: Some(99), code: None }).is_err());
    }

    #[test]
    fn test_store_hit_miss_stale() {
        let store = EvidenceStore::new(Arc::new(Store::open_memory()), 600);
        let p = pack("p1", "fp-current", 600);
        store.put(&p).unwrap();

        assert!(matches!(store.get("p1", "fp-current").unwrap(), PackLookup::Hit(_)));
        assert!(matches!(store.get("nope", "fp-current").unwrap(), PackLookup::Miss));
        assert!(matches!(
            store.get("p1", "fp-drifted").unwrap(),
            PackLookup::Stale("fingerprint_mismatch")
        ));

        let expired = pack("p2", "fp-current", -10);
        store.put(&expired).unwrap();
        assert!(matches!(store.get("p2", "fp-current").unwrap(), PackLookup::Stale("expired")));
    }

    #[test]
    fn test_store_survives_memory_eviction() {
        let store = EvidenceStore::new(Arc::new(Store::open_memory()), 600);
        let p = pack("p1", "fp", 600);
        store.put(&p).unwrap();
        store.memory.clear();
        // falls through to sqlite
        assert!(matches!(store.get("p1", "fp").unwrap(), PackLookup::Hit(_)));
    }

    #[test]
    fn test_token_budget_truncates_tail() {
        use crate::cluster::{ClusterSeed, RelationshipContainer, SearchCluster};
        let mk = |id: &str, tokens: usize| SearchCluster {
            cluster_id: id.into(),
            seed: ClusterSeed { file: "x.ts".into(), symbol: None, score: 1.0, preview: "".into() },
            callers: RelationshipContainer::not_loaded(),
            callees: RelationshipContainer::not_loaded(),
            type_family: RelationshipContainer::not_loaded(),
            colocated: RelationshipContainer::loaded(vec![], 10),
            siblings: RelationshipContainer::loaded(vec![], 6),
            cluster_type: crate::cluster::ClusterType::Mixed,
            relevance_score: 1.0,
            token_estimate: tokens,
        };

        let (kept, outcome) = apply_token_budget(vec![mk("a", 300), mk("b", 300), mk("c", 300)], 650);
        assert_eq!(kept.len(), 2);
        assert!(outcome.degraded);
        assert_eq!(outcome.reasons, vec!["budget_exceeded".to_string()]);
        assert!(outcome.estimated_tokens <= 650);

        let (kept, outcome) = apply_token_budget(vec![mk("a", 300)], 1000);
        assert_eq!(kept.len(), 1);
        assert!(!outcome.degraded);

        // head cluster alone over budget: kept, but degraded
        let (kept, outcome) = apply_token_budget(vec![mk("a", 900)], 100);
        assert_eq!(kept.len(), 1);
        assert!(outcome.degraded);
    }
}
