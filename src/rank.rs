//! BM25F ranking with a bounded call-graph boost.
//!
//! Candidates carry per-field text (`filename`, `symbol-definition`,
//! `content`); each field is scored with BM25 against the candidate corpus
//! and combined with the configured field weights (filename > symbol >
//! content). A multiplicative boost derived from call-graph shape — entry
//! points and high in-degree symbols up, deep leaves down — is clamped so it
//! can never dominate the content signal.

use crate::config::SearchConfig;
use crate::trigram::normalize;
use serde::Serialize;
use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// The boost multiplier is confined to this band.
const BOOST_MIN: f64 = 0.8;
const BOOST_MAX: f64 = 1.5;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    Filename,
    SymbolDefinition,
    Content,
}

/// A candidate document: one file (or symbol) with its field texts.
#[derive(Debug, Clone)]
pub struct RankDoc {
    pub id: String,
    pub fields: Vec<(FieldType, String)>,
}

/// Call-graph shape of a symbol, fed by the UCG.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CallSignal {
    pub depth: u32,
    #[serde(rename = "inDegree")]
    pub in_degree: u32,
    #[serde(rename = "outDegree")]
    pub out_degree: u32,
    #[serde(rename = "isEntryPoint")]
    pub is_entry_point: bool,
}

impl CallSignal {
    /// Multiplicative boost in `[BOOST_MIN, BOOST_MAX]`.
    pub fn boost(&self) -> f64 {
        let mut boost = 1.0;
        if self.is_entry_point {
            boost += 0.25;
        }
        // Widely-called symbols are likelier to be the context a query wants.
        boost += (self.in_degree as f64 / 10.0).min(0.25);
        if self.depth > 4 && self.in_degree <= 1 {
            boost -= 0.15;
        }
        boost.clamp(BOOST_MIN, BOOST_MAX)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedHit {
    pub id: String,
    pub score: f64,
    #[serde(rename = "fieldScores")]
    pub field_scores: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Ranker
// ---------------------------------------------------------------------------

pub struct Bm25fRanker {
    filename_weight: f64,
    symbol_weight: f64,
    content_weight: f64,
}

impl Bm25fRanker {
    pub fn new(config: &SearchConfig) -> Bm25fRanker {
        Bm25fRanker {
            filename_weight: config.filename_weight,
            symbol_weight: config.symbol_weight,
            content_weight: config.content_weight,
        }
    }

    fn weight(&self, field: FieldType) -> f64 {
        match field {
            FieldType::Filename => self.filename_weight,
            FieldType::SymbolDefinition => self.symbol_weight,
            FieldType::Content => self.content_weight,
        }
    }

    /// Rank `docs` against `query`. `signals` maps doc id to the strongest
    /// call-graph signal associated with it (absent = neutral boost).
    pub fn rank(
        &self,
        query: &str,
        docs: &[RankDoc],
        signals: &HashMap<String, CallSignal>,
    ) -> Vec<RankedHit> {
        let terms: Vec<String> = normalize(query)
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();
        if terms.is_empty() || docs.is_empty() {
            return Vec::new();
        }

        // Tokenize once; collect corpus stats per field.
        let tokenized: Vec<Vec<(FieldType, Vec<String>)>> = docs
            .iter()
            .map(|doc| {
                doc.fields
                    .iter()
                    .map(|(ft, text)| {
                        let tokens: Vec<String> = normalize(text)
                            .split(' ')
                            .filter(|t| !t.is_empty())
                            .map(|t| t.to_string())
                            .collect();
                        (*ft, tokens)
                    })
                    .collect()
            })
            .collect();

        let mut avg_len: HashMap<FieldType, f64> = HashMap::new();
        let mut field_docs: HashMap<FieldType, usize> = HashMap::new();
        for fields in &tokenized {
            for (ft, tokens) in fields {
                *avg_len.entry(*ft).or_insert(0.0) += tokens.len() as f64;
                *field_docs.entry(*ft).or_insert(0) += 1;
            }
        }
        for (ft, total) in avg_len.iter_mut() {
            *total /= field_docs.get(ft).copied().unwrap_or(1).max(1) as f64;
        }

        // Document frequency per term across all fields, Laplace-smoothed.
        let n = docs.len() as f64;
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for fields in &tokenized {
            let mut seen: Vec<&str> = Vec::new();
            for (_, tokens) in fields {
                for term in &terms {
                    if tokens.iter().any(|t| t == term) && !seen.contains(&term.as_str()) {
                        seen.push(term);
                    }
                }
            }
            for term in seen {
                *doc_freq.entry(term).or_insert(0) += 1;
            }
        }

        let idf = |term: &str| -> f64 {
            let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
            (((n - df + 0.5) / (df + 0.5)) + 1.0).ln()
        };

        let mut hits: Vec<RankedHit> = docs
            .iter()
            .zip(tokenized.iter())
            .map(|(doc, fields)| {
                let mut field_scores: HashMap<String, f64> = HashMap::new();
                let mut total = 0.0;
                for (ft, tokens) in fields {
                    let len = tokens.len() as f64;
                    let avg = avg_len.get(ft).copied().unwrap_or(1.0).max(1.0);
                    let mut field_score = 0.0;
                    for term in &terms {
                        let tf = tokens.iter().filter(|t| *t == term).count() as f64;
                        if tf == 0.0 {
                            continue;
                        }
                        let norm_tf =
                            (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * len / avg));
                        field_score += idf(term) * norm_tf;
                    }
                    let weighted = field_score * self.weight(*ft);
                    if weighted > 0.0 {
                        let key = match ft {
                            FieldType::Filename => "filename",
                            FieldType::SymbolDefinition => "symbol-definition",
                            FieldType::Content => "content",
                        };
                        *field_scores.entry(key.to_string()).or_insert(0.0) += weighted;
                    }
                    total += weighted;
                }

                let boost = signals.get(&doc.id).map(|s| s.boost()).unwrap_or(1.0);
                RankedHit { id: doc.id.clone(), score: total * boost, field_scores }
            })
            .filter(|h| h.score > 0.0)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
