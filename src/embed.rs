//! Embedding provider seam and the chunk embedding indexer.
//!
//! The actual model lives outside the engine; everything here goes through
//! [`EmbeddingProvider`]. The deterministic hash provider ships for `test`
//! and `ci` modes and for workspaces with no external provider configured —
//! it is a real (if crude) bag-of-tokens embedding, so cosine ranking over
//! it behaves sensibly in fixtures.

use crate::storage::{ChunkRow, EmbeddingRow, Store};
use crate::trigram::normalize;
use crate::vecpack::{l2_norm, PackStore};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

pub trait EmbeddingProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// Embed a batch of texts. Must return one vector per input, each of
    /// `dims()` length.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, String>;
}

// ---------------------------------------------------------------------------
// Deterministic hash provider
// ---------------------------------------------------------------------------

/// Token-hash embedding: each normalized token is hashed into a bucket with
/// a sign, the result L2-normalized. Deterministic across processes.
pub struct HashEmbeddingProvider {
    dims: usize,
    model: String,
}

impl HashEmbeddingProvider {
    pub fn new(dims: usize) -> HashEmbeddingProvider {
        HashEmbeddingProvider { dims, model: format!("hash-{dims}") }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in normalize(text).split(' ') {
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let mut raw = 0u64;
            for byte in &digest[..8] {
                raw = (raw << 8) | *byte as u64;
            }
            let bucket = (raw % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = l2_norm(&vector);
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn provider_name(&self) -> &str {
        "local"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, String> {
        Ok(texts.par_iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Resolve the configured provider. Unknown names fall back to the hash
/// provider so the engine keeps working without network access.
pub fn create_provider(provider: &str, model: &str) -> Arc<dyn EmbeddingProvider> {
    match (provider, model) {
        ("local", m) if m.starts_with("hash-") => {
            let dims = m.trim_start_matches("hash-").parse().unwrap_or(256);
            Arc::new(HashEmbeddingProvider::new(dims))
        }
        _ => Arc::new(HashEmbeddingProvider::new(256)),
    }
}

// ---------------------------------------------------------------------------
// Chunk embedding indexer
// ---------------------------------------------------------------------------

/// Embed chunks and upsert them into the pack and the metadata table.
/// Returns the number of chunks embedded (already-embedded chunks with an
/// unchanged hash are skipped).
pub fn embed_chunks(
    provider: &dyn EmbeddingProvider,
    pack: &PackStore,
    store: &Store,
    chunks: &[ChunkRow],
) -> Result<usize, String> {
    let pending: Vec<&ChunkRow> = chunks
        .iter()
        .filter(|c| {
            // A pack record plus a metadata row means this chunk is done.
            pack.get(&c.id).is_none()
                || store
                    .embedding(&c.id, provider.provider_name(), provider.model_name())
                    .ok()
                    .flatten()
                    .is_none()
        })
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    let texts: Vec<&str> = pending.iter().map(|c| c.text.as_str()).collect();
    let vectors = provider.embed(&texts)?;
    if vectors.len() != pending.len() {
        return Err(format!(
            "provider returned {} vectors for {} texts",
            vectors.len(),
            pending.len()
        ));
    }

    for (chunk, vector) in pending.iter().zip(vectors.iter()) {
        pack.upsert(&chunk.id, vector).map_err(|e| e.to_string())?;
        store
            .upsert_embedding(&EmbeddingRow {
                chunk_id: chunk.id.clone(),
                provider: provider.provider_name().to_string(),
                model: provider.model_name().to_string(),
                dims: vector.len(),
                norm: l2_norm(vector),
                format: "f32".to_string(),
            })
            .map_err(|e| e.to_string())?;
    }
    debug!(embedded = pending.len(), "chunks embedded");
    Ok(pending.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackFormat;
    use crate::types::SourceRange;

    fn chunk(id: &str, text: &str) -> ChunkRow {
        ChunkRow {
            id: id.into(),
            file: "docs/a.md".into(),
            kind: "markdown".into(),
            section_path: "Intro".into(),
            heading: None,
            heading_level: 1,
            range: SourceRange::default(),
            text: text.into(),
            content_hash: crate::types::content_hash(text),
        }
    }

    #[test]
    fn test_hash_provider_is_deterministic() {
        let provider = HashEmbeddingProvider::new(64);
        let a = provider.embed(&["authentication flow"]).unwrap();
        let b = provider.embed(&["authentication flow"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
        assert!((l2_norm(&a[0]) - 1.0).abs() < 1e-5, "unit norm");
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let provider = HashEmbeddingProvider::new(128);
        let vs = provider
            .embed(&[
                "user login session token",
                "login session for the user",
                "chunk packing heuristics",
            ])
            .unwrap();
        let close = crate::vecpack::cosine(&vs[0], &vs[1]);
        let far = crate::vecpack::cosine(&vs[0], &vs[2]);
        assert!(close > far, "close={close} far={far}");
    }

    #[test]
    fn test_embed_chunks_skips_done_work() {
        let dir = tempfile::tempdir().unwrap();
        let pack = PackStore::open(dir.path(), 64, PackFormat::Float32, 1, 1024 * 1024).unwrap();
        let store = Store::open_memory();
        let provider = HashEmbeddingProvider::new(64);

        let chunks = vec![chunk("c1", "alpha beta"), chunk("c2", "gamma delta")];
        store.replace_chunks("docs/a.md", &[chunks[0].clone(), chunks[1].clone()]).unwrap();

        assert_eq!(embed_chunks(&provider, &pack, &store, &chunks).unwrap(), 2);
        assert_eq!(embed_chunks(&provider, &pack, &store, &chunks).unwrap(), 0, "second run is a no-op");
        assert!(pack.get("c1").is_some());
        assert!(store.embedding("c1", "local", "hash-64").unwrap().is_some());
    }
}
