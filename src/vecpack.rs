//! Append-only embedding pack.
//!
//! One pack per (provider, model) pair, laid out as:
//!
//! ```text
//! <pack-dir>/
//!   meta.json              dims, record count, format, shard count, timestamps
//!   embeddings.index.json  per-shard chunkId → byte offset, one table per format
//!   embeddings.f32.<s>.bin append-only f32 records for shard s
//!   embeddings.q8.<s>.bin  append-only int8 records for shard s
//!   tombstones.json        deleted chunk ids awaiting compaction
//!   ready.json             marker written after a successful flush
//! ```
//!
//! Records are length-prefixed: `[id-len u32][id utf8][norm-or-scale f32]
//! [vector bytes]`. q8 stores `int8 = round(clamp(v/scale, -127, 127))` with
//! `scale = max|v| / 127`. Writes only ever append within a generation;
//! index/meta swaps are rename-atomic, so concurrent readers stay safe.
//! Deletes tombstone; an explicit `compact` rewrites the bins and clears the
//! tombstone set.

use crate::config::PackFormat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

const PACK_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Quantization
// ---------------------------------------------------------------------------

/// `scale = max|v| / 127`; zero vectors use scale 1.0 so dequantization is
/// well defined.
pub fn q8_scale(vector: &[f32]) -> f32 {
    let max = vector.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if max == 0.0 {
        1.0
    } else {
        max / 127.0
    }
}

pub fn quantize_q8(vector: &[f32], scale: f32) -> Vec<i8> {
    vector
        .iter()
        .map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8)
        .collect()
}

pub fn dequantize_q8(bytes: &[i8], scale: f32) -> Vec<f32> {
    bytes.iter().map(|b| *b as f32 * scale).collect()
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na = l2_norm(a);
    let nb = l2_norm(b);
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Stable shard assignment from the chunk id.
pub fn shard_of(chunk_id: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut value = 0u64;
    for byte in &digest[..8] {
        value = (value << 8) | *byte as u64;
    }
    (value % shards as u64) as usize
}

// ---------------------------------------------------------------------------
// Metadata / index files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackMeta {
    version: u32,
    dims: usize,
    count: usize,
    format: PackFormat,
    shards: usize,
    #[serde(rename = "createdAt")]
    created_at: u64,
    #[serde(rename = "updatedAt")]
    updated_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OffsetIndex {
    /// format → shard index (stringified) → chunkId → byte offset
    f32: HashMap<String, HashMap<String, u64>>,
    q8: HashMap<String, HashMap<String, u64>>,
}

// ---------------------------------------------------------------------------
// LRU decode cache
// ---------------------------------------------------------------------------

/// Byte-bounded LRU of decoded f32 vectors.
struct VectorCache {
    budget: usize,
    used: usize,
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl VectorCache {
    fn new(budget: usize) -> VectorCache {
        VectorCache { budget, used: 0, map: HashMap::new(), order: VecDeque::new() }
    }

    fn get(&mut self, id: &str) -> Option<Vec<f32>> {
        if let Some(v) = self.map.get(id) {
            let v = v.clone();
            // refresh recency
            if let Some(pos) = self.order.iter().position(|k| k == id) {
                let key = self.order.remove(pos).unwrap();
                self.order.push_back(key);
            }
            return Some(v);
        }
        None
    }

    fn put(&mut self, id: String, vector: Vec<f32>) {
        let bytes = vector.len() * 4;
        if bytes > self.budget {
            return;
        }
        if let Some(old) = self.map.remove(&id) {
            self.used -= old.len() * 4;
            self.order.retain(|k| k != &id);
        }
        while self.used + bytes > self.budget {
            let Some(evicted) = self.order.pop_front() else { break };
            if let Some(old) = self.map.remove(&evicted) {
                self.used -= old.len() * 4;
            }
        }
        self.used += bytes;
        self.order.push_back(id.clone());
        self.map.insert(id, vector);
    }

    fn invalidate(&mut self, id: &str) {
        if let Some(old) = self.map.remove(id) {
            self.used -= old.len() * 4;
            self.order.retain(|k| k != id);
        }
    }
}

// ---------------------------------------------------------------------------
// Pack store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PackHealth {
    pub degraded: bool,
    pub reason: Option<String>,
}

pub struct PackStore {
    dir: PathBuf,
    dims: usize,
    format: PackFormat,
    shards: usize,
    index: Mutex<OffsetIndex>,
    tombstones: Mutex<HashSet<String>>,
    cache: Mutex<VectorCache>,
    dirty: AtomicBool,
    count: Mutex<usize>,
    health: Mutex<PackHealth>,
}

impl PackStore {
    /// Open (or create) the pack at `dir`. Disagreements between `meta.json`
    /// and the requested shape mark the store degraded rather than failing.
    pub fn open(
        dir: &Path,
        dims: usize,
        format: PackFormat,
        shards: usize,
        cache_bytes: usize,
    ) -> std::io::Result<PackStore> {
        std::fs::create_dir_all(dir)?;
        let shards = shards.max(1);
        let mut health = PackHealth { degraded: false, reason: None };
        let mut count = 0usize;

        if let Ok(bytes) = std::fs::read(dir.join("meta.json")) {
            match serde_json::from_slice::<PackMeta>(&bytes) {
                Ok(meta) => {
                    count = meta.count;
                    if meta.dims != dims {
                        health = PackHealth {
                            degraded: true,
                            reason: Some(format!(
                                "dims mismatch: pack has {}, config wants {dims}",
                                meta.dims
                            )),
                        };
                    } else if meta.shards != shards {
                        health = PackHealth {
                            degraded: true,
                            reason: Some(format!(
                                "shard count mismatch: pack has {}, config wants {shards}",
                                meta.shards
                            )),
                        };
                    }
                }
                Err(e) => {
                    health =
                        PackHealth { degraded: true, reason: Some(format!("meta unreadable: {e}")) };
                }
            }
        }

        let index: OffsetIndex = std::fs::read(dir.join("embeddings.index.json"))
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();
        let tombstones: HashSet<String> = std::fs::read(dir.join("tombstones.json"))
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();

        Ok(PackStore {
            dir: dir.to_path_buf(),
            dims,
            format,
            shards,
            index: Mutex::new(index),
            tombstones: Mutex::new(tombstones),
            cache: Mutex::new(VectorCache::new(cache_bytes)),
            dirty: AtomicBool::new(false),
            count: Mutex::new(count),
            health: Mutex::new(health),
        })
    }

    pub fn health(&self) -> PackHealth {
        self.health.lock().unwrap().clone()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        *self.count.lock().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bin_path(&self, format: &str, shard: usize) -> PathBuf {
        self.dir.join(format!("embeddings.{format}.{shard}.bin"))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append a record and update the in-memory offset tables. The previous
    /// record for the id (if any) becomes unreachable garbage until the next
    /// compaction.
    pub fn upsert(&self, chunk_id: &str, vector: &[f32]) -> std::io::Result<()> {
        if vector.len() != self.dims {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("vector dims {} != pack dims {}", vector.len(), self.dims),
            ));
        }
        let shard = shard_of(chunk_id, self.shards);

        if self.format.stores_f32() {
            let offset = self.append_record(
                &self.bin_path("f32", shard),
                chunk_id,
                l2_norm(vector),
                &vector.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>(),
            )?;
            self.index
                .lock()
                .unwrap()
                .f32
                .entry(shard.to_string())
                .or_default()
                .insert(chunk_id.to_string(), offset);
        }
        if self.format.stores_q8() {
            let scale = q8_scale(vector);
            let quantized = quantize_q8(vector, scale);
            let offset = self.append_record(
                &self.bin_path("q8", shard),
                chunk_id,
                scale,
                &quantized.iter().map(|b| *b as u8).collect::<Vec<u8>>(),
            )?;
            self.index
                .lock()
                .unwrap()
                .q8
                .entry(shard.to_string())
                .or_default()
                .insert(chunk_id.to_string(), offset);
        }

        self.tombstones.lock().unwrap().remove(chunk_id);
        *self.count.lock().unwrap() = self.live_ids().len();
        self.cache.lock().unwrap().invalidate(chunk_id);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn append_record(
        &self,
        path: &Path,
        chunk_id: &str,
        norm_or_scale: f32,
        payload: &[u8],
    ) -> std::io::Result<u64> {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        let id_bytes = chunk_id.as_bytes();
        file.write_all(&(id_bytes.len() as u32).to_le_bytes())?;
        file.write_all(id_bytes)?;
        file.write_all(&norm_or_scale.to_le_bytes())?;
        file.write_all(payload)?;
        Ok(offset)
    }

    /// Tombstone a chunk id. The bytes stay on disk until compaction.
    pub fn delete(&self, chunk_id: &str) {
        self.tombstones.lock().unwrap().insert(chunk_id.to_string());
        self.cache.lock().unwrap().invalidate(chunk_id);
        *self.count.lock().unwrap() = self.live_ids().len();
        self.dirty.store(true, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn offset_of(&self, chunk_id: &str) -> Option<(String, usize, u64)> {
        let shard = shard_of(chunk_id, self.shards);
        let index = self.index.lock().unwrap();
        if let Some(offset) = index.f32.get(&shard.to_string()).and_then(|m| m.get(chunk_id)) {
            return Some(("f32".to_string(), shard, *offset));
        }
        if let Some(offset) = index.q8.get(&shard.to_string()).and_then(|m| m.get(chunk_id)) {
            return Some(("q8".to_string(), shard, *offset));
        }
        None
    }

    /// Fetch a vector, decoding q8 when no f32 record exists. Tombstoned ids
    /// read as absent.
    pub fn get(&self, chunk_id: &str) -> Option<Vec<f32>> {
        if self.tombstones.lock().unwrap().contains(chunk_id) {
            return None;
        }
        if let Some(hit) = self.cache.lock().unwrap().get(chunk_id) {
            return Some(hit);
        }
        let (format, shard, offset) = self.offset_of(chunk_id)?;
        let (_, _, vector) = self.read_record(&format, shard, offset).ok()?;
        self.cache.lock().unwrap().put(chunk_id.to_string(), vector.clone());
        Some(vector)
    }

    fn read_record(
        &self,
        format: &str,
        shard: usize,
        offset: u64,
    ) -> std::io::Result<(String, f32, Vec<f32>)> {
        let mut file = std::fs::File::open(self.bin_path(format, shard))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let id_len = u32::from_le_bytes(len_buf) as usize;
        let mut id_buf = vec![0u8; id_len];
        file.read_exact(&mut id_buf)?;
        let id = String::from_utf8_lossy(&id_buf).to_string();

        let mut f32_buf = [0u8; 4];
        file.read_exact(&mut f32_buf)?;
        let norm_or_scale = f32::from_le_bytes(f32_buf);

        let vector = if format == "f32" {
            let mut payload = vec![0u8; self.dims * 4];
            file.read_exact(&mut payload)?;
            payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        } else {
            let mut payload = vec![0u8; self.dims];
            file.read_exact(&mut payload)?;
            let signed: Vec<i8> = payload.iter().map(|b| *b as i8).collect();
            dequantize_q8(&signed, norm_or_scale)
        };
        Ok((id, norm_or_scale, vector))
    }

    /// All live (non-tombstoned) chunk ids across both format tables.
    pub fn live_ids(&self) -> Vec<String> {
        let index = self.index.lock().unwrap();
        let tombstones = self.tombstones.lock().unwrap();
        let mut ids: HashSet<&String> = HashSet::new();
        for table in index.f32.values().chain(index.q8.values()) {
            ids.extend(table.keys());
        }
        let mut out: Vec<String> =
            ids.into_iter().filter(|id| !tombstones.contains(*id)).cloned().collect();
        out.sort();
        out
    }

    /// Exact cosine scan over every shard, merged and truncated to `k`.
    pub fn search_flat(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut hits: Vec<(String, f32)> = self
            .live_ids()
            .into_iter()
            .filter_map(|id| {
                let v = self.get(&id)?;
                Some((id, cosine(query, &v)))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);
        hits
    }

    // -----------------------------------------------------------------------
    // Flush and compaction
    // -----------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Debounced by the owner: write index, tombstones, meta, and the ready
    /// marker via tmp-file + rename.
    pub fn flush_if_dirty(&self) -> std::io::Result<bool> {
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let index = self.index.lock().unwrap().clone();
        let tombstones: Vec<String> = {
            let t = self.tombstones.lock().unwrap();
            let mut v: Vec<String> = t.iter().cloned().collect();
            v.sort();
            v
        };
        let meta = PackMeta {
            version: PACK_VERSION,
            dims: self.dims,
            count: self.len(),
            format: self.format,
            shards: self.shards,
            created_at: crate::storage::now_secs(),
            updated_at: crate::storage::now_secs(),
        };

        self.write_atomic("embeddings.index.json", &serde_json::to_vec(&index)?)?;
        self.write_atomic("tombstones.json", &serde_json::to_vec(&tombstones)?)?;
        self.write_atomic("meta.json", &serde_json::to_vec(&meta)?)?;
        self.write_atomic(
            "ready.json",
            &serde_json::to_vec(&serde_json::json!({ "readyAt": crate::storage::now_secs() }))?,
        )?;
        self.dirty.store(false, Ordering::Relaxed);
        debug!(count = meta.count, "pack flushed");
        Ok(true)
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = self.dir.join(format!(
            "{name}.tmp-{}-{}",
            std::process::id(),
            crate::storage::now_secs()
        ));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }

    /// Rewrite every shard keeping only live records, then clear tombstones.
    /// Manual operation; readers of the old generation keep working because
    /// bins are swapped by rename.
    pub fn compact(&self) -> std::io::Result<usize> {
        let live = self.live_ids();
        let vectors: Vec<(String, Vec<f32>)> = live
            .iter()
            .filter_map(|id| self.get(id).map(|v| (id.clone(), v)))
            .collect();

        // Reset bins and offset tables, then re-append.
        {
            let mut index = self.index.lock().unwrap();
            *index = OffsetIndex::default();
        }
        for shard in 0..self.shards {
            for format in ["f32", "q8"] {
                let path = self.bin_path(format, shard);
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        for (id, vector) in &vectors {
            if let Err(e) = self.upsert(id, vector) {
                warn!(chunk = %id, error = %e, "compaction re-append failed");
            }
        }
        self.tombstones.lock().unwrap().clear();
        self.dirty.store(true, Ordering::Relaxed);
        self.flush_if_dirty()?;
        Ok(vectors.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
