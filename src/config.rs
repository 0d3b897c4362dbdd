//! Engine configuration: `scopegraph.toml` plus `SCOPEGRAPH_*` environment
//! overrides, feature flags, and rollout presets.
//!
//! Flags are resolved once per request into an immutable [`FlagSnapshot`];
//! nothing reads the live config mid-request.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Engine mode and backend selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    #[default]
    Prod,
    Ci,
    Test,
}

/// Parser backend preference. `Auto` tries tree-sitter first and falls back
/// to the line-scan snapshot backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    #[default]
    Auto,
    Native,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackFormat {
    #[default]
    Float32,
    Q8,
    Both,
}

impl PackFormat {
    pub fn stores_f32(self) -> bool {
        matches!(self, PackFormat::Float32 | PackFormat::Both)
    }
    pub fn stores_q8(self) -> bool {
        matches!(self, PackFormat::Q8 | PackFormat::Both)
    }
}

// ---------------------------------------------------------------------------
// Feature flags and rollout presets
// ---------------------------------------------------------------------------

/// Flag vector gating the adaptive subsystems. Treated as an immutable
/// snapshot within a request's orchestration context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub adaptive_flow_enabled: bool,
    pub ucg_enabled: bool,
    pub topology_scanner_enabled: bool,
    pub dual_write_validation: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        RolloutPreset::Full.flags()
    }
}

/// How a rollout preset admits traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum RolloutMode {
    Off,
    On,
    /// Only the listed workspace roots get the new path.
    Canary { allowlist: Vec<String> },
    /// Deterministic percentage bucket by workspace fingerprint.
    Beta { percent: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutPreset {
    Legacy,
    Shadow,
    Canary,
    Beta,
    #[default]
    Full,
}

impl RolloutPreset {
    pub fn parse(s: &str) -> Option<RolloutPreset> {
        match s {
            "legacy" => Some(RolloutPreset::Legacy),
            "shadow" => Some(RolloutPreset::Shadow),
            "canary" => Some(RolloutPreset::Canary),
            "beta" => Some(RolloutPreset::Beta),
            "full" => Some(RolloutPreset::Full),
            _ => None,
        }
    }

    /// The flag vector a preset maps to.
    pub fn flags(self) -> FeatureFlags {
        match self {
            // Legacy: old analysis path only.
            RolloutPreset::Legacy => FeatureFlags {
                adaptive_flow_enabled: false,
                ucg_enabled: false,
                topology_scanner_enabled: false,
                dual_write_validation: false,
            },
            // Shadow: new path runs and is validated, old path answers.
            RolloutPreset::Shadow => FeatureFlags {
                adaptive_flow_enabled: false,
                ucg_enabled: true,
                topology_scanner_enabled: true,
                dual_write_validation: true,
            },
            RolloutPreset::Canary | RolloutPreset::Beta => FeatureFlags {
                adaptive_flow_enabled: true,
                ucg_enabled: true,
                topology_scanner_enabled: true,
                dual_write_validation: true,
            },
            RolloutPreset::Full => FeatureFlags {
                adaptive_flow_enabled: true,
                ucg_enabled: true,
                topology_scanner_enabled: true,
                dual_write_validation: false,
            },
        }
    }

    pub fn mode(self) -> RolloutMode {
        match self {
            RolloutPreset::Legacy => RolloutMode::Off,
            RolloutPreset::Shadow | RolloutPreset::Full => RolloutMode::On,
            RolloutPreset::Canary => RolloutMode::Canary { allowlist: Vec::new() },
            RolloutPreset::Beta => RolloutMode::Beta { percent: 25 },
        }
    }
}

/// Immutable per-request view of the flags in effect.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlagSnapshot {
    pub flags: FeatureFlags,
    pub preset: RolloutPreset,
}

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Trigram index options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrigramConfig {
    /// Extensions admitted to the index. Empty = all text files.
    #[serde(default)]
    pub include_extensions: Vec<String>,
    /// Files larger than this are skipped.
    #[serde(default = "default_trigram_max_bytes")]
    pub max_file_bytes: u64,
    /// Trigrams present in more than this fraction of files are dropped.
    #[serde(default = "default_max_doc_freq")]
    pub max_doc_freq_ratio: f64,
    /// Per-file cap on distinct trigrams; highest-frequency kept.
    #[serde(default = "default_max_trigrams_per_file")]
    pub max_trigrams_per_file: usize,
}

fn default_trigram_max_bytes() -> u64 {
    1024 * 1024
}
fn default_max_doc_freq() -> f64 {
    0.5
}
fn default_max_trigrams_per_file() -> usize {
    20_000
}

impl Default for TrigramConfig {
    fn default() -> Self {
        TrigramConfig {
            include_extensions: Vec::new(),
            max_file_bytes: default_trigram_max_bytes(),
            max_doc_freq_ratio: default_max_doc_freq(),
            max_trigrams_per_file: default_max_trigrams_per_file(),
        }
    }
}

/// Hybrid search tunables, including the BM25F field weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_filename_weight")]
    pub filename_weight: f64,
    #[serde(default = "default_symbol_weight")]
    pub symbol_weight: f64,
    #[serde(default = "default_content_weight")]
    pub content_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_rrf_depth")]
    pub rrf_depth: usize,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f64,
}

fn default_filename_weight() -> f64 {
    3.0
}
fn default_symbol_weight() -> f64 {
    2.0
}
fn default_content_weight() -> f64 {
    1.0
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_rrf_depth() -> usize {
    50
}
fn default_mmr_lambda() -> f64 {
    0.7
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            filename_weight: default_filename_weight(),
            symbol_weight: default_symbol_weight(),
            content_weight: default_content_weight(),
            rrf_k: default_rrf_k(),
            rrf_depth: default_rrf_depth(),
            mmr_lambda: default_mmr_lambda(),
        }
    }
}

/// Vector pack + ANN tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub pack_format: PackFormat,
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: usize,
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default)]
    pub hnsw_enabled: bool,
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
    /// Embed document chunks at index time instead of first query.
    #[serde(default)]
    pub eager_doc_embedding: bool,
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_model() -> String {
    "hash-256".to_string()
}
fn default_cache_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_shards() -> usize {
    4
}
fn default_hnsw_m() -> usize {
    16
}
fn default_hnsw_ef_construction() -> usize {
    200
}
fn default_hnsw_ef_search() -> usize {
    64
}

impl Default for VectorConfig {
    fn default() -> Self {
        VectorConfig {
            provider: default_provider(),
            model: default_model(),
            pack_format: PackFormat::Float32,
            cache_bytes: default_cache_bytes(),
            shards: default_shards(),
            hnsw_enabled: false,
            hnsw_m: default_hnsw_m(),
            hnsw_ef_construction: default_hnsw_ef_construction(),
            hnsw_ef_search: default_hnsw_ef_search(),
            eager_doc_embedding: false,
        }
    }
}

/// Document handling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Documents beyond this size are sampled head+tail before chunking.
    #[serde(default = "default_doc_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_head_bytes")]
    pub head_bytes: usize,
    #[serde(default = "default_tail_bytes")]
    pub tail_bytes: usize,
}

fn default_doc_max_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_head_bytes() -> usize {
    256 * 1024
}
fn default_tail_bytes() -> usize {
    64 * 1024
}

impl Default for DocumentConfig {
    fn default() -> Self {
        DocumentConfig {
            max_bytes: default_doc_max_bytes(),
            head_bytes: default_head_bytes(),
            tail_bytes: default_tail_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: EngineMode,
    #[serde(default)]
    pub parser_backend: BackendPreference,
    #[serde(default)]
    pub rollout: RolloutPreset,
    /// Explicit flag overrides win over the rollout preset.
    #[serde(default)]
    pub flags: Option<FeatureFlags>,
    /// Allow full reads of sensitive files without a per-call override.
    #[serde(default)]
    pub allow_sensitive: bool,
    /// Extensions excluded from the topology scanner (always full AST).
    #[serde(default)]
    pub topology_opt_out: Vec<String>,
    /// Ghost symbols older than this many seconds are pruned.
    #[serde(default = "default_ghost_max_age")]
    pub ghost_max_age_secs: u64,
    /// Evidence packs expire after this many seconds.
    #[serde(default = "default_pack_ttl")]
    pub pack_ttl_secs: u64,
    #[serde(default)]
    pub trigram: TrigramConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub document: DocumentConfig,
}

fn default_ghost_max_age() -> u64 {
    7 * 24 * 3600
}
fn default_pack_ttl() -> u64 {
    30 * 60
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mode: EngineMode::default(),
            parser_backend: BackendPreference::default(),
            rollout: RolloutPreset::default(),
            flags: None,
            allow_sensitive: false,
            topology_opt_out: Vec::new(),
            ghost_max_age_secs: default_ghost_max_age(),
            pack_ttl_secs: default_pack_ttl(),
            trigram: TrigramConfig::default(),
            search: SearchConfig::default(),
            vector: VectorConfig::default(),
            document: DocumentConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load `scopegraph.toml` from the workspace root (when present), then
    /// apply `SCOPEGRAPH_*` environment overrides.
    pub fn load(root: &Path) -> EngineConfig {
        let mut config = match std::fs::read_to_string(root.join("scopegraph.toml")) {
            Ok(text) => match toml::from_str::<EngineConfig>(&text) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "scopegraph.toml invalid, using defaults");
                    EngineConfig::default()
                }
            },
            Err(_) => EngineConfig::default(),
        };
        config.apply_env();
        config
    }

    /// Environment overrides. Only the knobs that make sense to flip per
    /// process are exposed; structured tables stay in the TOML file.
    fn apply_env(&mut self) {
        if let Ok(mode) = std::env::var("SCOPEGRAPH_MODE") {
            self.mode = match mode.as_str() {
                "ci" => EngineMode::Ci,
                "test" => EngineMode::Test,
                _ => EngineMode::Prod,
            };
        }
        if let Ok(backend) = std::env::var("SCOPEGRAPH_PARSER_BACKEND") {
            self.parser_backend = match backend.as_str() {
                "native" => BackendPreference::Native,
                "snapshot" => BackendPreference::Snapshot,
                _ => BackendPreference::Auto,
            };
        }
        if let Ok(preset) = std::env::var("SCOPEGRAPH_ROLLOUT") {
            if let Some(p) = RolloutPreset::parse(&preset) {
                self.rollout = p;
            }
        }
        if let Ok(provider) = std::env::var("SCOPEGRAPH_EMBED_PROVIDER") {
            self.vector.provider = provider;
        }
        if let Ok(model) = std::env::var("SCOPEGRAPH_EMBED_MODEL") {
            self.vector.model = model;
        }
        if let Ok(fmt) = std::env::var("SCOPEGRAPH_PACK_FORMAT") {
            self.vector.pack_format = match fmt.as_str() {
                "q8" => PackFormat::Q8,
                "both" => PackFormat::Both,
                _ => PackFormat::Float32,
            };
        }
        if let Ok(bytes) = std::env::var("SCOPEGRAPH_VECTOR_CACHE_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.vector.cache_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("SCOPEGRAPH_HNSW") {
            self.vector.hnsw_enabled = v == "1" || v == "true";
        }
        if let Ok(v) = std::env::var("SCOPEGRAPH_EAGER_DOC_EMBED") {
            self.vector.eager_doc_embedding = v == "1" || v == "true";
        }
        if let Ok(v) = std::env::var("SCOPEGRAPH_ALLOW_SENSITIVE") {
            self.allow_sensitive = v == "1" || v == "true";
        }
        if let Ok(bytes) = std::env::var("SCOPEGRAPH_TRIGRAM_MAX_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.trigram.max_file_bytes = n;
            }
        }
        if let Ok(bytes) = std::env::var("SCOPEGRAPH_DOC_MAX_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.document.max_bytes = n;
            }
        }
    }

    /// Resolve the flags in effect, preferring explicit overrides.
    pub fn flag_snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            flags: self.flags.unwrap_or_else(|| self.rollout.flags()),
            preset: self.rollout,
        }
    }

    pub fn topology_opt_out_set(&self) -> HashSet<String> {
        self.topology_opt_out.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Storage layout
// ---------------------------------------------------------------------------

/// Root of all on-disk caches: `$SCOPEGRAPH_STORAGE` or `~/.scopegraph`.
pub fn storage_root() -> PathBuf {
    if let Ok(dir) = std::env::var("SCOPEGRAPH_STORAGE") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".scopegraph")
}

/// Versioned cache directory for a workspace root.
pub fn cache_dir_for_root(root: &Path) -> PathBuf {
    let digest = crate::types::content_hash(&root.to_string_lossy());
    storage_root().join("v1").join(&digest[..16])
}

/// Pack directory for a (provider, model) pair under a workspace cache dir.
pub fn pack_dir(cache_dir: &Path, provider: &str, model: &str) -> PathBuf {
    cache_dir.join("embeddings").join(provider).join(model)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_flag_vectors() {
        let legacy = RolloutPreset::Legacy.flags();
        assert!(!legacy.ucg_enabled && !legacy.adaptive_flow_enabled);

        let shadow = RolloutPreset::Shadow.flags();
        assert!(shadow.dual_write_validation);
        assert!(!shadow.adaptive_flow_enabled);

        let full = RolloutPreset::Full.flags();
        assert!(full.adaptive_flow_enabled && full.ucg_enabled);
        assert!(!full.dual_write_validation);
    }

    #[test]
    fn test_explicit_flags_override_preset() {
        let mut config = EngineConfig::default();
        config.rollout = RolloutPreset::Legacy;
        config.flags = Some(FeatureFlags {
            adaptive_flow_enabled: true,
            ucg_enabled: true,
            topology_scanner_enabled: false,
            dual_write_validation: false,
        });
        let snap = config.flag_snapshot();
        assert!(snap.flags.adaptive_flow_enabled);
        assert!(!snap.flags.topology_scanner_enabled);
    }

    #[test]
    fn test_toml_round_trip_defaults() {
        let config: EngineConfig = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.search.filename_weight, 3.0);
        assert_eq!(config.search.symbol_weight, 2.0);
        assert_eq!(config.search.content_weight, 1.0);
        assert_eq!(config.search.rrf_k, 60.0);
        assert_eq!(config.vector.shards, 4);
        // serde defaults and Default::default agree on the TTLs
        assert_eq!(config.pack_ttl_secs, EngineConfig::default().pack_ttl_secs);
        assert!(EngineConfig::default().pack_ttl_secs >= 60);
        assert!(EngineConfig::default().ghost_max_age_secs > 0);
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
mode = "ci"
[search]
rrf_k = 20.0
[vector]
pack_format = "both"
hnsw_enabled = true
"#,
        )
        .expect("partial config should parse");
        assert_eq!(config.mode, EngineMode::Ci);
        assert_eq!(config.search.rrf_k, 20.0);
        assert_eq!(config.vector.pack_format, PackFormat::Both);
        assert!(config.vector.hnsw_enabled);
        // untouched sections keep defaults
        assert_eq!(config.trigram.max_trigrams_per_file, 20_000);
    }
}
