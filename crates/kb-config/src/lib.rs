//! TOML configuration loading, merging and validation: a
//! `ConfigError`/`ConfigWarning` pair, a config struct with a sensible
//! `Default`, and a `load` entry point the daemon and CLI binaries both
//! call at startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },
    #[error("failed to parse config: {reason}")]
    ParseError { reason: String },
    #[error("config failed validation: {}", .reasons.join("; "))]
    ValidationError { reasons: Vec<String> },
    #[error("conflicting config sources: {reason}")]
    MergeConflict { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    DeprecatedField { field: String },
    MissingOptionalField { field: String },
    LargeTimeout { field: String, secs: u64 },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::DeprecatedField { field } => write!(f, "field `{field}` is deprecated"),
            ConfigWarning::MissingOptionalField { field } => {
                write!(f, "optional field `{field}` not set, using default")
            }
            ConfigWarning::LargeTimeout { field, secs } => {
                write!(f, "timeout `{field}` is unusually large: {secs}s")
            }
        }
    }
}

/// One configurable model gateway backend. `Mock` is used by tests and
/// by `kb-cli init-index` dry runs; `Http` is the production path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelBackendEntry {
    Mock {},
    Http { url: String, timeout_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSearchConfig {
    pub vector_weight: f32,
    pub bm25_weight: f32,
}

impl Default for HybridSearchConfig {
    fn default() -> Self {
        HybridSearchConfig {
            vector_weight: 0.7,
            bm25_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub cpu_pool_size: usize,
    pub model_pool_size: usize,
    pub queue_capacity: usize,
    pub lease_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            cpu_pool_size: num_cpus_fallback(),
            model_pool_size: 4,
            queue_capacity: 256,
            lease_ttl_secs: 60,
            heartbeat_interval_secs: 10,
            max_attempts: 5,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Average confidence below which the Render/OCR stage prefers
    /// native text over OCR output, per spec §4.7 edge policies.
    pub low_confidence_threshold: f32,
    /// Deep-mode re-OCR trigger: per-region confidence below this
    /// triggers a higher-DPI re-pass (spec §9 Open Question — fixed here
    /// as a configuration value rather than a hardcoded constant).
    pub deep_reocr_threshold: f32,
    pub default_engine: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        OcrConfig {
            low_confidence_threshold: 0.3,
            deep_reocr_threshold: 0.6,
            default_engine: "tesseract".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KbConfig {
    pub log_level: String,
    pub blob_root: PathBuf,
    pub metadata_dsn: Option<String>,
    pub index_hosts: Vec<String>,
    pub embedding_backend: ModelBackendEntry,
    pub vlm_backend: ModelBackendEntry,
    pub token_signing_secret: String,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    pub hybrid_search: HybridSearchConfig,
    pub worker_pools: WorkerPoolConfig,
    pub ocr: OcrConfig,
    pub extra: BTreeMap<String, String>,
}

impl Default for KbConfig {
    fn default() -> Self {
        KbConfig {
            log_level: "info".to_string(),
            blob_root: PathBuf::from("./data/blobs"),
            metadata_dsn: None,
            index_hosts: Vec::new(),
            embedding_backend: ModelBackendEntry::Mock {},
            vlm_backend: ModelBackendEntry::Mock {},
            token_signing_secret: "change-me".to_string(),
            access_token_ttl_secs: 3600,
            refresh_token_ttl_secs: 14 * 24 * 3600,
            hybrid_search: HybridSearchConfig::default(),
            worker_pools: WorkerPoolConfig::default(),
            ocr: OcrConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl KbConfig {
    /// Loads and validates a TOML file, returning non-fatal warnings
    /// alongside the parsed config, following the reference config
    /// crate's `load` shape.
    pub fn load(path: impl AsRef<Path>) -> Result<(KbConfig, Vec<ConfigWarning>), ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<(KbConfig, Vec<ConfigWarning>), ConfigError> {
        let config: KbConfig = toml::from_str(raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if self.token_signing_secret.trim().is_empty() {
            reasons.push("token_signing_secret must not be empty".to_string());
        }
        if self.hybrid_search.vector_weight < 0.0 || self.hybrid_search.bm25_weight < 0.0 {
            reasons.push("hybrid search weights must be non-negative".to_string());
        }
        if self.worker_pools.cpu_pool_size == 0 {
            reasons.push("worker_pools.cpu_pool_size must be at least 1".to_string());
        }
        if self.worker_pools.model_pool_size == 0 {
            reasons.push("worker_pools.model_pool_size must be at least 1".to_string());
        }

        for (field, secs) in [
            ("access_token_ttl_secs", self.access_token_ttl_secs),
            ("refresh_token_ttl_secs", self.refresh_token_ttl_secs),
            ("worker_pools.lease_ttl_secs", self.worker_pools.lease_ttl_secs),
        ] {
            if secs > MAX_TIMEOUT_SECS {
                reasons.push(format!("{field} exceeds maximum of {MAX_TIMEOUT_SECS}s"));
            } else if secs > MAX_TIMEOUT_SECS / 2 {
                warnings.push(ConfigWarning::LargeTimeout {
                    field: field.to_string(),
                    secs,
                });
            }
        }

        if self.index_hosts.is_empty() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "index_hosts".to_string(),
            });
        }

        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_validates_cleanly() {
        let cfg = KbConfig::default();
        let warnings = cfg.validate().expect("default must validate");
        assert!(warnings.is_empty());
    }

    #[test]
    fn empty_secret_fails_validation() {
        let mut cfg = KbConfig::default();
        cfg.token_signing_secret = "".to_string();
        let err = cfg.validate().unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("token_signing_secret")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_file_surfaces_file_not_found() {
        let err = KbConfig::load("/nonexistent/path/kb.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn loads_from_disk_and_warns_on_empty_index_hosts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"log_level = "debug""#).unwrap();
        let (cfg, warnings) = KbConfig::load(file.path()).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::MissingOptionalField { field } if field == "index_hosts")));
    }
}
