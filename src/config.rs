//! Runtime configuration.
//!
//! Every knob has a default; a config file only needs the keys it overrides.
//! The server binary loads this from JSON and applies env overrides for the
//! listener ports and data directory.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for KV files, WAL segments, snapshots and the audit log.
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub wal: WalConfig,
    pub snapshot: SnapshotConfig,
    pub search: SearchConfig,
    pub fulltext: FulltextConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub embedding: EmbeddingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            server: ServerConfig::default(),
            wal: WalConfig::default(),
            snapshot: SnapshotConfig::default(),
            search: SearchConfig::default(),
            fulltext: FulltextConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bolt listener port.
    pub bolt_port: u16,
    /// HTTP listener port.
    pub http_port: u16,
    /// Bind address for both listeners.
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bolt_port: 7687,
            http_port: 7474,
            bind_address: "127.0.0.1".to_owned(),
        }
    }
}

/// WAL fsync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// fsync every record. Strict durable ordering.
    Immediate,
    /// Group commit: one fsync per window or byte budget.
    Batch,
    /// No fsync; the kernel flushes opportunistically.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub sync_mode: SyncMode,
    /// Group-commit window in milliseconds (batch mode).
    pub group_window_ms: u64,
    /// Group-commit byte budget (batch mode).
    pub group_bytes: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Batch,
            group_window_ms: 5,
            group_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Rotate when the WAL exceeds this many bytes.
    pub size_bytes: u64,
    /// Rotate after this much wall time, in seconds.
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            size_bytes: 100 * 1024 * 1024,
            interval_secs: 3600,
        }
    }
}

impl SnapshotConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// RRF smoothing constant.
    pub rrf_k: f64,
    /// Adapt branch weights to query length.
    pub rrf_adaptive: bool,
    /// Fused results below this score are dropped.
    pub rrf_min_score: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            rrf_adaptive: true,
            rrf_min_score: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FulltextConfig {
    /// Property keys whose string values are indexed for BM25.
    pub properties: Vec<String>,
    /// Fold accented characters to ASCII before indexing.
    pub ascii_folding: bool,
}

impl Default for FulltextConfig {
    fn default() -> Self {
        Self {
            properties: [
                "content",
                "text",
                "title",
                "name",
                "description",
                "path",
                "summary",
                "body",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
            ascii_folding: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require credentials on Bolt and HTTP.
    pub enabled: bool,
    /// Initial account (`user:password`) created when auth is enabled.
    pub default_account: String,
    /// Bearer token lifetime in seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_account: "neo4j:password".to_owned(),
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Idle cutoff for explicit transactions, in seconds.
    pub transaction_expiry_secs: u64,
    /// Per-query timeout, in seconds.
    pub query_timeout_secs: u64,
    /// Hard cap on variable-length pattern expansion depth.
    pub varlen_max_hops: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            transaction_expiry_secs: 30,
            query_timeout_secs: 60,
            varlen_max_hops: 15,
        }
    }
}

impl LimitsConfig {
    pub fn transaction_expiry(&self) -> Duration {
        Duration::from_secs(self.transaction_expiry_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Endpoint of the external embedding service. Empty disables
    /// string-query embedding (vector procedures then require a vector).
    pub endpoint: String,
    /// Model name forwarded to the service.
    pub model: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "default".to_owned(),
            timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| crate::Error::StorageError(format!("invalid config: {e}")))
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.server.bolt_port, 7687);
        assert_eq!(cfg.server.http_port, 7474);
        assert_eq!(cfg.wal.sync_mode, SyncMode::Batch);
        assert_eq!(cfg.wal.group_window_ms, 5);
        assert_eq!(cfg.limits.varlen_max_hops, 15);
        assert!(cfg.fulltext.properties.contains(&"content".to_owned()));
    }

    #[test]
    fn test_partial_overrides() {
        let cfg: Config =
            serde_json::from_str(r#"{"wal": {"sync_mode": "immediate"}}"#).unwrap();
        assert_eq!(cfg.wal.sync_mode, SyncMode::Immediate);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.search.rrf_k, 60.0);
    }
}
