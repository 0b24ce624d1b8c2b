use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `UPLIFT__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub segments: SegmentCatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "uplift-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            state: StateConfig::default(),
            storage: StorageConfig::default(),
            segments: SegmentCatalogConfig::default(),
        }
    }
}

// ─── State Codec Config ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    AesGcm,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_codec")]
    pub codec: CodecKind,
    /// Base64-encoded 256-bit key for the AES-GCM codec. The baked-in
    /// value is for local development only.
    #[serde(default = "default_state_key")]
    pub key_base64: String,
}

fn default_codec() -> CodecKind {
    CodecKind::AesGcm
}
fn default_state_key() -> String {
    "dXBsaWZ0LWRldi1zdGF0ZS1rZXktMDEyMzQ1Njc4OWE=".to_string()
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            key_base64: default_state_key(),
        }
    }
}

// ─── Storage Runtime Config ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_duration_secs() -> u64 {
    30
}
fn default_half_open_successes() -> u32 {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration_secs(),
            half_open_successes: default_half_open_successes(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ─── Segment Catalog Config ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentCatalogConfig {
    #[serde(default = "default_catalog_ttl_secs")]
    pub catalog_ttl_secs: u64,
}

fn default_catalog_ttl_secs() -> u64 {
    300
}

impl Default for SegmentCatalogConfig {
    fn default() -> Self {
        Self {
            catalog_ttl_secs: default_catalog_ttl_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("UPLIFT")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
