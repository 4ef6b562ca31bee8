use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the fleet controller
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FleetConfig {
    /// Control API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Persistence backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Outbound client used to reach proxy admin endpoints
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Periodic liveness probing
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_api_bind")]
    pub bind: String,

    /// Port for the control API (default: 7070)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required by the control API.
    /// If not set, a random token is generated at startup and logged
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            port: default_api_port(),
            token: None,
        }
    }
}

/// Which repository implementation backs the fleet
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Relational tables in a SQLite file (default)
    #[default]
    Sqlite,
    /// JSON documents kept in a single file
    #[serde(alias = "json")]
    Document,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database or document file. ":memory:" keeps everything in process
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn in_memory(backend: StoreBackend) -> Self {
        Self {
            backend,
            path: IN_MEMORY_PATH.to_string(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_PATH
    }
}

pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// URL scheme used to reach admin endpoints ("http" only for now)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per target host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Start the monitor together with the control API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Milliseconds between probe cycles (default: 5 minutes)
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Timebox for a single probe, must be shorter than the interval
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// Default value functions
fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    7070
}

fn default_store_path() -> String {
    "./fleet.db".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    4
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    300_000 // 5 minutes
}

fn default_probe_timeout() -> u64 {
    2_000
}

impl FleetConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.gateway.scheme != "http" {
            errors.push(format!(
                "gateway.scheme '{}' is not supported (expected \"http\")",
                self.gateway.scheme
            ));
        }

        if self.gateway.request_timeout_secs == 0 {
            errors.push("gateway.request_timeout_secs must be greater than 0".to_string());
        }

        if self.health.interval_ms == 0 {
            errors.push("health.interval_ms must be greater than 0".to_string());
        } else if self.health.probe_timeout_ms >= self.health.interval_ms {
            errors.push(format!(
                "health.probe_timeout_ms ({}) must be shorter than health.interval_ms ({})",
                self.health.probe_timeout_ms, self.health.interval_ms
            ));
        }

        if self.store.path.trim().is_empty() {
            errors.push("store.path must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
