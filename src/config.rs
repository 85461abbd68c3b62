use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis holding routes and credentials
    #[serde(default)]
    pub store: StoreConfig,

    /// Docker swarm service discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Operator credentials
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Admin API port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Redis host (default: 127.0.0.1)
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port (default: 6379)
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis logical database (default: 0)
    #[serde(default)]
    pub db: u8,

    /// Key prefix shared with the proxy engine; empty disables prefixing
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Deadline for each Redis round trip in milliseconds (default: 2000)
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Rewrite path-less route keys to the canonical form at startup
    #[serde(default = "default_true")]
    pub migrate_legacy_keys: bool,
}

impl StoreConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            prefix: default_prefix(),
            timeout_ms: default_store_timeout(),
            migrate_legacy_keys: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Docker endpoint (`unix://` or `tcp://`); falls back to DOCKER_HOST, then the default socket
    pub docker_host: Option<String>,

    /// Overlay network a service must join to be routable (default: proxy)
    #[serde(default = "default_proxy_network")]
    pub proxy_network: String,

    /// Deadline for each Docker API call in seconds (default: 10)
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            proxy_network: default_proxy_network(),
            timeout_secs: default_discovery_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// bcrypt work factor for new hashes (default: 12)
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    /// Realm announced in WWW-Authenticate
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Account created when no credential exists yet
    pub bootstrap_user: Option<String>,

    /// Password for `bootstrap_user`
    pub bootstrap_password: Option<String>,
}

impl AuthConfig {
    pub fn bootstrap(&self) -> Option<(&str, &str)> {
        match (&self.bootstrap_user, &self.bootstrap_password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: default_bcrypt_cost(),
            realm: default_realm(),
            bootstrap_user: None,
            bootstrap_password: None,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_prefix() -> String {
    "proxy".to_string()
}

fn default_store_timeout() -> u64 {
    2000 // 2 seconds per round trip
}

fn default_true() -> bool {
    true
}

fn default_proxy_network() -> String {
    "proxy".to_string()
}

fn default_discovery_timeout() -> u64 {
    10
}

fn default_bcrypt_cost() -> u32 {
    12
}

fn default_realm() -> String {
    "routekeeper".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }

        if self.store.timeout_ms == 0 {
            errors.push("store: 'timeout_ms' must be greater than 0".to_string());
        }

        if self.store.prefix.contains(['*', '?', '[']) {
            errors.push(format!(
                "store: 'prefix' must not contain glob characters (got '{}')",
                self.store.prefix
            ));
        }

        if self.discovery.proxy_network.trim().is_empty() {
            errors.push("discovery: 'proxy_network' must not be empty".to_string());
        }

        if self.discovery.timeout_secs == 0 {
            errors.push("discovery: 'timeout_secs' must be greater than 0".to_string());
        }

        if !(bcrypt_cost_range().contains(&self.auth.bcrypt_cost)) {
            errors.push(format!(
                "auth: 'bcrypt_cost' must be between 4 and 31 (got {})",
                self.auth.bcrypt_cost
            ));
        }

        if self.auth.bootstrap_user.is_some() != self.auth.bootstrap_password.is_some() {
            errors.push(
                "auth: 'bootstrap_user' and 'bootstrap_password' must be set together".to_string(),
            );
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn bcrypt_cost_range() -> std::ops::RangeInclusive<u32> {
    4..=31
}
