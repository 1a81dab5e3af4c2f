use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub prober: ProberConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// API port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Bearer token for every route except health, version and connection types.
    /// If not set, a random token is generated at startup and logged
    pub api_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Largest accepted request body in bytes (default: 64 KiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            api_token: None,
            pid_file: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Records live only as long as the process
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite file (default: ./data/connwatch.db)
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
        }
    }
}

/// Where the credential codec gets its key
#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    /// JSON key file written by `connwatch keygen`
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Environment variable holding a base64 key; wins over the key file when set
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            key_env: default_key_env(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProberConfig {
    /// Default probe timeout in milliseconds (default: 10000)
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Upper bound for a per-call timeout override (default: 60000)
    #[serde(default = "default_max_probe_timeout_ms")]
    pub max_timeout_ms: u64,

    /// PEM bundle used to verify TLS for Redis and MongoDB probes
    #[serde(default = "default_ca_bundle")]
    pub ca_bundle: Option<PathBuf>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            max_timeout_ms: default_max_probe_timeout_ms(),
            ca_bundle: default_ca_bundle(),
        }
    }
}

impl ProberConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    /// Per-call timeout, clamped to the configured maximum
    pub fn clamp_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms.min(self.max_timeout_ms)),
            _ => self.timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Run the background loop (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between scans for due schedules (default: 30)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Probes in flight across all runs (default: 8)
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    /// Age after which an orphaned Running schedule or Testing connection is reset (default: 900)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Seconds in-flight runs get to finish on shutdown (default: 10)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
            max_concurrent_probes: default_max_concurrent_probes(),
            stale_after_secs: default_stale_after(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Webhook delivery of probe and run events
#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub url: String,

    /// HMAC key for the X-Connwatch-Signature header
    pub secret: Option<String>,

    /// Only deliver events with these names (default: all)
    #[serde(default)]
    pub events: Vec<String>,

    /// Only deliver failures (default: false)
    #[serde(default)]
    pub failures_only: bool,

    /// Request timeout in seconds (default: 10)
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, index: usize) -> Result<(), String> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(format!("notifications.webhooks[{}]: url must be http(s)", index));
        }
        for name in &self.events {
            if name != "probe_completed" && name != "run_completed" {
                return Err(format!(
                    "notifications.webhooks[{}]: unknown event '{}'",
                    index, name
                ));
            }
        }
        if self.timeout_secs == 0 {
            return Err(format!(
                "notifications.webhooks[{}]: 'timeout_secs' must be greater than 0",
                index
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/connwatch.db")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("./data/master.key")
}

fn default_key_env() -> String {
    "CONNWATCH_MASTER_KEY".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_max_probe_timeout_ms() -> u64 {
    60_000
}

fn default_ca_bundle() -> Option<PathBuf> {
    Some(PathBuf::from("/etc/ssl/certs/ca-certificates.crt"))
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_concurrent_probes() -> usize {
    8
}

fn default_stale_after() -> u64 {
    900
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_webhook_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.max_body_bytes == 0 {
            errors.push("server.max_body_bytes must be greater than 0".to_string());
        }
        if self.prober.timeout_ms == 0 {
            errors.push("prober.timeout_ms must be greater than 0".to_string());
        }
        if self.prober.max_timeout_ms < self.prober.timeout_ms {
            errors.push("prober.max_timeout_ms must not be below prober.timeout_ms".to_string());
        }
        if self.scheduler.poll_interval_secs == 0 {
            errors.push("scheduler.poll_interval_secs must be greater than 0".to_string());
        }
        if self.scheduler.max_concurrent_probes == 0 {
            errors.push("scheduler.max_concurrent_probes must be greater than 0".to_string());
        }
        if self.scheduler.stale_after_secs.saturating_mul(1000) <= self.prober.max_timeout_ms {
            errors.push(
                "scheduler.stale_after_secs must exceed the longest probe timeout".to_string(),
            );
        }
        if self.secrets.key_env.trim().is_empty() {
            errors.push("secrets.key_env must not be empty".to_string());
        }

        for (index, webhook) in self.notifications.webhooks.iter().enumerate() {
            if let Err(e) = webhook.validate(index) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.database.backend, StorageBackend::Sqlite);
        assert_eq!(config.prober.timeout(), Duration::from_secs(10));
        assert_eq!(config.scheduler.max_concurrent_probes, 8);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.secrets.key_env, "CONNWATCH_MASTER_KEY");
        assert!(config.notifications.webhooks.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [server]
            port = 9090
            bind = "0.0.0.0"
            api_token = "secret-token"
            pid_file = "/run/connwatch.pid"

            [database]
            backend = "memory"

            [secrets]
            key_file = "/etc/connwatch/master.key"

            [prober]
            timeout_ms = 5000
            ca_bundle = "/etc/pki/tls/cert.pem"

            [scheduler]
            poll_interval_secs = 15
            max_concurrent_probes = 4
            stale_after_secs = 600
            shutdown_grace_secs = 5

            [[notifications.webhooks]]
            url = "https://hooks.example.com/connwatch"
            secret = "whsec"
            events = ["run_completed"]
            failures_only = true
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.api_token.as_deref(), Some("secret-token"));
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(
            config.secrets.key_file,
            PathBuf::from("/etc/connwatch/master.key")
        );
        assert_eq!(config.prober.timeout(), Duration::from_secs(5));
        assert_eq!(
            config.prober.ca_bundle,
            Some(PathBuf::from("/etc/pki/tls/cert.pem"))
        );
        assert_eq!(config.scheduler.stale_after(), chrono::Duration::minutes(10));
        assert_eq!(config.scheduler.shutdown_grace(), Duration::from_secs(5));

        let webhook = &config.notifications.webhooks[0];
        assert!(webhook.failures_only);
        assert_eq!(webhook.timeout(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
            [prober]
            timeout_ms = 0

            [scheduler]
            poll_interval_secs = 0
            max_concurrent_probes = 0

            [[notifications.webhooks]]
            url = "ftp://example.com"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("prober.timeout_ms"));
        assert!(err.contains("poll_interval_secs"));
        assert!(err.contains("max_concurrent_probes"));
        assert!(err.contains("webhooks[0]"));
    }

    #[test]
    fn test_stale_threshold_must_exceed_probe_timeout() {
        let toml = r#"
            [prober]
            max_timeout_ms = 120000

            [scheduler]
            stale_after_secs = 60
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("stale_after_secs"));
    }

    #[test]
    fn test_clamp_timeout() {
        let prober = ProberConfig::default();
        assert_eq!(prober.clamp_timeout(None), Duration::from_secs(10));
        assert_eq!(prober.clamp_timeout(Some(0)), Duration::from_secs(10));
        assert_eq!(prober.clamp_timeout(Some(250)), Duration::from_millis(250));
        assert_eq!(prober.clamp_timeout(Some(999_999)), Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_webhook_event_rejected() {
        let toml = r#"
            [[notifications.webhooks]]
            url = "https://example.com"
            events = ["deploy_finished"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
