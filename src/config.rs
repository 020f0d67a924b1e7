use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

/// Connection-pool tunables. Mirrored into `pool::PoolConfig` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Worker sessions allowed per user.
    pub max_workers: usize,
    /// Seconds before an unlocked session is probed with NOOP on reuse.
    pub health_check_threshold_seconds: u64,
    /// Seconds of idleness after which the janitor retires a worker session.
    pub worker_idle_timeout_seconds: u64,
    /// TCP dial timeout in seconds.
    pub dial_timeout_seconds: u64,
    /// Plaintext IMAP/SMTP for test setups; TLS in production.
    pub use_tls: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_workers: 3,
            health_check_threshold_seconds: 60,
            worker_idle_timeout_seconds: 600,
            dial_timeout_seconds: 5,
            use_tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Folder cache TTL in seconds; `should_sync` is true past this age.
    pub cache_ttl_seconds: u64,
    /// Deadline for the background thread-count refresh.
    pub count_refresh_timeout_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            count_refresh_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    pub database_url: String,
    /// 64 hex characters (32 bytes) for AES-256-GCM credential encryption.
    pub encryption_master_key: String,
    /// Default undo window applied when a user has no settings row yet.
    pub undo_send_delay_seconds: u32,
    pub pool: PoolSettings,
    pub sync: SyncSettings,
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let default_config_path = "config/default.toml";
        let path_to_use = config_path.unwrap_or(default_config_path);

        let builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("undo_send_delay_seconds", 20)?
            .set_default("pool.max_workers", 3)?
            .set_default("pool.health_check_threshold_seconds", 60)?
            .set_default("pool.worker_idle_timeout_seconds", 600)?
            .set_default("pool.dial_timeout_seconds", 5)?
            .set_default("pool.use_tls", true)?
            .set_default("sync.cache_ttl_seconds", 300)?
            .set_default("sync.count_refresh_timeout_seconds", 30)?
            // File is optional; environment overrides everything.
            // VMAIL_DATABASE_URL, VMAIL_POOL__MAX_WORKERS, ...
            .add_source(File::with_name(path_to_use).required(false))
            .add_source(
                Environment::with_prefix("VMAIL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.sync.cache_ttl_seconds)
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load or parse configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_applied_from_env_only() {
        std::env::set_var("VMAIL_DATABASE_URL", "postgres://localhost/vmail");
        std::env::set_var("VMAIL_ENCRYPTION_MASTER_KEY", "00".repeat(32));

        let settings = Settings::new(Some("does/not/exist.toml")).unwrap();
        assert_eq!(settings.pool.max_workers, 3);
        assert_eq!(settings.pool.dial_timeout_seconds, 5);
        assert_eq!(settings.sync.cache_ttl_seconds, 300);
        assert_eq!(settings.undo_send_delay_seconds, 20);
        assert!(settings.pool.use_tls);

        std::env::remove_var("VMAIL_DATABASE_URL");
        std::env::remove_var("VMAIL_ENCRYPTION_MASTER_KEY");
    }

    #[test]
    #[serial]
    fn environment_overrides_defaults() {
        std::env::set_var("VMAIL_DATABASE_URL", "postgres://localhost/vmail");
        std::env::set_var("VMAIL_ENCRYPTION_MASTER_KEY", "00".repeat(32));
        std::env::set_var("VMAIL_POOL__MAX_WORKERS", "7");
        std::env::set_var("VMAIL_POOL__USE_TLS", "false");

        let settings = Settings::new(Some("does/not/exist.toml")).unwrap();
        assert_eq!(settings.pool.max_workers, 7);
        assert!(!settings.pool.use_tls);

        std::env::remove_var("VMAIL_DATABASE_URL");
        std::env::remove_var("VMAIL_ENCRYPTION_MASTER_KEY");
        std::env::remove_var("VMAIL_POOL__MAX_WORKERS");
        std::env::remove_var("VMAIL_POOL__USE_TLS");
    }
}
