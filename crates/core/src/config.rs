//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Deployment environment.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Testing,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Testing => "testing",
            Self::Production => "production",
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8000").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// SECURITY: When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage (MinIO in development).
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// Region. Defaults to us-east-1.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// Access key.
        /// WARNING: Prefer PANTRY_STORAGE__ACCESS_KEY_ID over storing secrets in config files.
        access_key_id: Option<String>,
        /// Secret key.
        /// WARNING: Prefer PANTRY_STORAGE__SECRET_ACCESS_KEY over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (development and tests).
    Sqlite {
        /// Database file path, or ":memory:".
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer PANTRY_METADATA__PASSWORD over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("metadata.max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Expired group reconciliation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run the recurring reconciliation scheduler (default: true).
    #[serde(default = "default_reconcile_enabled")]
    pub enabled: bool,
    /// Seconds between passes (default: 1 hour).
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Fire one pass immediately after startup instead of waiting a full interval.
    #[serde(default)]
    pub run_on_startup: bool,
    /// Upper bound for the object deletions of one group. A group that exceeds
    /// it is treated as failed and retried later; its metadata is untouched.
    #[serde(default = "default_group_timeout_secs")]
    pub group_timeout_secs: u64,
    /// Groups processed concurrently within one pass.
    #[serde(default = "default_max_concurrent_groups")]
    pub max_concurrent_groups: usize,
    /// Object deletions issued concurrently within one group.
    #[serde(default = "default_max_concurrent_deletes")]
    pub max_concurrent_deletes: usize,
    /// Base delay before a failed group is retried. 0 retries on every pass.
    #[serde(default)]
    pub retry_backoff_base_secs: u64,
    /// Cap on the retry delay.
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
    /// Stop retrying a group after this many failed attempts (default: unlimited).
    /// Held groups keep their metadata and are reported on every pass.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Report what would be deleted without deleting anything.
    #[serde(default)]
    pub dry_run: bool,
    /// Age after which a `running` pass record no longer holds the pass lease
    /// (default: 6 hours). Older records are marked failed at startup and
    /// whenever a pass finds the lease taken. Must exceed the longest pass.
    #[serde(default = "default_pass_lease_ttl_secs")]
    pub pass_lease_ttl_secs: u64,
}

fn default_reconcile_enabled() -> bool {
    true
}

fn default_reconcile_interval_secs() -> u64 {
    crate::DEFAULT_RECONCILE_INTERVAL_SECS
}

fn default_group_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent_groups() -> usize {
    4
}

fn default_max_concurrent_deletes() -> usize {
    8
}

fn default_retry_backoff_max_secs() -> u64 {
    86_400 // 1 day
}

fn default_pass_lease_ttl_secs() -> u64 {
    21_600 // 6 hours
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconcile_enabled(),
            interval_secs: default_reconcile_interval_secs(),
            run_on_startup: false,
            group_timeout_secs: default_group_timeout_secs(),
            max_concurrent_groups: default_max_concurrent_groups(),
            max_concurrent_deletes: default_max_concurrent_deletes(),
            retry_backoff_base_secs: 0,
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
            max_attempts: None,
            dry_run: false,
            pass_lease_ttl_secs: default_pass_lease_ttl_secs(),
        }
    }
}

impl ReconcileConfig {
    /// Interval between passes.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    /// Per-group processing ceiling.
    pub fn group_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.group_timeout_secs)
    }

    /// Age after which a `running` pass record counts as abandoned.
    pub fn pass_lease_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.pass_lease_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Delay before the next attempt for a group that has already failed
    /// `failed_attempts` times (counting the failure being recorded).
    ///
    /// Doubles per attempt starting from the base and saturates at the cap.
    pub fn retry_delay(&self, failed_attempts: u32) -> Duration {
        if self.retry_backoff_base_secs == 0 {
            return Duration::ZERO;
        }
        let exponent = failed_attempts.saturating_sub(1).min(32);
        let secs = self
            .retry_backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.retry_backoff_max_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    /// Validate reconciliation settings that would break the scheduler at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("reconcile.interval_secs cannot be 0. \
                 This would cause a panic when creating the scheduler timer."
                .to_string());
        }
        if self.group_timeout_secs == 0 {
            return Err("reconcile.group_timeout_secs must be at least 1".to_string());
        }
        if self.max_concurrent_groups == 0 || self.max_concurrent_deletes == 0 {
            return Err(
                "reconcile.max_concurrent_groups and max_concurrent_deletes must be at least 1"
                    .to_string(),
            );
        }
        if self.retry_backoff_max_secs > i64::MAX as u64 {
            return Err(format!(
                "reconcile.retry_backoff_max_secs {} exceeds maximum value {}",
                self.retry_backoff_max_secs,
                i64::MAX
            ));
        }
        if self.max_attempts == Some(0) {
            return Err("reconcile.max_attempts must be at least 1 when set".to_string());
        }
        if self.pass_lease_ttl_secs <= self.group_timeout_secs {
            return Err(format!(
                "reconcile.pass_lease_ttl_secs ({}) must be greater than group_timeout_secs ({})",
                self.pass_lease_ttl_secs, self.group_timeout_secs
            ));
        }
        Ok(())
    }
}

/// Logging and error reporting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub json_logs: bool,
    /// Send pass-level and migration-level failures to the error reporter
    /// (default: true).
    #[serde(default = "default_report_errors")]
    pub report_errors: bool,
    /// Sentry DSN. When set, reported errors are also sent to Sentry.
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

fn default_report_errors() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            report_errors: default_report_errors(),
            sentry_dsn: None,
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Expired group reconciliation.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Logging and error reporting.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing() -> Self {
        Self {
            environment: Environment::Testing,
            ..Self::default()
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.reconcile.validate()?;
        Ok(())
    }
}
