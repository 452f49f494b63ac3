//! Pantry daemon binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use pantry_core::config::{AppConfig, Environment, TelemetryConfig};
use pantry_server::bootstrap::{prepare_metadata, recover_orphaned_passes};
use pantry_server::reporter::{ErrorReporter, LogReporter, NoopReporter, SentryReporter};
use pantry_server::{AppState, Reconciler, Scheduler, TriggerOutcome, create_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pantry - content lifecycle backend
#[derive(Parser, Debug)]
#[command(name = "pantryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "PANTRY_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,

    /// Apply pending schema migrations and exit
    #[arg(long)]
    migrate_only: bool,

    /// Run a single reconciliation pass and exit
    #[arg(long, conflicts_with = "migrate_only")]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, has_config_file) = load_config(&args.config)?;
    init_tracing(config.telemetry.json_logs);

    tracing::info!("Pantry v{}", env!("CARGO_PKG_VERSION"));
    if has_config_file {
        tracing::info!(config_path = %args.config, "Loaded configuration from file");
    } else {
        tracing::info!("Using environment variables for configuration");
    }
    if config.reconcile.dry_run {
        tracing::warn!("Reconciliation is in dry-run mode, nothing will be deleted");
    }

    // Flushes pending events on drop, so it lives until main returns.
    let _sentry = init_sentry(&config.telemetry, config.environment)?;
    let reporter = select_reporter(&config.telemetry);

    // Migration gate: nothing else runs until the schema is current.
    let metadata = match prepare_metadata(&config.metadata).await {
        Ok(metadata) => metadata,
        Err(e) => {
            reporter.report_error("migration_gate", &*e);
            return Err(e);
        }
    };
    tracing::info!(backend = metadata.backend_name(), "Metadata store ready");

    if args.migrate_only {
        tracing::info!("Migrations complete, exiting");
        return Ok(());
    }

    pantry_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = pantry_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend connectivity verified");

    let recovered = recover_orphaned_passes(
        metadata.as_ref(),
        time::OffsetDateTime::now_utc(),
        config.reconcile.pass_lease_ttl(),
    )
    .await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "Recovered orphaned reconciliation passes");
    }

    let reconciler = Arc::new(
        Reconciler::new(metadata.clone(), storage.clone(), config.reconcile.clone())
            .with_reporter(reporter),
    );
    let scheduler = Arc::new(Scheduler::new(reconciler));
    let cancel = CancellationToken::new();

    if args.once {
        return match scheduler.trigger(&cancel).await {
            TriggerOutcome::Completed(summary) => {
                tracing::info!(
                    pass_id = %summary.pass_id,
                    groups_deleted = summary.stats.groups_deleted,
                    groups_failed = summary.stats.groups_failed,
                    "Single pass complete"
                );
                Ok(())
            }
            TriggerOutcome::Skipped(reason) => {
                tracing::info!(reason = ?reason, "Single pass skipped");
                Ok(())
            }
            TriggerOutcome::Failed(e) => Err(e).context("reconciliation pass failed"),
        };
    }

    let scheduler_handle = if config.reconcile.enabled {
        Some(tokio::spawn(scheduler.clone().run(cancel.clone())))
    } else {
        tracing::info!("Reconciliation scheduler disabled");
        None
    };

    let state = AppState::new(config.clone(), storage, metadata);
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    // The server is down; make sure the scheduler stops too, then let any
    // in-flight group finish.
    cancel.cancel();
    if let Some(handle) = scheduler_handle {
        tracing::info!("Waiting for reconciliation scheduler to stop");
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Reconciliation scheduler task failed");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Load configuration from an optional TOML file and `PANTRY_` env vars.
fn load_config(path: &str) -> Result<(AppConfig, bool)> {
    let config_path = std::path::Path::new(path);
    let has_config_file = config_path.exists();

    let mut figment = Figment::new();
    if has_config_file {
        figment = figment.merge(Toml::file(path));
    }

    // PANTRY_CONFIG only names the file.
    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("PANTRY_") && key != "PANTRY_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: pantryd --config /path/to/config.toml\n  \
             2. Environment variables: PANTRY_METADATA__TYPE=sqlite \
             PANTRY_METADATA__PATH=/var/lib/pantry/metadata.db pantryd\n\n\
             See config/server.example.toml for example configuration.\n\
             Set PANTRY_CONFIG env var to specify a default config file path."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("PANTRY_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    Ok((config, has_config_file))
}

fn init_sentry(
    telemetry: &TelemetryConfig,
    environment: Environment,
) -> Result<Option<sentry::ClientInitGuard>> {
    let Some(dsn) = telemetry.sentry_dsn.as_deref() else {
        return Ok(None);
    };
    let dsn: sentry::types::Dsn = dsn.parse().context("invalid telemetry.sentry_dsn")?;
    let guard = sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        environment: Some(environment.as_str().into()),
        ..Default::default()
    });
    tracing::info!("Sentry error reporting enabled");
    Ok(Some(guard))
}

fn select_reporter(telemetry: &TelemetryConfig) -> Arc<dyn ErrorReporter> {
    match (telemetry.report_errors, telemetry.sentry_dsn.is_some()) {
        (false, _) => Arc::new(NoopReporter),
        (true, true) => Arc::new(SentryReporter),
        (true, false) => Arc::new(LogReporter),
    }
}

fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "unable to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping reconciliation and HTTP server");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
environment = "testing"

[server]
bind = "127.0.0.1:9090"

[storage]
type = "filesystem"
path = "/tmp/pantry-objects"

[metadata]
type = "sqlite"
path = "/tmp/pantry.db"

[reconcile]
interval_secs = 600
max_attempts = 5
"#,
        )
        .unwrap();

        let (config, has_file) = load_config(path.to_str().unwrap()).unwrap();
        assert!(has_file);
        assert_eq!(config.server.bind, "127.0.0.1:9090");
        assert_eq!(config.reconcile.interval_secs, 600);
        assert_eq!(config.reconcile.max_attempts, Some(5));
    }

    #[test]
    fn load_config_rejects_invalid_reconcile_section() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
[reconcile]
interval_secs = 0
"#,
        )
        .unwrap();

        let err = load_config(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn sentry_disabled_without_dsn() {
        let telemetry = TelemetryConfig::default();
        assert!(
            init_sentry(&telemetry, Environment::Testing)
                .unwrap()
                .is_none()
        );

        let events = sentry::test::with_captured_events(|| {
            select_reporter(&telemetry)
                .report_error("migration_gate", &std::io::Error::other("schema drift"));
        });
        assert!(events.is_empty());
    }

    #[test]
    fn sentry_dsn_selects_sentry_reporter() {
        let telemetry = TelemetryConfig {
            sentry_dsn: Some("https://public@sentry.example.com/1".to_string()),
            ..TelemetryConfig::default()
        };
        let events = sentry::test::with_captured_events(|| {
            select_reporter(&telemetry)
                .report_error("migration_gate", &std::io::Error::other("schema drift"));
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tags["context"], "migration_gate");

        let muted = TelemetryConfig {
            report_errors: false,
            ..telemetry
        };
        let events = sentry::test::with_captured_events(|| {
            select_reporter(&muted)
                .report_error("migration_gate", &std::io::Error::other("schema drift"));
        });
        assert!(events.is_empty());
    }

    #[test]
    fn invalid_sentry_dsn_is_rejected() {
        let telemetry = TelemetryConfig {
            sentry_dsn: Some("not a dsn".to_string()),
            ..TelemetryConfig::default()
        };
        let Err(err) = init_sentry(&telemetry, Environment::Testing) else {
            panic!("invalid DSN must be rejected");
        };
        assert!(err.to_string().contains("sentry_dsn"), "got {err}");
    }

    #[test]
    fn args_once_conflicts_with_migrate_only() {
        assert!(Args::try_parse_from(["pantryd", "--once", "--migrate-only"]).is_err());
        let args = Args::try_parse_from(["pantryd", "--once"]).unwrap();
        assert!(args.once);
    }
}
