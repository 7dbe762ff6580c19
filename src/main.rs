//! # relay
//!
//! Session-scoped chat relay: wires the history store, session coordinator
//! and HTTP/SSE server together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use relay_engine::{EngineConfig, SessionCoordinator};
use relay_server::ServerConfig;
use relay_store::{Database, HistoryStore, JsonFileHistoryStore, SqliteHistoryStore};
use relay_telemetry::{LogFormat, TelemetryConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreBackend {
    Sqlite,
    Json,
}

/// Relay server.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Session-scoped chat relay over SSE")]
struct Cli {
    /// Host to bind.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "RELAY_PORT", default_value_t = 22041)]
    port: u16,

    /// Directory for history and log databases.
    #[arg(long, env = "RELAY_DATA_DIR", default_value = "relay-data")]
    data_dir: PathBuf,

    #[arg(long, env = "RELAY_STORE", value_enum, default_value_t = StoreBackend::Sqlite)]
    store: StoreBackend,

    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// `json` or `pretty`.
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Persist warn+ logs to `<data-dir>/logs.db`.
    #[arg(long, env = "RELAY_LOG_TO_SQLITE")]
    log_to_sqlite: bool,

    /// Idle seconds before a stream emits a heartbeat.
    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Delay between produced responses.
    #[arg(long, env = "RELAY_PACING_MS", default_value_t = 500)]
    pacing_ms: u64,

    #[arg(long, env = "RELAY_MIN_RESPONSES", default_value_t = 1)]
    min_responses: u32,

    #[arg(long, env = "RELAY_MAX_RESPONSES", default_value_t = 10)]
    max_responses: u32,

    /// Keep in-memory session state after its stream closes.
    #[arg(long, env = "RELAY_KEEP_STATE_ON_DETACH")]
    keep_state_on_detach: bool,
}

impl Cli {
    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            format: self.log_format,
            log_to_sqlite: self.log_to_sqlite,
            log_db_path: self.data_dir.join("logs.db"),
            ..TelemetryConfig::default()
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pacing_interval: Duration::from_millis(self.pacing_ms),
            idle_timeout: Duration::from_secs(self.heartbeat_secs.max(1)),
            release_state_on_detach: !self.keep_state_on_detach,
            min_responses: self.min_responses,
            max_responses: self.max_responses,
            ..EngineConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

fn open_history(backend: StoreBackend, data_dir: &Path) -> Result<Arc<dyn HistoryStore>> {
    match backend {
        StoreBackend::Sqlite => {
            let path = data_dir.join("history.db");
            let db = Database::open(&path)
                .with_context(|| format!("Failed to open history database: {}", path.display()))?;
            tracing::info!(path = %path.display(), "history database opened");
            Ok(Arc::new(SqliteHistoryStore::new(db)))
        }
        StoreBackend::Json => {
            let dir = data_dir.join("chat_history");
            let store = JsonFileHistoryStore::open(&dir)
                .with_context(|| format!("Failed to open history directory: {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), "json history directory opened");
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("Failed to create directory: {}", cli.data_dir.display()))?;

    let _telemetry = relay_telemetry::init_telemetry(cli.telemetry_config());
    tracing::info!(store = ?cli.store, "starting relay server");

    let history = open_history(cli.store, &cli.data_dir)?;
    let coordinator = Arc::new(SessionCoordinator::new(cli.engine_config(), history));

    let handle = relay_server::start(cli.server_config(), coordinator)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "relay server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let cli = Cli::parse_from(["relay"]);
        assert_eq!(cli.port, 22041);
        let engine = cli.engine_config();
        assert_eq!(engine.pacing_interval, Duration::from_millis(500));
        assert_eq!(engine.idle_timeout, Duration::from_secs(30));
        assert!(engine.release_state_on_detach);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "relay",
            "--port",
            "9000",
            "--store",
            "json",
            "--log-format",
            "pretty",
            "--pacing-ms",
            "20",
            "--keep-state-on-detach",
        ]);
        assert_eq!(cli.server_config().port, 9000);
        assert!(matches!(cli.store, StoreBackend::Json));
        assert_eq!(cli.log_format, LogFormat::Pretty);
        assert_eq!(cli.engine_config().pacing_interval, Duration::from_millis(20));
        assert!(!cli.engine_config().release_state_on_detach);
    }
}
