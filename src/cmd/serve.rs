//! HTTP API server command — `tryout serve`.

use std::path::PathBuf;

use anyhow::{Context, Result};

use tryout::config::TryoutConfig;
use tryout::server::{ServerConfig, start_server};
use tryout::session::{DbHandle, SessionDb};

pub async fn cmd_serve(
    mut config: TryoutConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(path) = db_path {
        config.database.path = path;
    }

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let db_path = &config.database.path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = SessionDb::new(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let engine = config.build_engine(DbHandle::new(db))?;

    tracing::info!(
        db_path = %db_path.display(),
        backend = %config.generation.backend,
        evidence = config.evidence.enabled,
        jobs = config.jobs.len(),
        "Starting tryout"
    );

    start_server(
        ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: dev,
        },
        engine,
    )
    .await
}
