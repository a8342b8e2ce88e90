//! Database initialization command — `tryout init-db`.

use std::path::PathBuf;

use anyhow::{Context, Result};

use tryout::config::TryoutConfig;
use tryout::session::SessionDb;

pub fn cmd_init_db(config: &TryoutConfig, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.database.path.clone());
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = SessionDb::new(&db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    let sessions = db.count_sessions()?;

    println!("Database initialized at {}", db_path.display());
    println!("  sessions: {}", sessions);
    Ok(())
}
