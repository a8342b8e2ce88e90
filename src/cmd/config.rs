//! Configuration view and validation commands — `tryout config`.

use std::path::Path;

use anyhow::Result;

use tryout::config::TryoutConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Tryout Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}; using defaults.", config_path.display());
            }
            println!();

            let config = TryoutConfig::load_or_default(config_path)?;
            print_config(&config);

            if !config_path.exists() {
                println!("Run 'tryout config init' to create a tryout.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No tryout.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = TryoutConfig::load_or_default(config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("tryout.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            TryoutConfig::default().save(config_path)?;

            println!("Created tryout.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [generation] backend, api_url, model, api_key_env");
            println!("  - [evidence] enabled, token_env");
            println!("  - [[jobs]] to attach job context to sessions");
            println!();
        }
    }

    Ok(())
}

/// Effective values, environment overrides included. Secrets are reported
/// as present or missing only.
fn print_config(config: &TryoutConfig) {
    let set = |v: &Option<String>| if v.is_some() { "set" } else { "missing" };

    println!("[server]");
    println!("  host = \"{}\"", config.server.host);
    println!("  port = {}", config.server.port);
    println!();

    println!("[database]");
    println!("  path = \"{}\"", config.database.path.display());
    println!();

    let g = &config.generation;
    println!("[generation]");
    println!("  backend = \"{}\"", g.backend);
    println!("  api_url = \"{}\"", g.api_url);
    println!("  model = \"{}\"", g.model);
    println!("  api_key_env = \"{}\" ({})", g.api_key_env, set(&g.api_key));
    println!("  claude_cmd = \"{}\"", g.claude_cmd);
    println!("  timeout_secs = {}", g.timeout_secs);
    println!();

    let e = &config.evidence;
    println!("[evidence]");
    println!("  enabled = {}", e.enabled);
    println!("  github_api_url = \"{}\"", e.github_api_url);
    println!("  token_env = \"{}\" ({})", e.token_env, set(&e.token));
    println!("  timeout_secs = {}", e.timeout_secs);
    println!("  max_repos = {}", e.max_repos);
    println!();

    println!("[session]");
    println!(
        "  snapshot_preview_chars = {}",
        config.session.snapshot_preview_chars
    );
    println!(
        "  max_exchanges_per_stage = {}",
        config.session.max_exchanges_per_stage
    );
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", config.logging.level);
    println!("  format = {:?}", config.logging.format);
    println!();

    if !config.jobs.is_empty() {
        println!("Jobs:");
        for job in &config.jobs {
            println!("  {} - {}", job.id, job.title);
        }
        println!();
    }
}
