//! Configuration for the tryout service, read from `tryout.toml`.
//!
//! Every section is optional and falls back to defaults. Values are layered
//! file → environment → CLI flags; the CLI layer is applied by the commands
//! themselves.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//!
//! [database]
//! path = "tryout.db"
//!
//! [generation]
//! backend = "http"            # or "claude_cli"
//! api_url = "https://api.openai.com/v1/chat/completions"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//! timeout_secs = 60
//!
//! [evidence]
//! enabled = true
//! token_env = "GITHUB_TOKEN"
//!
//! [session]
//! snapshot_preview_chars = 1200
//! max_exchanges_per_stage = 3
//!
//! [logging]
//! level = "info"
//! format = "pretty"           # or "json"
//!
//! [[jobs]]
//! id = "backend-2026"
//! title = "Backend Engineer"
//! requirements = ["Rust", "Postgres"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::evidence::github::DEFAULT_GITHUB_API_URL;
use crate::evidence::{EvidenceFetcher, GitHubEvidenceFetcher, NoopEvidenceFetcher};
use crate::generation::{ClaudeCliGenerator, Generator, HttpGenerator};
use crate::jobs::{JobCatalog, JobContext};
use crate::session::prompt::DEFAULT_MAX_EXCHANGES_PER_STAGE;
use crate::session::transcript::DEFAULT_SNAPSHOT_PREVIEW_CHARS;
use crate::session::{DbHandle, EngineSettings, WorkSessionEngine};

pub const DEFAULT_CONFIG_FILE: &str = "tryout.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tryout.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Which generation collaborator to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationBackend {
    /// OpenAI-compatible chat-completions endpoint
    #[default]
    Http,
    /// Local `claude` CLI in print mode
    ClaudeCli,
}

impl std::fmt::Display for GenerationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationBackend::Http => write!(f, "http"),
            GenerationBackend::ClaudeCli => write!(f, "claude_cli"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default)]
    pub backend: GenerationBackend,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    /// Resolved from `api_key_env`; never written back to disk.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_generation_timeout() -> u64 {
    60
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            backend: GenerationBackend::default(),
            api_url: default_api_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            claude_cmd: default_claude_cmd(),
            timeout_secs: default_generation_timeout(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_evidence_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_repos")]
    pub max_repos: usize,
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_github_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_evidence_timeout() -> u64 {
    10
}

fn default_max_repos() -> usize {
    5
}

impl Default for EvidenceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            github_api_url: default_github_api_url(),
            token_env: default_token_env(),
            timeout_secs: default_evidence_timeout(),
            max_repos: default_max_repos(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_preview_chars")]
    pub snapshot_preview_chars: usize,
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges_per_stage: u32,
}

fn default_preview_chars() -> usize {
    DEFAULT_SNAPSHOT_PREVIEW_CHARS
}

fn default_max_exchanges() -> u32 {
    DEFAULT_MAX_EXCHANGES_PER_STAGE
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            snapshot_preview_chars: default_preview_chars(),
            max_exchanges_per_stage: default_max_exchanges(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Contents of `tryout.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TryoutConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub evidence: EvidenceSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub jobs: Vec<JobContext>,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl TryoutConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tryout.toml")
    }

    /// Load `path` if it exists, defaults otherwise, then apply the
    /// environment layer.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize tryout.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = lookup("TRYOUT_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(port) = lookup("TRYOUT_PORT") {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid TRYOUT_PORT"),
            }
        }
        if let Some(url) = lookup("TRYOUT_GENERATION_URL") {
            self.generation.api_url = url;
        }
        if let Some(model) = lookup("TRYOUT_MODEL") {
            self.generation.model = model;
        }
        self.generation.api_key = lookup(&self.generation.api_key_env);
        self.evidence.token = lookup(&self.evidence.token_env);
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("[server] port is 0; the OS will pick a random port".to_string());
        }

        let generation = &self.generation;
        match generation.backend {
            GenerationBackend::Http => {
                if generation.api_url.trim().is_empty() {
                    warnings.push("[generation] api_url is empty".to_string());
                }
                if generation.model.trim().is_empty() {
                    warnings.push("[generation] model is empty".to_string());
                }
                if generation.api_key.is_none() {
                    warnings.push(format!(
                        "[generation] no API key found in ${}; requests will be unauthenticated",
                        generation.api_key_env
                    ));
                }
            }
            GenerationBackend::ClaudeCli => {
                if generation.claude_cmd.trim().is_empty() {
                    warnings.push("[generation] claude_cmd is empty".to_string());
                }
            }
        }
        if generation.timeout_secs == 0 {
            warnings.push("[generation] timeout_secs is 0; every call will time out".to_string());
        }

        if self.evidence.enabled && self.evidence.timeout_secs == 0 {
            warnings.push("[evidence] timeout_secs is 0; evidence will never arrive".to_string());
        }
        if self.evidence.enabled && self.evidence.max_repos == 0 {
            warnings.push("[evidence] max_repos is 0; repositories will not be listed".to_string());
        }

        if self.session.max_exchanges_per_stage == 0 {
            warnings.push(
                "[session] max_exchanges_per_stage is 0; the per-stage exchange limit is disabled"
                    .to_string(),
            );
        }
        if self.session.snapshot_preview_chars == 0 {
            warnings.push(
                "[session] snapshot_preview_chars is 0; code will be hidden from the interviewer"
                    .to_string(),
            );
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            warnings.push(format!(
                "[logging] unknown level '{}'. Valid values: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.id.trim().is_empty() {
                warnings.push(format!("[[jobs]] '{}' has an empty id", job.title));
            } else if !seen.insert(job.id.as_str()) {
                warnings.push(format!("[[jobs]] duplicate id '{}'; the last one wins", job.id));
            }
            if job.title.trim().is_empty() {
                warnings.push(format!("[[jobs]] '{}' has an empty title", job.id));
            }
        }

        warnings
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            generation_timeout: Duration::from_secs(self.generation.timeout_secs),
            evidence_timeout: Duration::from_secs(self.evidence.timeout_secs),
            snapshot_preview_chars: self.session.snapshot_preview_chars,
            max_exchanges_per_stage: self.session.max_exchanges_per_stage,
        }
    }

    pub fn build_generator(&self) -> Result<Arc<dyn Generator>> {
        let g = &self.generation;
        let timeout = Duration::from_secs(g.timeout_secs);
        Ok(match g.backend {
            GenerationBackend::Http => Arc::new(
                HttpGenerator::new(&g.api_url, &g.model, g.api_key.clone(), timeout)
                    .context("Failed to build HTTP generator")?,
            ),
            GenerationBackend::ClaudeCli => Arc::new(ClaudeCliGenerator::new(&g.claude_cmd, timeout)),
        })
    }

    pub fn build_fetcher(&self) -> Result<Arc<dyn EvidenceFetcher>> {
        let e = &self.evidence;
        if !e.enabled {
            return Ok(Arc::new(NoopEvidenceFetcher));
        }
        let fetcher = GitHubEvidenceFetcher::new(
            &e.github_api_url,
            e.token.clone(),
            Duration::from_secs(e.timeout_secs),
            e.max_repos,
        )?;
        Ok(Arc::new(fetcher))
    }

    pub fn job_catalog(&self) -> JobCatalog {
        JobCatalog::new(self.jobs.iter().cloned())
    }

    /// Wire the engine and its collaborators from this configuration.
    pub fn build_engine(&self, db: DbHandle) -> Result<WorkSessionEngine> {
        Ok(WorkSessionEngine::new(
            db,
            self.build_generator()?,
            self.build_fetcher()?,
            Arc::new(self.job_catalog()),
            self.engine_settings(),
        ))
    }
}
