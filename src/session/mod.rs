//! Work session engine: event log, stage control, prompt policy, lifecycle and
//! evidence synthesis.
//!
//! Sub-modules:
//! - `models` — data types shared by storage and the API
//! - `db` — SQLite persistence (`SessionDb`) and its async handle (`DbHandle`)
//! - `stages` — stage plans, targeting rules and event-log replay
//! - `prompt` — the prompt generation policy
//! - `lifecycle` — session creation
//! - `synthesis` / `transcript` — evidence pack generation
//! - `locks` — per-session write serialization
//! - `engine` — `WorkSessionEngine`, the operation facade

pub mod db;
pub mod engine;
pub mod lifecycle;
pub mod locks;
pub mod models;
pub mod prompt;
pub mod stages;
pub mod synthesis;
pub mod transcript;

pub use db::{DbHandle, SessionDb};
pub use engine::{
    CompletedSession, EngineSettings, PromptTurn, SessionView, SnapshotOutcome, WorkSessionEngine,
};
pub use lifecycle::{CreateSessionRequest, CreatedSession};
