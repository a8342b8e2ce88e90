pub mod config;
pub mod errors;
pub mod evidence;
pub mod generation;
pub mod jobs;
pub mod logging;
pub mod server;
pub mod session;

pub use errors::EngineError;
pub use session::WorkSessionEngine;
