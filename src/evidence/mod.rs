//! Best-effort external evidence about a candidate.
//!
//! A fetcher never fails a session: any error is logged and reported as
//! "no evidence", which the synthesis step then states explicitly.

pub mod github;

use async_trait::async_trait;

pub use github::GitHubEvidenceFetcher;

#[async_trait]
pub trait EvidenceFetcher: Send + Sync {
    /// Summarize what can be learned from `source_ref`, or `None`.
    async fn fetch(&self, source_ref: &str) -> Option<String>;
}

/// Fetcher used when evidence collection is disabled.
pub struct NoopEvidenceFetcher;

#[async_trait]
impl EvidenceFetcher for NoopEvidenceFetcher {
    async fn fetch(&self, _source_ref: &str) -> Option<String> {
        None
    }
}
