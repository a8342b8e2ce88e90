//! Session Lifecycle Manager: validated creation with best-effort evidence.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::evidence::EvidenceFetcher;
use crate::jobs::JobContextProvider;

use super::db::{DbHandle, NewSession};
use super::models::{Level, RoleTrack, SessionDuration};
use super::stages::StagePlan;

/// Raw creation request, as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub evidence_source_ref: String,
    pub role_track: String,
    pub level: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub job_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatedSession {
    pub session_id: String,
    pub evidence_available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub evidence_source_ref: String,
    pub role_track: RoleTrack,
    pub level: Level,
    pub duration: SessionDuration,
    pub job_ref: Option<String>,
}

/// Parse every enum-valued field. Runs before any I/O.
pub fn validate_request(request: &CreateSessionRequest) -> Result<ValidatedRequest, EngineError> {
    let evidence_source_ref = request.evidence_source_ref.trim();
    if evidence_source_ref.is_empty() {
        return Err(EngineError::Validation(
            "evidence_source_ref must not be empty".to_string(),
        ));
    }
    let role_track: RoleTrack = request
        .role_track
        .trim()
        .parse()
        .map_err(EngineError::Validation)?;
    let level: Level = request.level.trim().parse().map_err(EngineError::Validation)?;
    let duration =
        SessionDuration::from_minutes(request.duration_minutes).map_err(EngineError::Validation)?;
    let job_ref = request
        .job_ref
        .as_deref()
        .map(str::trim)
        .filter(|j| !j.is_empty())
        .map(str::to_string);

    Ok(ValidatedRequest {
        evidence_source_ref: evidence_source_ref.to_string(),
        role_track,
        level,
        duration,
        job_ref,
    })
}

pub struct SessionLifecycle {
    db: DbHandle,
    fetcher: Arc<dyn EvidenceFetcher>,
    jobs: Arc<dyn JobContextProvider>,
    evidence_timeout: Duration,
}

impl SessionLifecycle {
    pub fn new(
        db: DbHandle,
        fetcher: Arc<dyn EvidenceFetcher>,
        jobs: Arc<dyn JobContextProvider>,
        evidence_timeout: Duration,
    ) -> Self {
        Self {
            db,
            fetcher,
            jobs,
            evidence_timeout,
        }
    }

    async fn fetch_evidence(&self, source_ref: &str) -> Option<String> {
        match tokio::time::timeout(self.evidence_timeout, self.fetcher.fetch(source_ref)).await {
            Ok(evidence) => evidence.filter(|t| !t.trim().is_empty()),
            Err(_) => {
                tracing::warn!(
                    source_ref,
                    timeout_secs = self.evidence_timeout.as_secs(),
                    "Evidence fetch timed out; continuing without evidence"
                );
                None
            }
        }
    }

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, EngineError> {
        let valid = validate_request(&request)?;

        let job_context = match &valid.job_ref {
            Some(job_ref) => match self.jobs.job_context(job_ref).await {
                Some(job) => Some(job.render()),
                None => {
                    return Err(EngineError::Validation(format!(
                        "Unknown job reference '{}'",
                        job_ref
                    )));
                }
            },
            None => None,
        };

        let evidence_text = self.fetch_evidence(&valid.evidence_source_ref).await;
        let evidence_available = evidence_text.is_some();

        let plan = StagePlan::for_duration(valid.duration);
        let new = NewSession {
            id: uuid::Uuid::new_v4().to_string(),
            evidence_source_ref: valid.evidence_source_ref,
            role_track: valid.role_track,
            level: valid.level,
            duration: valid.duration,
            evidence_text,
            job_context,
        };
        let first = plan.first();
        let session = self
            .db
            .call(move |db| db.create_session(&new, first))
            .await
            .map_err(EngineError::Database)?;

        tracing::info!(
            session_id = %session.id,
            role_track = session.role_track.as_str(),
            level = session.level.as_str(),
            duration_minutes = session.duration.minutes(),
            evidence_available,
            "Session created"
        );

        Ok(CreatedSession {
            session_id: session.id,
            evidence_available,
        })
    }
}
