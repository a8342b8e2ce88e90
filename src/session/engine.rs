//! `WorkSessionEngine`: the transport-agnostic operations of the work session.
//!
//! Every operation re-reads state from storage. Collaborator calls run outside
//! the per-session lock; only the final verify-and-write section holds it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::EngineError;
use crate::evidence::EvidenceFetcher;
use crate::generation::Generator;
use crate::jobs::JobContextProvider;

use super::db::{
    CommitOutcome, DbHandle, NewEvidencePack, SnapshotWrite, StageTransition, TurnCommit,
};
use super::lifecycle::{CreateSessionRequest, CreatedSession, SessionLifecycle};
use super::locks::SessionLocks;
use super::models::{
    Event, EvidencePack, PromptMetadata, QuestionSource, Session, SignalTag, SnapshotMetadata,
    Stage, StageName,
};
use super::prompt::{
    DEFAULT_MAX_EXCHANGES_PER_STAGE, PolicyContext, PromptPolicy, transition_text,
    unanswered_prompt,
};
use super::stages::{StagePlan, resolve_target};
use super::synthesis::Synthesizer;
use super::transcript::DEFAULT_SNAPSHOT_PREVIEW_CHARS;

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub generation_timeout: Duration,
    pub evidence_timeout: Duration,
    pub snapshot_preview_chars: usize,
    pub max_exchanges_per_stage: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(60),
            evidence_timeout: Duration::from_secs(10),
            snapshot_preview_chars: DEFAULT_SNAPSHOT_PREVIEW_CHARS,
            max_exchanges_per_stage: DEFAULT_MAX_EXCHANGES_PER_STAGE,
        }
    }
}

/// Result of `next_prompt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptTurn {
    pub next_prompt_text: String,
    pub stage_complete: bool,
    pub signal_tags: Vec<SignalTag>,
    /// Stage the prompt was issued in.
    pub stage: StageName,
    /// Open stage after this call; `None` once every stage is closed.
    pub current_stage: Option<StageName>,
    /// True when an unanswered prompt was returned again instead of generating a new one.
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedSession {
    pub evidence_pack_id: String,
    pub share_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotOutcome {
    pub recorded: bool,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_seq: Option<i64>,
}

/// Everything a caller needs to render or resume a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session: Session,
    pub plan: Vec<StageName>,
    pub stages: Vec<Stage>,
    pub open_stage: Option<StageName>,
    pub eligible_for_completion: bool,
    pub events: Vec<Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
}

pub fn content_hash(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

pub struct WorkSessionEngine {
    db: DbHandle,
    locks: SessionLocks,
    lifecycle: SessionLifecycle,
    policy: PromptPolicy,
    synthesizer: Synthesizer,
    settings: EngineSettings,
}

impl WorkSessionEngine {
    pub fn new(
        db: DbHandle,
        generator: Arc<dyn Generator>,
        fetcher: Arc<dyn EvidenceFetcher>,
        jobs: Arc<dyn JobContextProvider>,
        settings: EngineSettings,
    ) -> Self {
        let lifecycle = SessionLifecycle::new(db.clone(), fetcher, jobs, settings.evidence_timeout);
        let policy = PromptPolicy::new(
            generator.clone(),
            settings.generation_timeout,
            settings.max_exchanges_per_stage,
        );
        let synthesizer = Synthesizer::new(
            generator,
            settings.generation_timeout,
            settings.snapshot_preview_chars,
        );
        Self {
            db,
            locks: SessionLocks::new(),
            lifecycle,
            policy,
            synthesizer,
            settings,
        }
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, EngineError> {
        let id = session_id.to_string();
        self.db
            .call(move |db| db.get_session(&id))
            .await
            .map_err(EngineError::Database)?
            .ok_or_else(|| EngineError::SessionNotFound {
                id: session_id.to_string(),
            })
    }

    async fn load_state(
        &self,
        session_id: &str,
    ) -> Result<(Option<Stage>, Vec<Event>), EngineError> {
        let id = session_id.to_string();
        self.db
            .call(move |db| Ok((db.open_stage(&id)?, db.list_events(&id)?)))
            .await
            .map_err(EngineError::Database)
    }

    fn rejected<T>(session_id: &str, outcome: CommitOutcome<T>) -> EngineError {
        match outcome {
            CommitOutcome::Committed(_) => {
                EngineError::Conflict("write was committed but reported as rejected".to_string())
            }
            CommitOutcome::NotFound => EngineError::SessionNotFound {
                id: session_id.to_string(),
            },
            CommitOutcome::Terminal => {
                EngineError::Conflict(format!("session {} is already completed", session_id))
            }
            CommitOutcome::Stale {
                expected_seq,
                actual_seq,
            } => EngineError::Conflict(format!(
                "session {} changed concurrently (expected event {}, found {}); reload and retry",
                session_id, expected_seq, actual_seq
            )),
            CommitOutcome::StageMoved { open: Some(open) } => EngineError::Conflict(format!(
                "session {} moved on; the current stage is '{}'",
                session_id, open
            )),
            CommitOutcome::StageMoved { open: None } => EngineError::Conflict(format!(
                "session {} has no open stage",
                session_id
            )),
        }
    }

    // ── Operations ───────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, EngineError> {
        self.lifecycle.create_session(request).await
    }

    /// Advance the conversation in `stage` by one step.
    ///
    /// Without a response, returns the stage's pending question (generating it
    /// if there is none). With a response, records it together with the next
    /// prompt and any stage transition.
    pub async fn next_prompt(
        &self,
        session_id: &str,
        stage: &str,
        candidate_response: Option<String>,
    ) -> Result<PromptTurn, EngineError> {
        let response = match candidate_response {
            Some(r) if r.trim().is_empty() => {
                return Err(EngineError::Validation(
                    "candidate response must not be empty".to_string(),
                ));
            }
            other => other,
        };

        let session = self.load_session(session_id).await?;
        let plan = StagePlan::for_duration(session.duration);
        let (open, history) = self.load_state(session_id).await?;
        let stage = resolve_target(&session, &plan, open.as_ref(), stage)?;
        let expected_seq = history.last().map(|e| e.seq).unwrap_or(0);

        let ctx = PolicyContext {
            session: &session,
            plan: &plan,
            stage,
            history: &history,
            snapshot_preview_chars: self.settings.snapshot_preview_chars,
        };

        let (prompt_text, prompt_metadata, transition) = match response.as_deref() {
            None => {
                if let Some(pending) = unanswered_prompt(&history, stage) {
                    tracing::debug!(session_id, stage = %stage, seq = pending.seq, "Replaying unanswered prompt");
                    return Ok(PromptTurn {
                        next_prompt_text: pending.payload.clone(),
                        stage_complete: false,
                        signal_tags: Vec::new(),
                        stage,
                        current_stage: Some(stage),
                        replayed: true,
                    });
                }
                let (text, source) = self.policy.question(&ctx, None).await?;
                let metadata = PromptMetadata {
                    signal_tags: Vec::new(),
                    stage_complete: false,
                    decision: None,
                    rationale: None,
                    question_source: source,
                };
                (text, metadata, StageTransition::Stay)
            }
            Some(answer) => {
                let decision = self.policy.assess(&ctx, answer).await?;
                let (text, source, transition) = if decision.stage_complete {
                    let next = plan.next_after(stage);
                    let transition = match next {
                        Some(next) => StageTransition::Advance(next),
                        None => StageTransition::CloseLast,
                    };
                    (transition_text(stage, next), QuestionSource::Transition, transition)
                } else {
                    let (text, source) = self.policy.question(&ctx, Some(answer)).await?;
                    (text, source, StageTransition::Stay)
                };
                let metadata = PromptMetadata {
                    signal_tags: decision.signal_tags,
                    stage_complete: decision.stage_complete,
                    decision: Some(decision.basis),
                    rationale: decision.rationale,
                    question_source: source,
                };
                (text, metadata, transition)
            }
        };

        let turn = TurnCommit {
            session_id: session_id.to_string(),
            stage,
            expected_seq,
            response,
            prompt_text,
            prompt_metadata,
            transition,
        };
        let result = PromptTurn {
            next_prompt_text: turn.prompt_text.clone(),
            stage_complete: turn.prompt_metadata.stage_complete,
            signal_tags: turn.prompt_metadata.signal_tags.clone(),
            stage,
            current_stage: match transition {
                StageTransition::Stay => Some(stage),
                StageTransition::Advance(next) => Some(next),
                StageTransition::CloseLast => None,
            },
            replayed: false,
        };

        let outcome = {
            let _guard = self.locks.acquire(session_id).await;
            self.db
                .call(move |db| db.commit_turn(&turn))
                .await
                .map_err(EngineError::Database)?
        };
        match outcome {
            CommitOutcome::Committed(events) => {
                tracing::info!(
                    session_id,
                    stage = %stage,
                    seq = events.last().map(|e| e.seq).unwrap_or(0),
                    stage_complete = result.stage_complete,
                    tags = ?result.signal_tags,
                    "Prompt committed"
                );
                Ok(result)
            }
            other => {
                let err = Self::rejected(session_id, other);
                tracing::warn!(session_id, stage = %stage, error = %err, "Prompt commit rejected");
                Err(err)
            }
        }
    }

    /// Synthesize the evidence pack and close the session. Runs exactly once per session.
    pub async fn complete_session(&self, session_id: &str) -> Result<CompletedSession, EngineError> {
        let session = self.load_session(session_id).await?;
        if session.is_completed() {
            return Err(EngineError::Conflict(format!(
                "session {} is already completed",
                session_id
            )));
        }
        let (_, events) = self.load_state(session_id).await?;
        let expected_seq = events.last().map(|e| e.seq).unwrap_or(0);

        let summary = self.synthesizer.synthesize(&session, &events).await?;
        let pack = NewEvidencePack {
            id: uuid::Uuid::new_v4().to_string(),
            share_id: uuid::Uuid::new_v4().simple().to_string(),
            summary,
        };

        let id = session_id.to_string();
        let outcome = {
            let _guard = self.locks.acquire(session_id).await;
            self.db
                .call(move |db| db.finalize_session(&id, expected_seq, &pack))
                .await
                .map_err(EngineError::Database)?
        };
        match outcome {
            CommitOutcome::Committed(pack) => {
                tracing::info!(session_id, pack_id = %pack.id, events = events.len(), "Session completed");
                Ok(CompletedSession {
                    evidence_pack_id: pack.id,
                    share_id: pack.share_id,
                })
            }
            other => {
                let err = Self::rejected(session_id, other);
                tracing::warn!(session_id, error = %err, "Completion rejected");
                Err(err)
            }
        }
    }

    /// Record the candidate's current code on the open stage, skipping exact repeats.
    pub async fn record_code_snapshot(
        &self,
        session_id: &str,
        code: String,
        language: Option<String>,
    ) -> Result<SnapshotOutcome, EngineError> {
        if code.trim().is_empty() {
            return Err(EngineError::Validation("code snapshot must not be empty".to_string()));
        }
        let metadata = SnapshotMetadata {
            content_hash: content_hash(&code),
            language: language.map(|l| l.trim().to_lowercase()).filter(|l| !l.is_empty()),
            chars: code.chars().count(),
        };
        let hash = metadata.content_hash.clone();

        let id = session_id.to_string();
        let outcome = {
            let _guard = self.locks.acquire(session_id).await;
            self.db
                .call(move |db| db.append_code_snapshot(&id, &code, &metadata))
                .await
                .map_err(EngineError::Database)?
        };
        match outcome {
            CommitOutcome::Committed(SnapshotWrite::Recorded(event)) => {
                tracing::debug!(session_id, seq = event.seq, hash = %hash, "Code snapshot recorded");
                Ok(SnapshotOutcome {
                    recorded: true,
                    content_hash: hash,
                    event_seq: Some(event.seq),
                })
            }
            CommitOutcome::Committed(SnapshotWrite::Duplicate) => Ok(SnapshotOutcome {
                recorded: false,
                content_hash: hash,
                event_seq: None,
            }),
            other => Err(Self::rejected(session_id, other)),
        }
    }

    pub async fn session_view(&self, session_id: &str) -> Result<SessionView, EngineError> {
        let id = session_id.to_string();
        let (session, stages, events, pack) = self
            .db
            .call(move |db| {
                Ok((
                    db.get_session(&id)?,
                    db.list_stages(&id)?,
                    db.list_events(&id)?,
                    db.get_evidence_pack_for_session(&id)?,
                ))
            })
            .await
            .map_err(EngineError::Database)?;
        let session = session.ok_or_else(|| EngineError::SessionNotFound {
            id: session_id.to_string(),
        })?;

        let plan = StagePlan::for_duration(session.duration);
        let open_stage = stages.iter().find(|s| s.is_open()).map(|s| s.stage_name);
        let eligible_for_completion = !session.is_completed() && open_stage.is_none();
        Ok(SessionView {
            plan: plan.stages().to_vec(),
            open_stage,
            eligible_for_completion,
            share_id: pack.map(|p| p.share_id),
            session,
            stages,
            events,
        })
    }

    pub async fn evidence_pack_by_share_id(&self, share_id: &str) -> Result<EvidencePack, EngineError> {
        let token = share_id.to_string();
        self.db
            .call(move |db| db.get_evidence_pack_by_share_id(&token))
            .await
            .map_err(EngineError::Database)?
            .ok_or_else(|| EngineError::EvidencePackNotFound {
                share_id: share_id.to_string(),
            })
    }
}
