//! End-to-end scenarios for `WorkSessionEngine` against a file-backed database,
//! using scripted collaborators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{Barrier, Notify};

use tryout::EngineError;
use tryout::errors::GenerationError;
use tryout::evidence::EvidenceFetcher;
use tryout::generation::{GenerationRequest, Generator};
use tryout::jobs::{JobCatalog, JobContext};
use tryout::session::models::{DecisionBasis, EventType, QuestionSource, StageName};
use tryout::session::stages::{StagePlan, derive_progress};
use tryout::session::{
    CreateSessionRequest, DbHandle, EngineSettings, SessionDb, WorkSessionEngine,
};

const SUMMARY: &str = r#"{
  "role_level_estimate": "Solid mid-level backend engineer",
  "confidence": "medium",
  "strengths": [{"claim": "Frames problems around users", "evidence": "Framing: 'I'd start with who uses it'"}],
  "risks_or_unknowns": [],
  "decision_log": ["Chose SQLite for the first version"],
  "execution_observations": ["Wrote a working handler"],
  "recommended_next_step": "Pair on a production incident review",
  "highlights": ["I'd start with who uses it"]
}"#;

/// Generator with fixed answers per request kind.
struct Scripted {
    complete_stages: bool,
    malformed: bool,
    gate: Option<Barrier>,
}

impl Scripted {
    fn new(complete_stages: bool) -> Self {
        Self {
            complete_stages,
            malformed: false,
            gate: None,
        }
    }

    fn malformed() -> Self {
        Self {
            malformed: true,
            ..Self::new(false)
        }
    }

    /// Every call waits until `n` calls are in flight.
    fn gated(n: usize) -> Self {
        Self {
            gate: Some(Barrier::new(n)),
            ..Self::new(false)
        }
    }
}

#[async_trait]
impl Generator for Scripted {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        if let Some(gate) = &self.gate {
            gate.wait().await;
        }
        if self.malformed {
            return Ok("{ this is not json".to_string());
        }
        let props = &request.schema["properties"];
        if props.get("question").is_some() {
            Ok(r#"{"question":"How would you test that?"}"#.to_string())
        } else if props.get("stage_complete").is_some() {
            Ok(format!(
                r#"{{"signal_tags":["Communication","Judgment"],"stage_complete":{},"rationale":"clear answer"}}"#,
                self.complete_stages
            ))
        } else {
            Ok(SUMMARY.to_string())
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Scripted answers, except the first summary request parks until released.
/// Every summary context is recorded.
struct HeldSummary {
    inner: Scripted,
    hold: AtomicBool,
    entered: Notify,
    release: Notify,
    summarized: Mutex<Vec<String>>,
}

impl HeldSummary {
    fn new() -> Self {
        Self {
            inner: Scripted::new(false),
            hold: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
            summarized: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Generator for HeldSummary {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let props = &request.schema["properties"];
        let is_summary = props.get("question").is_none() && props.get("stage_complete").is_none();
        if is_summary {
            self.summarized
                .lock()
                .unwrap()
                .push(request.conversation_context.clone());
            if self.hold.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
        self.inner.generate(request).await
    }

    fn name(&self) -> &str {
        "held-summary"
    }
}

struct Unavailable;

#[async_trait]
impl Generator for Unavailable {
    async fn generate(&self, _request: GenerationRequest) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

struct FixedEvidence(Option<&'static str>);

#[async_trait]
impl EvidenceFetcher for FixedEvidence {
    async fn fetch(&self, _source_ref: &str) -> Option<String> {
        self.0.map(str::to_string)
    }
}

struct Harness {
    _dir: TempDir,
    db_path: std::path::PathBuf,
    engine: WorkSessionEngine,
}

fn harness(generator: Arc<dyn Generator>, evidence: Option<&'static str>) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("tryout.db");
    let db = SessionDb::new(&db_path).unwrap();
    let jobs = JobCatalog::new([JobContext {
        id: "be-1".to_string(),
        title: "Backend Engineer".to_string(),
        description: "Owns the payments API".to_string(),
        requirements: vec!["Rust".to_string()],
        tech_stack: vec!["Postgres".to_string()],
    }]);
    let engine = WorkSessionEngine::new(
        DbHandle::new(db),
        generator,
        Arc::new(FixedEvidence(evidence)),
        Arc::new(jobs),
        EngineSettings::default(),
    );
    Harness {
        _dir: dir,
        db_path,
        engine,
    }
}

fn request(minutes: u32) -> CreateSessionRequest {
    CreateSessionRequest {
        evidence_source_ref: "https://github.com/octocat".to_string(),
        role_track: "backend".to_string(),
        level: "mid".to_string(),
        duration_minutes: minutes,
        job_ref: None,
    }
}

async fn create(engine: &WorkSessionEngine, minutes: u32) -> String {
    engine.create_session(request(minutes)).await.unwrap().session_id
}

#[tokio::test]
async fn demo_session_runs_to_a_shared_evidence_pack() {
    let h = harness(Arc::new(Scripted::new(false)), Some("12 public repos, mostly Rust"));
    let created = h.engine.create_session(request(5)).await.unwrap();
    assert!(created.evidence_available);
    let id = created.session_id;

    let opening = h.engine.next_prompt(&id, "framing", None).await.unwrap();
    assert_eq!(opening.stage, StageName::Framing);

    // Demo tier closes each stage on its first answer.
    let turn = h
        .engine
        .next_prompt(&id, "framing", Some("I'd start with who uses it".to_string()))
        .await
        .unwrap();
    assert!(turn.stage_complete);
    assert_eq!(turn.current_stage, Some(StageName::Build));

    let turn = h
        .engine
        .next_prompt(&id, "build", Some("A small axum handler over SQLite".to_string()))
        .await
        .unwrap();
    assert!(turn.stage_complete);
    assert_eq!(turn.current_stage, None);

    let view = h.engine.session_view(&id).await.unwrap();
    assert!(view.eligible_for_completion);

    let done = h.engine.complete_session(&id).await.unwrap();
    let pack = h.engine.evidence_pack_by_share_id(&done.share_id).await.unwrap();
    assert_eq!(pack.session_id, id);
    assert_eq!(pack.summary.recommended_next_step, "Pair on a production incident review");
    // Evidence was available, so no absence claim is added.
    assert!(pack.summary.risks_or_unknowns.is_empty());

    let view = h.engine.session_view(&id).await.unwrap();
    assert!(view.session.is_completed());
    assert!(view.session.ended_at.is_some());
}

#[tokio::test]
async fn missing_evidence_is_stated_as_a_risk() {
    let h = harness(Arc::new(Scripted::new(false)), None);
    let created = h.engine.create_session(request(15)).await.unwrap();
    assert!(!created.evidence_available);

    let done = h.engine.complete_session(&created.session_id).await.unwrap();
    let pack = h.engine.evidence_pack_by_share_id(&done.share_id).await.unwrap();
    assert!(
        pack.summary
            .risks_or_unknowns
            .iter()
            .any(|r| r.claim.contains("No external evidence"))
    );
}

#[tokio::test]
async fn job_context_is_attached_and_unknown_job_rejected() {
    let h = harness(Arc::new(Scripted::new(false)), None);
    let mut req = request(15);
    req.job_ref = Some("be-1".to_string());
    let id = h.engine.create_session(req).await.unwrap().session_id;
    let view = h.engine.session_view(&id).await.unwrap();
    assert!(
        view.session
            .job_context
            .as_deref()
            .is_some_and(|c| c.contains("Backend Engineer"))
    );

    let mut req = request(15);
    req.job_ref = Some("nope".to_string());
    let err = h.engine.create_session(req).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn malformed_generation_falls_back_and_synthesis_fails_loudly() {
    let h = harness(Arc::new(Scripted::malformed()), None);
    let id = create(&h.engine, 15).await;

    let turn = h
        .engine
        .next_prompt(&id, "framing", Some("I'd ask who the users are".to_string()))
        .await
        .unwrap();
    assert!(!turn.stage_complete);
    assert!(turn.signal_tags.is_empty());
    assert!(!turn.next_prompt_text.trim().is_empty());

    let view = h.engine.session_view(&id).await.unwrap();
    let meta = view.events.last().unwrap().prompt_metadata().unwrap();
    assert_eq!(meta.decision, Some(DecisionBasis::Fallback));
    assert_eq!(meta.question_source, QuestionSource::Fallback);

    let err = h.engine.complete_session(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::Schema { .. }));

    // Nothing was finalized; the session can still be completed later.
    let view = h.engine.session_view(&id).await.unwrap();
    assert!(!view.session.is_completed());
    assert!(view.share_id.is_none());
}

#[tokio::test]
async fn unavailable_generator_is_retryable_and_writes_nothing() {
    let h = harness(Arc::new(Unavailable), None);
    let id = create(&h.engine, 15).await;

    let err = h.engine.next_prompt(&id, "framing", None).await.unwrap_err();
    assert!(err.is_retryable());

    let err = h
        .engine
        .next_prompt(&id, "framing", Some("answer".to_string()))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let err = h.engine.complete_session(&id).await.unwrap_err();
    assert!(err.is_retryable());

    let view = h.engine.session_view(&id).await.unwrap();
    assert!(view.events.is_empty());
    assert!(!view.session.is_completed());
}

#[tokio::test]
async fn stages_advance_in_plan_order_with_one_open_at_a_time() {
    let h = harness(Arc::new(Scripted::new(true)), None);
    let id = create(&h.engine, 30).await;
    let plan = StagePlan::for_duration(tryout::session::models::SessionDuration::Extended);

    for (i, stage) in plan.stages().iter().enumerate() {
        h.engine.next_prompt(&id, stage.as_str(), None).await.unwrap();
        let turn = h
            .engine
            .next_prompt(&id, stage.as_str(), Some(format!("answer {}", i)))
            .await
            .unwrap();
        assert!(turn.stage_complete);
        assert_eq!(turn.current_stage, plan.next_after(*stage));

        let view = h.engine.session_view(&id).await.unwrap();
        let open: Vec<_> = view.stages.iter().filter(|s| s.is_open()).collect();
        assert!(open.len() <= 1);
        let names: Vec<StageName> = view.stages.iter().map(|s| s.stage_name).collect();
        assert_eq!(names, plan.stages()[..names.len()].to_vec());
    }

    let view = h.engine.session_view(&id).await.unwrap();
    assert_eq!(view.stages.len(), plan.stages().len());
    assert!(view.open_stage.is_none());
    assert!(view.eligible_for_completion);

    // Every stage is closed; nothing can be targeted any more.
    let err = h.engine.next_prompt(&id, "reflection", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn exchange_limit_closes_a_stage() {
    let h = harness(Arc::new(Scripted::new(false)), None);
    let id = create(&h.engine, 15).await;

    for i in 1..=3 {
        let turn = h
            .engine
            .next_prompt(&id, "framing", Some(format!("answer {}", i)))
            .await
            .unwrap();
        assert_eq!(turn.stage_complete, i == 3);
    }

    let view = h.engine.session_view(&id).await.unwrap();
    assert_eq!(view.open_stage, Some(StageName::Build));
    let last = view.events.last().unwrap().prompt_metadata().unwrap();
    assert_eq!(last.decision, Some(DecisionBasis::ExchangeLimit));
    assert_eq!(last.question_source, QuestionSource::Transition);
}

#[tokio::test]
async fn event_log_is_ordered_and_timestamps_never_go_backwards() {
    let h = harness(Arc::new(Scripted::new(false)), None);
    let id = create(&h.engine, 15).await;

    h.engine.next_prompt(&id, "framing", None).await.unwrap();
    h.engine
        .record_code_snapshot(&id, "fn main() {}".to_string(), Some("rust".to_string()))
        .await
        .unwrap();
    h.engine
        .next_prompt(&id, "framing", Some("first answer".to_string()))
        .await
        .unwrap();
    h.engine
        .record_code_snapshot(&id, "fn main() { run() }".to_string(), None)
        .await
        .unwrap();

    let view = h.engine.session_view(&id).await.unwrap();
    let seqs: Vec<i64> = view.events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=seqs.len() as i64).collect::<Vec<_>>());
    for pair in view.events.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
    let types: Vec<EventType> = view.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::Prompt,
            EventType::CodeSnapshot,
            EventType::Response,
            EventType::Prompt,
            EventType::CodeSnapshot,
        ]
    );
}

#[tokio::test]
async fn completed_session_rejects_every_write() {
    let h = harness(Arc::new(Scripted::new(false)), None);
    let id = create(&h.engine, 5).await;
    h.engine.complete_session(&id).await.unwrap();

    let err = h.engine.complete_session(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let err = h
        .engine
        .next_prompt(&id, "framing", Some("late answer".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let err = h
        .engine
        .record_code_snapshot(&id, "late code".to_string(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn concurrent_answers_commit_exactly_once() {
    let h = harness(Arc::new(Scripted::gated(2)), None);
    let id = create(&h.engine, 15).await;

    let (a, b) = tokio::join!(
        h.engine
            .next_prompt(&id, "framing", Some("answer from tab one".to_string())),
        h.engine
            .next_prompt(&id, "framing", Some("answer from tab two".to_string())),
    );

    let results = [a, b];
    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(committed, 1);
    let conflict = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(conflict, EngineError::Conflict(_)));

    let view = h.engine.session_view(&id).await.unwrap();
    let responses = view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::Response)
        .count();
    assert_eq!(responses, 1);
    assert_eq!(view.events.len(), 2);
}

#[tokio::test]
async fn concurrent_completion_produces_one_pack() {
    let h = harness(Arc::new(Scripted::gated(2)), Some("some evidence"));
    let id = create(&h.engine, 5).await;

    let (a, b) = tokio::join!(h.engine.complete_session(&id), h.engine.complete_session(&id));
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::Conflict(_)))
    );

    let packs = SessionDb::new(&h.db_path)
        .unwrap()
        .count_evidence_packs(&id)
        .unwrap();
    assert_eq!(packs, 1);
}

#[tokio::test]
async fn completion_against_a_moved_log_is_a_conflict() {
    let generator = Arc::new(HeldSummary::new());
    let h = harness(generator.clone(), Some("some evidence"));
    let id = create(&h.engine, 15).await;
    h.engine.next_prompt(&id, "framing", None).await.unwrap();

    // An answer lands while the summary is being generated from the older log.
    let (completed, answered) = tokio::join!(h.engine.complete_session(&id), async {
        generator.entered.notified().await;
        let turn = h
            .engine
            .next_prompt(&id, "framing", Some("late answer".to_string()))
            .await;
        generator.release.notify_one();
        turn
    });

    assert!(answered.is_ok());
    assert!(matches!(completed.unwrap_err(), EngineError::Conflict(_)));
    let view = h.engine.session_view(&id).await.unwrap();
    assert!(!view.session.is_completed());
    let packs = SessionDb::new(&h.db_path)
        .unwrap()
        .count_evidence_packs(&id)
        .unwrap();
    assert_eq!(packs, 0);

    // A retry summarizes the transcript that includes the late answer.
    let done = h.engine.complete_session(&id).await.unwrap();
    let pack = h.engine.evidence_pack_by_share_id(&done.share_id).await.unwrap();
    assert_eq!(pack.session_id, id);
    let summarized = generator.summarized.lock().unwrap();
    assert_eq!(summarized.len(), 2);
    assert!(!summarized[0].contains("late answer"));
    assert!(summarized[1].contains("late answer"));
}

#[tokio::test]
async fn replaying_the_log_after_restart_matches_stored_stages() {
    let generator: Arc<dyn Generator> = Arc::new(Scripted::new(true));
    let h = harness(generator.clone(), None);
    let id = create(&h.engine, 15).await;

    h.engine.next_prompt(&id, "framing", None).await.unwrap();
    h.engine
        .next_prompt(&id, "framing", Some("scope it down".to_string()))
        .await
        .unwrap();
    h.engine
        .record_code_snapshot(&id, "let x = 1;".to_string(), None)
        .await
        .unwrap();

    // Reopen the same file as a fresh process would.
    let reopened = SessionDb::new(&h.db_path).unwrap();
    let session = reopened.get_session(&id).unwrap().unwrap();
    let stages = reopened.list_stages(&id).unwrap();
    let events = reopened.list_events(&id).unwrap();
    let plan = StagePlan::for_duration(session.duration);
    let progress = derive_progress(&plan, &events);

    assert_eq!(progress.closed, vec![StageName::Framing]);
    assert_eq!(progress.open, Some(StageName::Build));
    assert!(progress.mismatches(&stages, false).is_empty());

    // A second engine over the reopened file continues where the first stopped.
    let engine = WorkSessionEngine::new(
        DbHandle::new(reopened),
        generator,
        Arc::new(FixedEvidence(None)),
        Arc::new(JobCatalog::default()),
        EngineSettings::default(),
    );
    let turn = engine.next_prompt(&id, "build", None).await.unwrap();
    assert_eq!(turn.stage, StageName::Build);
    assert!(!turn.replayed);
}
