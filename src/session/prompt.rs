//! Prompt Generation Policy.
//!
//! Two separate decisions are made per candidate response:
//! 1. an assessment (signal tags plus a stage-complete verdict), then
//! 2. a follow-up question, only when the stage stays open.
//!
//! A deterministic rule sits on top of the assessment verdict, so the demo
//! tier and the per-stage exchange limit hold no matter what the model says.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::EngineError;
use crate::generation::{GenerationRequest, Generator, StructuredError, generate_structured};

use super::models::{DecisionBasis, Event, EventType, QuestionSource, Session, SignalTag, StageName};
use super::stages::StagePlan;
use super::transcript::render_transcript;

pub const DEFAULT_MAX_EXCHANGES_PER_STAGE: u32 = 3;
const MAX_FALLBACK_QUESTION_CHARS: usize = 600;

const QUESTION_INSTRUCTIONS: &str = r#"You are a senior engineer running a short, practical work session with a candidate.
Ask exactly ONE question for the current stage.

Rules:
- Keep it short: one or two sentences.
- Ask about real work: how they would approach, build, debug or decide something. No trivia, no definitions, no puzzles.
- Build on what the candidate already said; do not repeat earlier questions.
- Match the candidate's role track and level, and the job context when given.
- Do not evaluate or praise the candidate in the question."#;

const ASSESSMENT_INSTRUCTIONS: &str = r#"You are assessing one candidate response in a staged work session.

Classify the latest response into 1 or 2 signal tags from this fixed list:
Ownership, Judgment, Execution, Communication, ProductSense.

Then decide whether the current stage has gathered enough signal to move on (stage_complete).
A stage is complete when the candidate has substantively addressed the stage focus; it is not complete
when the answer is vague, off-topic, or raises an obvious follow-up worth asking.

Give a one-sentence rationale that refers to what the candidate actually said. Never assign numeric scores."#;

#[derive(Debug, Deserialize)]
struct QuestionAnswer {
    question: String,
}

#[derive(Debug, Deserialize)]
struct AssessmentAnswer {
    signal_tags: Vec<String>,
    stage_complete: bool,
    #[serde(default)]
    rationale: Option<String>,
}

fn question_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "question": { "type": "string" }
        },
        "required": ["question"],
        "additionalProperties": false
    })
}

fn assessment_schema() -> serde_json::Value {
    let tags: Vec<&str> = SignalTag::ALL.iter().map(|t| t.as_str()).collect();
    serde_json::json!({
        "type": "object",
        "properties": {
            "signal_tags": {
                "type": "array",
                "items": { "type": "string", "enum": tags },
                "minItems": 1,
                "maxItems": 2
            },
            "stage_complete": { "type": "boolean" },
            "rationale": { "type": "string" }
        },
        "required": ["signal_tags", "stage_complete", "rationale"],
        "additionalProperties": false
    })
}

/// Outcome of assessing one response, after the completion rule.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDecision {
    pub signal_tags: Vec<SignalTag>,
    pub stage_complete: bool,
    pub basis: DecisionBasis,
    pub rationale: Option<String>,
}

/// The collaborator's verdict on one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub signal_tags: Vec<SignalTag>,
    pub stage_complete: bool,
    pub rationale: Option<String>,
}

/// Apply the deterministic completion rule on top of an assessment.
///
/// `responses_in_stage` counts the response being decided on.
pub fn decide_completion(
    session: &Session,
    responses_in_stage: u32,
    max_exchanges: u32,
    assessment: Option<Assessment>,
) -> StageDecision {
    let (signal_tags, verdict, rationale, basis) = match assessment {
        Some(a) => (a.signal_tags, a.stage_complete, a.rationale, DecisionBasis::Assessment),
        None => (Vec::new(), false, None, DecisionBasis::Fallback),
    };

    if responses_in_stage == 0 {
        // Nothing to close on yet.
        return StageDecision {
            signal_tags,
            stage_complete: false,
            basis,
            rationale,
        };
    }
    if session.duration.is_demo() {
        return StageDecision {
            signal_tags,
            stage_complete: true,
            basis: DecisionBasis::DemoTier,
            rationale,
        };
    }
    if max_exchanges > 0 && responses_in_stage >= max_exchanges {
        return StageDecision {
            signal_tags,
            stage_complete: true,
            basis: DecisionBasis::ExchangeLimit,
            rationale,
        };
    }
    StageDecision {
        signal_tags,
        stage_complete: verdict,
        basis,
        rationale,
    }
}

/// Normalize model-produced tags: known names only, no duplicates, at most two.
pub fn normalize_tags(raw: &[String]) -> Vec<SignalTag> {
    let mut tags = Vec::new();
    for tag in raw.iter().filter_map(|t| t.parse::<SignalTag>().ok()) {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
        if tags.len() == 2 {
            break;
        }
    }
    tags
}

/// Turn unusable question output into something the candidate can still answer.
pub fn fallback_question(raw: &str, stage: StageName) -> String {
    let text = raw.trim();
    let looks_structured = text.starts_with('{') || text.starts_with('[') || text.contains("```");
    if !text.is_empty() && !looks_structured && text.chars().count() <= MAX_FALLBACK_QUESTION_CHARS {
        return text.to_string();
    }
    generic_question(stage)
}

pub fn generic_question(stage: StageName) -> String {
    match stage {
        StageName::Framing => {
            "Before building anything, how would you frame this problem: who is it for, and what matters most?".to_string()
        }
        StageName::Build => {
            "Walk me through how you would build the first working version. What would you do first?".to_string()
        }
        StageName::Debug => {
            "Suppose your first version fails in production. How would you track down the cause?".to_string()
        }
        StageName::Tradeoffs => {
            "What is one design decision here you could make two ways, and which would you pick?".to_string()
        }
        StageName::Reflection => {
            "Looking back at this session, what would you do differently with more time?".to_string()
        }
    }
}

/// Fixed prompt emitted when a stage closes.
pub fn transition_text(closed: StageName, next: Option<StageName>) -> String {
    match next {
        Some(next) => format!(
            "Thanks, that wraps up {}. Let's move on to {}: {}",
            closed,
            next,
            next.focus()
        ),
        None => format!(
            "Thanks, that wraps up {}, the last stage of this session. You can finish the session whenever you're ready.",
            closed
        ),
    }
}

/// Number of RESPONSE events recorded for `stage`.
pub fn responses_in_stage(history: &[Event], stage: StageName) -> u32 {
    history
        .iter()
        .filter(|e| e.event_type == EventType::Response && e.stage_name == stage)
        .count() as u32
}

/// The PROMPT for `stage` still waiting for an answer, if any.
pub fn unanswered_prompt(history: &[Event], stage: StageName) -> Option<&Event> {
    history
        .iter()
        .rev()
        .find(|e| e.stage_name == stage && e.event_type != EventType::CodeSnapshot)
        .filter(|e| e.event_type == EventType::Prompt)
}

/// Everything the policy reads for one decision.
pub struct PolicyContext<'a> {
    pub session: &'a Session,
    pub plan: &'a StagePlan,
    pub stage: StageName,
    pub history: &'a [Event],
    pub snapshot_preview_chars: usize,
}

impl PolicyContext<'_> {
    fn render(&self, pending_response: Option<&str>) -> String {
        let plan: Vec<&str> = self.plan.stages().iter().map(|s| s.as_str()).collect();
        let mut out = format!(
            "Candidate: {} track, {} level.\nSession length: {} minutes. Stage plan: {}.\nCurrent stage: {} ({})\n",
            self.session.role_track.as_str(),
            self.session.level.as_str(),
            self.session.duration.minutes(),
            plan.join(", "),
            self.stage,
            self.stage.focus(),
        );
        if let Some(job) = self.session.job_context.as_deref() {
            out.push_str(&format!("\n## Job context\n{}\n", job.trim()));
        }
        match self.session.evidence_text.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(evidence) => out.push_str(&format!("\n## External evidence\n{}\n", evidence.trim())),
            None => out.push_str("\n## External evidence\nNone available.\n"),
        }
        out.push_str("\n## Transcript so far\n");
        if self.history.is_empty() {
            out.push_str("(no exchanges yet)\n");
        } else {
            out.push_str(&render_transcript(self.history, self.snapshot_preview_chars));
        }
        if let Some(response) = pending_response {
            out.push_str(&format!(
                "\n## Latest candidate response ({})\n{}\n",
                self.stage,
                response.trim()
            ));
        }
        out
    }
}

/// Decides questions and stage completion through the generation collaborator.
pub struct PromptPolicy {
    generator: Arc<dyn Generator>,
    timeout: Duration,
    max_exchanges_per_stage: u32,
}

impl PromptPolicy {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration, max_exchanges_per_stage: u32) -> Self {
        Self {
            generator,
            timeout,
            max_exchanges_per_stage,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: GenerationRequest,
    ) -> Result<T, StructuredError> {
        generate_structured(self.generator.as_ref(), request, self.timeout).await
    }

    /// Ask for one question for the current stage.
    pub async fn question(
        &self,
        ctx: &PolicyContext<'_>,
        pending_response: Option<&str>,
    ) -> Result<(String, QuestionSource), EngineError> {
        let request = GenerationRequest {
            system_instructions: QUESTION_INSTRUCTIONS.to_string(),
            schema: question_schema(),
            conversation_context: ctx.render(pending_response),
        };
        match self.call::<QuestionAnswer>(request).await {
            Ok(answer) if !answer.question.trim().is_empty() => {
                Ok((answer.question.trim().to_string(), QuestionSource::Generated))
            }
            Ok(_) => {
                tracing::warn!(session_id = %ctx.session.id, stage = %ctx.stage, "Generator returned an empty question; using fallback");
                Ok((generic_question(ctx.stage), QuestionSource::Fallback))
            }
            Err(StructuredError::Schema { message, raw }) => {
                let preview: String = raw.chars().take(300).collect();
                tracing::warn!(
                    session_id = %ctx.session.id,
                    stage = %ctx.stage,
                    error = %message,
                    raw = %preview,
                    "Malformed question output; using fallback"
                );
                Ok((fallback_question(&raw, ctx.stage), QuestionSource::Fallback))
            }
            Err(StructuredError::Generation(e)) => Err(e.into()),
        }
    }

    /// Assess a response and apply the completion rule.
    pub async fn assess(
        &self,
        ctx: &PolicyContext<'_>,
        response: &str,
    ) -> Result<StageDecision, EngineError> {
        let request = GenerationRequest {
            system_instructions: ASSESSMENT_INSTRUCTIONS.to_string(),
            schema: assessment_schema(),
            conversation_context: ctx.render(Some(response)),
        };
        let assessment = match self.call::<AssessmentAnswer>(request).await {
            Ok(answer) => {
                let tags = normalize_tags(&answer.signal_tags);
                if tags.is_empty() {
                    tracing::warn!(
                        session_id = %ctx.session.id,
                        stage = %ctx.stage,
                        tags = ?answer.signal_tags,
                        "Assessment has no recognizable signal tags; using fallback"
                    );
                    None
                } else {
                    Some(Assessment {
                        signal_tags: tags,
                        stage_complete: answer.stage_complete,
                        rationale: answer.rationale.filter(|r| !r.trim().is_empty()),
                    })
                }
            }
            Err(StructuredError::Schema { message, raw }) => {
                let preview: String = raw.chars().take(300).collect();
                tracing::warn!(
                    session_id = %ctx.session.id,
                    stage = %ctx.stage,
                    error = %message,
                    raw = %preview,
                    "Malformed assessment output; using fallback"
                );
                None
            }
            Err(StructuredError::Generation(e)) => return Err(e.into()),
        };

        let responses = responses_in_stage(ctx.history, ctx.stage) + 1;
        Ok(decide_completion(
            ctx.session,
            responses,
            self.max_exchanges_per_stage,
            assessment,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GenerationError;
    use crate::session::models::{Level, RoleTrack, SessionDuration, SessionStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn session(duration: SessionDuration) -> Session {
        Session {
            id: "s1".into(),
            evidence_source_ref: "alice".into(),
            role_track: RoleTrack::Backend,
            level: Level::Mid,
            duration,
            status: SessionStatus::Active,
            evidence_text: Some("GitHub profile: alice".into()),
            job_context: Some("Job: Payments".into()),
            started_at: "2026-01-01T00:00:00.000000Z".into(),
            ended_at: None,
        }
    }

    fn event(seq: i64, event_type: EventType, stage: StageName) -> Event {
        Event {
            id: seq,
            session_id: "s1".into(),
            seq,
            event_type,
            stage_name: stage,
            payload: format!("payload {}", seq),
            metadata: None,
            created_at: "2026-01-01T00:00:00.000000Z".into(),
        }
    }

    struct Scripted {
        replies: Mutex<Vec<Result<String, GenerationError>>>,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
            self.seen.lock().unwrap().push(request);
            self.replies.lock().unwrap().remove(0)
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct Slow;

    #[async_trait]
    impl Generator for Slow {
        async fn generate(&self, _request: GenerationRequest) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("{}".into())
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    fn policy(generator: Arc<dyn Generator>) -> PromptPolicy {
        PromptPolicy::new(generator, Duration::from_secs(2), 3)
    }

    // ── completion rule ──────────────────────────────────────────────

    fn verdict(complete: bool) -> Option<Assessment> {
        Some(Assessment {
            signal_tags: vec![SignalTag::Judgment],
            stage_complete: complete,
            rationale: None,
        })
    }

    #[test]
    fn demo_tier_completes_after_first_response() {
        let d = decide_completion(&session(SessionDuration::Demo), 1, 3, verdict(false));
        assert!(d.stage_complete);
        assert_eq!(d.basis, DecisionBasis::DemoTier);
        assert_eq!(d.signal_tags, vec![SignalTag::Judgment]);
    }

    #[test]
    fn demo_tier_completes_even_when_assessment_fell_back() {
        let d = decide_completion(&session(SessionDuration::Demo), 1, 3, None);
        assert!(d.stage_complete);
        assert!(d.signal_tags.is_empty());
    }

    #[test]
    fn exchange_limit_forces_completion() {
        let d = decide_completion(&session(SessionDuration::Standard), 3, 3, verdict(false));
        assert!(d.stage_complete);
        assert_eq!(d.basis, DecisionBasis::ExchangeLimit);
    }

    #[test]
    fn zero_limit_leaves_the_verdict_in_charge() {
        let s = session(SessionDuration::Standard);
        let d = decide_completion(&s, 50, 0, verdict(false));
        assert!(!d.stage_complete);
        assert_eq!(d.basis, DecisionBasis::Assessment);
        assert!(decide_completion(&s, 1, 0, verdict(true)).stage_complete);
    }

    #[test]
    fn verdict_is_used_below_limit() {
        let s = session(SessionDuration::Extended);
        assert!(decide_completion(&s, 1, 3, verdict(true)).stage_complete);
        let d = decide_completion(&s, 1, 3, verdict(false));
        assert!(!d.stage_complete);
        assert_eq!(d.basis, DecisionBasis::Assessment);
    }

    #[test]
    fn fallback_never_completes_below_limit() {
        let d = decide_completion(&session(SessionDuration::Standard), 1, 3, None);
        assert!(!d.stage_complete);
        assert_eq!(d.basis, DecisionBasis::Fallback);
        assert!(d.signal_tags.is_empty());
    }

    #[test]
    fn no_response_never_completes() {
        let d = decide_completion(&session(SessionDuration::Demo), 0, 3, verdict(true));
        assert!(!d.stage_complete);
    }

    // ── helpers ──────────────────────────────────────────────────────

    #[test]
    fn normalize_tags_filters_and_caps() {
        let raw = vec![
            "judgement".to_string(),
            "Charisma".to_string(),
            "Judgment".to_string(),
            "product sense".to_string(),
            "Execution".to_string(),
        ];
        assert_eq!(
            normalize_tags(&raw),
            vec![SignalTag::Judgment, SignalTag::ProductSense]
        );
        assert!(normalize_tags(&["Vibes".to_string()]).is_empty());
    }

    #[test]
    fn fallback_question_prefers_plain_text() {
        assert_eq!(
            fallback_question("  What would you cache first?  ", StageName::Build),
            "What would you cache first?"
        );
        assert_eq!(
            fallback_question("{\"q\": 1}", StageName::Build),
            generic_question(StageName::Build)
        );
        assert_eq!(fallback_question("", StageName::Debug), generic_question(StageName::Debug));
        assert_eq!(
            fallback_question(&"a".repeat(700), StageName::Framing),
            generic_question(StageName::Framing)
        );
    }

    #[test]
    fn transition_text_names_next_stage() {
        let text = transition_text(StageName::Framing, Some(StageName::Build));
        assert!(text.contains("framing"));
        assert!(text.contains("build"));
        let last = transition_text(StageName::Reflection, None);
        assert!(last.contains("last stage"));
    }

    #[test]
    fn unanswered_prompt_detection() {
        let history = vec![
            event(1, EventType::Prompt, StageName::Framing),
            event(2, EventType::Response, StageName::Framing),
            event(3, EventType::Prompt, StageName::Framing),
            event(4, EventType::CodeSnapshot, StageName::Framing),
        ];
        assert_eq!(unanswered_prompt(&history, StageName::Framing).map(|e| e.seq), Some(3));
        assert!(unanswered_prompt(&history[..2], StageName::Framing).is_none());
        assert!(unanswered_prompt(&history, StageName::Build).is_none());
        assert_eq!(responses_in_stage(&history, StageName::Framing), 1);
    }

    // ── collaborator calls ───────────────────────────────────────────

    fn ctx<'a>(session: &'a Session, plan: &'a StagePlan, history: &'a [Event]) -> PolicyContext<'a> {
        PolicyContext {
            session,
            plan,
            stage: StageName::Framing,
            history,
            snapshot_preview_chars: 1200,
        }
    }

    #[tokio::test]
    async fn question_uses_structured_answer() {
        let generator = Scripted::new(vec![Ok(r#"{"question":"Who are the users?"}"#.into())]);
        let s = session(SessionDuration::Standard);
        let plan = StagePlan::for_duration(s.duration);
        let (text, source) = policy(generator.clone())
            .question(&ctx(&s, &plan, &[]), None)
            .await
            .unwrap();
        assert_eq!(text, "Who are the users?");
        assert_eq!(source, QuestionSource::Generated);

        let seen = generator.seen.lock().unwrap();
        let context = &seen[0].conversation_context;
        assert!(context.contains("backend track, mid level"));
        assert!(context.contains("Job: Payments"));
        assert!(context.contains("GitHub profile: alice"));
    }

    #[tokio::test]
    async fn malformed_question_falls_back_to_raw_text() {
        let generator = Scripted::new(vec![Ok("What trade-offs worry you most?".into())]);
        let s = session(SessionDuration::Standard);
        let plan = StagePlan::for_duration(s.duration);
        let (text, source) = policy(generator)
            .question(&ctx(&s, &plan, &[]), None)
            .await
            .unwrap();
        assert_eq!(text, "What trade-offs worry you most?");
        assert_eq!(source, QuestionSource::Fallback);
    }

    #[tokio::test]
    async fn assessment_parses_tags_and_verdict() {
        let generator = Scripted::new(vec![Ok(
            r#"{"signal_tags":["Ownership","Communication"],"stage_complete":true,"rationale":"Named users and constraints."}"#.into(),
        )]);
        let s = session(SessionDuration::Standard);
        let plan = StagePlan::for_duration(s.duration);
        let d = policy(generator)
            .assess(&ctx(&s, &plan, &[]), "I'd ask who the users are")
            .await
            .unwrap();
        assert!(d.stage_complete);
        assert_eq!(d.basis, DecisionBasis::Assessment);
        assert_eq!(d.signal_tags, vec![SignalTag::Ownership, SignalTag::Communication]);
        assert_eq!(d.rationale.as_deref(), Some("Named users and constraints."));
    }

    #[tokio::test]
    async fn malformed_assessment_falls_back() {
        let generator = Scripted::new(vec![Ok("I think they did great!".into())]);
        let s = session(SessionDuration::Standard);
        let plan = StagePlan::for_duration(s.duration);
        let d = policy(generator)
            .assess(&ctx(&s, &plan, &[]), "answer")
            .await
            .unwrap();
        assert!(!d.stage_complete);
        assert!(d.signal_tags.is_empty());
        assert_eq!(d.basis, DecisionBasis::Fallback);
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let generator = Scripted::new(vec![Err(GenerationError::RateLimited { retry_after: None })]);
        let s = session(SessionDuration::Standard);
        let plan = StagePlan::for_duration(s.duration);
        let err = policy(generator)
            .assess(&ctx(&s, &plan, &[]), "answer")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_generator_times_out_as_retryable() {
        let s = session(SessionDuration::Standard);
        let plan = StagePlan::for_duration(s.duration);
        let policy = PromptPolicy::new(Arc::new(Slow), Duration::from_millis(50), 3);
        let err = policy
            .question(&ctx(&s, &plan, &[]), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }
}
