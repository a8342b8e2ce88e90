//! Evidence Synthesis Pipeline: transcript in, validated `EvidenceSummary` out.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::EngineError;
use crate::generation::{GenerationRequest, Generator, StructuredError, generate_structured};

use super::models::{CitedClaim, Event, EvidenceSummary, Session};
use super::stages::StagePlan;
use super::transcript::render_transcript;

const RUBRIC: &str = r#"You are writing the evidence pack for a hiring team after a staged work session with a candidate.

Produce a structured, evidence-first decision report.

Rubric:
- NEVER give numeric scores, ratings, percentages or grades. Describe observed behavior instead.
- Every strength and every risk MUST cite a concrete moment from the transcript in its "evidence" field
  (quote or paraphrase what the candidate said or wrote, with the [seq] marker when possible).
- If something could not be observed, list it under risks_or_unknowns and say so plainly.
- If no external evidence (profile, repositories) was provided, state that absence in risks_or_unknowns.
- decision_log: the notable decisions the candidate made, in order.
- execution_observations: how they actually worked (sequencing, verification, code they wrote).
- role_level_estimate: the role and level the session supports, in words.
- recommended_next_step: one concrete action for the hiring team.
- highlights: short quotes or moments worth reading first."#;

const NO_EVIDENCE_CLAIM: &str = "No external evidence was available for this candidate";

fn summary_schema() -> serde_json::Value {
    let claim = serde_json::json!({
        "type": "object",
        "properties": {
            "claim": { "type": "string" },
            "evidence": { "type": "string" }
        },
        "required": ["claim", "evidence"],
        "additionalProperties": false
    });
    serde_json::json!({
        "type": "object",
        "properties": {
            "role_level_estimate": { "type": "string" },
            "confidence": { "type": "string", "enum": ["low", "medium", "high"] },
            "strengths": { "type": "array", "items": claim.clone() },
            "risks_or_unknowns": { "type": "array", "items": claim },
            "decision_log": { "type": "array", "items": { "type": "string" } },
            "execution_observations": { "type": "array", "items": { "type": "string" } },
            "recommended_next_step": { "type": "string" },
            "highlights": { "type": "array", "items": { "type": "string" } }
        },
        "required": [
            "role_level_estimate", "confidence", "strengths", "risks_or_unknowns",
            "decision_log", "execution_observations", "recommended_next_step", "highlights"
        ],
        "additionalProperties": false
    })
}

/// True if `text` contains something shaped like a score: `7/10`, `85/100`, `80%`.
pub fn contains_numeric_score(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
            i += 1;
        }
        let mut j = i;
        while j < chars.len() && chars[j] == ' ' {
            j += 1;
        }
        if j < chars.len() && chars[j] == '%' {
            return true;
        }
        if j < chars.len() && chars[j] == '/' {
            j += 1;
            while j < chars.len() && chars[j] == ' ' {
                j += 1;
            }
            let start = j;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            let denominator: String = chars[start..j].iter().collect();
            if denominator == "10" || denominator == "100" {
                return true;
            }
        }
    }
    false
}

/// Check a parsed summary against the rubric. Returns the first violation.
pub fn validate_summary(summary: &EvidenceSummary) -> Result<(), String> {
    if summary.role_level_estimate.trim().is_empty() {
        return Err("role_level_estimate is empty".to_string());
    }
    if summary.recommended_next_step.trim().is_empty() {
        return Err("recommended_next_step is empty".to_string());
    }
    for (section, claims) in [
        ("strengths", &summary.strengths),
        ("risks_or_unknowns", &summary.risks_or_unknowns),
    ] {
        for (idx, c) in claims.iter().enumerate() {
            if c.claim.trim().is_empty() {
                return Err(format!("{}[{}] has an empty claim", section, idx));
            }
            if c.evidence.trim().is_empty() {
                return Err(format!("{}[{}] cites no evidence", section, idx));
            }
            if contains_numeric_score(&c.claim) {
                return Err(format!("{}[{}] contains a numeric score", section, idx));
            }
        }
    }
    if contains_numeric_score(&summary.role_level_estimate) {
        return Err("role_level_estimate contains a numeric score".to_string());
    }
    Ok(())
}

fn mentions_missing_evidence(claim: &CitedClaim) -> bool {
    let text = format!("{} {}", claim.claim, claim.evidence).to_lowercase();
    text.contains("evidence")
        && ["no ", "not ", "absent", "absence", "missing", "unavailable", "without"]
            .iter()
            .any(|w| text.contains(w))
}

/// Make sure a session without external evidence says so in `risks_or_unknowns`.
pub fn ensure_absence_noted(summary: &mut EvidenceSummary, session: &Session) {
    if session.has_evidence() {
        return;
    }
    if summary.risks_or_unknowns.iter().any(mentions_missing_evidence) {
        return;
    }
    summary.risks_or_unknowns.push(CitedClaim {
        claim: NO_EVIDENCE_CLAIM.to_string(),
        evidence: format!(
            "Nothing could be retrieved from '{}'; every finding rests on this session's transcript alone.",
            session.evidence_source_ref
        ),
    });
}

pub struct Synthesizer {
    generator: Arc<dyn Generator>,
    timeout: Duration,
    snapshot_preview_chars: usize,
}

impl Synthesizer {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration, snapshot_preview_chars: usize) -> Self {
        Self {
            generator,
            timeout,
            snapshot_preview_chars,
        }
    }

    fn context(&self, session: &Session, events: &[Event]) -> String {
        let plan = StagePlan::for_duration(session.duration);
        let stages: Vec<&str> = plan.stages().iter().map(|s| s.as_str()).collect();
        let mut out = format!(
            "Candidate: {} track, {} level. Session length: {} minutes. Stages: {}.\n",
            session.role_track.as_str(),
            session.level.as_str(),
            session.duration.minutes(),
            stages.join(", ")
        );
        if let Some(job) = session.job_context.as_deref() {
            out.push_str(&format!("\n## Job context\n{}\n", job.trim()));
        }
        match session.evidence_text.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(evidence) => out.push_str(&format!("\n## External evidence\n{}\n", evidence.trim())),
            None => out.push_str("\n## External evidence\nNONE. No external evidence was retrieved.\n"),
        }
        out.push_str("\n## Transcript\n");
        if events.is_empty() {
            out.push_str("(the session has no recorded exchanges)\n");
        } else {
            out.push_str(&render_transcript(events, self.snapshot_preview_chars));
        }
        out
    }

    /// Produce a validated summary. Malformed output is fatal.
    pub async fn synthesize(
        &self,
        session: &Session,
        events: &[Event],
    ) -> Result<EvidenceSummary, EngineError> {
        let request = GenerationRequest {
            system_instructions: RUBRIC.to_string(),
            schema: summary_schema(),
            conversation_context: self.context(session, events),
        };
        let generated =
            generate_structured::<EvidenceSummary>(self.generator.as_ref(), request, self.timeout)
                .await;
        let mut summary = match generated {
            Ok(summary) => summary,
            Err(StructuredError::Schema { message, raw }) => {
                let preview: String = raw.chars().take(300).collect();
                tracing::error!(session_id = %session.id, error = %message, raw = %preview, "Malformed evidence summary");
                return Err(EngineError::Schema { message });
            }
            Err(StructuredError::Generation(e)) => return Err(e.into()),
        };
        validate_summary(&summary).map_err(|message| {
            tracing::error!(session_id = %session.id, error = %message, "Evidence summary violates the rubric");
            EngineError::Schema { message }
        })?;
        ensure_absence_noted(&mut summary, session);
        Ok(summary)
    }
}
