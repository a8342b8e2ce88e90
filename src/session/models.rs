use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoleTrack {
    Backend,
    Frontend,
}

impl RoleTrack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
        }
    }
}

impl FromStr for RoleTrack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            _ => Err(format!(
                "Invalid role track '{}'. Valid values: backend, frontend",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Junior,
    Mid,
    Senior,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Junior => "junior",
            Self::Mid => "mid",
            Self::Senior => "senior",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "junior" => Ok(Self::Junior),
            "mid" => Ok(Self::Mid),
            "senior" => Ok(Self::Senior),
            _ => Err(format!(
                "Invalid level '{}'. Valid values: junior, mid, senior",
                s
            )),
        }
    }
}

/// Allowed session lengths. The shortest tier is the demo mode with exactly two stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub enum SessionDuration {
    Demo,
    Standard,
    Extended,
}

impl SessionDuration {
    pub const ALLOWED_MINUTES: [u32; 3] = [5, 15, 30];

    pub fn minutes(&self) -> u32 {
        match self {
            Self::Demo => 5,
            Self::Standard => 15,
            Self::Extended => 30,
        }
    }

    pub fn from_minutes(minutes: u32) -> Result<Self, String> {
        match minutes {
            5 => Ok(Self::Demo),
            15 => Ok(Self::Standard),
            30 => Ok(Self::Extended),
            _ => Err(format!(
                "Invalid duration {} minutes. Valid values: 5, 15, 30",
                minutes
            )),
        }
    }

    pub fn is_demo(&self) -> bool {
        matches!(self, Self::Demo)
    }
}

impl TryFrom<u32> for SessionDuration {
    type Error = String;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        Self::from_minutes(minutes)
    }
}

impl From<SessionDuration> for u32 {
    fn from(d: SessionDuration) -> Self {
        d.minutes()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Interview stages in their one fixed global order. Every stage plan is a
/// subsequence of this order, so `Ord` on `StageName` is the sequence order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Framing,
    Build,
    Debug,
    Tradeoffs,
    Reflection,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Framing => "framing",
            Self::Build => "build",
            Self::Debug => "debug",
            Self::Tradeoffs => "tradeoffs",
            Self::Reflection => "reflection",
        }
    }

    /// What the interviewer is probing for during this stage.
    pub fn focus(&self) -> &'static str {
        match self {
            Self::Framing => {
                "Clarify the problem: goals, users, constraints and what is explicitly out of scope."
            }
            Self::Build => {
                "Walk through how they would build a first working slice: structure, data flow, key steps."
            }
            Self::Debug => {
                "Diagnose a realistic failure in what they built: how they narrow it down and verify a fix."
            }
            Self::Tradeoffs => {
                "Weigh two viable designs against each other and commit to one with reasons."
            }
            Self::Reflection => {
                "Look back: what they would change, what they are unsure about, what they would ship first."
            }
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "framing" => Ok(Self::Framing),
            "build" => Ok(Self::Build),
            "debug" => Ok(Self::Debug),
            "tradeoffs" => Ok(Self::Tradeoffs),
            "reflection" => Ok(Self::Reflection),
            _ => Err(format!("Invalid stage name: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Prompt,
    Response,
    CodeSnapshot,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "PROMPT",
            Self::Response => "RESPONSE",
            Self::CodeSnapshot => "CODE_SNAPSHOT",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROMPT" => Ok(Self::Prompt),
            "RESPONSE" => Ok(Self::Response),
            "CODE_SNAPSHOT" => Ok(Self::CodeSnapshot),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// Fixed vocabulary of competency indicators attached to a candidate response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalTag {
    Ownership,
    Judgment,
    Execution,
    Communication,
    ProductSense,
}

impl SignalTag {
    pub const ALL: [SignalTag; 5] = [
        SignalTag::Ownership,
        SignalTag::Judgment,
        SignalTag::Execution,
        SignalTag::Communication,
        SignalTag::ProductSense,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ownership => "Ownership",
            Self::Judgment => "Judgment",
            Self::Execution => "Execution",
            Self::Communication => "Communication",
            Self::ProductSense => "ProductSense",
        }
    }
}

impl FromStr for SignalTag {
    type Err = String;

    /// Accepts the canonical names plus the spellings models tend to produce
    /// ("product sense", "product_sense", "judgement").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "ownership" => Ok(Self::Ownership),
            "judgment" | "judgement" => Ok(Self::Judgment),
            "execution" => Ok(Self::Execution),
            "communication" => Ok(Self::Communication),
            "productsense" => Ok(Self::ProductSense),
            _ => Err(format!("Unknown signal tag: {}", s)),
        }
    }
}

/// Why a stage decision came out the way it did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionBasis {
    /// The collaborator's assessment was used as-is.
    Assessment,
    /// The assessment was malformed; defaults were applied.
    Fallback,
    /// Demo tier: a stage is complete after its first response.
    DemoTier,
    /// The stage hit the configured exchange limit.
    ExchangeLimit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionSource {
    Generated,
    Fallback,
    Transition,
}

/// Metadata stored on every PROMPT event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptMetadata {
    #[serde(default)]
    pub signal_tags: Vec<SignalTag>,
    #[serde(default)]
    pub stage_complete: bool,
    /// Present when the prompt follows a candidate response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionBasis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub question_source: QuestionSource,
}

/// Metadata stored on every CODE_SNAPSHOT event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    pub content_hash: String,
    #[serde(default)]
    pub language: Option<String>,
    pub chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub evidence_source_ref: String,
    pub role_track: RoleTrack,
    pub level: Level,
    pub duration: SessionDuration,
    pub status: SessionStatus,
    pub evidence_text: Option<String>,
    pub job_context: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl Session {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn has_evidence(&self) -> bool {
        self.evidence_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub id: i64,
    pub session_id: String,
    pub stage_name: StageName,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl Stage {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub session_id: String,
    pub seq: i64,
    pub event_type: EventType,
    pub stage_name: StageName,
    pub payload: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

impl Event {
    /// Decode PROMPT metadata. Returns `None` for other event types or unreadable metadata.
    pub fn prompt_metadata(&self) -> Option<PromptMetadata> {
        if self.event_type != EventType::Prompt {
            return None;
        }
        self.metadata
            .as_ref()
            .and_then(|m| serde_json::from_value(m.clone()).ok())
    }

    pub fn snapshot_metadata(&self) -> Option<SnapshotMetadata> {
        if self.event_type != EventType::CodeSnapshot {
            return None;
        }
        self.metadata
            .as_ref()
            .and_then(|m| serde_json::from_value(m.clone()).ok())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// A strength or risk, tied to the transcript moment that supports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitedClaim {
    pub claim: String,
    pub evidence: String,
}

/// The structured body of an Evidence Pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceSummary {
    pub role_level_estimate: String,
    pub confidence: Confidence,
    pub strengths: Vec<CitedClaim>,
    pub risks_or_unknowns: Vec<CitedClaim>,
    pub decision_log: Vec<String>,
    pub execution_observations: Vec<String>,
    pub recommended_next_step: String,
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePack {
    pub id: String,
    pub session_id: String,
    pub summary: EvidenceSummary,
    pub generated_at: String,
    pub share_id: String,
}

// Raw rows as read from SQLite, before enum parsing.

#[derive(Debug)]
pub(crate) struct SessionRow {
    pub id: String,
    pub evidence_source_ref: String,
    pub role_track: String,
    pub level: String,
    pub duration_minutes: u32,
    pub status: String,
    pub evidence_text: Option<String>,
    pub job_context: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl SessionRow {
    pub fn into_session(self) -> anyhow::Result<Session> {
        Ok(Session {
            id: self.id,
            evidence_source_ref: self.evidence_source_ref,
            role_track: self.role_track.parse().map_err(anyhow::Error::msg)?,
            level: self.level.parse().map_err(anyhow::Error::msg)?,
            duration: SessionDuration::from_minutes(self.duration_minutes)
                .map_err(anyhow::Error::msg)?,
            status: self.status.parse().map_err(anyhow::Error::msg)?,
            evidence_text: self.evidence_text,
            job_context: self.job_context,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

#[derive(Debug)]
pub(crate) struct EventRow {
    pub id: i64,
    pub session_id: String,
    pub seq: i64,
    pub event_type: String,
    pub stage_name: String,
    pub payload: String,
    pub metadata: Option<String>,
    pub created_at: String,
}

impl EventRow {
    pub fn into_event(self) -> anyhow::Result<Event> {
        let metadata = match self.metadata {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid event metadata in database: {}", e))?,
            ),
            None => None,
        };
        Ok(Event {
            id: self.id,
            session_id: self.session_id,
            seq: self.seq,
            event_type: self.event_type.parse().map_err(anyhow::Error::msg)?,
            stage_name: self.stage_name.parse().map_err(anyhow::Error::msg)?,
            payload: self.payload,
            metadata,
            created_at: self.created_at,
        })
    }
}
