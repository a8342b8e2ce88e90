//! Stage Controller: the ordered stage plan of a session and the rules for
//! which stage a caller may act on.
//!
//! The open stage is always read from storage. `derive_progress` rebuilds the
//! same answer from the event log alone, which is what makes a session
//! resumable after a restart.

use crate::errors::EngineError;

use super::models::{Event, EventType, Session, SessionDuration, Stage, StageName};

const DEMO_PLAN: &[StageName] = &[StageName::Framing, StageName::Build];
const STANDARD_PLAN: &[StageName] = &[StageName::Framing, StageName::Build, StageName::Reflection];
const EXTENDED_PLAN: &[StageName] = &[
    StageName::Framing,
    StageName::Build,
    StageName::Debug,
    StageName::Tradeoffs,
    StageName::Reflection,
];

/// Ordered stages for one session length. Always a subsequence of the global
/// `StageName` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    stages: &'static [StageName],
}

impl StagePlan {
    pub fn for_duration(duration: SessionDuration) -> Self {
        let stages = match duration {
            SessionDuration::Demo => DEMO_PLAN,
            SessionDuration::Standard => STANDARD_PLAN,
            SessionDuration::Extended => EXTENDED_PLAN,
        };
        Self { stages }
    }

    pub fn stages(&self) -> &'static [StageName] {
        self.stages
    }

    pub fn first(&self) -> StageName {
        self.stages[0]
    }

    pub fn contains(&self, stage: StageName) -> bool {
        self.stages.contains(&stage)
    }

    /// The successor of `stage`, or `None` when it is last (or not in the plan).
    pub fn next_after(&self, stage: StageName) -> Option<StageName> {
        let idx = self.stages.iter().position(|s| *s == stage)?;
        self.stages.get(idx + 1).copied()
    }
}

/// Check that `requested` names the stage a caller may act on right now.
pub fn resolve_target(
    session: &Session,
    plan: &StagePlan,
    open: Option<&Stage>,
    requested: &str,
) -> Result<StageName, EngineError> {
    let not_found = || EngineError::StageNotFound {
        session_id: session.id.clone(),
        stage: requested.to_string(),
    };
    let stage: StageName = requested.parse().map_err(|_| not_found())?;
    if !plan.contains(stage) {
        return Err(not_found());
    }
    if session.is_completed() {
        return Err(EngineError::Conflict(format!(
            "session {} is already completed",
            session.id
        )));
    }
    match open {
        None => Err(EngineError::Conflict(format!(
            "session {} has no open stage; all stages are closed",
            session.id
        ))),
        Some(open) if open.stage_name != stage => Err(EngineError::Conflict(format!(
            "stage '{}' is not open; the current stage is '{}'",
            stage, open.stage_name
        ))),
        Some(_) => Ok(stage),
    }
}

/// Stage history as reconstructed from the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProgress {
    pub closed: Vec<StageName>,
    pub open: Option<StageName>,
}

impl StageProgress {
    /// Compare with stored stage rows. A completed session has its last open
    /// stage closed by completion rather than by an event, so that case is
    /// allowed to differ on `open` only.
    pub fn mismatches(&self, rows: &[Stage], session_completed: bool) -> Vec<String> {
        let mut problems = Vec::new();
        let stored_closed: Vec<StageName> = rows
            .iter()
            .filter(|s| !s.is_open())
            .map(|s| s.stage_name)
            .collect();
        let stored_open = rows.iter().find(|s| s.is_open()).map(|s| s.stage_name);

        if session_completed {
            let mut expected = self.closed.clone();
            expected.extend(self.open);
            if stored_closed != expected {
                problems.push(format!(
                    "closed stages differ: log {:?}, stored {:?}",
                    expected, stored_closed
                ));
            }
            if let Some(open) = stored_open {
                problems.push(format!("completed session still has open stage '{}'", open));
            }
            return problems;
        }

        if stored_closed != self.closed {
            problems.push(format!(
                "closed stages differ: log {:?}, stored {:?}",
                self.closed, stored_closed
            ));
        }
        if stored_open != self.open {
            problems.push(format!(
                "open stage differs: log {:?}, stored {:?}",
                self.open, stored_open
            ));
        }
        problems
    }
}

/// Rebuild stage progress from events. A stage is closed by the PROMPT whose
/// metadata carries `stage_complete = true` after a RESPONSE in that stage.
pub fn derive_progress(plan: &StagePlan, events: &[Event]) -> StageProgress {
    let mut closed: Vec<StageName> = Vec::new();
    let mut answered: Option<StageName> = None;

    for event in events {
        match event.event_type {
            EventType::Response => answered = Some(event.stage_name),
            EventType::Prompt => {
                let completes = event
                    .prompt_metadata()
                    .is_some_and(|m| m.stage_complete);
                if completes
                    && answered == Some(event.stage_name)
                    && !closed.contains(&event.stage_name)
                {
                    closed.push(event.stage_name);
                }
            }
            EventType::CodeSnapshot => {}
        }
    }

    let open = match closed.last() {
        None => Some(plan.first()),
        Some(last) => plan.next_after(*last),
    };
    StageProgress { closed, open }
}
