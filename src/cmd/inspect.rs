//! Session inspection command — `tryout inspect`.

use std::path::PathBuf;

use anyhow::{Context, Result};

use tryout::config::TryoutConfig;
use tryout::session::SessionDb;
use tryout::session::models::EventType;
use tryout::session::stages::{StagePlan, derive_progress};

pub fn cmd_inspect(config: &TryoutConfig, session_id: &str, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.database.path.clone());
    if !db_path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'tryout init-db' or 'tryout serve' first.",
            db_path.display()
        );
    }
    let db = SessionDb::new(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let session = db
        .get_session(session_id)?
        .with_context(|| format!("Session {} not found", session_id))?;
    let stages = db.list_stages(session_id)?;
    let events = db.list_events(session_id)?;
    let pack = db.get_evidence_pack_for_session(session_id)?;
    let plan = StagePlan::for_duration(session.duration);

    println!();
    println!("Session {}", session.id);
    println!("  status:    {}", session.status.as_str());
    println!(
        "  track:     {} / {}",
        session.role_track.as_str(),
        session.level.as_str()
    );
    println!("  duration:  {} minutes", session.duration.minutes());
    println!("  evidence:  {}", if session.has_evidence() { "yes" } else { "none" });
    println!("  started:   {}", session.started_at);
    if let Some(ended) = &session.ended_at {
        println!("  ended:     {}", ended);
    }
    if let Some(pack) = &pack {
        println!("  share id:  {}", pack.share_id);
    }
    println!();

    let plan_line: Vec<&str> = plan.stages().iter().map(|s| s.as_str()).collect();
    println!("Stages (plan: {})", plan_line.join(" → "));
    for stage in &stages {
        println!(
            "  {:<14} {} .. {}",
            stage.stage_name.as_str(),
            stage.started_at,
            stage.ended_at.as_deref().unwrap_or("(open)")
        );
    }
    println!();

    let count = |t: EventType| events.iter().filter(|e| e.event_type == t).count();
    println!(
        "Events: {} ({} prompts, {} responses, {} code snapshots)",
        events.len(),
        count(EventType::Prompt),
        count(EventType::Response),
        count(EventType::CodeSnapshot)
    );
    println!();

    let progress = derive_progress(&plan, &events);
    let mismatches = progress.mismatches(&stages, session.is_completed());
    if mismatches.is_empty() {
        println!("Stage history agrees with the event log.");
    } else {
        println!("Stage history disagrees with the event log:");
        for problem in &mismatches {
            println!("  - {}", problem);
        }
    }
    println!();

    Ok(())
}
