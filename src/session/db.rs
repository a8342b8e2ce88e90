use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use super::models::*;

/// Async-safe handle to the session database.
///
/// Wraps `SessionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SessionDb>>,
}

impl DbHandle {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SessionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Timestamp format used for every stored time. Fixed width, so string order
/// equals time order.
pub fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

/// Everything needed to insert a new session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub evidence_source_ref: String,
    pub role_track: RoleTrack,
    pub level: Level,
    pub duration: SessionDuration,
    pub evidence_text: Option<String>,
    pub job_context: Option<String>,
}

/// What happens to the open stage when a turn commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTransition {
    Stay,
    /// Close the open stage and open the given one.
    Advance(StageName),
    /// Close the open stage; it was the last one in the plan.
    CloseLast,
}

/// One prompt/response exchange, committed atomically.
#[derive(Debug, Clone)]
pub struct TurnCommit {
    pub session_id: String,
    pub stage: StageName,
    /// `seq` of the last event the caller saw. The commit is rejected if the log moved.
    pub expected_seq: i64,
    pub response: Option<String>,
    pub prompt_text: String,
    pub prompt_metadata: PromptMetadata,
    pub transition: StageTransition,
}

#[derive(Debug, Clone)]
pub struct NewEvidencePack {
    pub id: String,
    pub share_id: String,
    pub summary: EvidenceSummary,
}

/// Result of a guarded write. Anything other than `Committed` means nothing was written.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome<T> {
    Committed(T),
    NotFound,
    /// The session is already completed.
    Terminal,
    /// The event log moved since the caller's snapshot.
    Stale { expected_seq: i64, actual_seq: i64 },
    /// The open stage is not the one the caller expected.
    StageMoved { open: Option<StageName> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotWrite {
    Recorded(Event),
    /// Identical to the previous snapshot; nothing written.
    Duplicate,
}

pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    evidence_source_ref TEXT NOT NULL,
                    role_track TEXT NOT NULL,
                    level TEXT NOT NULL,
                    duration_minutes INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    evidence_text TEXT,
                    job_context TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS stages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    stage_name TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    UNIQUE(session_id, stage_name)
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    stage_name TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    metadata TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(session_id, seq)
                );

                CREATE TABLE IF NOT EXISTS evidence_packs (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL UNIQUE REFERENCES sessions(id) ON DELETE CASCADE,
                    summary TEXT NOT NULL,
                    generated_at TEXT NOT NULL,
                    share_id TEXT NOT NULL UNIQUE
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_stages_single_open
                    ON stages(session_id) WHERE ended_at IS NULL;
                CREATE INDEX IF NOT EXISTS idx_stages_session ON stages(session_id);
                CREATE INDEX IF NOT EXISTS idx_events_session_seq ON events(session_id, seq);

                CREATE TRIGGER IF NOT EXISTS events_no_update
                    BEFORE UPDATE ON events
                    BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;

                CREATE TRIGGER IF NOT EXISTS evidence_packs_no_update
                    BEFORE UPDATE ON evidence_packs
                    BEGIN SELECT RAISE(ABORT, 'evidence packs are immutable'); END;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Insert a session and its first open stage in one transaction.
    pub fn create_session(&self, new: &NewSession, first_stage: StageName) -> Result<Session> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = now_timestamp();
        tx.execute(
            "INSERT INTO sessions (id, evidence_source_ref, role_track, level, duration_minutes, status, evidence_text, job_context, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?8)",
            params![
                new.id,
                new.evidence_source_ref,
                new.role_track.as_str(),
                new.level.as_str(),
                new.duration.minutes(),
                new.evidence_text,
                new.job_context,
                now,
            ],
        )
        .context("Failed to insert session")?;
        tx.execute(
            "INSERT INTO stages (session_id, stage_name, started_at) VALUES (?1, ?2, ?3)",
            params![new.id, first_stage.as_str(), now],
        )
        .context("Failed to insert first stage")?;
        tx.commit().context("Failed to commit session creation")?;

        self.get_session(&new.id)?
            .context("Session not found after insert")
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Self::read_session(&self.conn, id)
    }

    pub fn count_sessions(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .context("Failed to count sessions")
    }

    fn read_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
        let row = conn
            .query_row(
                "SELECT id, evidence_source_ref, role_track, level, duration_minutes, status, evidence_text, job_context, started_at, ended_at
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        evidence_source_ref: row.get(1)?,
                        role_track: row.get(2)?,
                        level: row.get(3)?,
                        duration_minutes: row.get(4)?,
                        status: row.get(5)?,
                        evidence_text: row.get(6)?,
                        job_context: row.get(7)?,
                        started_at: row.get(8)?,
                        ended_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .context("Failed to query session")?;
        row.map(SessionRow::into_session).transpose()
    }

    // ── Stages ────────────────────────────────────────────────────────

    pub fn list_stages(&self, session_id: &str) -> Result<Vec<Stage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, stage_name, started_at, ended_at
                 FROM stages WHERE session_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_stages")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query stages")?;
        let mut stages = Vec::new();
        for row in rows {
            let (id, session_id, stage_name, started_at, ended_at) =
                row.context("Failed to read stage row")?;
            stages.push(Stage {
                id,
                session_id,
                stage_name: stage_name.parse().map_err(anyhow::Error::msg)?,
                started_at,
                ended_at,
            });
        }
        Ok(stages)
    }

    /// The single open stage of a session, if any.
    pub fn open_stage(&self, session_id: &str) -> Result<Option<Stage>> {
        Self::read_open_stage(&self.conn, session_id)
    }

    fn read_open_stage(conn: &Connection, session_id: &str) -> Result<Option<Stage>> {
        let row = conn
            .query_row(
                "SELECT id, session_id, stage_name, started_at FROM stages
                 WHERE session_id = ?1 AND ended_at IS NULL",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query open stage")?;
        match row {
            Some((id, session_id, stage_name, started_at)) => Ok(Some(Stage {
                id,
                session_id,
                stage_name: stage_name.parse().map_err(anyhow::Error::msg)?,
                started_at,
                ended_at: None,
            })),
            None => Ok(None),
        }
    }

    pub fn count_open_stages(&self, session_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM stages WHERE session_id = ?1 AND ended_at IS NULL",
                params![session_id],
                |row| row.get(0),
            )
            .context("Failed to count open stages")
    }

    // ── Events ────────────────────────────────────────────────────────

    /// All events of a session in log order.
    pub fn list_events(&self, session_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, seq, event_type, stage_name, payload, metadata, created_at
                 FROM events WHERE session_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    seq: row.get(2)?,
                    event_type: row.get(3)?,
                    stage_name: row.get(4)?,
                    payload: row.get(5)?,
                    metadata: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            let r = row.context("Failed to read event row")?;
            events.push(r.into_event()?);
        }
        Ok(events)
    }

    fn log_head(conn: &Connection, session_id: &str) -> Result<(i64, Option<String>)> {
        conn.query_row(
            "SELECT seq, created_at FROM events WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![session_id],
            |row| Ok((row.get::<_, i64>(0)?, Some(row.get::<_, String>(1)?))),
        )
        .optional()
        .context("Failed to read event log head")
        .map(|head| head.unwrap_or((0, None)))
    }

    /// Append one event inside an open transaction. `created_at` never goes
    /// backwards relative to the previous event of the session.
    fn append_event(
        tx: &Transaction<'_>,
        session_id: &str,
        event_type: EventType,
        stage: StageName,
        payload: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Event> {
        let (last_seq, last_created_at) = Self::log_head(tx, session_id)?;
        let now = now_timestamp();
        let created_at = match last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let seq = last_seq + 1;
        let metadata_text = metadata.map(|m| m.to_string());
        tx.execute(
            "INSERT INTO events (session_id, seq, event_type, stage_name, payload, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                seq,
                event_type.as_str(),
                stage.as_str(),
                payload,
                metadata_text,
                created_at,
            ],
        )
        .context("Failed to append event")?;
        Ok(Event {
            id: tx.last_insert_rowid(),
            session_id: session_id.to_string(),
            seq,
            event_type,
            stage_name: stage,
            payload: payload.to_string(),
            metadata: metadata.cloned(),
            created_at,
        })
    }

    /// Shared guard for every write on a live session: `Some` means reject with that outcome.
    fn check_live<T>(tx: &Transaction<'_>, session_id: &str) -> Result<Option<CommitOutcome<T>>> {
        match Self::read_session(tx, session_id)? {
            None => Ok(Some(CommitOutcome::NotFound)),
            Some(s) if s.is_completed() => Ok(Some(CommitOutcome::Terminal)),
            Some(_) => Ok(None),
        }
    }

    /// Commit a prompt/response exchange: the optional RESPONSE, the PROMPT
    /// carrying the decision, and any stage transition, all or nothing.
    pub fn commit_turn(&self, turn: &TurnCommit) -> Result<CommitOutcome<Vec<Event>>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(rejected) = Self::check_live(&tx, &turn.session_id)? {
            return Ok(rejected);
        }
        let open = Self::read_open_stage(&tx, &turn.session_id)?;
        let open_stage = match open {
            Some(stage) if stage.stage_name == turn.stage => stage,
            other => {
                return Ok(CommitOutcome::StageMoved {
                    open: other.map(|s| s.stage_name),
                });
            }
        };
        let (actual_seq, _) = Self::log_head(&tx, &turn.session_id)?;
        if actual_seq != turn.expected_seq {
            return Ok(CommitOutcome::Stale {
                expected_seq: turn.expected_seq,
                actual_seq,
            });
        }

        let mut appended = Vec::new();
        if let Some(response) = &turn.response {
            appended.push(Self::append_event(
                &tx,
                &turn.session_id,
                EventType::Response,
                turn.stage,
                response,
                None,
            )?);
        }
        let metadata = serde_json::to_value(&turn.prompt_metadata)
            .context("Failed to encode prompt metadata")?;
        appended.push(Self::append_event(
            &tx,
            &turn.session_id,
            EventType::Prompt,
            turn.stage,
            &turn.prompt_text,
            Some(&metadata),
        )?);

        match turn.transition {
            StageTransition::Stay => {}
            StageTransition::Advance(next) => {
                let now = now_timestamp();
                Self::close_stage(&tx, open_stage.id, &now)?;
                tx.execute(
                    "INSERT INTO stages (session_id, stage_name, started_at) VALUES (?1, ?2, ?3)",
                    params![turn.session_id, next.as_str(), now],
                )
                .context("Failed to open next stage")?;
            }
            StageTransition::CloseLast => {
                Self::close_stage(&tx, open_stage.id, &now_timestamp())?;
            }
        }

        tx.commit().context("Failed to commit turn")?;
        Ok(CommitOutcome::Committed(appended))
    }

    fn close_stage(tx: &Transaction<'_>, stage_id: i64, ended_at: &str) -> Result<()> {
        tx.execute(
            "UPDATE stages SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
            params![ended_at, stage_id],
        )
        .context("Failed to close stage")?;
        Ok(())
    }

    /// Append a CODE_SNAPSHOT on the open stage unless it repeats the latest snapshot.
    pub fn append_code_snapshot(
        &self,
        session_id: &str,
        code: &str,
        metadata: &SnapshotMetadata,
    ) -> Result<CommitOutcome<SnapshotWrite>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(rejected) = Self::check_live(&tx, session_id)? {
            return Ok(rejected);
        }
        let Some(open) = Self::read_open_stage(&tx, session_id)? else {
            return Ok(CommitOutcome::StageMoved { open: None });
        };

        let previous_hash: Option<String> = tx
            .query_row(
                "SELECT metadata FROM events WHERE session_id = ?1 AND event_type = 'CODE_SNAPSHOT'
                 ORDER BY seq DESC LIMIT 1",
                params![session_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .context("Failed to read previous snapshot")?
            .flatten()
            .and_then(|raw| serde_json::from_str::<SnapshotMetadata>(&raw).ok())
            .map(|m| m.content_hash);
        if previous_hash.as_deref() == Some(metadata.content_hash.as_str()) {
            return Ok(CommitOutcome::Committed(SnapshotWrite::Duplicate));
        }

        let metadata =
            serde_json::to_value(metadata).context("Failed to encode snapshot metadata")?;
        let event = Self::append_event(
            &tx,
            session_id,
            EventType::CodeSnapshot,
            open.stage_name,
            code,
            Some(&metadata),
        )?;
        tx.commit().context("Failed to commit snapshot")?;
        Ok(CommitOutcome::Committed(SnapshotWrite::Recorded(event)))
    }

    // ── Evidence packs ────────────────────────────────────────────────

    /// The single finalizing write: store the pack, close any open stage and
    /// mark the session completed. `expected_seq` is the last event the pack
    /// was synthesized from; the write is rejected if the log moved since.
    pub fn finalize_session(
        &self,
        session_id: &str,
        expected_seq: i64,
        pack: &NewEvidencePack,
    ) -> Result<CommitOutcome<EvidencePack>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(rejected) = Self::check_live(&tx, session_id)? {
            return Ok(rejected);
        }
        let (actual_seq, _) = Self::log_head(&tx, session_id)?;
        if actual_seq != expected_seq {
            return Ok(CommitOutcome::Stale {
                expected_seq,
                actual_seq,
            });
        }

        let now = now_timestamp();
        let summary =
            serde_json::to_string(&pack.summary).context("Failed to encode evidence summary")?;
        tx.execute(
            "INSERT INTO evidence_packs (id, session_id, summary, generated_at, share_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![pack.id, session_id, summary, now, pack.share_id],
        )
        .context("Failed to insert evidence pack")?;
        tx.execute(
            "UPDATE stages SET ended_at = ?1 WHERE session_id = ?2 AND ended_at IS NULL",
            params![now, session_id],
        )
        .context("Failed to close open stages")?;
        tx.execute(
            "UPDATE sessions SET status = 'completed', ended_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )
        .context("Failed to complete session")?;
        tx.commit().context("Failed to commit session completion")?;

        Ok(CommitOutcome::Committed(EvidencePack {
            id: pack.id.clone(),
            session_id: session_id.to_string(),
            summary: pack.summary.clone(),
            generated_at: now,
            share_id: pack.share_id.clone(),
        }))
    }

    pub fn get_evidence_pack_for_session(&self, session_id: &str) -> Result<Option<EvidencePack>> {
        self.query_evidence_pack("session_id", session_id)
    }

    pub fn get_evidence_pack_by_share_id(&self, share_id: &str) -> Result<Option<EvidencePack>> {
        self.query_evidence_pack("share_id", share_id)
    }

    fn query_evidence_pack(&self, column: &str, value: &str) -> Result<Option<EvidencePack>> {
        let sql = format!(
            "SELECT id, session_id, summary, generated_at, share_id FROM evidence_packs WHERE {} = ?1",
            column
        );
        let row = self
            .conn
            .query_row(&sql, params![value], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()
            .context("Failed to query evidence pack")?;
        match row {
            Some((id, session_id, summary, generated_at, share_id)) => Ok(Some(EvidencePack {
                id,
                session_id,
                summary: serde_json::from_str(&summary)
                    .context("invalid evidence summary in database")?,
                generated_at,
                share_id,
            })),
            None => Ok(None),
        }
    }

    pub fn count_evidence_packs(&self, session_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM evidence_packs WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("Failed to count evidence packs")
    }
}
