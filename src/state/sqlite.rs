//! SQLite State Manager
//!
//! Embedded store for member state and open durability events. Writes go
//! through with `synchronous = FULL`, so a change is on disk before the call
//! returns.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{MemberRecord, StateManager};
use crate::durability::{
    DurabilityEvent, InvocationEvent, InvokerEvent, InvokerOutcome, Phase, TransactionId,
};
use crate::error::{Error, ErrorKind, Result};
use crate::member::Member;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS member_state (
    member_id TEXT PRIMARY KEY,
    active INTEGER NOT NULL,
    reason TEXT,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS invocation_event (
    tx_id BLOB NOT NULL,
    phase INTEGER NOT NULL,
    classification TEXT NOT NULL,
    opened_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (tx_id, phase)
);

CREATE TABLE IF NOT EXISTS invoker_event (
    tx_id BLOB NOT NULL,
    phase INTEGER NOT NULL,
    member_id TEXT NOT NULL,
    outcome TEXT,
    error_kind TEXT,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (tx_id, phase, member_id)
);
"#;

/// State manager backed by SQLite
pub struct SqliteStateManager {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStateManager {
    /// Create or open `<data_dir>/<cluster_id>.db`
    pub fn new(data_dir: PathBuf, cluster_id: &str) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join(format!("{}.db", cluster_id));
        let conn = Connection::open(&db_path)?;
        tracing::info!("Opened cluster state at {}", db_path.display());

        Self::init(conn, Some(db_path))
    }

    /// Non-persistent store, for tests and throwaway clusters
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Location of the database file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Every persisted member record
    pub async fn member_records(&self) -> Result<Vec<MemberRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT member_id, active, reason, updated_at FROM member_state ORDER BY member_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MemberRecord {
                member_id: row.get(0)?,
                active: row.get::<_, i64>(1)? != 0,
                reason: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }
}

fn outcome_columns(outcome: Option<InvokerOutcome>) -> (Option<&'static str>, Option<String>) {
    match outcome {
        None => (None, None),
        Some(InvokerOutcome::Success) => (Some("success"), None),
        Some(InvokerOutcome::Failure(kind)) => (Some("failure"), Some(kind.to_string())),
    }
}

fn outcome_from_columns(outcome: Option<String>, kind: Option<String>) -> Result<Option<InvokerOutcome>> {
    match outcome.as_deref() {
        None => Ok(None),
        Some("success") => Ok(Some(InvokerOutcome::Success)),
        Some("failure") => {
            let kind = match kind {
                Some(k) => k.parse::<ErrorKind>()?,
                None => ErrorKind::MemberFailure,
            };
            Ok(Some(InvokerOutcome::Failure(kind)))
        }
        Some(other) => Err(Error::StateCorrupted(format!("unknown invoker outcome '{}'", other))),
    }
}

#[async_trait]
impl StateManager for SqliteStateManager {
    async fn read_active_members(&self) -> Result<Option<BTreeSet<String>>> {
        let conn = self.conn.lock().await;
        let recorded: i64 = conn.query_row("SELECT COUNT(*) FROM member_state", [], |row| row.get(0))?;
        if recorded == 0 {
            return Ok(None);
        }

        let mut stmt = conn.prepare("SELECT member_id FROM member_state WHERE active = 1")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut active = BTreeSet::new();
        for id in rows {
            active.insert(id?);
        }
        Ok(Some(active))
    }

    async fn activate(&self, member: &Member) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO member_state (member_id, active, reason) VALUES (?1, 1, NULL)
            ON CONFLICT(member_id) DO UPDATE SET
                active = 1, reason = NULL, updated_at = CURRENT_TIMESTAMP
            "#,
            params![member.id],
        )?;
        Ok(())
    }

    async fn deactivate(&self, member: &Member, reason: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO member_state (member_id, active, reason) VALUES (?1, 0, ?2)
            ON CONFLICT(member_id) DO UPDATE SET
                active = 0, reason = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![member.id, reason],
        )?;
        Ok(())
    }

    /// Members never recorded are reported inactive
    async fn is_active(&self, member: &Member) -> Result<bool> {
        let conn = self.conn.lock().await;
        let active: Option<i64> = conn
            .query_row(
                "SELECT active FROM member_state WHERE member_id = ?1",
                params![member.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active.unwrap_or(0) != 0)
    }

    async fn member_record(&self, member_id: &str) -> Result<Option<MemberRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT member_id, active, reason, updated_at FROM member_state WHERE member_id = ?1",
                params![member_id],
                |row| {
                    Ok(MemberRecord {
                        member_id: row.get(0)?,
                        active: row.get::<_, i64>(1)? != 0,
                        reason: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO invocation_event (tx_id, phase, classification) VALUES (?1, ?2, ?3)",
            params![
                event.event.transaction_id.to_bytes().to_vec(),
                event.event.phase.id(),
                event.classification
            ],
        )?;
        Ok(())
    }

    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx_id = event.event.transaction_id.to_bytes().to_vec();
        let phase = event.event.phase.id();

        let txn = conn.transaction()?;
        txn.execute(
            "DELETE FROM invoker_event WHERE tx_id = ?1 AND phase = ?2",
            params![tx_id, phase],
        )?;
        txn.execute(
            "DELETE FROM invocation_event WHERE tx_id = ?1 AND phase = ?2",
            params![tx_id, phase],
        )?;
        txn.commit()?;
        Ok(())
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO invoker_event (tx_id, phase, member_id, outcome, error_kind)
            VALUES (?1, ?2, ?3, NULL, NULL)
            "#,
            params![
                event.event.transaction_id.to_bytes().to_vec(),
                event.event.phase.id(),
                event.member_id
            ],
        )?;
        Ok(())
    }

    async fn after_invoker(&self, event: &InvokerEvent) -> Result<()> {
        let (outcome, kind) = outcome_columns(event.outcome);
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO invoker_event (tx_id, phase, member_id, outcome, error_kind)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tx_id, phase, member_id) DO UPDATE SET
                outcome = ?4, error_kind = ?5, updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                event.event.transaction_id.to_bytes().to_vec(),
                event.event.phase.id(),
                event.member_id,
                outcome,
                kind
            ],
        )?;
        Ok(())
    }

    async fn unresolved_invocations(&self) -> Result<Vec<InvocationEvent>> {
        let raw: Vec<(Vec<u8>, u8, String)> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT tx_id, phase, classification FROM invocation_event ORDER BY opened_at, rowid",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            let mut raw = Vec::new();
            for row in rows {
                raw.push(row?);
            }
            raw
        };

        raw.into_iter()
            .map(|(tx_id, phase, classification)| -> Result<InvocationEvent> {
                Ok(InvocationEvent {
                    event: DurabilityEvent::new(TransactionId::from_bytes(&tx_id)?, Phase::from_id(phase)?),
                    classification,
                })
            })
            .collect()
    }

    async fn invoker_events(&self, event: &DurabilityEvent) -> Result<Vec<InvokerEvent>> {
        let raw: Vec<(String, Option<String>, Option<String>)> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT member_id, outcome, error_kind FROM invoker_event WHERE tx_id = ?1 AND phase = ?2",
            )?;
            let rows = stmt.query_map(
                params![event.transaction_id.to_bytes().to_vec(), event.phase.id()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let mut raw = Vec::new();
            for row in rows {
                raw.push(row?);
            }
            raw
        };

        raw.into_iter()
            .map(|(member_id, outcome, kind)| -> Result<InvokerEvent> {
                Ok(InvokerEvent {
                    event: *event,
                    member_id,
                    outcome: outcome_from_columns(outcome, kind)?,
                })
            })
            .collect()
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}
