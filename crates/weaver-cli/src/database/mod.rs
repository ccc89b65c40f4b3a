//! Sqlite-backed session repository.
//!
//! Holds the durable workflow records the control-plane registry persists
//! across restarts. Migrations are ordered and applied transactionally,
//! tracked by name in a bookkeeping table.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::headless::client::ProviderKind;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Durable record of one workflow, keyed by project identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub key: String,
    pub name: String,
    pub workdir: String,
    pub provider: ProviderKind,
    /// Last provider session observed for this workflow, if any.
    pub session_ref: Option<String>,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(key: &str, name: &str, workdir: &str, provider: ProviderKind) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            name: name.to_string(),
            workdir: workdir.to_string(),
            provider,
            session_ref: None,
            paused: false,
            created_at: now,
            updated_at: now,
        }
    }
}

struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_migration_table",
        sql: "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL
              );",
    },
    Migration {
        name: "001_workflows_table",
        sql: "CREATE TABLE workflows (
                key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                workdir TEXT NOT NULL,
                provider TEXT NOT NULL,
                session_ref TEXT,
                paused INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
              );",
    },
];

pub struct SessionDb {
    conn: Mutex<Connection>,
}

impl SessionDb {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let mut conn = Connection::open(path)?;
        migrate(&mut conn)?;
        info!(path = %path.display(), "session repository opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_workflow(&self, record: &WorkflowRecord) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workflows (key, name, workdir, provider, session_ref, paused, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                workdir = excluded.workdir,
                provider = excluded.provider,
                session_ref = excluded.session_ref,
                paused = excluded.paused,
                updated_at = excluded.updated_at",
            params![
                record.key,
                record.name,
                record.workdir,
                record.provider.to_string(),
                record.session_ref,
                record.paused,
                record.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_workflow(&self, key: &str) -> Result<Option<WorkflowRecord>, DatabaseError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT key, name, workdir, provider, session_ref, paused, created_at, updated_at
             FROM workflows WHERE key = ?1",
        )?;
        let mut rows = statement.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, DatabaseError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT key, name, workdir, provider, session_ref, paused, created_at, updated_at
             FROM workflows ORDER BY created_at",
        )?;
        let mut rows = statement.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    pub fn remove_workflow(&self, key: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM workflows WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    pub fn set_session_ref(&self, key: &str, session_ref: Option<&str>) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflows SET session_ref = ?2, updated_at = ?3 WHERE key = ?1",
            params![key, session_ref, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_paused(&self, key: &str, paused: bool) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workflows SET paused = ?2, updated_at = ?3 WHERE key = ?1",
            params![key, paused, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn migrate(conn: &mut Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(MIGRATIONS[0].sql)?;
    for migration in &MIGRATIONS[1..] {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?1)",
            params![migration.name],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO migrations (name, applied_at) VALUES (?1, ?2)",
            params![migration.name, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        info!(migration = migration.name, "applied migration");
    }
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<WorkflowRecord, DatabaseError> {
    let provider_raw: String = row.get(3)?;
    let provider = provider_raw
        .parse::<ProviderKind>()
        .map_err(|_| DatabaseError::Corrupt(format!("unknown provider: {provider_raw}")))?;
    Ok(WorkflowRecord {
        key: row.get(0)?,
        name: row.get(1)?,
        workdir: row.get(2)?,
        provider,
        session_ref: row.get(4)?,
        paused: row.get(5)?,
        created_at: parse_timestamp(row.get::<_, String>(6)?)?,
        updated_at: parse_timestamp(row.get::<_, String>(7)?)?,
    })
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| DatabaseError::Corrupt(format!("bad timestamp {raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_get_round_trip() {
        let db = SessionDb::open_in_memory().unwrap();
        let record = WorkflowRecord::new("proj-1", "api server", "/work/api", ProviderKind::Claude);
        db.upsert_workflow(&record).unwrap();

        let loaded = db.get_workflow("proj-1").unwrap().unwrap();
        assert_eq!(loaded.name, "api server");
        assert_eq!(loaded.provider, ProviderKind::Claude);
        assert!(!loaded.paused);
        assert!(db.get_workflow("proj-2").unwrap().is_none());
    }

    #[test]
    fn test_upsert_updates_existing() {
        let db = SessionDb::open_in_memory().unwrap();
        let mut record = WorkflowRecord::new("proj-1", "api", "/work", ProviderKind::Codex);
        db.upsert_workflow(&record).unwrap();
        record.name = "api v2".to_string();
        db.upsert_workflow(&record).unwrap();

        let all = db.list_workflows().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "api v2");
    }

    #[test]
    fn test_session_ref_and_paused_updates() {
        let db = SessionDb::open_in_memory().unwrap();
        let record = WorkflowRecord::new("proj-1", "api", "/work", ProviderKind::Amp);
        db.upsert_workflow(&record).unwrap();

        db.set_session_ref("proj-1", Some("T-99")).unwrap();
        db.set_paused("proj-1", true).unwrap();

        let loaded = db.get_workflow("proj-1").unwrap().unwrap();
        assert_eq!(loaded.session_ref.as_deref(), Some("T-99"));
        assert!(loaded.paused);
    }

    #[test]
    fn test_remove_workflow() {
        let db = SessionDb::open_in_memory().unwrap();
        db.upsert_workflow(&WorkflowRecord::new("p", "n", "/w", ProviderKind::Gemini))
            .unwrap();
        assert!(db.remove_workflow("p").unwrap());
        assert!(!db.remove_workflow("p").unwrap());
    }

    #[test]
    fn test_migrations_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weaver.db");
        {
            let db = SessionDb::open(&path).unwrap();
            db.upsert_workflow(&WorkflowRecord::new("p", "n", "/w", ProviderKind::Opencode))
                .unwrap();
        }
        let db = SessionDb::open(&path).unwrap();
        assert_eq!(db.list_workflows().unwrap().len(), 1);
    }
}
