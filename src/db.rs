//! SQLite repository for connection and schedule records
//!
//! Timestamps are stored as fixed-width RFC 3339 text so range queries can
//! compare them lexically.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::catalog::ConnectionType;
use crate::model::{ConnectionRecord, ConnectionStatus, RunStatus, ScheduleRecord};
use crate::store::{ensure_sealed, Repository, StoreError, TestOutcome};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const CONNECTION_COLUMNS: &str = "id, application_id, connection_type, name, server, port, database_name,
     username, encrypted_secret, connection_string_override, additional_settings, status,
     last_tested_at, last_test_result, is_active, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, application_id, cron_expression, is_enabled, last_run_time,
     next_run_time, last_run_status, running_since, last_run_summary, created_at, updated_at";

/// Repository backed by a single SQLite connection
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the API read while the scheduler writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }

            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }

        Ok(())
    }
}

/// Migration v1: connections and schedules
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            application_id TEXT NOT NULL,
            connection_type TEXT NOT NULL,
            name TEXT NOT NULL,
            server TEXT,
            port INTEGER,
            database_name TEXT,
            username TEXT,
            encrypted_secret TEXT,
            connection_string_override TEXT,
            additional_settings TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'Untested',
            last_tested_at TEXT,
            last_test_result TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_connections_application ON connections(application_id);

        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            application_id TEXT NOT NULL UNIQUE,
            cron_expression TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            last_run_time TEXT,
            next_run_time TEXT,
            last_run_status TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Migration v2: run bookkeeping for stale-lock recovery
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Applying migration v2: schedule run tracking");

    conn.execute_batch(
        r#"
        ALTER TABLE schedules ADD COLUMN running_since TEXT;
        ALTER TABLE schedules ADD COLUMN last_run_summary TEXT;

        CREATE INDEX IF NOT EXISTS idx_connections_status ON connections(status, updated_at);
        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(is_enabled, next_run_time);

        INSERT INTO schema_migrations (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn invalid_value(idx: usize, value: &str) -> rusqlite::Error {
    conversion_error(
        idx,
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unexpected value {:?}", value)),
    )
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<ConnectionRecord> {
    let connection_type: String = row.get(2)?;
    let connection_type: ConnectionType = connection_type
        .parse()
        .map_err(|e| conversion_error(2, e))?;

    let settings: String = row.get(10)?;
    let additional_settings: BTreeMap<String, String> =
        serde_json::from_str(&settings).map_err(|e| conversion_error(10, e))?;

    let status: String = row.get(11)?;
    let status = status
        .parse::<ConnectionStatus>()
        .map_err(|_| invalid_value(11, &status))?;

    Ok(ConnectionRecord {
        id: row.get(0)?,
        application_id: row.get(1)?,
        connection_type,
        name: row.get(3)?,
        server: row.get(4)?,
        port: row.get(5)?,
        database: row.get(6)?,
        username: row.get(7)?,
        encrypted_secret: row.get(8)?,
        connection_string_override: row.get(9)?,
        additional_settings,
        status,
        last_tested_at: get_opt_ts(row, 12)?,
        last_test_result: row.get(13)?,
        is_active: row.get(14)?,
        created_at: get_ts(row, 15)?,
        updated_at: get_ts(row, 16)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    let last_run_status: Option<String> = row.get(6)?;
    let last_run_status = match last_run_status {
        Some(s) => Some(s.parse::<RunStatus>().map_err(|_| invalid_value(6, &s))?),
        None => None,
    };

    Ok(ScheduleRecord {
        id: row.get(0)?,
        application_id: row.get(1)?,
        cron_expression: row.get(2)?,
        is_enabled: row.get(3)?,
        last_run_time: get_opt_ts(row, 4)?,
        next_run_time: get_opt_ts(row, 5)?,
        last_run_status,
        running_since: get_opt_ts(row, 7)?,
        last_run_summary: row.get(8)?,
        created_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Repository for SqliteRepository {
    fn insert_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        ensure_sealed(record)?;
        let settings = serde_json::to_string(&record.additional_settings)
            .context("Failed to encode connection settings")?;
        let conn = self.lock();
        let inserted = conn.execute(
            &format!(
                "INSERT INTO connections ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                CONNECTION_COLUMNS
            ),
            params![
                record.id,
                record.application_id,
                record.connection_type.as_str(),
                record.name,
                record.server,
                record.port,
                record.database,
                record.username,
                record.encrypted_secret,
                record.connection_string_override,
                settings,
                record.status.as_str(),
                opt_ts(record.last_tested_at),
                record.last_test_result,
                record.is_active,
                ts(record.created_at),
                ts(record.updated_at),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                "connection {} already exists",
                record.id
            ))),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert connection").into()),
        }
    }

    fn get_connection(&self, id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM connections WHERE id = ?1", CONNECTION_COLUMNS),
                params![id],
                connection_from_row,
            )
            .optional()
            .context("Failed to get connection")?;
        Ok(record)
    }

    fn update_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        ensure_sealed(record)?;
        let settings = serde_json::to_string(&record.additional_settings)
            .context("Failed to encode connection settings")?;
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE connections SET name = ?2, server = ?3, port = ?4, database_name = ?5,
                    username = ?6, encrypted_secret = ?7, connection_string_override = ?8,
                    additional_settings = ?9, is_active = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    record.id,
                    record.name,
                    record.server,
                    record.port,
                    record.database,
                    record.username,
                    record.encrypted_secret,
                    record.connection_string_override,
                    settings,
                    record.is_active,
                    ts(record.updated_at),
                ],
            )
            .context("Failed to update connection")?;

        if updated == 0 {
            return Err(StoreError::connection_not_found(&record.id));
        }
        Ok(())
    }

    fn list_connections(&self, application_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM connections WHERE application_id = ?1 ORDER BY created_at, id",
                CONNECTION_COLUMNS
            ))
            .context("Failed to prepare connection query")?;
        let rows = stmt
            .query_map(params![application_id], connection_from_row)
            .context("Failed to list connections")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read connection row")?;
        Ok(rows)
    }

    fn list_stale_testing(&self, before: DateTime<Utc>) -> Result<Vec<ConnectionRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM connections WHERE status = 'Testing' AND updated_at < ?1",
                CONNECTION_COLUMNS
            ))
            .context("Failed to prepare stale query")?;
        let rows = stmt
            .query_map(params![ts(before)], connection_from_row)
            .context("Failed to list stale connections")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read connection row")?;
        Ok(rows)
    }

    fn set_testing(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE connections SET status = 'Testing', updated_at = ?2 WHERE id = ?1",
                params![id, ts(at)],
            )
            .context("Failed to mark connection as testing")?;
        if updated == 0 {
            return Err(StoreError::connection_not_found(id));
        }
        Ok(())
    }

    fn set_test_outcome(&self, id: &str, outcome: &TestOutcome) -> Result<(), StoreError> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE connections
                 SET status = ?2, last_tested_at = ?3, last_test_result = ?4, updated_at = ?3
                 WHERE id = ?1",
                params![id, outcome.status.as_str(), ts(outcome.tested_at), outcome.summary],
            )
            .context("Failed to record test outcome")?;
        if updated == 0 {
            return Err(StoreError::connection_not_found(id));
        }
        Ok(())
    }

    fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        let inserted = conn.execute(
            &format!(
                "INSERT INTO schedules ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                SCHEDULE_COLUMNS
            ),
            params![
                schedule.id,
                schedule.application_id,
                schedule.cron_expression,
                schedule.is_enabled,
                opt_ts(schedule.last_run_time),
                opt_ts(schedule.next_run_time),
                schedule.last_run_status.map(|s| s.as_str()),
                opt_ts(schedule.running_since),
                schedule.last_run_summary,
                ts(schedule.created_at),
                ts(schedule.updated_at),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                "application {} already has a schedule",
                schedule.application_id
            ))),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert schedule").into()),
        }
    }

    fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>, StoreError> {
        let conn = self.lock();
        let schedule = conn
            .query_row(
                &format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS),
                params![id],
                schedule_from_row,
            )
            .optional()
            .context("Failed to get schedule")?;
        Ok(schedule)
    }

    fn get_schedule_for_application(&self, application_id: &str) -> Result<Option<ScheduleRecord>, StoreError> {
        let conn = self.lock();
        let schedule = conn
            .query_row(
                &format!("SELECT {} FROM schedules WHERE application_id = ?1", SCHEDULE_COLUMNS),
                params![application_id],
                schedule_from_row,
            )
            .optional()
            .context("Failed to get schedule")?;
        Ok(schedule)
    }

    fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE schedules SET cron_expression = ?2, is_enabled = ?3, last_run_time = ?4,
                    next_run_time = ?5, last_run_status = ?6, running_since = ?7,
                    last_run_summary = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    schedule.id,
                    schedule.cron_expression,
                    schedule.is_enabled,
                    opt_ts(schedule.last_run_time),
                    opt_ts(schedule.next_run_time),
                    schedule.last_run_status.map(|s| s.as_str()),
                    opt_ts(schedule.running_since),
                    schedule.last_run_summary,
                    ts(schedule.updated_at),
                ],
            )
            .context("Failed to update schedule")?;
        if updated == 0 {
            return Err(StoreError::schedule_not_found(&schedule.id));
        }
        Ok(())
    }

    fn delete_schedule(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let deleted = conn
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])
            .context("Failed to delete schedule")?;
        Ok(deleted > 0)
    }

    fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM schedules
                 WHERE is_enabled = 1
                   AND next_run_time IS NOT NULL
                   AND next_run_time <= ?1
                   AND (last_run_status IS NULL OR last_run_status != 'Running')
                 ORDER BY next_run_time",
                SCHEDULE_COLUMNS
            ))
            .context("Failed to prepare due query")?;
        let rows = stmt
            .query_map(params![ts(now)], schedule_from_row)
            .context("Failed to list due schedules")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read schedule row")?;
        Ok(rows)
    }

    fn list_running_schedules(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM schedules WHERE last_run_status = 'Running'",
                SCHEDULE_COLUMNS
            ))
            .context("Failed to prepare running query")?;
        let rows = stmt
            .query_map([], schedule_from_row)
            .context("Failed to list running schedules")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read schedule row")?;
        Ok(rows)
    }
}
