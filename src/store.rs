//! Repository interface for connection and schedule records
//!
//! The core depends only on [`Repository`]. [`MemoryRepository`] backs tests
//! and single-process deployments without a database file; the SQLite
//! implementation lives in [`crate::db`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{ConnectionRecord, ConnectionStatus, ScheduleRecord};
use crate::secrets::CredentialCodec;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Conflict(String),
    #[error("connection {0} carries a secret that is not encrypted")]
    Unsealed(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn connection_not_found(id: &str) -> Self {
        StoreError::NotFound {
            entity: "connection",
            id: id.to_string(),
        }
    }

    pub fn schedule_not_found(id: &str) -> Self {
        StoreError::NotFound {
            entity: "schedule",
            id: id.to_string(),
        }
    }
}

/// Refuse rows whose secret column would hold anything but a ciphertext envelope
pub(crate) fn ensure_sealed(record: &ConnectionRecord) -> Result<(), StoreError> {
    match &record.encrypted_secret {
        Some(value) if !CredentialCodec::is_encrypted(value) => Err(StoreError::Unsealed(record.id.clone())),
        _ => Ok(()),
    }
}

/// Final state written once per completed probe
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub status: ConnectionStatus,
    pub tested_at: DateTime<Utc>,
    pub summary: String,
}

/// Persistence for the connection core
///
/// `set_testing` stamps `updated_at`, which is what `list_stale_testing`
/// compares against. `list_due_schedules` never returns a schedule whose
/// last run is still marked `Running`.
pub trait Repository: Send + Sync {
    fn insert_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError>;
    fn get_connection(&self, id: &str) -> Result<Option<ConnectionRecord>, StoreError>;
    /// Replace structural fields; test state is left as stored
    fn update_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError>;
    fn list_connections(&self, application_id: &str) -> Result<Vec<ConnectionRecord>, StoreError>;
    fn list_stale_testing(&self, before: DateTime<Utc>) -> Result<Vec<ConnectionRecord>, StoreError>;
    fn set_testing(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    fn set_test_outcome(&self, id: &str, outcome: &TestOutcome) -> Result<(), StoreError>;

    /// Fails with `Conflict` when the application already has a schedule
    fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError>;
    fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>, StoreError>;
    fn get_schedule_for_application(&self, application_id: &str) -> Result<Option<ScheduleRecord>, StoreError>;
    fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError>;
    fn delete_schedule(&self, id: &str) -> Result<bool, StoreError>;
    fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError>;
    fn list_running_schedules(&self) -> Result<Vec<ScheduleRecord>, StoreError>;
}

/// In-process repository
#[derive(Default)]
pub struct MemoryRepository {
    connections: RwLock<HashMap<String, ConnectionRecord>>,
    schedules: RwLock<HashMap<String, ScheduleRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn insert_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        ensure_sealed(record)?;
        let mut connections = self.connections.write();
        if connections.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("connection {} already exists", record.id)));
        }
        connections.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get_connection(&self, id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        Ok(self.connections.read().get(id).cloned())
    }

    fn update_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        ensure_sealed(record)?;
        let mut connections = self.connections.write();
        let existing = connections
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::connection_not_found(&record.id))?;

        let mut updated = record.clone();
        updated.status = existing.status;
        updated.last_tested_at = existing.last_tested_at;
        updated.last_test_result = existing.last_test_result.take();
        updated.created_at = existing.created_at;
        *existing = updated;
        Ok(())
    }

    fn list_connections(&self, application_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        let mut rows: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|c| c.application_id == application_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    fn list_stale_testing(&self, before: DateTime<Utc>) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self
            .connections
            .read()
            .values()
            .filter(|c| c.status == ConnectionStatus::Testing && c.updated_at < before)
            .cloned()
            .collect())
    }

    fn set_testing(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut connections = self.connections.write();
        let record = connections
            .get_mut(id)
            .ok_or_else(|| StoreError::connection_not_found(id))?;
        record.status = ConnectionStatus::Testing;
        record.updated_at = at;
        Ok(())
    }

    fn set_test_outcome(&self, id: &str, outcome: &TestOutcome) -> Result<(), StoreError> {
        let mut connections = self.connections.write();
        let record = connections
            .get_mut(id)
            .ok_or_else(|| StoreError::connection_not_found(id))?;
        record.status = outcome.status;
        record.last_tested_at = Some(outcome.tested_at);
        record.last_test_result = Some(outcome.summary.clone());
        record.updated_at = outcome.tested_at;
        Ok(())
    }

    fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        if schedules
            .values()
            .any(|s| s.application_id == schedule.application_id)
        {
            return Err(StoreError::Conflict(format!(
                "application {} already has a schedule",
                schedule.application_id
            )));
        }
        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>, StoreError> {
        Ok(self.schedules.read().get(id).cloned())
    }

    fn get_schedule_for_application(&self, application_id: &str) -> Result<Option<ScheduleRecord>, StoreError> {
        Ok(self
            .schedules
            .read()
            .values()
            .find(|s| s.application_id == application_id)
            .cloned())
    }

    fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        let existing = schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| StoreError::schedule_not_found(&schedule.id))?;
        *existing = schedule.clone();
        Ok(())
    }

    fn delete_schedule(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.schedules.write().remove(id).is_some())
    }

    fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError> {
        let mut due: Vec<_> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.is_due(now) && !s.is_running())
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_time);
        Ok(due)
    }

    fn list_running_schedules(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        Ok(self
            .schedules
            .read()
            .values()
            .filter(|s| s.is_running())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ConnectionType;
    use crate::model::{ConnectionDraft, RunStatus};
    use chrono::Duration;

    fn connection(id: &str, app: &str) -> ConnectionRecord {
        ConnectionDraft::new(app, ConnectionType::PostgreSql).into_record(id.to_string(), None, Utc::now())
    }

    fn schedule(id: &str, app: &str) -> ScheduleRecord {
        let now = Utc::now();
        ScheduleRecord {
            id: id.to_string(),
            application_id: app.to_string(),
            cron_expression: "*/5 * * * *".to_string(),
            is_enabled: true,
            last_run_time: None,
            next_run_time: Some(now),
            last_run_status: None,
            running_since: None,
            last_run_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_list_connections_is_scoped_to_application() {
        let repo = MemoryRepository::new();
        repo.insert_connection(&connection("c-1", "app-1")).unwrap();
        repo.insert_connection(&connection("c-2", "app-2")).unwrap();
        repo.insert_connection(&connection("c-3", "app-1")).unwrap();

        let ids: Vec<_> = repo
            .list_connections("app-1")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"c-1".to_string()));
        assert!(ids.contains(&"c-3".to_string()));
    }

    #[test]
    fn test_update_preserves_test_state() {
        let repo = MemoryRepository::new();
        let record = connection("c-1", "app-1");
        repo.insert_connection(&record).unwrap();
        repo.set_test_outcome(
            "c-1",
            &TestOutcome {
                status: ConnectionStatus::Connected,
                tested_at: Utc::now(),
                summary: "Connected in 3ms: ok".to_string(),
            },
        )
        .unwrap();

        let mut edited = record.clone();
        edited.server = Some("db2.internal".to_string());
        repo.update_connection(&edited).unwrap();

        let stored = repo.get_connection("c-1").unwrap().unwrap();
        assert_eq!(stored.server.as_deref(), Some("db2.internal"));
        assert_eq!(stored.status, ConnectionStatus::Connected);
        assert!(stored.last_test_result.is_some());
    }

    #[test]
    fn test_plaintext_secret_is_refused() {
        let repo = MemoryRepository::new();
        let mut record = connection("c-1", "app-1");
        record.encrypted_secret = Some("hunter2".to_string());
        let err = repo.insert_connection(&record).unwrap_err();
        assert!(matches!(err, StoreError::Unsealed(ref id) if id == "c-1"));
        assert!(!err.to_string().contains("hunter2"));
        assert!(repo.get_connection("c-1").unwrap().is_none());

        record.encrypted_secret = None;
        repo.insert_connection(&record).unwrap();
        record.encrypted_secret = Some("hunter2".to_string());
        assert!(matches!(repo.update_connection(&record), Err(StoreError::Unsealed(_))));
    }

    #[test]
    fn test_stale_testing_uses_testing_timestamp() {
        let repo = MemoryRepository::new();
        repo.insert_connection(&connection("c-1", "app-1")).unwrap();
        repo.insert_connection(&connection("c-2", "app-1")).unwrap();

        let now = Utc::now();
        repo.set_testing("c-1", now - Duration::minutes(30)).unwrap();
        repo.set_testing("c-2", now).unwrap();

        let stale = repo.list_stale_testing(now - Duration::minutes(10)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "c-1");
    }

    #[test]
    fn test_missing_connection_is_not_found() {
        let repo = MemoryRepository::new();
        let err = repo.set_testing("nope", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "connection", .. }));
    }

    #[test]
    fn test_one_schedule_per_application() {
        let repo = MemoryRepository::new();
        repo.insert_schedule(&schedule("s-1", "app-1")).unwrap();
        let err = repo.insert_schedule(&schedule("s-2", "app-1")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        repo.insert_schedule(&schedule("s-3", "app-2")).unwrap();
    }

    #[test]
    fn test_due_query_skips_running_and_disabled() {
        let repo = MemoryRepository::new();
        let now = Utc::now();

        repo.insert_schedule(&schedule("s-1", "app-1")).unwrap();

        let mut running = schedule("s-2", "app-2");
        running.last_run_status = Some(RunStatus::Running);
        running.running_since = Some(now);
        repo.insert_schedule(&running).unwrap();

        let mut disabled = schedule("s-3", "app-3");
        disabled.is_enabled = false;
        repo.insert_schedule(&disabled).unwrap();

        let mut later = schedule("s-4", "app-4");
        later.next_run_time = Some(now + Duration::hours(1));
        repo.insert_schedule(&later).unwrap();

        let due = repo.list_due_schedules(now + Duration::seconds(1)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "s-1");

        let running = repo.list_running_schedules().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "s-2");
    }

    #[test]
    fn test_delete_schedule() {
        let repo = MemoryRepository::new();
        repo.insert_schedule(&schedule("s-1", "app-1")).unwrap();
        assert!(repo.delete_schedule("s-1").unwrap());
        assert!(!repo.delete_schedule("s-1").unwrap());
        assert!(repo.get_schedule_for_application("app-1").unwrap().is_none());
    }
}
