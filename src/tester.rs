//! Connection testing: decrypt, build, probe, record
//!
//! A stored connection is tested in one pass:
//! classify, decrypt the secret, build the target, check eligibility, mark
//! `Testing`, probe, then write the final status exactly once and publish a
//! [`ProbeEvent`].
//!
//! Build and credential errors abort a manual test without touching the
//! stored status. In a scheduled run the same errors are recorded as
//! `Failed` against that connection so the run can move on. Custom
//! connection strings are never probed and never change status.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::builder::{self, BuildError, ConnectionTarget};
use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::events::{Event, EventBus, ProbeEvent, Trigger};
use crate::model::{ConnectionDraft, ConnectionRecord, ConnectionStatus};
use crate::probe::{ProbeResult, Prober};
use crate::secrets::{CredentialCodec, CredentialError, Secret};
use crate::store::{Repository, StoreError, TestOutcome};

/// Result summary written to connections whose probe never finished
const INTERRUPTED_SUMMARY: &str = "test interrupted before completion";

#[derive(Debug, Error)]
pub enum TestError {
    #[error("connection {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TestError {
    /// Taxonomy code, for errors that have one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TestError::Build(e) => Some(e.code()),
            TestError::Credential(_) => Some(ErrorCode::CredentialError),
            TestError::Unsupported(_) => Some(ErrorCode::UnsupportedOperation),
            TestError::NotFound(_) | TestError::Store(_) => None,
        }
    }
}

/// Who is asking, which decides how local failures are handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMode {
    Manual,
    Scheduled { schedule_id: String, trigger: Trigger },
}

impl TestMode {
    fn trigger(&self) -> Trigger {
        match self {
            TestMode::Manual => Trigger::Manual,
            TestMode::Scheduled { trigger, .. } => *trigger,
        }
    }

    fn schedule_id(&self) -> Option<String> {
        match self {
            TestMode::Manual => None,
            TestMode::Scheduled { schedule_id, .. } => Some(schedule_id.clone()),
        }
    }
}

pub struct ConnectionTester {
    repo: Arc<dyn Repository>,
    codec: Arc<CredentialCodec>,
    prober: Prober,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl ConnectionTester {
    pub fn new(
        repo: Arc<dyn Repository>,
        codec: Arc<CredentialCodec>,
        prober: Prober,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            codec,
            prober,
            events,
            clock,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn codec(&self) -> &CredentialCodec {
        &self.codec
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Decrypt a record's stored secret, if it has one
    pub fn open_secret(&self, record: &ConnectionRecord) -> Result<Option<Secret>, CredentialError> {
        record
            .encrypted_secret
            .as_deref()
            .map(|blob| self.codec.open(blob))
            .transpose()
    }

    /// Build the probe target for a stored record
    pub fn target_for(&self, record: &ConnectionRecord) -> Result<ConnectionTarget, TestError> {
        let secret = self.open_secret(record)?;
        Ok(builder::build(&record.to_draft(), secret.as_ref())?)
    }

    /// Test a stored connection and record the outcome
    pub async fn test_record(&self, id: &str, mode: TestMode) -> Result<ProbeResult, TestError> {
        self.test_record_within(id, mode, self.prober.timeout()).await
    }

    /// [`test_record`](Self::test_record) bounded by a caller-chosen timeout
    pub async fn test_record_within(
        &self,
        id: &str,
        mode: TestMode,
        timeout: Duration,
    ) -> Result<ProbeResult, TestError> {
        let record = self
            .repo
            .get_connection(id)?
            .ok_or_else(|| TestError::NotFound(id.to_string()))?;

        let target = match self.target_for(&record) {
            Ok(target) => target,
            Err(e) => return self.local_failure(&record, &mode, e),
        };

        if !target.is_probe_eligible() {
            debug!(connection_id = %record.id, "Skipping probe for custom connection");
            return Err(TestError::Unsupported(format!(
                "{} uses a custom connection string and is not tested automatically",
                record.name
            )));
        }

        self.repo.set_testing(&record.id, self.clock.now())?;

        let result = self.prober.probe_with_timeout(&target, timeout).await;
        self.record_outcome(&record, &mode, &result)?;

        info!(
            connection_id = %record.id,
            application_id = %record.application_id,
            connection_type = %record.connection_type,
            success = result.success,
            latency_ms = result.latency_ms,
            error_code = result.error_code.map(|c| c.as_str()).unwrap_or("none"),
            "Connection tested"
        );

        Ok(result)
    }

    /// Test an unsaved connection; nothing is persisted
    pub async fn test_ad_hoc(
        &self,
        draft: &ConnectionDraft,
        secret: Option<&Secret>,
        timeout: Option<Duration>,
    ) -> Result<ProbeResult, TestError> {
        let target = builder::build(draft, secret)?;

        if !target.is_probe_eligible() {
            return Err(TestError::Unsupported(
                "custom connection strings are not tested automatically".to_string(),
            ));
        }

        let timeout = timeout.unwrap_or_else(|| self.prober.timeout());
        let result = self.prober.probe_with_timeout(&target, timeout).await;

        self.events.publish(Event::ProbeCompleted(ProbeEvent {
            connection_id: None,
            application_id: draft.application_id.clone(),
            connection_type: draft.connection_type,
            schedule_id: None,
            trigger: Trigger::Manual,
            result: result.clone(),
            at: self.clock.now(),
        }));

        Ok(result)
    }

    /// Active connections owned by an application
    ///
    /// The store query is already scoped; rows owned by another application
    /// are dropped here as well and logged.
    pub fn active_connections(&self, application_id: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        let rows = self.repo.list_connections(application_id)?;
        Ok(rows
            .into_iter()
            .filter(|c| {
                if c.application_id != application_id {
                    warn!(
                        connection_id = %c.id,
                        expected = application_id,
                        actual = %c.application_id,
                        "Store returned a connection owned by another application"
                    );
                    return false;
                }
                c.is_active
            })
            .collect())
    }

    /// Reset `Testing` connections whose probe started before `now - threshold`
    pub fn recover_stale_tests(&self, threshold: chrono::Duration) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let stale = self.repo.list_stale_testing(now - threshold)?;

        for record in &stale {
            warn!(connection_id = %record.id, "Resetting stale Testing status");
            self.repo.set_test_outcome(
                &record.id,
                &TestOutcome {
                    status: ConnectionStatus::Failed,
                    tested_at: now,
                    summary: INTERRUPTED_SUMMARY.to_string(),
                },
            )?;
        }

        Ok(stale.len())
    }

    /// Build or credential failure before any probe ran
    fn local_failure(
        &self,
        record: &ConnectionRecord,
        mode: &TestMode,
        err: TestError,
    ) -> Result<ProbeResult, TestError> {
        let (TestMode::Scheduled { .. }, Some(code)) = (mode, err.code()) else {
            return Err(err);
        };

        warn!(
            connection_id = %record.id,
            code = %code,
            error = %err,
            "Connection could not be prepared for probing"
        );

        let result = ProbeResult::failed(code, Duration::ZERO, err.to_string());
        self.record_outcome(record, mode, &result)?;
        Ok(result)
    }

    fn record_outcome(
        &self,
        record: &ConnectionRecord,
        mode: &TestMode,
        result: &ProbeResult,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let status = if result.success {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Failed
        };

        self.repo.set_test_outcome(
            &record.id,
            &TestOutcome {
                status,
                tested_at: now,
                summary: result.summary(),
            },
        )?;

        self.events.publish(Event::ProbeCompleted(ProbeEvent {
            connection_id: Some(record.id.clone()),
            application_id: record.application_id.clone(),
            connection_type: record.connection_type,
            schedule_id: mode.schedule_id(),
            trigger: mode.trigger(),
            result: result.clone(),
            at: now,
        }));

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::{Category, ConnectionType};
    use crate::clock::{ManualClock, SystemClock};
    use crate::probe::{ProbeError, ProbeStrategy};
    use crate::store::MemoryRepository;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Relational strategy with a canned answer
    pub(crate) struct FixedProbe(pub Result<&'static str, ErrorCode>);

    #[async_trait]
    impl ProbeStrategy for FixedProbe {
        fn category(&self) -> Category {
            Category::Relational
        }

        async fn probe(&self, _: &ConnectionTarget, _: Duration) -> Result<String, ProbeError> {
            match self.0 {
                Ok(message) => Ok(message.to_string()),
                Err(code) => Err(ProbeError::new(code, "canned failure")),
            }
        }
    }

    /// Reports the timeout it was handed
    pub(crate) struct EchoTimeout;

    #[async_trait]
    impl ProbeStrategy for EchoTimeout {
        fn category(&self) -> Category {
            Category::Relational
        }

        async fn probe(&self, _: &ConnectionTarget, timeout: Duration) -> Result<String, ProbeError> {
            Ok(format!("budget {}ms", timeout.as_millis()))
        }
    }

    fn tester(repo: Arc<MemoryRepository>, probe: FixedProbe) -> ConnectionTester {
        ConnectionTester::new(
            repo,
            Arc::new(CredentialCodec::new()),
            Prober::empty(Duration::from_secs(2)).with_strategy(Arc::new(probe)),
            EventBus::default(),
            Arc::new(SystemClock),
        )
    }

    fn postgres(tester: &ConnectionTester, id: &str, app: &str) -> ConnectionRecord {
        let mut draft = ConnectionDraft::new(app, ConnectionType::PostgreSql);
        draft.server = Some("db.internal".to_string());
        draft.database = Some("app".to_string());
        draft.username = Some("svc".to_string());
        let secret = tester
            .codec()
            .seal(&Secret::Password("pw".to_string()))
            .unwrap();
        draft.into_record(id.to_string(), Some(secret), Utc::now())
    }

    #[tokio::test]
    async fn test_success_writes_connected_and_publishes() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = tester(repo.clone(), FixedProbe(Ok("SELECT 1 succeeded")));
        repo.insert_connection(&postgres(&tester, "c-1", "app-1")).unwrap();
        let mut events = tester.events().subscribe();

        let result = tester.test_record("c-1", TestMode::Manual).await.unwrap();
        assert!(result.success);

        let stored = repo.get_connection("c-1").unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Connected);
        assert!(stored.last_test_result.unwrap().starts_with("Connected in"));
        assert!(stored.last_tested_at.is_some());

        match events.recv().await.unwrap() {
            Event::ProbeCompleted(e) => {
                assert_eq!(e.connection_id.as_deref(), Some("c-1"));
                assert_eq!(e.trigger, Trigger::Manual);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stored_connection_honours_caller_timeout() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = ConnectionTester::new(
            repo.clone(),
            Arc::new(CredentialCodec::new()),
            Prober::empty(Duration::from_secs(2)).with_strategy(Arc::new(EchoTimeout)),
            EventBus::default(),
            Arc::new(SystemClock),
        );
        repo.insert_connection(&postgres(&tester, "c-1", "app-1")).unwrap();

        let result = tester.test_record("c-1", TestMode::Manual).await.unwrap();
        assert_eq!(result.message, "budget 2000ms");

        let result = tester
            .test_record_within("c-1", TestMode::Manual, Duration::from_millis(750))
            .await
            .unwrap();
        assert_eq!(result.message, "budget 750ms");
    }

    #[tokio::test]
    async fn test_failure_writes_failed() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = tester(repo.clone(), FixedProbe(Err(ErrorCode::AuthRejected)));
        repo.insert_connection(&postgres(&tester, "c-1", "app-1")).unwrap();

        let result = tester.test_record("c-1", TestMode::Manual).await.unwrap();
        assert_eq!(result.error_code, Some(ErrorCode::AuthRejected));

        let stored = repo.get_connection("c-1").unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Failed);
        assert!(stored.last_test_result.unwrap().starts_with("AuthRejected"));
    }

    #[tokio::test]
    async fn test_custom_connection_is_unsupported_and_untouched() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = tester(repo.clone(), FixedProbe(Ok("unused")));

        let mut draft = ConnectionDraft::new("app-1", ConnectionType::Custom);
        draft.connection_string_override = Some("Driver={X};Server=legacy;".to_string());
        repo.insert_connection(&draft.into_record("c-1".to_string(), None, Utc::now()))
            .unwrap();

        let err = tester.test_record("c-1", TestMode::Manual).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnsupportedOperation));

        let stored = repo.get_connection("c-1").unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Untested);
        assert!(stored.last_tested_at.is_none());
    }

    #[tokio::test]
    async fn test_manual_credential_error_leaves_status() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = tester(repo.clone(), FixedProbe(Ok("unused")));

        // Sealed under a different key
        let other = CredentialCodec::new();
        let mut record = postgres(&tester, "c-1", "app-1");
        record.encrypted_secret = Some(other.seal(&Secret::Password("pw".to_string())).unwrap());
        repo.insert_connection(&record).unwrap();

        let err = tester.test_record("c-1", TestMode::Manual).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::CredentialError));
        assert_eq!(
            repo.get_connection("c-1").unwrap().unwrap().status,
            ConnectionStatus::Untested
        );
    }

    #[tokio::test]
    async fn test_scheduled_build_error_is_recorded() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = tester(repo.clone(), FixedProbe(Ok("unused")));

        let mut record = postgres(&tester, "c-1", "app-1");
        record.server = None;
        repo.insert_connection(&record).unwrap();

        let mode = TestMode::Scheduled {
            schedule_id: "s-1".to_string(),
            trigger: Trigger::Scheduled,
        };
        let result = tester.test_record("c-1", mode).await.unwrap();
        assert_eq!(result.error_code, Some(ErrorCode::MissingField));

        let stored = repo.get_connection("c-1").unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Failed);
        assert!(stored.last_test_result.unwrap().contains("server"));
    }

    #[tokio::test]
    async fn test_ad_hoc_does_not_persist() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = tester(repo.clone(), FixedProbe(Ok("ok")));

        let mut draft = ConnectionDraft::new("app-1", ConnectionType::MySql);
        draft.server = Some("db".to_string());
        draft.database = Some("app".to_string());
        draft.username = Some("svc".to_string());

        let result = tester
            .test_ad_hoc(&draft, Some(&Secret::Password("pw".to_string())), None)
            .await
            .unwrap();
        assert!(result.success);
        assert!(repo.list_connections("app-1").unwrap().is_empty());

        let err = tester.test_ad_hoc(&draft, None, None).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MissingField));
    }

    #[test]
    fn test_recover_stale_tests() {
        let repo = Arc::new(MemoryRepository::new());
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let tester = ConnectionTester::new(
            repo.clone(),
            Arc::new(CredentialCodec::new()),
            Prober::empty(Duration::from_secs(1)),
            EventBus::default(),
            clock.clone(),
        );

        let record = postgres(&tester, "c-1", "app-1");
        repo.insert_connection(&record).unwrap();
        repo.set_testing("c-1", start).unwrap();

        assert_eq!(tester.recover_stale_tests(chrono::Duration::minutes(5)).unwrap(), 0);

        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(tester.recover_stale_tests(chrono::Duration::minutes(5)).unwrap(), 1);

        let stored = repo.get_connection("c-1").unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Failed);
        assert_eq!(stored.last_test_result.as_deref(), Some(INTERRUPTED_SUMMARY));
    }

    #[test]
    fn test_active_connections_filters_inactive() {
        let repo = Arc::new(MemoryRepository::new());
        let tester = tester(repo.clone(), FixedProbe(Ok("ok")));

        repo.insert_connection(&postgres(&tester, "c-1", "app-1")).unwrap();
        let mut inactive = postgres(&tester, "c-2", "app-1");
        inactive.is_active = false;
        repo.insert_connection(&inactive).unwrap();

        let active = tester.active_connections("app-1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "c-1");
    }
}
