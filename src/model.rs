//! Connection and schedule records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

use crate::catalog::{classify, Category, ConnectionType, TypeSpec};
use crate::secrets::Secret;

/// Last known connectivity state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionStatus {
    #[default]
    Untested,
    Connected,
    Failed,
    /// Transient, only while a probe is in flight
    Testing,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Untested => "Untested",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Failed => "Failed",
            ConnectionStatus::Testing => "Testing",
        }
    }

}

/// Stored status text that names no known status
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ConnectionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Untested" => Ok(ConnectionStatus::Untested),
            "Connected" => Ok(ConnectionStatus::Connected),
            "Failed" => Ok(ConnectionStatus::Failed),
            "Testing" => Ok(ConnectionStatus::Testing),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Stored connection definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub application_id: String,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub name: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    /// Ciphertext envelope; never serialized back to clients
    #[serde(skip_serializing, default)]
    pub encrypted_secret: Option<String>,
    pub connection_string_override: Option<String>,
    #[serde(default)]
    pub additional_settings: BTreeMap<String, String>,
    pub status: ConnectionStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_test_result: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn spec(&self) -> &'static TypeSpec {
        classify(self.connection_type)
    }

    /// Derived from the type, never stored
    pub fn category(&self) -> Category {
        self.spec().category
    }

    /// Non-empty setting value by name
    pub fn setting(&self, name: &str) -> Option<&str> {
        self.additional_settings
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Structural fields only, as a draft for building
    pub fn to_draft(&self) -> ConnectionDraft {
        ConnectionDraft {
            application_id: self.application_id.clone(),
            connection_type: self.connection_type,
            name: self.name.clone(),
            server: self.server.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            connection_string_override: self.connection_string_override.clone(),
            additional_settings: self.additional_settings.clone(),
            is_active: self.is_active,
        }
    }
}

/// Operator-supplied connection fields, without identity or test state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDraft {
    #[serde(default)]
    pub application_id: String,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub connection_string_override: Option<String>,
    #[serde(default)]
    pub additional_settings: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl ConnectionDraft {
    pub fn new(application_id: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            application_id: application_id.into(),
            connection_type,
            name: String::new(),
            server: None,
            port: None,
            database: None,
            username: None,
            connection_string_override: None,
            additional_settings: BTreeMap::new(),
            is_active: true,
        }
    }

    pub fn spec(&self) -> &'static TypeSpec {
        classify(self.connection_type)
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.additional_settings
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Materialize a stored record
    pub fn into_record(
        self,
        id: String,
        encrypted_secret: Option<String>,
        now: DateTime<Utc>,
    ) -> ConnectionRecord {
        let name = if self.name.trim().is_empty() {
            self.spec().display_name.to_string()
        } else {
            self.name
        };

        ConnectionRecord {
            id,
            application_id: self.application_id,
            connection_type: self.connection_type,
            name,
            server: self.server,
            port: self.port,
            database: self.database,
            username: self.username,
            encrypted_secret,
            connection_string_override: self.connection_string_override,
            additional_settings: self.additional_settings,
            status: ConnectionStatus::Untested,
            last_tested_at: None,
            last_test_result: None,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Draft plus plaintext secret, as submitted for ad-hoc tests
#[derive(Debug, Clone, Deserialize)]
pub struct DraftWithSecret {
    #[serde(flatten)]
    pub draft: ConnectionDraft,
    #[serde(default)]
    pub secret: Option<Secret>,
}

/// Outcome of the last scheduled run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Failed,
    Running,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "Success",
            RunStatus::Failed => "Failed",
            RunStatus::Running => "Running",
        }
    }

}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(RunStatus::Success),
            "Failed" => Ok(RunStatus::Failed),
            "Running" => Ok(RunStatus::Running),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Recurring probe definition for one application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub application_id: String,
    pub cron_expression: String,
    pub is_enabled: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    /// Set while `last_run_status` is `Running`
    pub running_since: Option<DateTime<Utc>>,
    pub last_run_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    pub fn is_running(&self) -> bool {
        self.last_run_status == Some(RunStatus::Running)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && self.next_run_time.is_some_and(|next| next <= now)
    }
}
