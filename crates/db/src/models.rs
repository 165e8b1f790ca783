//! Row structs that map 1-to-1 onto database tables, plus the status
//! vocabularies stored in their text columns.
//!
//! These are *persistence* models; they carry no domain behaviour.
//! Domain types live in the `engine` and `nodes` crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::DbError;

/// Text-column enums: `as_str` for writing, `FromStr` for reading back.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DbError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DbError::Corrupt(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum! {
    /// Lifecycle of an automation definition.
    AutomationStatus {
        Draft => "draft",
        Live => "live",
        Paused => "paused",
        Archived => "archived",
    }
}

text_enum! {
    /// How often one contact may enter an automation.
    Frequency {
        Once => "once",
        EveryTime => "every_time",
    }
}

text_enum! {
    /// Lifecycle of one contact's enrollment.
    EnrollmentStatus {
        Active => "active",
        Completed => "completed",
        Exited => "exited",
    }
}

text_enum! {
    /// What a `node_execution_log` row records.
    LogAction {
        Entered => "entered",
        Executed => "executed",
        Retry => "retry",
        Failed => "failed",
        Completed => "completed",
        Exited => "exited",
    }
}

// ---------------------------------------------------------------------------
// automations
// ---------------------------------------------------------------------------

/// A persisted automation definition row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AutomationRow {
    pub id: Uuid,
    pub workspace_id: String,
    pub name: String,
    pub status: String,
    pub event_kind: String,
    pub frequency: String,
    /// Graph JSON: `{ "root_node_id": …, "nodes": { id: node } }`.
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AutomationRow {
    pub fn status(&self) -> Result<AutomationStatus, DbError> {
        self.status.parse()
    }

    pub fn frequency(&self) -> Result<Frequency, DbError> {
        self.frequency.parse()
    }
}

// ---------------------------------------------------------------------------
// contact_automations
// ---------------------------------------------------------------------------

/// One contact's progress through one automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ContactAutomationRow {
    pub id: Uuid,
    pub workspace_id: String,
    pub automation_id: Uuid,
    pub contact_email: String,
    pub status: String,
    pub current_node_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub entered_at: DateTime<Utc>,
    pub context: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Scheduler instance holding the processing lease, if any.
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ContactAutomationRow {
    pub fn status(&self) -> Result<EnrollmentStatus, DbError> {
        self.status.parse()
    }
}

// ---------------------------------------------------------------------------
// automation_trigger_log
// ---------------------------------------------------------------------------

/// Existence marks that a `once` automation already fired for the contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TriggerLogRow {
    pub automation_id: Uuid,
    pub contact_email: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// node_execution_log
// ---------------------------------------------------------------------------

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NodeExecutionLogRow {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub automation_id: Uuid,
    pub node_id: String,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A log row before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub node_id: String,
    pub action: LogAction,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn new(node_id: impl Into<String>, action: LogAction, created_at: DateTime<Utc>) -> Self {
        Self { node_id: node_id.into(), action, detail: None, created_at }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub(crate) fn into_row(self, enrollment_id: Uuid, automation_id: Uuid) -> NodeExecutionLogRow {
        NodeExecutionLogRow {
            id: Uuid::new_v4(),
            enrollment_id,
            automation_id,
            node_id: self.node_id,
            action: self.action.as_str().to_owned(),
            detail: self.detail,
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Enrollment counters derived by aggregation, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentCounts {
    pub enrolled: i64,
    pub active: i64,
    pub completed: i64,
    pub exited: i64,
    /// Distinct contacts recorded in the trigger log.
    pub triggered_contacts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trips() {
        for status in [
            EnrollmentStatus::Active,
            EnrollmentStatus::Completed,
            EnrollmentStatus::Exited,
        ] {
            assert_eq!(status.as_str().parse::<EnrollmentStatus>().unwrap(), status);
        }
        assert_eq!(Frequency::EveryTime.to_string(), "every_time");
    }

    #[test]
    fn unknown_status_is_corrupt() {
        assert!(matches!("zombie".parse::<AutomationStatus>(), Err(DbError::Corrupt(_))));
    }
}
