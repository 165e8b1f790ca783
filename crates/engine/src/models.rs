//! Core domain models for the automation engine.
//!
//! An [`Automation`] is stored as one `automations` row: the trigger lives in
//! columns (so live automations can be matched by event kind) and the node
//! graph is serialised into the JSONB `definition` column.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use db::models::{AutomationRow, ContactAutomationRow};
pub use db::models::{AutomationStatus, EnrollmentStatus, Frequency, LogAction};
use nodes::Node;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Which timeline events enroll contacts, and how often.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub event_kind: String,
    pub frequency: Frequency,
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// The operator-authored part of an automation: everything create/update accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationDefinition {
    pub name: String,
    pub trigger: TriggerConfig,
    pub root_node_id: String,
    /// Node arena keyed by node id.
    pub nodes: BTreeMap<String, Node>,
}

impl AutomationDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }
}

/// Shape of the `definition` column.
#[derive(Serialize, Deserialize)]
struct StoredGraph {
    root_node_id: String,
    nodes: BTreeMap<String, Node>,
}

// ---------------------------------------------------------------------------
// Automation
// ---------------------------------------------------------------------------

/// A stored automation: definition plus lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub workspace_id: String,
    pub status: AutomationStatus,
    #[serde(flatten)]
    pub definition: AutomationDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Automation {
    /// A fresh `draft` automation.
    pub fn new(
        workspace_id: impl Into<String>,
        definition: AutomationDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            status: AutomationStatus::Draft,
            definition,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.definition.node(id)
    }

    pub fn root(&self) -> Option<&Node> {
        self.node(&self.definition.root_node_id)
    }

    pub fn frequency(&self) -> Frequency {
        self.definition.trigger.frequency
    }

    pub fn from_row(row: AutomationRow) -> Result<Self, EngineError> {
        let status = row.status()?;
        let frequency = row.frequency()?;
        let graph: StoredGraph = serde_json::from_value(row.definition)?;

        Ok(Self {
            id: row.id,
            workspace_id: row.workspace_id,
            status,
            definition: AutomationDefinition {
                name: row.name,
                trigger: TriggerConfig { event_kind: row.event_kind, frequency },
                root_node_id: graph.root_node_id,
                nodes: graph.nodes,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }

    pub fn to_row(&self) -> Result<AutomationRow, EngineError> {
        let graph = StoredGraph {
            root_node_id: self.definition.root_node_id.clone(),
            nodes: self.definition.nodes.clone(),
        };

        Ok(AutomationRow {
            id: self.id,
            workspace_id: self.workspace_id.clone(),
            name: self.definition.name.clone(),
            status: self.status.as_str().to_owned(),
            event_kind: self.definition.trigger.event_kind.clone(),
            frequency: self.definition.trigger.frequency.as_str().to_owned(),
            definition: serde_json::to_value(graph)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A change in a contact's lifecycle, as produced by the contact timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactTimelineEvent {
    pub workspace_id: String,
    pub contact_email: String,
    /// e.g. `insert_contact_list`, `join_segment`, or a custom event name.
    pub event_kind: String,
    #[serde(default)]
    pub data: Value,
}

impl ContactTimelineEvent {
    pub fn new(
        workspace_id: impl Into<String>,
        contact_email: impl Into<String>,
        event_kind: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            contact_email: contact_email.into(),
            event_kind: event_kind.into(),
            data,
        }
    }
}

/// Dedup keys and ledger rows use the trimmed, lower-cased address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// One contact's progress through one automation (a `contact_automations` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub contact_email: String,
    pub status: EnrollmentStatus,
    pub current_node_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub entered_at: DateTime<Utc>,
    pub context: Value,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl TryFrom<ContactAutomationRow> for Enrollment {
    type Error = EngineError;

    fn try_from(row: ContactAutomationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status()?,
            id: row.id,
            automation_id: row.automation_id,
            contact_email: row.contact_email,
            current_node_id: row.current_node_id,
            scheduled_at: row.scheduled_at,
            entered_at: row.entered_at,
            context: row.context,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> AutomationDefinition {
        serde_json::from_value(json!({
            "name": "welcome series",
            "trigger": { "event_kind": "insert_contact_list", "frequency": "once" },
            "root_node_id": "start",
            "nodes": {
                "start": { "id": "start", "type": "trigger", "next_node_id": "hello" },
                "hello": { "id": "hello", "type": "email",
                           "config": { "template_id": "tpl-hello" } }
            }
        }))
        .expect("valid definition")
    }

    #[test]
    fn row_round_trip_keeps_graph_and_trigger() {
        let automation = Automation::new("ws-1", sample_definition(), Utc::now());
        let row = automation.to_row().unwrap();

        assert_eq!(row.status, "draft");
        assert_eq!(row.frequency, "once");
        assert_eq!(row.event_kind, "insert_contact_list");
        assert_eq!(row.definition["root_node_id"], "start");

        assert_eq!(Automation::from_row(row).unwrap(), automation);
    }

    #[test]
    fn corrupt_status_is_rejected() {
        let automation = Automation::new("ws-1", sample_definition(), Utc::now());
        let mut row = automation.to_row().unwrap();
        row.status = "sleeping".into();
        assert!(Automation::from_row(row).is_err());
    }

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Jo@Example.COM "), "jo@example.com");
    }
}
