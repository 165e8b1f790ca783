//! Read-only views over the ledger: per-automation counters and history.
//!
//! Counters are aggregated from `contact_automations` and the trigger log on
//! every call; nothing here is stored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{EnrollmentCounts, NodeExecutionLogRow};
use db::AutomationStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Automation, Enrollment, LogAction};
use crate::{normalize_email, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationStats {
    /// Enrollments ever created.
    pub enrolled: i64,
    pub active: i64,
    pub completed: i64,
    pub exited: i64,
    /// Distinct contacts recorded in the trigger log (`once` automations).
    pub triggered_contacts: i64,
}

impl From<EnrollmentCounts> for AutomationStats {
    fn from(c: EnrollmentCounts) -> Self {
        Self {
            enrolled: c.enrolled,
            active: c.active,
            completed: c.completed,
            exited: c.exited,
            triggered_contacts: c.triggered_contacts,
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub node_id: String,
    pub action: LogAction,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<NodeExecutionLogRow> for ExecutionLogEntry {
    type Error = EngineError;

    fn try_from(row: NodeExecutionLogRow) -> Result<Self, Self::Error> {
        Ok(Self {
            action: row.action.parse::<LogAction>()?,
            node_id: row.node_id,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

pub struct StatsAggregator {
    store: Arc<dyn AutomationStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn AutomationStore>) -> Self {
        Self { store }
    }

    pub async fn stats(
        &self,
        workspace_id: &str,
        automation_id: Uuid,
    ) -> Result<AutomationStats, EngineError> {
        self.owned_automation(workspace_id, automation_id).await?;
        Ok(self.store.enrollment_counts(automation_id).await?.into())
    }

    /// Enrollments of an automation in entry order, optionally for one contact.
    pub async fn enrollments(
        &self,
        workspace_id: &str,
        automation_id: Uuid,
        contact_email: Option<&str>,
    ) -> Result<Vec<Enrollment>, EngineError> {
        self.owned_automation(workspace_id, automation_id).await?;
        let email = contact_email.map(normalize_email);

        self.store
            .list_enrollments(automation_id, email.as_deref())
            .await?
            .into_iter()
            .map(Enrollment::try_from)
            .collect()
    }

    /// The audit trail of one enrollment, oldest first.
    pub async fn execution_log(
        &self,
        workspace_id: &str,
        enrollment_id: Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, EngineError> {
        let enrollment = self.store.get_enrollment(enrollment_id).await?;
        if enrollment.workspace_id != workspace_id {
            return Err(EngineError::NotFound);
        }

        self.store
            .execution_log(enrollment_id)
            .await?
            .into_iter()
            .map(ExecutionLogEntry::try_from)
            .collect()
    }

    async fn owned_automation(
        &self,
        workspace_id: &str,
        id: Uuid,
    ) -> Result<Automation, EngineError> {
        let automation = Automation::from_row(self.store.get_automation(id).await?)?;
        if automation.workspace_id != workspace_id {
            return Err(EngineError::NotFound);
        }
        Ok(automation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_map_onto_stats() {
        let counts = EnrollmentCounts {
            enrolled: 4,
            active: 1,
            completed: 2,
            exited: 1,
            triggered_contacts: 3,
        };
        let stats = AutomationStats::from(counts);
        assert_eq!(stats.enrolled, stats.active + stats.completed + stats.exited);
        assert_eq!(stats.triggered_contacts, 3);
    }

    #[test]
    fn log_rows_with_unknown_actions_are_corrupt() {
        let row = NodeExecutionLogRow {
            id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            automation_id: Uuid::new_v4(),
            node_id: "mail".into(),
            action: "exploded".into(),
            detail: None,
            created_at: Utc::now(),
        };
        assert!(matches!(ExecutionLogEntry::try_from(row), Err(EngineError::Database(_))));
    }
}
