//! The Definition Store service: create, edit, publish and retire automations.
//!
//! Every call is scoped by workspace; an automation of another workspace is
//! reported as [`EngineError::NotFound`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use db::AutomationStore;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::dag::validate_definition;
use crate::models::{Automation, AutomationDefinition, AutomationStatus, EnrollmentStatus};
use crate::EngineError;

pub struct AutomationService {
    store: Arc<dyn AutomationStore>,
}

impl AutomationService {
    pub fn new(store: Arc<dyn AutomationStore>) -> Self {
        Self { store }
    }

    /// Validate and persist a new automation in `draft`.
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    pub async fn create(
        &self,
        workspace_id: &str,
        definition: AutomationDefinition,
    ) -> Result<Automation, EngineError> {
        validate_definition(&definition)?;

        let automation = Automation::new(workspace_id, definition, Utc::now());
        self.store.insert_automation(&automation.to_row()?).await?;

        info!(automation_id = %automation.id, "automation created");
        Ok(automation)
    }

    /// Fetch one automation, archived ones included.
    pub async fn get(&self, workspace_id: &str, id: Uuid) -> Result<Automation, EngineError> {
        let automation = Automation::from_row(self.store.get_automation(id).await?)?;
        if automation.workspace_id != workspace_id {
            return Err(EngineError::NotFound);
        }
        Ok(automation)
    }

    /// Non-deleted automations of a workspace, newest first.
    pub async fn list(&self, workspace_id: &str) -> Result<Vec<Automation>, EngineError> {
        self.store
            .list_automations(workspace_id)
            .await?
            .into_iter()
            .map(Automation::from_row)
            .collect()
    }

    /// Replace the definition of a `draft` or `paused` automation.
    ///
    /// A paused automation may only be edited when no active enrollment sits
    /// on a node the new graph drops; otherwise those contacts could never be
    /// advanced again.
    #[instrument(skip(self, definition))]
    pub async fn update(
        &self,
        workspace_id: &str,
        id: Uuid,
        definition: AutomationDefinition,
    ) -> Result<Automation, EngineError> {
        let mut automation = self.get(workspace_id, id).await?;

        match automation.status {
            AutomationStatus::Draft => {}
            AutomationStatus::Paused => {
                let stranded: BTreeSet<String> = self
                    .store
                    .list_enrollments(id, None)
                    .await?
                    .into_iter()
                    .filter(|row| row.status == EnrollmentStatus::Active.as_str())
                    .filter_map(|row| row.current_node_id)
                    .filter(|node_id| !definition.nodes.contains_key(node_id))
                    .collect();
                if !stranded.is_empty() {
                    return Err(EngineError::StrandedEnrollments(stranded.into_iter().collect()));
                }
            }
            status @ (AutomationStatus::Live | AutomationStatus::Archived) => {
                return Err(EngineError::Immutable(status));
            }
        }

        validate_definition(&definition)?;

        automation.definition = definition;
        automation.updated_at = Utc::now();
        self.store.update_automation(&automation.to_row()?).await?;

        info!("automation definition updated");
        Ok(automation)
    }

    /// Publish (`live`) or freeze (`paused`) an automation.
    ///
    /// Pausing never touches enrollments: the scheduler's due set simply
    /// stops including them until the automation is live again.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        workspace_id: &str,
        id: Uuid,
        status: AutomationStatus,
    ) -> Result<Automation, EngineError> {
        let mut automation = self.get(workspace_id, id).await?;
        let from = automation.status;

        if from == status {
            return Ok(automation);
        }

        let allowed = matches!(
            (from, status),
            (AutomationStatus::Draft, AutomationStatus::Live)
                | (AutomationStatus::Live, AutomationStatus::Paused)
                | (AutomationStatus::Paused, AutomationStatus::Live)
        );
        if !allowed {
            return Err(EngineError::InvalidTransition { from, to: status });
        }

        let now = Utc::now();
        self.store.set_automation_status(id, status, now).await?;

        info!("automation {} -> {}", from, status);
        automation.status = status;
        automation.updated_at = now;
        Ok(automation)
    }

    /// Soft-delete: archive the automation and exit its active enrollments
    /// in one transaction. Returns the number of enrollments exited.
    #[instrument(skip(self))]
    pub async fn delete(&self, workspace_id: &str, id: Uuid) -> Result<u64, EngineError> {
        let automation = self.get(workspace_id, id).await?;
        if automation.deleted_at.is_some() {
            return Err(EngineError::NotFound);
        }

        let exited = self.store.archive_automation(id, Utc::now()).await?;
        info!(exited, "automation deleted");
        Ok(exited)
    }
}
