//! Postgres-backed [`AutomationStore`], delegating to the repository functions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AutomationRow, AutomationStatus, ContactAutomationRow, EnrollmentCounts, NodeExecutionLogRow,
};
use crate::repository::{automations, enrollments, execution_log};
use crate::store::{AutomationStore, EnrollOutcome, EnrollmentUpdate, Lease, NewEnrollment};
use crate::{DbError, DbPool};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutomationStore for PgStore {
    async fn insert_automation(&self, row: &AutomationRow) -> Result<(), DbError> {
        automations::insert_automation(&self.pool, row).await
    }

    async fn update_automation(&self, row: &AutomationRow) -> Result<(), DbError> {
        automations::update_automation(&self.pool, row).await
    }

    async fn get_automation(&self, id: Uuid) -> Result<AutomationRow, DbError> {
        automations::get_automation(&self.pool, id).await
    }

    async fn list_automations(&self, workspace_id: &str) -> Result<Vec<AutomationRow>, DbError> {
        automations::list_automations(&self.pool, workspace_id).await
    }

    async fn live_automations_for_event(
        &self,
        workspace_id: &str,
        event_kind: &str,
    ) -> Result<Vec<AutomationRow>, DbError> {
        automations::live_automations_for_event(&self.pool, workspace_id, event_kind).await
    }

    async fn set_automation_status(
        &self,
        id: Uuid,
        status: AutomationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        automations::set_automation_status(&self.pool, id, status, now).await
    }

    async fn archive_automation(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64, DbError> {
        automations::archive_automation(&self.pool, id, now).await
    }

    async fn enroll(&self, new: NewEnrollment) -> Result<EnrollOutcome, DbError> {
        enrollments::enroll(&self.pool, new).await
    }

    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ContactAutomationRow>, DbError> {
        enrollments::due(&self.pool, now, limit).await
    }

    async fn claim_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: &Lease,
    ) -> Result<Vec<ContactAutomationRow>, DbError> {
        enrollments::claim_due(&self.pool, now, limit, lease).await
    }

    async fn renew_lease(&self, id: Uuid, lease: &Lease) -> Result<bool, DbError> {
        enrollments::renew_lease(&self.pool, id, lease).await
    }

    async fn save_step(&self, update: &EnrollmentUpdate) -> Result<bool, DbError> {
        enrollments::save_step(&self.pool, update).await
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<ContactAutomationRow, DbError> {
        enrollments::get(&self.pool, id).await
    }

    async fn list_enrollments(
        &self,
        automation_id: Uuid,
        contact_email: Option<&str>,
    ) -> Result<Vec<ContactAutomationRow>, DbError> {
        enrollments::list(&self.pool, automation_id, contact_email).await
    }

    async fn execution_log(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<NodeExecutionLogRow>, DbError> {
        execution_log::for_enrollment(&self.pool, enrollment_id).await
    }

    async fn enrollment_counts(&self, automation_id: Uuid) -> Result<EnrollmentCounts, DbError> {
        enrollments::counts(&self.pool, automation_id).await
    }
}
