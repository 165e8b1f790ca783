//! The storage contract shared by the Postgres and in-memory backends.
//!
//! Every method is one logical (transactional) operation. Callers pass `now`
//! explicitly so the backends never read the clock themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AutomationRow, AutomationStatus, ContactAutomationRow, EnrollmentCounts, EnrollmentStatus,
    NewLogEntry, NodeExecutionLogRow,
};
use crate::DbError;

/// A new `contact_automations` row together with its opening log rows.
#[derive(Debug, Clone)]
pub struct NewEnrollment {
    pub row: ContactAutomationRow,
    /// Gate the insert on a fresh `(automation_id, contact_email)` trigger-log row.
    pub dedup: bool,
    pub logs: Vec<NewLogEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Enrolled(ContactAutomationRow),
    /// The trigger log already held the dedup key; nothing was written.
    Duplicate,
}

/// Processing lease stamped on claimed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Scheduler instance id.
    pub owner: String,
    pub until: DateTime<Utc>,
}

/// The persisted result of one scheduler step. Clears the lease.
#[derive(Debug, Clone)]
pub struct EnrollmentUpdate {
    pub id: Uuid,
    pub lease_owner: String,
    pub status: EnrollmentStatus,
    pub current_node_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub logs: Vec<NewLogEntry>,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    // ------ automations ------

    async fn insert_automation(&self, row: &AutomationRow) -> Result<(), DbError>;

    /// Overwrite name, trigger, status and definition of a non-deleted automation.
    async fn update_automation(&self, row: &AutomationRow) -> Result<(), DbError>;

    /// Fetch by id, soft-deleted rows included.
    async fn get_automation(&self, id: Uuid) -> Result<AutomationRow, DbError>;

    /// Non-deleted automations of a workspace, newest first.
    async fn list_automations(&self, workspace_id: &str) -> Result<Vec<AutomationRow>, DbError>;

    /// Live, non-deleted automations subscribed to `event_kind`.
    async fn live_automations_for_event(
        &self,
        workspace_id: &str,
        event_kind: &str,
    ) -> Result<Vec<AutomationRow>, DbError>;

    async fn set_automation_status(
        &self,
        id: Uuid,
        status: AutomationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Soft-delete and exit every active enrollment in one transaction.
    /// Returns the number of enrollments exited.
    async fn archive_automation(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64, DbError>;

    // ------ enrollment ledger ------

    async fn enroll(&self, new: NewEnrollment) -> Result<EnrollOutcome, DbError>;

    /// The due set, read-only: active rows whose time has come and whose
    /// automation is live and not deleted. Leases are ignored.
    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ContactAutomationRow>, DbError>;

    /// Claim up to `limit` due rows not held by an unexpired lease, skipping
    /// rows another instance is claiming concurrently.
    async fn claim_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: &Lease,
    ) -> Result<Vec<ContactAutomationRow>, DbError>;

    /// Push `lease.until` out on a row this instance still holds. Returns
    /// `false` when the row was claimed by someone else, left `active`, or its
    /// automation is no longer live.
    async fn renew_lease(&self, id: Uuid, lease: &Lease) -> Result<bool, DbError>;

    /// Persist a step. Returns `false` (writing nothing) when the row is no
    /// longer active or the lease belongs to someone else.
    async fn save_step(&self, update: &EnrollmentUpdate) -> Result<bool, DbError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<ContactAutomationRow, DbError>;

    /// Enrollments of an automation ordered by `entered_at`, optionally for one contact.
    async fn list_enrollments(
        &self,
        automation_id: Uuid,
        contact_email: Option<&str>,
    ) -> Result<Vec<ContactAutomationRow>, DbError>;

    // ------ audit & aggregates ------

    /// Execution log of one enrollment, oldest first.
    async fn execution_log(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<NodeExecutionLogRow>, DbError>;

    async fn enrollment_counts(&self, automation_id: Uuid) -> Result<EnrollmentCounts, DbError>;
}
