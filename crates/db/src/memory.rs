//! In-memory [`AutomationStore`].
//!
//! One mutex guards all four relations, so every trait method is atomic the
//! way a Postgres transaction is. Claims are serialized by that mutex, which
//! gives the same guarantee as `FOR UPDATE SKIP LOCKED`: a row is handed to at
//! most one claimer per lease.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    AutomationRow, AutomationStatus, ContactAutomationRow, EnrollmentCounts, EnrollmentStatus,
    LogAction, NewLogEntry, NodeExecutionLogRow, TriggerLogRow,
};
use crate::store::{AutomationStore, EnrollOutcome, EnrollmentUpdate, Lease, NewEnrollment};
use crate::DbError;

#[derive(Default)]
struct State {
    automations: HashMap<Uuid, AutomationRow>,
    enrollments: HashMap<Uuid, ContactAutomationRow>,
    trigger_log: HashMap<(Uuid, String), TriggerLogRow>,
    execution_log: Vec<NodeExecutionLogRow>,
}

impl State {
    fn is_schedulable(&self, row: &ContactAutomationRow, now: DateTime<Utc>) -> bool {
        let due = row.status == EnrollmentStatus::Active.as_str()
            && row.scheduled_at.is_some_and(|at| at <= now);
        due && self.automations.get(&row.automation_id).is_some_and(|a| {
            a.status == AutomationStatus::Live.as_str() && a.deleted_at.is_none()
        })
    }

    fn due_ids(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<&ContactAutomationRow> = self
            .enrollments
            .values()
            .filter(|row| self.is_schedulable(row, now))
            .collect();
        due.sort_by_key(|row| (row.scheduled_at, row.entered_at, row.id));
        due.into_iter().map(|row| row.id).collect()
    }

    fn live_automation_mut(&mut self, id: Uuid) -> Result<&mut AutomationRow, DbError> {
        self.automations
            .get_mut(&id)
            .filter(|a| a.deleted_at.is_none())
            .ok_or(DbError::NotFound)
    }

    fn append_logs(&mut self, enrollment_id: Uuid, automation_id: Uuid, logs: Vec<NewLogEntry>) {
        self.execution_log
            .extend(logs.into_iter().map(|entry| entry.into_row(enrollment_id, automation_id)));
    }
}

/// Shared-nothing store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trigger-log rows, across all automations.
    pub async fn trigger_log_len(&self) -> usize {
        self.state.lock().await.trigger_log.len()
    }
}

fn limit_to_usize(limit: i64) -> usize {
    usize::try_from(limit.max(0)).unwrap_or(usize::MAX)
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn insert_automation(&self, row: &AutomationRow) -> Result<(), DbError> {
        self.state.lock().await.automations.insert(row.id, row.clone());
        Ok(())
    }

    async fn update_automation(&self, row: &AutomationRow) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let stored = state.live_automation_mut(row.id)?;
        stored.name = row.name.clone();
        stored.status = row.status.clone();
        stored.event_kind = row.event_kind.clone();
        stored.frequency = row.frequency.clone();
        stored.definition = row.definition.clone();
        stored.updated_at = row.updated_at;
        Ok(())
    }

    async fn get_automation(&self, id: Uuid) -> Result<AutomationRow, DbError> {
        self.state.lock().await.automations.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_automations(&self, workspace_id: &str) -> Result<Vec<AutomationRow>, DbError> {
        let state = self.state.lock().await;
        let mut rows: Vec<AutomationRow> = state
            .automations
            .values()
            .filter(|a| a.workspace_id == workspace_id && a.deleted_at.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn live_automations_for_event(
        &self,
        workspace_id: &str,
        event_kind: &str,
    ) -> Result<Vec<AutomationRow>, DbError> {
        let state = self.state.lock().await;
        let mut rows: Vec<AutomationRow> = state
            .automations
            .values()
            .filter(|a| {
                a.workspace_id == workspace_id
                    && a.event_kind == event_kind
                    && a.status == AutomationStatus::Live.as_str()
                    && a.deleted_at.is_none()
            })
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.created_at, a.id));
        Ok(rows)
    }

    async fn set_automation_status(
        &self,
        id: Uuid,
        status: AutomationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let stored = state.live_automation_mut(id)?;
        stored.status = status.as_str().to_owned();
        stored.updated_at = now;
        Ok(())
    }

    async fn archive_automation(&self, id: Uuid, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut state = self.state.lock().await;
        let automation = state.live_automation_mut(id)?;
        automation.status = AutomationStatus::Archived.as_str().to_owned();
        automation.deleted_at = Some(now);
        automation.updated_at = now;

        let mut exited = Vec::new();
        for row in state.enrollments.values_mut() {
            if row.automation_id == id && row.status == EnrollmentStatus::Active.as_str() {
                row.status = EnrollmentStatus::Exited.as_str().to_owned();
                row.scheduled_at = None;
                row.locked_by = None;
                row.locked_until = None;
                row.updated_at = now;
                exited.push((row.id, row.current_node_id.clone().unwrap_or_default()));
            }
        }

        let count = exited.len() as u64;
        for (enrollment_id, node_id) in exited {
            let entry =
                NewLogEntry::new(node_id, LogAction::Exited, now).with_detail("automation deleted");
            state.append_logs(enrollment_id, id, vec![entry]);
        }
        Ok(count)
    }

    async fn enroll(&self, new: NewEnrollment) -> Result<EnrollOutcome, DbError> {
        let mut state = self.state.lock().await;
        let NewEnrollment { row, dedup, logs } = new;

        if dedup {
            let key = (row.automation_id, row.contact_email.clone());
            if state.trigger_log.contains_key(&key) {
                return Ok(EnrollOutcome::Duplicate);
            }
            state.trigger_log.insert(
                key,
                TriggerLogRow {
                    automation_id: row.automation_id,
                    contact_email: row.contact_email.clone(),
                    created_at: row.entered_at,
                },
            );
        }

        state.append_logs(row.id, row.automation_id, logs);
        state.enrollments.insert(row.id, row.clone());
        Ok(EnrollOutcome::Enrolled(row))
    }

    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ContactAutomationRow>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .due_ids(now)
            .into_iter()
            .take(limit_to_usize(limit))
            .filter_map(|id| state.enrollments.get(&id).cloned())
            .collect())
    }

    async fn claim_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: &Lease,
    ) -> Result<Vec<ContactAutomationRow>, DbError> {
        let mut state = self.state.lock().await;
        let candidates = state.due_ids(now);

        let mut claimed = Vec::new();
        for id in candidates {
            if claimed.len() >= limit_to_usize(limit) {
                break;
            }
            let Some(row) = state.enrollments.get_mut(&id) else { continue };
            if row.locked_until.is_some_and(|until| until > now) {
                continue;
            }
            row.locked_by = Some(lease.owner.clone());
            row.locked_until = Some(lease.until);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn renew_lease(&self, id: Uuid, lease: &Lease) -> Result<bool, DbError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.enrollments.get(&id) else {
            return Err(DbError::NotFound);
        };
        let live = state.automations.get(&row.automation_id).is_some_and(|a| {
            a.status == AutomationStatus::Live.as_str() && a.deleted_at.is_none()
        });
        if !live
            || row.status != EnrollmentStatus::Active.as_str()
            || row.locked_by.as_deref() != Some(lease.owner.as_str())
        {
            return Ok(false);
        }

        if let Some(row) = state.enrollments.get_mut(&id) {
            row.locked_until = Some(lease.until);
        }
        Ok(true)
    }

    async fn save_step(&self, update: &EnrollmentUpdate) -> Result<bool, DbError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.enrollments.get_mut(&update.id) else {
            return Err(DbError::NotFound);
        };
        if row.status != EnrollmentStatus::Active.as_str()
            || row.locked_by.as_deref() != Some(update.lease_owner.as_str())
        {
            return Ok(false);
        }

        row.status = update.status.as_str().to_owned();
        row.current_node_id = update.current_node_id.clone();
        row.scheduled_at = update.scheduled_at;
        row.retry_count = update.retry_count;
        row.locked_by = None;
        row.locked_until = None;
        row.updated_at = update.now;

        let automation_id = row.automation_id;
        state.append_logs(update.id, automation_id, update.logs.clone());
        Ok(true)
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<ContactAutomationRow, DbError> {
        self.state.lock().await.enrollments.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_enrollments(
        &self,
        automation_id: Uuid,
        contact_email: Option<&str>,
    ) -> Result<Vec<ContactAutomationRow>, DbError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ContactAutomationRow> = state
            .enrollments
            .values()
            .filter(|row| row.automation_id == automation_id)
            .filter(|row| contact_email.map_or(true, |email| row.contact_email == email))
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.entered_at, row.id));
        Ok(rows)
    }

    async fn execution_log(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<NodeExecutionLogRow>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .execution_log
            .iter()
            .filter(|entry| entry.enrollment_id == enrollment_id)
            .cloned()
            .collect())
    }

    async fn enrollment_counts(&self, automation_id: Uuid) -> Result<EnrollmentCounts, DbError> {
        let state = self.state.lock().await;
        let mut counts = EnrollmentCounts::default();

        for row in state.enrollments.values().filter(|r| r.automation_id == automation_id) {
            counts.enrolled += 1;
            match row.status()? {
                EnrollmentStatus::Active => counts.active += 1,
                EnrollmentStatus::Completed => counts.completed += 1,
                EnrollmentStatus::Exited => counts.exited += 1,
            }
        }
        counts.triggered_contacts = state
            .trigger_log
            .keys()
            .filter(|(id, _)| *id == automation_id)
            .map(|(_, email)| email.as_str())
            .collect::<HashSet<_>>()
            .len() as i64;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn automation(status: AutomationStatus, now: DateTime<Utc>) -> AutomationRow {
        AutomationRow {
            id: Uuid::new_v4(),
            workspace_id: "ws".into(),
            name: "welcome".into(),
            status: status.as_str().into(),
            event_kind: "insert_contact_list".into(),
            frequency: "once".into(),
            definition: json!({}),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn enrollment(automation_id: Uuid, email: &str, at: DateTime<Utc>) -> ContactAutomationRow {
        ContactAutomationRow {
            id: Uuid::new_v4(),
            workspace_id: "ws".into(),
            automation_id,
            contact_email: email.into(),
            status: "active".into(),
            current_node_id: Some("mail".into()),
            scheduled_at: Some(at),
            entered_at: at,
            context: json!({}),
            retry_count: 0,
            max_retries: 3,
            locked_by: None,
            locked_until: None,
            updated_at: at,
        }
    }

    fn lease(owner: &str, now: DateTime<Utc>) -> Lease {
        Lease { owner: owner.into(), until: now + Duration::seconds(30) }
    }

    #[tokio::test]
    async fn dedup_gate_rejects_second_insert() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = automation(AutomationStatus::Live, now);
        store.insert_automation(&a).await.unwrap();

        let first =
            NewEnrollment { row: enrollment(a.id, "jo@x.io", now), dedup: true, logs: vec![] };
        let second =
            NewEnrollment { row: enrollment(a.id, "jo@x.io", now), dedup: true, logs: vec![] };

        assert!(matches!(store.enroll(first).await.unwrap(), EnrollOutcome::Enrolled(_)));
        assert_eq!(store.enroll(second).await.unwrap(), EnrollOutcome::Duplicate);
        assert_eq!(store.list_enrollments(a.id, None).await.unwrap().len(), 1);
        assert_eq!(store.trigger_log_len().await, 1);
    }

    #[tokio::test]
    async fn claimed_rows_are_skipped_by_other_instances() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = automation(AutomationStatus::Live, now);
        store.insert_automation(&a).await.unwrap();
        for i in 0..3 {
            let row = enrollment(a.id, &format!("c{i}@x.io"), now);
            store.enroll(NewEnrollment { row, dedup: false, logs: vec![] }).await.unwrap();
        }

        let first = store.claim_due_enrollments(now, 2, &lease("a", now)).await.unwrap();
        let second = store.claim_due_enrollments(now, 10, &lease("b", now)).await.unwrap();
        let third = store.claim_due_enrollments(now, 10, &lease("c", now)).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert!(first.iter().all(|r| r.id != second[0].id));

        // The lease expires and the row becomes claimable again.
        let later = now + Duration::seconds(31);
        let reclaimed = store.claim_due_enrollments(later, 10, &lease("c", later)).await.unwrap();
        assert_eq!(reclaimed.len(), 3);
    }

    #[tokio::test]
    async fn save_step_requires_lease_owner() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = automation(AutomationStatus::Live, now);
        store.insert_automation(&a).await.unwrap();
        let row = enrollment(a.id, "jo@x.io", now);
        store.enroll(NewEnrollment { row: row.clone(), dedup: false, logs: vec![] }).await.unwrap();
        store.claim_due_enrollments(now, 10, &lease("a", now)).await.unwrap();

        let mut update = EnrollmentUpdate {
            id: row.id,
            lease_owner: "b".into(),
            status: EnrollmentStatus::Completed,
            current_node_id: None,
            scheduled_at: None,
            retry_count: 0,
            logs: vec![NewLogEntry::new("mail", LogAction::Executed, now)],
            now,
        };
        assert!(!store.save_step(&update).await.unwrap());

        update.lease_owner = "a".into();
        assert!(store.save_step(&update).await.unwrap());
        let saved = store.get_enrollment(row.id).await.unwrap();
        assert_eq!(saved.status, "completed");
        assert!(saved.locked_by.is_none());
        assert_eq!(store.execution_log(row.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn renewal_fails_once_another_instance_reclaims() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = automation(AutomationStatus::Live, now);
        store.insert_automation(&a).await.unwrap();
        let row = enrollment(a.id, "jo@x.io", now);
        store.enroll(NewEnrollment { row: row.clone(), dedup: false, logs: vec![] }).await.unwrap();
        store.claim_due_enrollments(now, 10, &lease("a", now)).await.unwrap();

        // Expired but untouched: the holder may still renew.
        let later = now + Duration::seconds(45);
        assert!(store.renew_lease(row.id, &lease("a", later)).await.unwrap());
        let renewed = store.get_enrollment(row.id).await.unwrap();
        assert_eq!(renewed.locked_until, Some(later + Duration::seconds(30)));
        let stolen = store.claim_due_enrollments(later, 10, &lease("b", later)).await.unwrap();
        assert!(stolen.is_empty());

        let expired = later + Duration::seconds(31);
        let reclaimed =
            store.claim_due_enrollments(expired, 10, &lease("b", expired)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert!(!store.renew_lease(row.id, &lease("a", expired)).await.unwrap());
        assert!(store.renew_lease(row.id, &lease("b", expired)).await.unwrap());

        store.set_automation_status(a.id, AutomationStatus::Paused, expired).await.unwrap();
        assert!(!store.renew_lease(row.id, &lease("b", expired)).await.unwrap());
    }

    #[tokio::test]
    async fn archive_exits_active_rows_only() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = automation(AutomationStatus::Live, now);
        store.insert_automation(&a).await.unwrap();

        let active = enrollment(a.id, "a@x.io", now);
        let mut done = enrollment(a.id, "b@x.io", now);
        done.status = "completed".into();
        done.scheduled_at = None;
        for row in [active.clone(), done.clone()] {
            store.enroll(NewEnrollment { row, dedup: false, logs: vec![] }).await.unwrap();
        }

        assert_eq!(store.archive_automation(a.id, now).await.unwrap(), 1);
        assert_eq!(store.get_enrollment(active.id).await.unwrap().status, "exited");
        assert_eq!(store.get_enrollment(done.id).await.unwrap().status, "completed");
        assert!(matches!(store.archive_automation(a.id, now).await, Err(DbError::NotFound)));
        let matching = store.live_automations_for_event("ws", "insert_contact_list").await.unwrap();
        assert!(matching.is_empty());
    }
}
