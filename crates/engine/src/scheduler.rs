//! Scheduler Loop: advances due enrollments one node at a time.
//!
//! Each tick:
//! 1. Claims up to `batch_size` due enrollments under a lease (rows already
//!    claimed by another instance are skipped, never waited on).
//! 2. For each row in turn, renews its lease (dropping rows another instance
//!    took over), runs the current node's decision procedure and applies its
//!    side effect under `send_timeout`.
//! 3. Persists the outcome guarded by the lease: advanced, completed, retried
//!    with back-off, or exited.
//!
//! Failures stay local to the enrollment they happened in.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{ContactAutomationRow, NewLogEntry};
use db::{AutomationStore, DbError, EnrollmentUpdate, Lease};
use nodes::{
    decide, ContactAttributes, ContactLookup, DecisionInput, ExecutionContext, ListManager,
    MessageSender, Node, NodeError, SideEffect,
};
use serde_json::Value;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::models::{Automation, Enrollment, EnrollmentStatus, LogAction};
use crate::EngineError;

/// The external services node side effects are delegated to.
#[derive(Clone)]
pub struct Collaborators {
    pub sender: Arc<dyn MessageSender>,
    pub lists: Arc<dyn ListManager>,
    pub contacts: Arc<dyn ContactLookup>,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    /// Moved to another node and still active.
    pub advanced: usize,
    pub completed: usize,
    pub retried: usize,
    pub exited: usize,
    /// Steps dropped or refused because the row changed hands, left `active`
    /// or its automation stopped being live.
    pub lost: usize,
    /// Steps abandoned on an infrastructure error; the lease will expire.
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Advanced,
    Completed,
    Retried,
    Exited,
}

impl TickReport {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Advanced => self.advanced += 1,
            StepOutcome::Completed => self.completed += 1,
            StepOutcome::Retried => self.retried += 1,
            StepOutcome::Exited => self.exited += 1,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn AutomationStore>,
    collaborators: Collaborators,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        collaborators: Collaborators,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, collaborators, config }
    }

    /// Tick every `poll_interval` until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(instance_id = %self.config.instance_id, "scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => match self.tick().await {
                    Ok(report) if report.claimed > 0 => info!(?report, "tick finished"),
                    Ok(_) => {}
                    Err(err) => error!("scheduler tick failed: {}", err),
                },
            }
        }
        info!(instance_id = %self.config.instance_id, "scheduler stopped");
    }

    /// One polling pass on the wall clock.
    pub async fn tick(&self) -> Result<TickReport, EngineError> {
        self.tick_with(Utc::now).await
    }

    /// One polling pass frozen at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        self.tick_with(move || now).await
    }

    /// One polling pass reading `clock` whenever it needs the time: to claim,
    /// then again before and after every step.
    ///
    /// Each row's lease is renewed right before its step; a row another
    /// instance re-claimed in the meantime is dropped without running.
    ///
    /// # Errors
    /// Only when the claim itself fails; per-enrollment failures are counted
    /// in the report.
    pub async fn tick_with<C>(&self, clock: C) -> Result<TickReport, EngineError>
    where
        C: Fn() -> DateTime<Utc>,
    {
        let now = clock();
        let rows = self
            .store
            .claim_due_enrollments(now, self.config.batch_size, &self.lease(now))
            .await?;

        let mut report = TickReport { claimed: rows.len(), ..TickReport::default() };
        let mut automations: HashMap<Uuid, Option<Arc<Automation>>> = HashMap::new();

        for row in rows {
            let enrollment_id = row.id;
            let started = clock();
            match self.store.renew_lease(enrollment_id, &self.lease(started)).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(%enrollment_id, "lease no longer held; step skipped");
                    report.lost += 1;
                    continue;
                }
                Err(err) => {
                    error!(%enrollment_id, "lease renewal failed: {}", err);
                    report.errors += 1;
                    continue;
                }
            }

            match self.step(row, started, &clock, &mut automations).await {
                Ok(Some(outcome)) => report.record(outcome),
                Ok(None) => report.lost += 1,
                Err(err) => {
                    error!(%enrollment_id, "step abandoned: {}", err);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    fn lease(&self, now: DateTime<Utc>) -> Lease {
        let lease_for = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Lease { owner: self.config.instance_id.clone(), until: now + lease_for }
    }

    /// Advance one claimed enrollment by one node. The decision sees
    /// `started`; the outcome is stamped with a fresh reading of `clock`.
    /// `Ok(None)` means the write was refused by the lease guard.
    #[instrument(skip_all, fields(enrollment_id = %row.id, automation_id = %row.automation_id))]
    async fn step<C>(
        &self,
        row: ContactAutomationRow,
        started: DateTime<Utc>,
        clock: &C,
        automations: &mut HashMap<Uuid, Option<Arc<Automation>>>,
    ) -> Result<Option<StepOutcome>, EngineError>
    where
        C: Fn() -> DateTime<Utc>,
    {
        let enrollment = Enrollment::try_from(row)?;
        let node_id = enrollment.current_node_id.clone().unwrap_or_default();

        let automation = match automations.get(&enrollment.automation_id) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = self.load_automation(enrollment.automation_id).await?;
                automations.insert(enrollment.automation_id, loaded.clone());
                loaded
            }
        };
        let Some(automation) = automation else {
            let err = NodeError::Fatal("automation is missing or unreadable".into());
            return self.fail(&enrollment, &node_id, &err, clock()).await;
        };
        let Some(node) = automation.node(&node_id) else {
            let err = NodeError::Fatal(format!("node '{node_id}' does not exist"));
            return self.fail(&enrollment, &node_id, &err, clock()).await;
        };

        match self.execute(&automation, &enrollment, node, started).await {
            Ok(next) => self.succeed(&enrollment, &node_id, next, clock()).await,
            Err(err) => self.fail(&enrollment, &node_id, &err, clock()).await,
        }
    }

    /// Run the node's decision and its side effect. Returns the next node and due time.
    async fn execute(
        &self,
        automation: &Automation,
        enrollment: &Enrollment,
        node: &Node,
        now: DateTime<Utc>,
    ) -> Result<(Option<String>, DateTime<Utc>), NodeError> {
        let attributes = if node.needs_contact() {
            self.attributes(automation, enrollment).await?
        } else {
            ContactAttributes::new()
        };

        let input = DecisionInput {
            contact_email: &enrollment.contact_email,
            attributes: &attributes,
            now,
        };
        let decision = decide(node, &input)?;

        if let Some(effect) = &decision.effect {
            let ctx = ExecutionContext {
                workspace_id: automation.workspace_id.clone(),
                automation_id: automation.id,
                enrollment_id: enrollment.id,
                node_id: node.id.clone(),
                contact_email: enrollment.contact_email.clone(),
                data: enrollment.context.clone(),
            };
            self.apply(effect, &ctx).await?;
        }

        debug!("node '{}' ({}) -> {:?}", node.id, node.type_name(), decision.next_node_id);
        Ok((decision.next_node_id, decision.scheduled_at))
    }

    /// The enrollment context overlaid with the contact's current attributes.
    async fn attributes(
        &self,
        automation: &Automation,
        enrollment: &Enrollment,
    ) -> Result<ContactAttributes, NodeError> {
        let mut attributes = match &enrollment.context {
            Value::Object(map) => map.clone(),
            _ => ContactAttributes::new(),
        };

        let lookup = self
            .collaborators
            .contacts
            .attributes(&automation.workspace_id, &enrollment.contact_email);
        match self.bounded(lookup).await? {
            Some(contact) => attributes.extend(contact),
            None => debug!(
                "contact {} not found; using enrollment context",
                enrollment.contact_email
            ),
        }
        Ok(attributes)
    }

    async fn apply(&self, effect: &SideEffect, ctx: &ExecutionContext) -> Result<(), NodeError> {
        let c = &self.collaborators;
        match effect {
            SideEffect::SendEmail { template_id } => {
                self.bounded(c.sender.send(template_id, ctx)).await
            }
            SideEffect::AddToList { list_id, status } => {
                self.bounded(c.lists.add_contact(list_id, status, ctx)).await
            }
            SideEffect::RemoveFromList { list_id } => {
                self.bounded(c.lists.remove_contact(list_id, ctx)).await
            }
        }
    }

    /// A collaborator call under `send_timeout`; running out of time is retryable.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, NodeError>>,
    ) -> Result<T, NodeError> {
        timeout(self.config.send_timeout, call).await.map_err(|_| {
            NodeError::Retryable(format!(
                "collaborator timed out after {:?}",
                self.config.send_timeout
            ))
        })?
    }

    async fn load_automation(&self, id: Uuid) -> Result<Option<Arc<Automation>>, EngineError> {
        match self.store.get_automation(id).await {
            Ok(row) => match Automation::from_row(row) {
                Ok(automation) => Ok(Some(Arc::new(automation))),
                Err(err) => {
                    error!(automation_id = %id, "unreadable automation: {}", err);
                    Ok(None)
                }
            },
            Err(DbError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn succeed(
        &self,
        enrollment: &Enrollment,
        node_id: &str,
        (next_node_id, scheduled_at): (Option<String>, DateTime<Utc>),
        now: DateTime<Utc>,
    ) -> Result<Option<StepOutcome>, EngineError> {
        let mut logs = vec![NewLogEntry::new(node_id, LogAction::Executed, now)];

        let (status, current_node_id, scheduled_at, outcome) = match next_node_id {
            Some(next) => {
                (EnrollmentStatus::Active, Some(next), Some(scheduled_at), StepOutcome::Advanced)
            }
            None => {
                logs.push(NewLogEntry::new(node_id, LogAction::Completed, now));
                let terminal = Some(node_id.to_owned());
                (EnrollmentStatus::Completed, terminal, None, StepOutcome::Completed)
            }
        };

        let update = EnrollmentUpdate {
            id: enrollment.id,
            lease_owner: self.config.instance_id.clone(),
            status,
            current_node_id,
            scheduled_at,
            retry_count: 0,
            logs,
            now,
        };
        self.save(update, outcome).await
    }

    async fn fail(
        &self,
        enrollment: &Enrollment,
        node_id: &str,
        err: &NodeError,
        now: DateTime<Utc>,
    ) -> Result<Option<StepOutcome>, EngineError> {
        let retry_count = enrollment.retry_count.saturating_add(1);
        let current_node_id = enrollment.current_node_id.clone();

        let update = if err.is_retryable() && retry_count < enrollment.max_retries {
            let wait = self.config.backoff(retry_count);
            let retry_at = now
                + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::hours(1));
            warn!(
                "node '{}' failed (attempt {}/{}), retrying at {}: {}",
                node_id, retry_count, enrollment.max_retries, retry_at, err
            );

            EnrollmentUpdate {
                id: enrollment.id,
                lease_owner: self.config.instance_id.clone(),
                status: EnrollmentStatus::Active,
                current_node_id,
                scheduled_at: Some(retry_at),
                retry_count,
                logs: vec![
                    NewLogEntry::new(node_id, LogAction::Retry, now).with_detail(err.to_string())
                ],
                now,
            }
        } else {
            error!("node '{}' failed for good after {} attempt(s): {}", node_id, retry_count, err);

            EnrollmentUpdate {
                id: enrollment.id,
                lease_owner: self.config.instance_id.clone(),
                status: EnrollmentStatus::Exited,
                current_node_id,
                scheduled_at: None,
                retry_count,
                logs: vec![
                    NewLogEntry::new(node_id, LogAction::Failed, now).with_detail(err.to_string()),
                    NewLogEntry::new(node_id, LogAction::Exited, now),
                ],
                now,
            }
        };

        let outcome = if update.status == EnrollmentStatus::Exited {
            StepOutcome::Exited
        } else {
            StepOutcome::Retried
        };
        self.save(update, outcome).await
    }

    async fn save(
        &self,
        update: EnrollmentUpdate,
        outcome: StepOutcome,
    ) -> Result<Option<StepOutcome>, EngineError> {
        if self.store.save_step(&update).await? {
            Ok(Some(outcome))
        } else {
            warn!("enrollment changed hands or left active; step discarded");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn report_counts_outcomes() {
        let mut report = TickReport::default();
        report.record(StepOutcome::Advanced);
        report.record(StepOutcome::Advanced);
        report.record(StepOutcome::Exited);
        assert_eq!(report.advanced, 2);
        assert_eq!(report.exited, 1);
        assert_eq!(report.completed + report.retried, 0);
    }

    #[test]
    fn default_lease_outlives_a_send() {
        let config = SchedulerConfig::default();
        assert!(config.lease_duration > config.send_timeout);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }
}
