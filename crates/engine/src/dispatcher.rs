//! Trigger Dispatcher: turns contact timeline events into enrollments.
//!
//! Call [`TriggerDispatcher::evaluate_trigger`] after the event is durably
//! recorded. For every live automation subscribed to the event kind it
//! enrolls the contact, gated for `once` automations by the trigger log's
//! unique `(automation_id, contact_email)` key. The gate and the enrollment
//! are written in one store transaction, so a lost race is a plain
//! [`TriggerOutcome::Duplicate`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{ContactAutomationRow, NewLogEntry};
use db::{AutomationStore, EnrollOutcome, NewEnrollment};
use nodes::{decide, ContactAttributes, DecisionInput, NodeKind};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::models::{
    normalize_email, Automation, ContactTimelineEvent, EnrollmentStatus, Frequency, LogAction,
};
use crate::EngineError;

/// What happened for one matching automation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enrolled { automation_id: Uuid, enrollment_id: Uuid },
    /// A `once` automation already fired for this contact.
    Duplicate { automation_id: Uuid },
}

pub struct TriggerDispatcher {
    store: Arc<dyn AutomationStore>,
    config: DispatcherConfig,
}

impl TriggerDispatcher {
    pub fn new(store: Arc<dyn AutomationStore>, config: DispatcherConfig) -> Self {
        Self { store, config }
    }

    pub async fn evaluate_trigger(
        &self,
        event: &ContactTimelineEvent,
    ) -> Result<Vec<TriggerOutcome>, EngineError> {
        self.evaluate_trigger_at(event, Utc::now()).await
    }

    /// [`Self::evaluate_trigger`] with an explicit clock.
    ///
    /// # Errors
    /// [`EngineError::MissingContact`] for an event without an address, or a
    /// persistence failure. Enrollments written before the failure stay.
    #[instrument(
        skip(self, event),
        fields(workspace_id = %event.workspace_id, event_kind = %event.event_kind)
    )]
    pub async fn evaluate_trigger_at(
        &self,
        event: &ContactTimelineEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<TriggerOutcome>, EngineError> {
        let email = normalize_email(&event.contact_email);
        if email.is_empty() {
            return Err(EngineError::MissingContact);
        }

        let rows = self
            .store
            .live_automations_for_event(&event.workspace_id, &event.event_kind)
            .await?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let automation_id = row.id;
            let automation = match Automation::from_row(row) {
                Ok(a) => a,
                Err(err) => {
                    warn!(%automation_id, "skipping unreadable automation: {}", err);
                    continue;
                }
            };

            let new = self.plan_enrollment(&automation, &email, event, now);
            let enrollment_id = new.row.id;

            match self.store.enroll(new).await? {
                EnrollOutcome::Enrolled(row) => {
                    info!(
                        %automation_id, %enrollment_id,
                        "enrolled {} at node {:?}", email, row.current_node_id
                    );
                    outcomes.push(TriggerOutcome::Enrolled { automation_id, enrollment_id });
                }
                EnrollOutcome::Duplicate => {
                    debug!(%automation_id, "{} already entered this automation", email);
                    outcomes.push(TriggerOutcome::Duplicate { automation_id });
                }
            }
        }

        Ok(outcomes)
    }

    /// Build the enrollment row and its opening log entries.
    ///
    /// A `trigger` root is executed right away, and a `delay` right behind it
    /// too, so the row's `scheduled_at` already points at real work.
    fn plan_enrollment(
        &self,
        automation: &Automation,
        email: &str,
        event: &ContactTimelineEvent,
        now: DateTime<Utc>,
    ) -> NewEnrollment {
        let root_id = automation.definition.root_node_id.clone();
        let mut logs = vec![NewLogEntry::new(root_id.clone(), LogAction::Entered, now)];

        let mut status = EnrollmentStatus::Active;
        let mut current_node_id = Some(root_id.clone());
        let mut scheduled_at = Some(now);

        let no_attributes = ContactAttributes::new();
        let input = DecisionInput { contact_email: email, attributes: &no_attributes, now };

        let trigger_root = automation.root().filter(|n| matches!(n.kind, NodeKind::Trigger { .. }));
        if let Some(root) = trigger_root {
            if let Ok(decision) = decide(root, &input) {
                logs.push(NewLogEntry::new(root_id.clone(), LogAction::Executed, now));

                match decision.next_node_id {
                    None => {
                        logs.push(NewLogEntry::new(root_id, LogAction::Completed, now));
                        status = EnrollmentStatus::Completed;
                        scheduled_at = None;
                    }
                    Some(next_id) => {
                        current_node_id = Some(next_id.clone());

                        let next = automation.node(&next_id).filter(|n| {
                            matches!(&n.kind, NodeKind::Delay { next_node_id: Some(_), .. })
                        });
                        if let Some(delay) = next {
                            if let Ok(waited) = decide(delay, &input) {
                                logs.push(NewLogEntry::new(next_id, LogAction::Executed, now));
                                current_node_id = waited.next_node_id;
                                scheduled_at = Some(waited.scheduled_at);
                            }
                        }
                    }
                }
            }
        }

        NewEnrollment {
            row: ContactAutomationRow {
                id: Uuid::new_v4(),
                workspace_id: automation.workspace_id.clone(),
                automation_id: automation.id,
                contact_email: email.to_owned(),
                status: status.as_str().to_owned(),
                current_node_id,
                scheduled_at,
                entered_at: now,
                context: event.data.clone(),
                retry_count: 0,
                max_retries: self.config.max_retries,
                locked_by: None,
                locked_until: None,
                updated_at: now,
            },
            dedup: automation.frequency() == Frequency::Once,
            logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use db::MemoryStore;
    use serde_json::json;

    async fn live_automation(
        store: &MemoryStore,
        frequency: &str,
        nodes: serde_json::Value,
    ) -> Automation {
        let definition = serde_json::from_value(json!({
            "name": "test",
            "trigger": { "event_kind": "test_event", "frequency": frequency },
            "root_node_id": "start",
            "nodes": nodes
        }))
        .unwrap();
        let mut automation = Automation::new("ws", definition, Utc::now());
        automation.status = crate::models::AutomationStatus::Live;
        store.insert_automation(&automation.to_row().unwrap()).await.unwrap();
        automation
    }

    fn event(email: &str) -> ContactTimelineEvent {
        ContactTimelineEvent::new("ws", email, "test_event", json!({ "source": "import" }))
    }

    #[tokio::test]
    async fn trigger_root_is_advanced_eagerly() {
        let store = Arc::new(MemoryStore::new());
        let automation = live_automation(&store, "every_time", json!({
            "start": { "id": "start", "type": "trigger", "next_node_id": "mail" },
            "mail": { "id": "mail", "type": "email", "config": { "template_id": "t" } }
        }))
        .await;
        let dispatcher = TriggerDispatcher::new(store.clone(), DispatcherConfig::default());
        let now = Utc::now();

        let outcomes = dispatcher.evaluate_trigger_at(&event(" Jo@X.io "), now).await.unwrap();
        let [TriggerOutcome::Enrolled { enrollment_id, .. }] = outcomes.as_slice() else {
            panic!("expected one enrollment, got {outcomes:?}");
        };

        let row = store.get_enrollment(*enrollment_id).await.unwrap();
        assert_eq!(row.contact_email, "jo@x.io");
        assert_eq!(row.current_node_id.as_deref(), Some("mail"));
        assert_eq!(row.scheduled_at, Some(now));
        assert_eq!(row.max_retries, 3);
        assert_eq!(row.context, json!({ "source": "import" }));

        let actions: Vec<String> = store
            .execution_log(*enrollment_id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.action)
            .collect();
        assert_eq!(actions, vec!["entered", "executed"]);
        assert_eq!(automation.id, row.automation_id);
    }

    #[tokio::test]
    async fn delay_after_trigger_is_scheduled_at_enrollment() {
        let store = Arc::new(MemoryStore::new());
        live_automation(&store, "once", json!({
            "start": { "id": "start", "type": "trigger", "next_node_id": "wait" },
            "wait": { "id": "wait", "type": "delay",
                      "config": { "duration": 5, "unit": "minutes" }, "next_node_id": "mail" },
            "mail": { "id": "mail", "type": "email", "config": { "template_id": "t" } }
        }))
        .await;
        let dispatcher = TriggerDispatcher::new(store.clone(), DispatcherConfig::default());
        let now = Utc::now();

        let outcomes = dispatcher.evaluate_trigger_at(&event("jo@x.io"), now).await.unwrap();
        let TriggerOutcome::Enrolled { enrollment_id, .. } = outcomes[0] else { panic!() };

        let row = store.get_enrollment(enrollment_id).await.unwrap();
        assert_eq!(row.current_node_id.as_deref(), Some("mail"));
        assert_eq!(row.scheduled_at, Some(now + Duration::minutes(5)));
    }

    #[tokio::test]
    async fn terminal_trigger_completes_immediately() {
        let store = Arc::new(MemoryStore::new());
        live_automation(&store, "once", json!({
            "start": { "id": "start", "type": "trigger", "next_node_id": "" }
        }))
        .await;
        let dispatcher = TriggerDispatcher::new(store.clone(), DispatcherConfig::default());

        let outcomes = dispatcher.evaluate_trigger(&event("jo@x.io")).await.unwrap();
        let TriggerOutcome::Enrolled { enrollment_id, .. } = outcomes[0] else { panic!() };

        let row = store.get_enrollment(enrollment_id).await.unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.scheduled_at, None);
        assert_eq!(row.current_node_id.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn once_dedups_per_contact() {
        let store = Arc::new(MemoryStore::new());
        live_automation(&store, "once", json!({
            "start": { "id": "start", "type": "trigger", "next_node_id": "" }
        }))
        .await;
        let dispatcher = TriggerDispatcher::new(store.clone(), DispatcherConfig::default());

        let first = dispatcher.evaluate_trigger(&event("jo@x.io")).await.unwrap();
        let second = dispatcher.evaluate_trigger(&event("JO@x.io")).await.unwrap();
        let other = dispatcher.evaluate_trigger(&event("al@x.io")).await.unwrap();

        assert!(matches!(first[0], TriggerOutcome::Enrolled { .. }));
        assert!(matches!(second[0], TriggerOutcome::Duplicate { .. }));
        assert!(matches!(other[0], TriggerOutcome::Enrolled { .. }));
        assert_eq!(store.trigger_log_len().await, 2);
    }

    #[tokio::test]
    async fn unmatched_events_and_blank_contacts() {
        let store = Arc::new(MemoryStore::new());
        live_automation(&store, "once", json!({
            "start": { "id": "start", "type": "trigger" }
        }))
        .await;
        let dispatcher = TriggerDispatcher::new(store.clone(), DispatcherConfig::default());

        let other_kind = ContactTimelineEvent::new("ws", "jo@x.io", "join_segment", json!({}));
        assert!(dispatcher.evaluate_trigger(&other_kind).await.unwrap().is_empty());

        let other_ws = ContactTimelineEvent::new("ws-2", "jo@x.io", "test_event", json!({}));
        assert!(dispatcher.evaluate_trigger(&other_ws).await.unwrap().is_empty());

        assert!(matches!(
            dispatcher.evaluate_trigger(&event("   ")).await,
            Err(EngineError::MissingContact)
        ));
    }
}
