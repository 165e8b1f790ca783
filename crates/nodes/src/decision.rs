//! Per-node decision procedures.
//!
//! [`decide`] maps (node, contact, clock) to the next step. It performs no I/O;
//! the returned [`SideEffect`] is applied by the caller, and only after it
//! succeeds is the decision persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::fnv1a_32;
use crate::{ContactAttributes, Node, NodeError, NodeKind, Variant};

/// What the decision procedures read besides the node itself.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub contact_email: &'a str,
    /// Contact snapshot; only consulted by `branch` and `filter`.
    pub attributes: &'a ContactAttributes,
    pub now: DateTime<Utc>,
}

/// Outcome of running one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Node to move to; `None` completes the enrollment.
    pub next_node_id: Option<String>,
    /// When the next node becomes due.
    pub scheduled_at: DateTime<Utc>,
    pub effect: Option<SideEffect>,
}

impl Decision {
    fn advance(next: &Option<String>, now: DateTime<Utc>) -> Self {
        Self { next_node_id: next.clone(), scheduled_at: now, effect: None }
    }

    fn with_effect(mut self, effect: SideEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.next_node_id.is_none()
    }
}

/// Work delegated to an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    SendEmail { template_id: String },
    AddToList { list_id: String, status: String },
    RemoveFromList { list_id: String },
}

/// Run the decision procedure matching the node's type.
///
/// # Errors
/// [`NodeError::Fatal`] when the node's configuration cannot produce a decision
/// (an `ab_test` with zero total weight, a delay that overflows the clock).
pub fn decide(node: &Node, input: &DecisionInput<'_>) -> Result<Decision, NodeError> {
    let now = input.now;

    let decision = match &node.kind {
        NodeKind::Trigger { next_node_id } => Decision::advance(next_node_id, now),

        NodeKind::Delay { config, next_node_id } => {
            let due = config
                .as_duration()
                .and_then(|wait| now.checked_add_signed(wait))
                .ok_or_else(|| {
                    NodeError::Fatal(format!("delay on node '{}' is out of range", node.id))
                })?;
            Decision { next_node_id: next_node_id.clone(), scheduled_at: due, effect: None }
        }

        NodeKind::Branch { paths, default_path_id } => {
            let next = paths
                .iter()
                .find(|path| path.conditions.evaluate(input.attributes))
                .map_or(default_path_id, |path| &path.next_node_id);
            Decision::advance(next, now)
        }

        NodeKind::Filter { config, continue_node_id, exit_node_id } => {
            let next = if config.conditions.evaluate(input.attributes) {
                continue_node_id
            } else {
                exit_node_id
            };
            Decision::advance(next, now)
        }

        NodeKind::AbTest { variants } => {
            let variant = pick_variant(input.contact_email, &node.id, variants).ok_or_else(|| {
                NodeError::Fatal(format!("ab_test node '{}' has no weighted variants", node.id))
            })?;
            Decision::advance(&variant.next_node_id, now)
        }

        NodeKind::AddToList { config, next_node_id } => Decision::advance(next_node_id, now)
            .with_effect(SideEffect::AddToList {
                list_id: config.list_id.clone(),
                status: config.status.clone(),
            }),

        NodeKind::RemoveFromList { config, next_node_id } => Decision::advance(next_node_id, now)
            .with_effect(SideEffect::RemoveFromList { list_id: config.list_id.clone() }),

        NodeKind::Email { config, next_node_id } => Decision::advance(next_node_id, now)
            .with_effect(SideEffect::SendEmail { template_id: config.template_id.clone() }),
    };

    Ok(decision)
}

/// Deterministic weighted pick: `FNV-1a(email + node_id) mod total_weight`,
/// then walk the variants in declared order until the running weight exceeds it.
///
/// Returns `None` when the variants carry no weight at all.
pub fn pick_variant<'v>(
    contact_email: &str,
    node_id: &str,
    variants: &'v [Variant],
) -> Option<&'v Variant> {
    let total: u64 = variants.iter().map(|v| u64::from(v.weight)).sum();
    if total == 0 {
        return None;
    }

    let key = format!("{contact_email}{node_id}");
    let bucket = u64::from(fnv1a_32(key.as_bytes())) % total;

    let mut running = 0u64;
    variants.iter().find(|variant| {
        running += u64::from(variant.weight);
        running > bucket
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn node(value: serde_json::Value) -> Node {
        serde_json::from_value(value).expect("valid node")
    }

    fn input<'a>(
        email: &'a str,
        attributes: &'a ContactAttributes,
        now: DateTime<Utc>,
    ) -> DecisionInput<'a> {
        DecisionInput { contact_email: email, attributes, now }
    }

    #[test]
    fn trigger_advances_immediately() {
        let now = Utc::now();
        let attrs = ContactAttributes::new();
        let n = node(json!({ "id": "t", "type": "trigger", "next_node_id": "a" }));

        let d = decide(&n, &input("jo@example.com", &attrs, now)).unwrap();
        assert_eq!(d.next_node_id.as_deref(), Some("a"));
        assert_eq!(d.scheduled_at, now);
        assert!(d.effect.is_none());
    }

    #[test]
    fn delay_schedules_in_the_future() {
        let now = Utc::now();
        let attrs = ContactAttributes::new();
        let n = node(json!({
            "id": "wait", "type": "delay",
            "config": { "duration": 5, "unit": "minutes" },
            "next_node_id": "mail"
        }));

        let d = decide(&n, &input("jo@example.com", &attrs, now)).unwrap();
        assert_eq!(d.scheduled_at, now + Duration::minutes(5));
        assert_eq!(d.next_node_id.as_deref(), Some("mail"));
    }

    #[test]
    fn branch_takes_first_match_then_default() {
        let n = node(json!({
            "id": "geo", "type": "branch",
            "paths": [
                { "id": "us",
                  "conditions": { "operator": "equals", "field": "country", "value": "US" },
                  "next_node_id": "us-mail" },
                { "id": "eu", "conditions": { "operator": "or", "children": [
                    { "operator": "equals", "field": "country", "value": "FR" },
                    { "operator": "equals", "field": "country", "value": "US" } ] },
                  "next_node_id": "eu-mail" }
            ],
            "default_path_id": "fallback"
        }));
        let now = Utc::now();

        let us = json!({ "country": "US" }).as_object().cloned().unwrap();
        let fr = json!({ "country": "FR" }).as_object().cloned().unwrap();
        let jp = json!({ "country": "JP" }).as_object().cloned().unwrap();

        let pick = |attrs: &ContactAttributes| {
            decide(&n, &input("a@b.c", attrs, now)).unwrap().next_node_id
        };
        assert_eq!(pick(&us).as_deref(), Some("us-mail"));
        assert_eq!(pick(&fr).as_deref(), Some("eu-mail"));
        assert_eq!(pick(&jp).as_deref(), Some("fallback"));
    }

    #[test]
    fn filter_routes_on_condition() {
        let n = node(json!({
            "id": "vip-only", "type": "filter",
            "config": { "conditions": { "operator": "equals", "field": "tier", "value": "vip" } },
            "continue_node_id": "perk",
            "exit_node_id": ""
        }));
        let now = Utc::now();
        let vip = json!({ "tier": "vip" }).as_object().cloned().unwrap();
        let free = json!({ "tier": "free" }).as_object().cloned().unwrap();

        let continued = decide(&n, &input("a@b.c", &vip, now)).unwrap();
        assert_eq!(continued.next_node_id.as_deref(), Some("perk"));
        assert!(decide(&n, &input("a@b.c", &free, now)).unwrap().is_terminal());
    }

    #[test]
    fn ab_test_is_deterministic_per_contact_and_node() {
        let variants = vec![
            Variant { id: "a".into(), weight: 50, next_node_id: Some("x".into()) },
            Variant { id: "b".into(), weight: 30, next_node_id: Some("y".into()) },
            Variant { id: "c".into(), weight: 20, next_node_id: Some("z".into()) },
        ];

        for i in 0..50 {
            let email = format!("user{i}@example.com");
            let first = pick_variant(&email, "split", &variants).unwrap();
            for _ in 0..10 {
                assert_eq!(pick_variant(&email, "split", &variants).unwrap(), first);
            }
        }
    }

    #[test]
    fn ab_test_bucket_walk_matches_hash() {
        let variants = vec![
            Variant { id: "a".into(), weight: 1, next_node_id: Some("x".into()) },
            Variant { id: "b".into(), weight: 1, next_node_id: Some("y".into()) },
        ];
        let email = "jo@example.com";
        let expected = if fnv1a_32(b"jo@example.comsplit") % 2 == 0 { "a" } else { "b" };

        assert_eq!(pick_variant(email, "split", &variants).unwrap().id, expected);
    }

    #[test]
    fn ab_test_spreads_across_variants() {
        let variants = vec![
            Variant { id: "a".into(), weight: 1, next_node_id: None },
            Variant { id: "b".into(), weight: 1, next_node_id: None },
        ];
        let picked_a = (0..200)
            .filter(|i| pick_variant(&format!("c{i}@x.io"), "n", &variants).unwrap().id == "a")
            .count();
        assert!(picked_a > 50 && picked_a < 150, "skewed split: {picked_a}");
    }

    #[test]
    fn ab_test_without_weight_is_fatal() {
        let n = node(json!({
            "id": "s", "type": "ab_test",
            "variants": [ { "weight": 0, "next_node_id": "x" } ]
        }));
        let attrs = ContactAttributes::new();
        assert!(matches!(
            decide(&n, &input("a@b.c", &attrs, Utc::now())),
            Err(NodeError::Fatal(_))
        ));
    }

    #[test]
    fn side_effect_nodes_carry_their_config() {
        let attrs = ContactAttributes::new();
        let now = Utc::now();

        let mail = node(json!({
            "id": "m", "type": "email",
            "config": { "template_id": "tpl-1" },
            "next_node_id": "j"
        }));
        assert_eq!(
            decide(&mail, &input("a@b.c", &attrs, now)).unwrap().effect,
            Some(SideEffect::SendEmail { template_id: "tpl-1".into() })
        );

        let join = node(json!({
            "id": "j", "type": "add_to_list",
            "config": { "list_id": "l1", "status": "unsubscribed" }
        }));
        let d = decide(&join, &input("a@b.c", &attrs, now)).unwrap();
        assert!(d.is_terminal());
        assert_eq!(
            d.effect,
            Some(SideEffect::AddToList { list_id: "l1".into(), status: "unsubscribed".into() })
        );

        let leave = node(json!({
            "id": "r", "type": "remove_from_list", "config": { "list_id": "l1" }
        }));
        assert_eq!(
            decide(&leave, &input("a@b.c", &attrs, now)).unwrap().effect,
            Some(SideEffect::RemoveFromList { list_id: "l1".into() })
        );
    }
}
