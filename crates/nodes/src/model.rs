//! Node graph types.
//!
//! Nodes live in an arena keyed by id; edges are plain id references. An
//! absent or empty reference marks a terminal edge: following it completes
//! the enrollment.
//!
//! Wire shape (one JSON object per node):
//!
//! ```json
//! { "id": "wait", "type": "delay", "config": { "duration": 5, "unit": "minutes" },
//!   "next_node_id": "welcome" }
//! ```

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Condition;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single step in an automation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the automation (referenced by other nodes).
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Type-specific behaviour and outgoing edges of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger {
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        next_node_id: Option<String>,
    },
    Email {
        config: EmailConfig,
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        next_node_id: Option<String>,
    },
    Delay {
        config: DelayConfig,
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        next_node_id: Option<String>,
    },
    AbTest {
        variants: Vec<Variant>,
    },
    Branch {
        paths: Vec<BranchPath>,
        /// Node taken when no path matches.
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        default_path_id: Option<String>,
    },
    Filter {
        config: FilterConfig,
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        continue_node_id: Option<String>,
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        exit_node_id: Option<String>,
    },
    AddToList {
        config: AddToListConfig,
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        next_node_id: Option<String>,
    },
    RemoveFromList {
        config: RemoveFromListConfig,
        #[serde(
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        next_node_id: Option<String>,
    },
}

impl Node {
    /// The `type` tag as it appears on the wire and in the execution log.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Trigger { .. } => "trigger",
            NodeKind::Email { .. } => "email",
            NodeKind::Delay { .. } => "delay",
            NodeKind::AbTest { .. } => "ab_test",
            NodeKind::Branch { .. } => "branch",
            NodeKind::Filter { .. } => "filter",
            NodeKind::AddToList { .. } => "add_to_list",
            NodeKind::RemoveFromList { .. } => "remove_from_list",
        }
    }

    /// Every node id this node may hand an enrollment to.
    pub fn successors(&self) -> Vec<&str> {
        let refs: Vec<Option<&String>> = match &self.kind {
            NodeKind::Trigger { next_node_id }
            | NodeKind::Email { next_node_id, .. }
            | NodeKind::Delay { next_node_id, .. }
            | NodeKind::AddToList { next_node_id, .. }
            | NodeKind::RemoveFromList { next_node_id, .. } => vec![next_node_id.as_ref()],
            NodeKind::AbTest { variants } => {
                variants.iter().map(|v| v.next_node_id.as_ref()).collect()
            }
            NodeKind::Branch { paths, default_path_id } => paths
                .iter()
                .map(|p| p.next_node_id.as_ref())
                .chain(std::iter::once(default_path_id.as_ref()))
                .collect(),
            NodeKind::Filter { continue_node_id, exit_node_id, .. } => {
                vec![continue_node_id.as_ref(), exit_node_id.as_ref()]
            }
        };
        refs.into_iter().flatten().map(String::as_str).collect()
    }

    /// Whether deciding this node needs the contact attribute snapshot.
    pub fn needs_contact(&self) -> bool {
        matches!(self.kind, NodeKind::Branch { .. } | NodeKind::Filter { .. })
    }
}

// ---------------------------------------------------------------------------
// Type-specific configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub template_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub duration: u32,
    pub unit: DelayUnit,
}

impl DelayConfig {
    /// The wait as a chrono duration, `None` if it does not fit.
    pub fn as_duration(&self) -> Option<Duration> {
        self.unit.of(self.duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn of(self, amount: u32) -> Option<Duration> {
        let amount = i64::from(amount);
        match self {
            Self::Seconds => Duration::try_seconds(amount),
            Self::Minutes => Duration::try_minutes(amount),
            Self::Hours => Duration::try_hours(amount),
            Self::Days => Duration::try_days(amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub conditions: Condition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToListConfig {
    pub list_id: String,
    /// Membership status written for the contact.
    #[serde(default = "default_list_status")]
    pub status: String,
}

fn default_list_status() -> String {
    "active".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFromListConfig {
    pub list_id: String,
}

// ---------------------------------------------------------------------------
// Fan-out edges
// ---------------------------------------------------------------------------

/// One weighted arm of an `ab_test` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default)]
    pub id: String,
    pub weight: u32,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

/// One conditional arm of a `branch` node. Paths are tried in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPath {
    #[serde(default)]
    pub id: String,
    pub conditions: Condition,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

/// Edge references treat `""` exactly like a missing reference.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_next_reference_is_terminal() {
        let node: Node = serde_json::from_value(json!({
            "id": "mail",
            "type": "email",
            "config": { "template_id": "welcome" },
            "next_node_id": ""
        }))
        .unwrap();

        assert_eq!(
            node.kind,
            NodeKind::Email {
                config: EmailConfig { template_id: "welcome".into() },
                next_node_id: None,
            }
        );
        assert!(node.successors().is_empty());
    }

    #[test]
    fn branch_successors_include_default() {
        let node: Node = serde_json::from_value(json!({
            "id": "split",
            "type": "branch",
            "paths": [
                { "id": "us",
                  "conditions": { "operator": "equals", "field": "country", "value": "US" },
                  "next_node_id": "us-mail" }
            ],
            "default_path_id": "other-mail"
        }))
        .unwrap();

        assert_eq!(node.type_name(), "branch");
        assert_eq!(node.successors(), vec!["us-mail", "other-mail"]);
        assert!(node.needs_contact());
    }

    #[test]
    fn add_to_list_status_defaults_to_active() {
        let node: Node = serde_json::from_value(json!({
            "id": "join",
            "type": "add_to_list",
            "config": { "list_id": "vip" }
        }))
        .unwrap();

        match node.kind {
            NodeKind::AddToList { config, next_node_id } => {
                assert_eq!(config.status, "active");
                assert!(next_node_id.is_none());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn delay_units_convert() {
        assert_eq!(DelayUnit::Minutes.of(5), Some(Duration::minutes(5)));
        assert_eq!(DelayUnit::Days.of(2), Some(Duration::hours(48)));
        assert_eq!(DelayUnit::Seconds.of(0), Some(Duration::zero()));
    }
}
