//! Graph validation, run before an automation definition is persisted.
//!
//! Rules enforced:
//! 1. The trigger names an event kind and the graph is non-empty.
//! 2. Every node is stored under its own id and the root exists.
//! 3. Every edge (next, variant, path, default, continue, exit) resolves.
//! 4. `ab_test` nodes carry positive total weight; delays fit the clock.
//! 5. The directed graph is acyclic (topological sort must succeed).
//!
//! Nodes unreachable from the root are reported with a warning only.
//! Returns a topologically-sorted list of node IDs on success.

use std::collections::{HashMap, HashSet, VecDeque};

use nodes::NodeKind;
use tracing::warn;

use crate::{models::AutomationDefinition, EngineError};

/// Validate the automation graph and return its nodes in topological order.
///
/// # Errors
/// Any of the validation variants of [`EngineError`].
pub fn validate_definition(def: &AutomationDefinition) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1-2. Shape: trigger, keys, root
    // -----------------------------------------------------------------------
    if def.trigger.event_kind.trim().is_empty() {
        return Err(EngineError::EmptyEventKind);
    }
    if def.nodes.is_empty() {
        return Err(EngineError::EmptyGraph);
    }
    for (key, node) in &def.nodes {
        if key != &node.id {
            return Err(EngineError::NodeIdMismatch { key: key.clone(), id: node.id.clone() });
        }
    }
    if !def.nodes.contains_key(&def.root_node_id) {
        return Err(EngineError::UnknownRoot(def.root_node_id.clone()));
    }

    // -----------------------------------------------------------------------
    // 3-4. Edges and per-type configuration
    // -----------------------------------------------------------------------
    for node in def.nodes.values() {
        for target in node.successors() {
            if !def.nodes.contains_key(target) {
                return Err(EngineError::DanglingReference {
                    node_id: node.id.clone(),
                    target: target.to_owned(),
                });
            }
        }

        match &node.kind {
            NodeKind::AbTest { variants } => {
                if variants.iter().map(|v| u64::from(v.weight)).sum::<u64>() == 0 {
                    return Err(EngineError::InvalidVariants(node.id.clone()));
                }
            }
            NodeKind::Delay { config, .. } if config.as_duration().is_none() => {
                return Err(EngineError::InvalidDelay(node.id.clone()));
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // 5. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut in_degree: HashMap<&str, usize> =
        def.nodes.keys().map(|id| (id.as_str(), 0)).collect();

    for node in def.nodes.values() {
        // Several arms may share a target; count each distinct edge once.
        let targets: HashSet<&str> = node.successors().into_iter().collect();
        for target in targets {
            *in_degree.entry(target).or_insert(0) += 1;
        }
    }

    // Seed with zero in-degree nodes; BTreeMap iteration keeps this deterministic.
    let mut queue: VecDeque<&str> = def
        .nodes
        .keys()
        .map(String::as_str)
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(def.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_owned());

        let targets: HashSet<&str> = def.nodes[node_id].successors().into_iter().collect();
        let mut targets: Vec<&str> = targets.into_iter().collect();
        targets.sort_unstable();
        for target in targets {
            let deg = in_degree.entry(target).or_insert(0);
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(target);
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != def.nodes.len() {
        return Err(EngineError::CycleDetected);
    }

    let reachable = reachable_from_root(def);
    let unreachable: Vec<&str> = def
        .nodes
        .keys()
        .map(String::as_str)
        .filter(|id| !reachable.contains(id))
        .collect();
    if !unreachable.is_empty() {
        warn!("automation '{}' has nodes unreachable from root: {:?}", def.name, unreachable);
    }

    Ok(sorted)
}

fn reachable_from_root(def: &AutomationDefinition) -> HashSet<&str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![def.root_node_id.as_str()];

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(node) = def.nodes.get(id) {
            stack.extend(node.successors());
        }
    }
    seen
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn definition(root: &str, nodes: Value) -> AutomationDefinition {
        serde_json::from_value(json!({
            "name": "test",
            "trigger": { "event_kind": "test_event", "frequency": "once" },
            "root_node_id": root,
            "nodes": nodes
        }))
        .expect("definition should parse")
    }

    #[test]
    fn linear_graph_returns_sorted_order() {
        // start → wait → mail
        let def = definition("start", json!({
            "start": { "id": "start", "type": "trigger", "next_node_id": "wait" },
            "wait": { "id": "wait", "type": "delay",
                      "config": { "duration": 1, "unit": "days" }, "next_node_id": "mail" },
            "mail": { "id": "mail", "type": "email", "config": { "template_id": "t" } }
        }));

        let sorted = validate_definition(&def).expect("should be valid");
        assert_eq!(sorted, vec!["start", "wait", "mail"]);
    }

    #[test]
    fn diamond_through_branch() {
        //     start
        //       |
        //     geo
        //    /    \
        //  us      other
        //    \    /
        //     done
        let def = definition("start", json!({
            "start": { "id": "start", "type": "trigger", "next_node_id": "geo" },
            "geo": { "id": "geo", "type": "branch",
                     "paths": [ {
                         "id": "p",
                         "conditions": { "operator": "equals", "field": "country", "value": "US" },
                         "next_node_id": "us"
                     } ],
                     "default_path_id": "other" },
            "us": { "id": "us", "type": "email",
                    "config": { "template_id": "us" }, "next_node_id": "done" },
            "other": { "id": "other", "type": "email",
                       "config": { "template_id": "other" }, "next_node_id": "done" },
            "done": { "id": "done", "type": "add_to_list", "config": { "list_id": "l" } }
        }));

        let sorted = validate_definition(&def).expect("should be valid");
        assert_eq!(sorted.first().unwrap(), "start");
        assert_eq!(sorted.last().unwrap(), "done");
        assert_eq!(sorted.len(), 5);
    }

    #[test]
    fn variants_sharing_a_target_are_not_a_cycle() {
        let def = definition("split", json!({
            "split": { "id": "split", "type": "ab_test", "variants": [
                { "id": "a", "weight": 1, "next_node_id": "mail" },
                { "id": "b", "weight": 1, "next_node_id": "mail" } ] },
            "mail": { "id": "mail", "type": "email", "config": { "template_id": "t" } }
        }));
        assert_eq!(validate_definition(&def).unwrap(), vec!["split", "mail"]);
    }

    #[test]
    fn missing_root_is_rejected() {
        let def = definition("ghost", json!({
            "start": { "id": "start", "type": "trigger" }
        }));
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::UnknownRoot(id)) if id == "ghost"
        ));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let def = definition("start", json!({
            "start": { "id": "start", "type": "filter",
                       "config": { "conditions": { "operator": "is_set", "field": "phone" } },
                       "continue_node_id": "ghost" }
        }));
        assert!(matches!(
            validate_definition(&def),
            Err(EngineError::DanglingReference { target, .. }) if target == "ghost"
        ));
    }

    #[test]
    fn key_must_match_node_id() {
        let def = definition("start", json!({
            "start": { "id": "begin", "type": "trigger" }
        }));
        assert!(matches!(validate_definition(&def), Err(EngineError::NodeIdMismatch { .. })));
    }

    #[test]
    fn weightless_ab_test_is_rejected() {
        let def = definition("split", json!({
            "split": { "id": "split", "type": "ab_test", "variants": [] }
        }));
        assert!(matches!(validate_definition(&def), Err(EngineError::InvalidVariants(_))));
    }

    #[test]
    fn cycle_is_detected() {
        // a → b → a
        let def = definition("a", json!({
            "a": { "id": "a", "type": "email",
                   "config": { "template_id": "t" }, "next_node_id": "b" },
            "b": { "id": "b", "type": "delay",
                   "config": { "duration": 1, "unit": "hours" }, "next_node_id": "a" }
        }));
        assert!(matches!(validate_definition(&def), Err(EngineError::CycleDetected)));
    }

    #[test]
    fn empty_trigger_and_graph_are_rejected() {
        let mut def = definition("start", json!({ "start": { "id": "start", "type": "trigger" } }));
        def.trigger.event_kind = " ".into();
        assert!(matches!(validate_definition(&def), Err(EngineError::EmptyEventKind)));

        let def = definition("start", json!({}));
        assert!(matches!(validate_definition(&def), Err(EngineError::EmptyGraph)));
    }

    #[test]
    fn single_terminal_trigger_is_valid() {
        let def = definition("solo", json!({
            "solo": { "id": "solo", "type": "trigger", "next_node_id": "" }
        }));
        assert_eq!(validate_definition(&def).unwrap(), vec!["solo"]);
    }
}
