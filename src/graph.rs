//! Status graph: immutable per-definition lookup structure and its cache

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::definition::{WorkflowDefinition, WorkflowStatus, WorkflowTransition};

/// Indexed, read-only view over one definition's statuses and transitions.
///
/// Built once per definition load. Definitions are stored content-addressed,
/// so a graph can never observe a half-edited definition: editing produces a
/// new hash and therefore a new graph, while callers holding the old one keep
/// a consistent snapshot.
#[derive(Debug)]
pub struct StatusGraph {
    definition_id: String,
    statuses: BTreeMap<String, WorkflowStatus>,
    transitions: BTreeMap<String, WorkflowTransition>,
    outgoing: BTreeMap<String, Vec<String>>, // status key -> transition ids, declared order
    initial_key: String,
}

impl StatusGraph {
    pub fn build(definition_id: &str, definition: &WorkflowDefinition) -> Self {
        let mut statuses = BTreeMap::new();
        for status in &definition.statuses {
            statuses.insert(status.key.clone(), status.clone());
        }

        let mut transitions = BTreeMap::new();
        let mut outgoing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut ordered = definition.transitions.clone();
        ordered.sort_by_key(|t| t.display_order);
        for transition in ordered {
            outgoing
                .entry(transition.from_status_key.clone())
                .or_default()
                .push(transition.id.clone());
            transitions.insert(transition.id.clone(), transition);
        }

        Self {
            definition_id: definition_id.to_string(),
            statuses,
            transitions,
            outgoing,
            initial_key: definition.initial_status().key.clone(),
        }
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn status(&self, key: &str) -> Option<&WorkflowStatus> {
        self.statuses.get(key)
    }

    pub fn initial_status(&self) -> &WorkflowStatus {
        &self.statuses[&self.initial_key]
    }

    pub fn is_terminal(&self, key: &str) -> bool {
        self.statuses.get(key).is_some_and(|s| s.is_terminal)
    }

    /// Outgoing transitions of a status, in display order. Terminal statuses
    /// always return an empty list.
    pub fn transitions_from(&self, status_key: &str) -> Vec<&WorkflowTransition> {
        match self.outgoing.get(status_key) {
            Some(ids) => ids.iter().filter_map(|id| self.transitions.get(id)).collect(),
            None => vec![],
        }
    }

    pub fn transition(&self, from_key: &str, to_key: &str) -> Option<&WorkflowTransition> {
        self.transitions_from(from_key)
            .into_iter()
            .find(|t| t.to_status_key == to_key)
    }

    pub fn transition_by_id(&self, id: &str) -> Option<&WorkflowTransition> {
        self.transitions.get(id)
    }
}

/// Cache of built graphs keyed by definition content hash.
///
/// Because keys are content hashes an entry can never go stale; invalidation
/// exists only to release retired definitions.
#[derive(Default)]
pub struct GraphCache {
    inner: RwLock<HashMap<String, Arc<StatusGraph>>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build<F>(&self, definition_id: &str, load: F) -> anyhow::Result<Arc<StatusGraph>>
    where
        F: FnOnce() -> anyhow::Result<WorkflowDefinition>,
    {
        if let Ok(cache) = self.inner.read()
            && let Some(graph) = cache.get(definition_id)
        {
            return Ok(Arc::clone(graph));
        }

        let graph = Arc::new(StatusGraph::build(definition_id, &load()?));

        if let Ok(mut cache) = self.inner.write() {
            cache.insert(definition_id.to_string(), Arc::clone(&graph));
        }

        Ok(graph)
    }

    pub fn invalidate(&self, definition_id: &str) {
        if let Ok(mut cache) = self.inner.write() {
            cache.remove(definition_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{WorkflowStatus, WorkflowTransition};

    fn sample_graph() -> StatusGraph {
        let def = WorkflowDefinition::draft("tenant_a", "purchase_order", "PO Approval")
            .status(WorkflowStatus::new("draft", "Draft").initial())
            .status(WorkflowStatus::new("pending", "Pending Finance"))
            .status(WorkflowStatus::new("approved", "Approved").terminal())
            .transition(WorkflowTransition::new("draft", "pending").allow_role("submitter"))
            .transition(WorkflowTransition::new("pending", "approved").allow_role("finance"))
            .build()
            .unwrap();
        StatusGraph::build("defhash", &def)
    }

    #[test]
    fn graph_queries() {
        let graph = sample_graph();

        assert_eq!(graph.initial_status().key, "draft");
        assert!(graph.is_terminal("approved"));
        assert!(!graph.is_terminal("draft"));

        let from_draft = graph.transitions_from("draft");
        assert_eq!(from_draft.len(), 1);
        assert_eq!(from_draft[0].to_status_key, "pending");

        assert!(graph.transition("draft", "pending").is_some());
        assert!(graph.transition("draft", "approved").is_none());
        assert!(graph.transitions_from("approved").is_empty());
    }

    #[test]
    fn cache_returns_the_same_snapshot_until_invalidated() {
        let cache = GraphCache::new();
        let def = WorkflowDefinition::draft("tenant_a", "purchase_order", "PO Approval")
            .status(WorkflowStatus::new("draft", "Draft").initial())
            .build()
            .unwrap();

        let first = cache
            .get_or_build("defhash", || Ok(def.clone()))
            .unwrap();
        let second = cache
            .get_or_build("defhash", || panic!("must come from cache"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.invalidate("defhash");
        let third = cache.get_or_build("defhash", || Ok(def.clone())).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
