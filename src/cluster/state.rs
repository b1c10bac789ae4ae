use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cluster::eligibility::{self, EligibilityOptions};
use crate::transform::TaskStatus;

/// A cluster member as seen by every other node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: u64,
    pub name: String,
    pub roles: BTreeSet<String>,
    pub attributes: BTreeMap<String, String>,
}

impl DiscoveryNode {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            roles: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.insert(role.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn is_transform_eligible(&self, options: &EligibilityOptions) -> bool {
        eligibility::is_eligible(&self.attributes, &self.roles, options)
    }
}

/// The cluster's decision that `node_id` runs `job_id`.
///
/// `allocation_id` is unique across the cluster's lifetime; a reassignment of
/// the same job always carries a larger value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub job_id: String,
    pub node_id: u64,
    pub allocation_id: u64,
    pub stop_requested: bool,
    /// Reason the job failed. Carried over when the job is reassigned and
    /// cleared only by a stop.
    pub failure: Option<String>,
}

/// Cluster-visible task status, published by the owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub node_id: u64,
    pub allocation_id: u64,
    pub status: TaskStatus,
    pub checkpoint: Option<u64>,
    pub retry_count: u32,
    pub last_failure: Option<String>,
}

/// Immutable snapshot of membership and assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub nodes: BTreeMap<u64, DiscoveryNode>,
    pub assignments: BTreeMap<String, Assignment>,
}

impl ClusterState {
    pub fn assignment(&self, job_id: &str) -> Option<&Assignment> {
        self.assignments.get(job_id)
    }

    pub fn assignments_for(&self, node_id: u64) -> impl Iterator<Item = &Assignment> {
        self.assignments
            .values()
            .filter(move |a| a.node_id == node_id)
    }

    /// Eligible member ids, in ascending order.
    pub fn eligible_nodes(&self, options: &EligibilityOptions) -> Vec<u64> {
        self.nodes
            .values()
            .filter(|n| n.is_transform_eligible(options))
            .map(|n| n.id)
            .collect()
    }

    /// Least-loaded eligible node; ties go to the lowest id.
    pub fn pick_node(&self, options: &EligibilityOptions) -> Option<u64> {
        self.eligible_nodes(options)
            .into_iter()
            .min_by_key(|&id| (self.assignments_for(id).count(), id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::eligibility::{DATA_ROLE, TRANSFORM_ENABLED_NODE_ATTR, TRANSFORM_ROLE};

    fn assignment(job: &str, node: u64, alloc: u64) -> Assignment {
        Assignment {
            job_id: job.to_string(),
            node_id: node,
            allocation_id: alloc,
            stop_requested: false,
            failure: None,
        }
    }

    #[test]
    fn pick_node_prefers_least_loaded() {
        let mut state = ClusterState::default();
        for id in 1..=3 {
            state.nodes.insert(
                id,
                DiscoveryNode::new(id, format!("node-{}", id)).with_role(TRANSFORM_ROLE),
            );
        }
        state.assignments.insert("a".into(), assignment("a", 1, 1));
        state.assignments.insert("b".into(), assignment("b", 2, 2));

        let options = EligibilityOptions::default();
        assert_eq!(state.pick_node(&options), Some(3));
    }

    #[test]
    fn pick_node_skips_ineligible() {
        let mut state = ClusterState::default();
        state.nodes.insert(
            1,
            DiscoveryNode::new(1, "master")
                .with_role("master")
                .with_attribute(TRANSFORM_ENABLED_NODE_ATTR, "false"),
        );
        state
            .nodes
            .insert(2, DiscoveryNode::new(2, "old-data").with_role(DATA_ROLE));

        let options = EligibilityOptions::default();
        assert_eq!(state.pick_node(&options), Some(2));

        let strict = EligibilityOptions {
            legacy_inference: false,
        };
        assert_eq!(state.pick_node(&strict), None);
    }
}
