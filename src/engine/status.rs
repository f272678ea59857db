//! Per-node status tracking for an ordered step graph.
//!
//! Status lives outside the nodes themselves so a new run can reset every
//! node to `pending` without touching the graph. Within one run a node only
//! moves forward along `pending -> running -> {passed, failed}`; regressive
//! marks are ignored and logged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::engine::types::StepNode;

/// Observable status of one step node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl NodeStatus {
    /// Rank along the forward-only transition order
    fn rank(self) -> u8 {
        match self {
            NodeStatus::Pending => 0,
            NodeStatus::Running => 1,
            NodeStatus::Passed => 2,
            NodeStatus::Failed => 2,
        }
    }

    /// Whether the node has reached a terminal state for this run
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Passed | NodeStatus::Failed)
    }
}

/// Aggregate outcome of a run over all nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    InProgress,
    Passed,
    Failed,
}

/// Status board: the node status machine for one ordered step graph.
///
/// Keyed by node id; node order is the declared sequence and drives both
/// index correlation and the `"CURRENT"` failure scan.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    nodes: Vec<StepNode>,
    statuses: HashMap<String, NodeStatus>,
    screenshots: HashMap<String, PathBuf>,
    errors: HashMap<String, String>,
}

impl StatusBoard {
    /// Create a board with every node `pending`
    pub fn new(nodes: Vec<StepNode>) -> Self {
        let statuses = nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect();
        Self {
            nodes,
            statuses,
            screenshots: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    /// Reset every node to `pending` and clear captured evidence paths.
    /// Called exactly once, synchronously, when a new run is requested.
    pub fn reset(&mut self) {
        for node in &self.nodes {
            self.statuses.insert(node.id.clone(), NodeStatus::Pending);
        }
        self.screenshots.clear();
        self.errors.clear();
    }

    /// The ordered nodes this board tracks
    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    /// Node at a 1-based external step index (index 0 is the reserved
    /// navigation step and maps to no node)
    pub fn node_at(&self, step_index: usize) -> Option<&StepNode> {
        if step_index == 0 {
            return None;
        }
        self.nodes.get(step_index - 1)
    }

    /// Current status of a node id
    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.statuses.get(id).copied()
    }

    /// Mark a node, enforcing forward-only transitions within a run
    pub fn mark(&mut self, id: &str, status: NodeStatus) {
        let Some(current) = self.statuses.get_mut(id) else {
            debug!(node = id, "mark for unknown node id ignored");
            return;
        };
        if status.rank() < current.rank() || current.is_terminal() {
            debug!(node = id, ?current, ?status, "regressive status mark ignored");
            return;
        }
        *current = status;
    }

    /// Attach a failure screenshot path to a node
    pub fn set_screenshot(&mut self, id: &str, path: PathBuf) {
        self.screenshots.insert(id.to_string(), path);
    }

    /// Attach an error message to a node
    pub fn set_error(&mut self, id: &str, error: String) {
        self.errors.insert(id.to_string(), error);
    }

    /// Screenshot captured for a node, if any
    pub fn screenshot(&self, id: &str) -> Option<&PathBuf> {
        self.screenshots.get(id)
    }

    /// Error recorded for a node, if any
    pub fn error(&self, id: &str) -> Option<&str> {
        self.errors.get(id).map(String::as_str)
    }

    /// First node in declared order whose status is `running` or `pending`.
    ///
    /// Used to resolve the `"CURRENT"` sentinel. Best-effort: with
    /// branching or looping scripts the pick can be wrong, and that
    /// ambiguity is accepted rather than silently resolved.
    pub fn first_unresolved(&self) -> Option<&StepNode> {
        self.nodes.iter().find(|n| {
            matches!(
                self.statuses.get(&n.id),
                Some(NodeStatus::Running) | Some(NodeStatus::Pending)
            )
        })
    }

    /// Number of nodes that reached `passed`
    pub fn total_passed(&self) -> usize {
        self.count(NodeStatus::Passed)
    }

    /// Number of nodes that reached `failed`
    pub fn total_failed(&self) -> usize {
        self.count(NodeStatus::Failed)
    }

    fn count(&self, status: NodeStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    /// Aggregate run outcome over all nodes
    pub fn outcome(&self) -> RunOutcome {
        if self.total_failed() > 0 {
            RunOutcome::Failed
        } else if !self.nodes.is_empty() && self.total_passed() == self.nodes.len() {
            RunOutcome::Passed
        } else {
            RunOutcome::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::StepKind;
    use pretty_assertions::assert_eq;

    fn nodes(n: usize) -> Vec<StepNode> {
        (1..=n)
            .map(|i| StepNode {
                id: i.to_string(),
                kind: if i % 2 == 0 {
                    StepKind::Assertion
                } else {
                    StepKind::Action
                },
                label: format!("step {i}"),
                selector: None,
            })
            .collect()
    }

    #[test]
    fn starts_all_pending() {
        let board = StatusBoard::new(nodes(3));
        for id in ["1", "2", "3"] {
            assert_eq!(board.status(id), Some(NodeStatus::Pending));
        }
        assert_eq!(board.outcome(), RunOutcome::InProgress);
    }

    #[test]
    fn forward_transitions_only() {
        let mut board = StatusBoard::new(nodes(2));
        board.mark("1", NodeStatus::Running);
        board.mark("1", NodeStatus::Passed);
        // Terminal: later marks are ignored
        board.mark("1", NodeStatus::Running);
        assert_eq!(board.status("1"), Some(NodeStatus::Passed));
        board.mark("1", NodeStatus::Failed);
        assert_eq!(board.status("1"), Some(NodeStatus::Passed));
    }

    #[test]
    fn reset_returns_everything_to_pending() {
        let mut board = StatusBoard::new(nodes(3));
        board.mark("1", NodeStatus::Passed);
        board.mark("2", NodeStatus::Failed);
        board.set_screenshot("2", PathBuf::from("/tmp/s.png"));
        board.set_error("2", "boom".to_string());
        board.reset();
        for id in ["1", "2", "3"] {
            assert_eq!(board.status(id), Some(NodeStatus::Pending));
        }
        assert_eq!(board.screenshot("2"), None);
        assert_eq!(board.error("2"), None);
    }

    #[test]
    fn node_index_offset() {
        let board = StatusBoard::new(nodes(3));
        assert!(board.node_at(0).is_none());
        assert_eq!(board.node_at(1).unwrap().id, "1");
        assert_eq!(board.node_at(3).unwrap().id, "3");
        assert!(board.node_at(4).is_none());
    }

    #[test]
    fn first_unresolved_scans_in_order() {
        let mut board = StatusBoard::new(nodes(3));
        board.mark("1", NodeStatus::Passed);
        board.mark("2", NodeStatus::Running);
        assert_eq!(board.first_unresolved().unwrap().id, "2");
        board.mark("2", NodeStatus::Passed);
        assert_eq!(board.first_unresolved().unwrap().id, "3");
        board.mark("3", NodeStatus::Failed);
        assert!(board.first_unresolved().is_none());
    }

    #[test]
    fn outcome_aggregation() {
        let mut board = StatusBoard::new(nodes(2));
        board.mark("1", NodeStatus::Passed);
        assert_eq!(board.outcome(), RunOutcome::InProgress);
        board.mark("2", NodeStatus::Passed);
        assert_eq!(board.outcome(), RunOutcome::Passed);

        let mut board = StatusBoard::new(nodes(2));
        board.mark("1", NodeStatus::Failed);
        assert_eq!(board.outcome(), RunOutcome::Failed);
    }
}
