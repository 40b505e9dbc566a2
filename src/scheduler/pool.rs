use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::NodeConfig;
use crate::error::{Result, TransportError};
use crate::scheduler::job::ReplicaId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Idle,
    Busy(ReplicaId),
}

/// Fixed registry of worker nodes and their idle/busy status.
///
/// Node identity is the index into the list given at construction.
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<NodeConfig>,
    status: Vec<NodeStatus>,
}

impl NodePool {
    pub fn new(nodes: Vec<NodeConfig>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(TransportError::InvalidConfig(
                "node pool cannot be empty".to_string(),
            ));
        }
        for node in &nodes {
            node.validate()?;
        }
        let status = vec![NodeStatus::Idle; nodes.len()];
        Ok(Self { nodes, status })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&NodeConfig> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    pub fn status(&self, index: usize) -> Option<NodeStatus> {
        self.status.get(index).copied()
    }

    pub fn idle_nodes(&self) -> Vec<usize> {
        self.status
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == NodeStatus::Idle)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn busy_nodes(&self) -> Vec<(usize, ReplicaId)> {
        self.status
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                NodeStatus::Busy(replica) => Some((i, *replica)),
                NodeStatus::Idle => None,
            })
            .collect()
    }

    /// Pick an idle node uniformly at random. Does not mark it busy.
    pub fn available_node(&self) -> Option<usize> {
        self.available_node_with(&mut rand::thread_rng())
    }

    pub fn available_node_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        self.idle_nodes().choose(rng).copied()
    }

    /// Mark a node busy with `replica`. Refuses unknown or already busy nodes.
    pub fn mark_busy(&mut self, index: usize, replica: ReplicaId) -> bool {
        match self.status.get_mut(index) {
            None => {
                tracing::warn!(node = index, "mark_busy: unknown node id");
                false
            }
            Some(NodeStatus::Busy(current)) => {
                tracing::warn!(
                    node = index,
                    current = *current,
                    replica,
                    "mark_busy: node already busy"
                );
                false
            }
            Some(slot) => {
                *slot = NodeStatus::Busy(replica);
                true
            }
        }
    }

    /// Return a node to idle, yielding the replica it was running.
    pub fn free(&mut self, index: usize) -> Option<ReplicaId> {
        match self.status.get_mut(index) {
            None => {
                tracing::warn!(node = index, "free: unknown node id");
                None
            }
            Some(NodeStatus::Idle) => {
                tracing::warn!(node = index, "free: node already idle");
                None
            }
            Some(slot) => {
                let previous = *slot;
                *slot = NodeStatus::Idle;
                match previous {
                    NodeStatus::Busy(replica) => Some(replica),
                    NodeStatus::Idle => None,
                }
            }
        }
    }
}
