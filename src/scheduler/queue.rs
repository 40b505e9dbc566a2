use std::collections::VecDeque;

use crate::scheduler::job::ReplicaId;

/// FIFO of replicas waiting for a free node.
///
/// A replica is held at most once; pushing a replica that is already waiting
/// is refused.
#[derive(Debug, Default)]
pub struct JobQueue {
    replicas: VecDeque<ReplicaId>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a replica. Returns false if it is already queued.
    pub fn push(&mut self, replica: ReplicaId) -> bool {
        if self.contains(replica) {
            return false;
        }
        self.replicas.push_back(replica);
        true
    }

    /// Put a replica back at the head, keeping its turn.
    pub fn push_front(&mut self, replica: ReplicaId) -> bool {
        if self.contains(replica) {
            return false;
        }
        self.replicas.push_front(replica);
        true
    }

    pub fn pop(&mut self) -> Option<ReplicaId> {
        self.replicas.pop_front()
    }

    pub fn peek(&self) -> Option<ReplicaId> {
        self.replicas.front().copied()
    }

    pub fn contains(&self, replica: ReplicaId) -> bool {
        self.replicas.contains(&replica)
    }

    pub fn iter(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}
