//! Priority queue of pending transactions
//!
//! Keyed by `(priority, seq)`, so the first entry is always the most urgent
//! transaction and ties resolve in enqueue order. A transaction keeps its
//! sequence number when it is put back between steps.

use super::operation::{Operation, Step};
use super::priority::PriorityClass;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Pending transactions for one link
#[derive(Debug)]
pub struct OpQueue<S: Step> {
    ops: BTreeMap<(PriorityClass, u64), Operation<S>>,
    next_seq: u64,
}

impl<S: Step> OpQueue<S> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Check if an equivalent transaction is already queued
    pub fn contains_equivalent(&self, op: &Operation<S>) -> bool {
        self.ops.values().any(|queued| queued.is_equivalent(op))
    }

    /// Add a transaction, assigning a sequence number on first enqueue
    pub fn push(&mut self, mut op: Operation<S>) {
        let seq = match op.seq() {
            Some(seq) => seq,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                op.set_seq(seq);
                seq
            }
        };
        self.ops.insert((op.priority(), seq), op);
    }

    /// Add a transaction behind everything of its class
    pub fn push_back(&mut self, mut op: Operation<S>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        op.set_seq(seq);
        self.ops.insert((op.priority(), seq), op);
    }

    /// Remove the most urgent transaction
    pub fn pop(&mut self) -> Option<Operation<S>> {
        self.ops.pop_first().map(|(_, op)| op)
    }

    /// Most urgent transaction, left in place
    pub fn peek(&self) -> Option<&Operation<S>> {
        self.ops.values().next()
    }

    /// Priority of the most urgent transaction
    pub fn peek_priority(&self) -> Option<PriorityClass> {
        self.ops.keys().next().map(|(p, _)| *p)
    }

    /// Remove a transaction by id
    pub fn remove(&mut self, id: Uuid) -> Option<Operation<S>> {
        let key = self
            .ops
            .iter()
            .find(|(_, op)| op.id() == id)
            .map(|(key, _)| *key)?;
        self.ops.remove(&key)
    }

    /// Remove every transaction bound to `device`
    pub fn remove_device(&mut self, device: &str) -> Vec<Operation<S>> {
        let keys: Vec<_> = self
            .ops
            .iter()
            .filter(|(_, op)| op.device().name() == device)
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.ops.remove(&key))
            .collect()
    }

    /// Remove everything
    pub fn drain(&mut self) -> Vec<Operation<S>> {
        std::mem::take(&mut self.ops).into_values().collect()
    }

    /// Number of queued transactions
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<S: Step> Default for OpQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}
