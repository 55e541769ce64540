//! Event processor: assigns ids and sequence numbers, transforms incoming
//! operations against concurrent session history, and bounds the history.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CollabResult;
use crate::operation::{Operation, OperationId, now_ms};
use crate::sanitize::{self, RawOperation};
use crate::transform::{ConflictRegistry, ConflictResolution, PendingConflict, transform};

/// Per-session operation history cap; oldest entries drop first.
pub const MAX_HISTORY: usize = 1000;

/// Broadcast-ready record of one applied operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    /// Operation kind name (`insert`, `delete`, ...).
    pub update_type: String,
    /// The transformed operation as applied.
    pub data: Operation,
    pub user_id: String,
    pub timestamp: u64,
    /// Per-session monotonically increasing counter.
    pub sequence_number: u64,
    pub operation_id: OperationId,
}

/// Sequences and transforms operations for all sessions.
#[derive(Debug, Default)]
pub struct EventProcessor {
    histories: HashMap<String, Vec<Operation>>,
    sequences: HashMap<String, u64>,
    conflicts: ConflictRegistry,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize and apply a single raw client operation.
    pub fn process(
        &mut self,
        session_id: &str,
        user_id: &str,
        raw: RawOperation,
    ) -> CollabResult<UpdateEnvelope> {
        let op = sanitize::sanitize_operation(raw, user_id, session_id)?;
        let applied = self.apply(op);
        Ok(self.envelope(applied))
    }

    /// Sanitize and apply a batch of raw client operations.
    ///
    /// The whole batch is validated before anything is applied, so a
    /// malformed item aborts with no partial state mutation.
    pub fn process_batch(
        &mut self,
        session_id: &str,
        user_id: &str,
        raws: Vec<RawOperation>,
    ) -> CollabResult<Vec<UpdateEnvelope>> {
        let ops = raws
            .into_iter()
            .map(|raw| sanitize::sanitize_operation(raw, user_id, session_id))
            .collect::<CollabResult<Vec<_>>>()?;

        Ok(ops
            .into_iter()
            .map(|op| {
                let applied = self.apply(op);
                self.envelope(applied)
            })
            .collect())
    }

    /// Transform an already-validated operation against every history entry
    /// with a strictly greater timestamp, then append it.
    ///
    /// The strictly-greater window is the reference behavior: entries at or
    /// before the incoming timestamp are treated as already reflected in the
    /// client's view.
    pub fn apply(&mut self, op: Operation) -> Operation {
        let now = now_ms();
        let incoming_ts = op.timestamp;
        let mut op = op;
        if let Some(history) = self.histories.get(&op.session_id) {
            for past in history.iter().filter(|past| past.timestamp > incoming_ts) {
                let (_, transformed) = transform(past, &op, now, &mut self.conflicts);
                op = transformed;
            }
        }

        let history = self.histories.entry(op.session_id.clone()).or_default();
        history.push(op.clone());
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
        op
    }

    fn envelope(&mut self, op: Operation) -> UpdateEnvelope {
        let sequence_number = self.next_sequence(&op.session_id);
        UpdateEnvelope {
            update_type: op.kind.name().to_string(),
            user_id: op.user_id.clone(),
            timestamp: op.timestamp,
            sequence_number,
            operation_id: op.id,
            data: op,
        }
    }

    fn next_sequence(&mut self, session_id: &str) -> u64 {
        let counter = self.sequences.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Operation history for a session, oldest first.
    pub fn history(&self, session_id: &str) -> &[Operation] {
        self.histories.get(session_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Conflicts parked for user resolution in a session.
    pub fn pending_conflicts(&self, session_id: &str) -> Vec<&PendingConflict> {
        self.conflicts.pending_for_session(session_id)
    }

    /// Resolve a parked conflict; returns the pair of operations to apply.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Option<(Operation, Operation)> {
        self.conflicts.resolve(conflict_id, resolution)
    }

    /// Drop all per-session processor state (history, sequence counter).
    /// Called when a session is evicted.
    pub fn drop_session(&mut self, session_id: &str) {
        self.histories.remove(session_id);
        self.sequences.remove(session_id);
    }
}
