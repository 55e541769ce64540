//! Pairwise operational transform and conflict-resolution policy.
//!
//! [`transform`] adjusts two concurrent operations so that applying them in
//! either order yields a consistent workspace. It is a pure function except
//! for the pending-conflict registry, which is only written when the
//! `UserChoice` strategy defers resolution to a human.

use kurbo::Vec2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::TAU;

use crate::operation::{Operation, OperationId, OperationKind};

/// Annotations on the same image closer than this (px) get nudged apart.
pub const DE_OVERLAP_THRESHOLD: f64 = 10.0;
/// Magnitude of the de-overlap nudge vector (px).
pub const DE_OVERLAP_MAGNITUDE: f64 = 15.0;

/// Policy used when operations cannot be reconciled by pure transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LastWriteWins,
    Merge,
    UserChoice,
    PriorityBased,
}

/// Outcome of resolving a pair of conflicting operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    /// Operation kept intact, when the strategy picks one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<OperationId>,
    /// Combined operation, when the strategy merges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<Operation>,
    /// True when resolution is parked until a human decides.
    pub requires_user_input: bool,
}

/// A conflict parked for out-of-band resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConflict {
    /// Key `"{session_id}-{op_a.id}-{op_b.id}"`.
    pub id: String,
    pub session_id: String,
    pub op_a: Operation,
    pub op_b: Operation,
    pub resolution: ConflictResolution,
}

/// Key for a conflict between two operations in a session.
pub fn conflict_key(session_id: &str, a: OperationId, b: OperationId) -> String {
    format!("{session_id}-{a}-{b}")
}

/// Stores conflicts awaiting user resolution.
#[derive(Debug, Default)]
pub struct ConflictRegistry {
    pending: HashMap<String, PendingConflict>,
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn park(&mut self, a: &Operation, b: &Operation) -> String {
        let id = conflict_key(&a.session_id, a.id, b.id);
        self.pending.insert(
            id.clone(),
            PendingConflict {
                id: id.clone(),
                session_id: a.session_id.clone(),
                op_a: a.clone(),
                op_b: b.clone(),
                resolution: ConflictResolution {
                    strategy: ConflictStrategy::UserChoice,
                    winner: None,
                    merged: None,
                    requires_user_input: true,
                },
            },
        );
        id
    }

    /// Conflicts still pending for a session.
    pub fn pending_for_session(&self, session_id: &str) -> Vec<&PendingConflict> {
        let mut pending: Vec<_> = self
            .pending
            .values()
            .filter(|c| c.session_id == session_id)
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending
    }

    /// Apply an out-of-band resolution to a parked conflict.
    ///
    /// Returns the operations to apply: the chosen winner (loser nullified),
    /// or both unchanged for a merge resolution.
    pub fn resolve(
        &mut self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Option<(Operation, Operation)> {
        let parked = self.pending.remove(conflict_id)?;
        let (a, b) = (parked.op_a, parked.op_b);
        let pair = match resolution.strategy {
            ConflictStrategy::Merge => (a, b),
            ConflictStrategy::LastWriteWins => {
                if a.timestamp >= b.timestamp {
                    let nb = b.nullify();
                    (a, nb)
                } else {
                    (a.nullify(), b)
                }
            }
            ConflictStrategy::UserChoice | ConflictStrategy::PriorityBased => {
                match resolution.winner {
                    Some(winner) if winner == b.id => (a.nullify(), b),
                    // Default to the first operation when no winner is named.
                    _ => {
                        let nb = b.nullify();
                        (a, nb)
                    }
                }
            }
        };
        Some(pair)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Whether two operations conflict and need transformation.
///
/// Operations conflict only within the same session, and only when both
/// annotate the same image or their position ranges overlap.
pub fn conflicts(a: &Operation, b: &Operation) -> bool {
    if a.session_id != b.session_id {
        return false;
    }
    if let (OperationKind::Annotate(pa), OperationKind::Annotate(pb)) = (&a.kind, &b.kind) {
        return pa.image_id == pb.image_id;
    }
    a.range_overlaps(b)
}

/// Transform a pair of concurrent operations into a consistent pair.
///
/// Non-conflicting pairs pass through unchanged. `now` feeds the age term of
/// priority scoring; callers on the hot path pass the current wall clock.
pub fn transform(
    a: &Operation,
    b: &Operation,
    now: u64,
    registry: &mut ConflictRegistry,
) -> (Operation, Operation) {
    if !conflicts(a, b) {
        return (a.clone(), b.clone());
    }

    match (&a.kind, &b.kind) {
        (OperationKind::Insert { .. }, OperationKind::Insert { .. }) => {
            transform_insert_insert(a, b)
        }
        (OperationKind::Delete { .. }, OperationKind::Delete { .. }) => {
            transform_delete_delete(a, b)
        }
        (OperationKind::Insert { .. }, OperationKind::Delete { .. }) => {
            transform_insert_delete(a, b)
        }
        (OperationKind::Delete { .. }, OperationKind::Insert { .. }) => {
            let (ins, del) = transform_insert_delete(b, a);
            (del, ins)
        }
        // Moves carry no positional arithmetic; ordering is purely temporal.
        (OperationKind::Move { .. }, _) | (_, OperationKind::Move { .. }) => {
            transform_by_timestamp(a, b)
        }
        (OperationKind::Annotate(_), OperationKind::Annotate(_)) => {
            transform_annotate_annotate(a, b)
        }
        _ => resolve_conflict_pair(a, b, now, registry),
    }
}

/// Lower position is unshifted; the other shifts by its length.
/// Position ties keep `a` unshifted.
fn transform_insert_insert(a: &Operation, b: &Operation) -> (Operation, Operation) {
    if a.position <= b.position {
        let mut b2 = b.clone();
        b2.position += a.len();
        (a.clone(), b2)
    } else {
        let mut a2 = a.clone();
        a2.position += b.len();
        (a2, b.clone())
    }
}

/// Overlapping deletes merge into one span covering the union; the second
/// becomes a no-op. Disjoint deletes shift the later range back by the
/// earlier one's length.
fn transform_delete_delete(a: &Operation, b: &Operation) -> (Operation, Operation) {
    if a.range_overlaps(b) {
        let start = a.position.min(b.position);
        let end = a.end().max(b.end());
        let mut merged = a.clone();
        merged.position = start;
        merged.kind = OperationKind::Delete { length: end - start };
        (merged, b.nullify())
    } else if a.position < b.position {
        let mut b2 = b.clone();
        b2.position -= a.len();
        (a.clone(), b2)
    } else {
        let mut a2 = a.clone();
        a2.position -= b.len();
        (a2, b.clone())
    }
}

/// Insert-versus-delete transform. `ins` must be the insert operand; the
/// returned pair is `(insert', delete')`.
fn transform_insert_delete(ins: &Operation, del: &Operation) -> (Operation, Operation) {
    if ins.position <= del.position {
        // Insert at or before the delete's start pushes the delete forward.
        let mut del2 = del.clone();
        del2.position += ins.len();
        (ins.clone(), del2)
    } else if ins.position >= del.end() {
        // Insert at or past the delete's end lands earlier once the range
        // is gone.
        let mut ins2 = ins.clone();
        ins2.position -= del.len();
        (ins2, del.clone())
    } else {
        // Strictly inside the deleted range: the earlier operation wins.
        if ins.timestamp <= del.timestamp {
            // Insert landed first; the delete widens to absorb it.
            let mut del2 = del.clone();
            del2.kind = OperationKind::Delete { length: del.len() + ins.len() };
            (ins.clone(), del2)
        } else {
            (ins.nullify(), del.clone())
        }
    }
}

/// Earlier timestamp keeps its operation; the later one is nullified.
/// Ties keep `a`.
fn transform_by_timestamp(a: &Operation, b: &Operation) -> (Operation, Operation) {
    if a.timestamp <= b.timestamp {
        (a.clone(), b.nullify())
    } else {
        (a.nullify(), b.clone())
    }
}

/// Near-identical marks on the same image get the second one nudged by a
/// fixed-magnitude vector so neither is hidden under the other.
fn transform_annotate_annotate(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let (OperationKind::Annotate(pa), OperationKind::Annotate(pb)) = (&a.kind, &b.kind) else {
        return (a.clone(), b.clone());
    };
    if pa.image_id != pb.image_id
        || pa.coordinates.len() < 2
        || pb.coordinates.len() < 2
    {
        return (a.clone(), b.clone());
    }

    let dx = pa.coordinates[0] - pb.coordinates[0];
    let dy = pa.coordinates[1] - pb.coordinates[1];
    if (dx * dx + dy * dy).sqrt() >= DE_OVERLAP_THRESHOLD {
        return (a.clone(), b.clone());
    }

    let offset = de_overlap_offset(a.id, b.id);
    let mut b2 = b.clone();
    if let OperationKind::Annotate(payload) = &mut b2.kind {
        payload.coordinates[0] += offset.x;
        payload.coordinates[1] += offset.y;
    }
    (a.clone(), b2)
}

/// Deterministic nudge vector of magnitude [`DE_OVERLAP_MAGNITUDE`].
///
/// The direction is derived from both operation ids, so re-transforming the
/// same pair always yields the same offset while distinct pairs spread in
/// different directions.
fn de_overlap_offset(a: OperationId, b: OperationId) -> Vec2 {
    let angle = (mix32(fold_id(a) ^ mix32(fold_id(b))) as f64 / u32::MAX as f64) * TAU;
    Vec2::new(angle.cos(), angle.sin()) * DE_OVERLAP_MAGNITUDE
}

fn fold_id(id: OperationId) -> u32 {
    let bits = id.as_u128();
    (bits as u32) ^ ((bits >> 32) as u32) ^ ((bits >> 64) as u32) ^ ((bits >> 96) as u32)
}

/// splitmix32-style avalanche.
fn mix32(mut x: u32) -> u32 {
    x = x.wrapping_mul(0x9E37_79B9);
    x ^= x >> 16;
    x = x.wrapping_mul(0x85EB_CA6B);
    x ^= x >> 13;
    x = x.wrapping_mul(0xC2B2_AE35);
    x ^= x >> 16;
    x
}

/// Strategy applied to operation pairs with no direct transform rule.
fn default_strategy(a: &Operation, b: &Operation) -> ConflictStrategy {
    match (&a.kind, &b.kind) {
        (OperationKind::Annotate(_), OperationKind::Annotate(_))
        | (OperationKind::Delete { .. }, OperationKind::Delete { .. }) => ConflictStrategy::Merge,
        _ => ConflictStrategy::PriorityBased,
    }
}

/// Resolve a conflicting pair that has no direct transform rule.
pub fn resolve_conflict_pair(
    a: &Operation,
    b: &Operation,
    now: u64,
    registry: &mut ConflictRegistry,
) -> (Operation, Operation) {
    match default_strategy(a, b) {
        ConflictStrategy::Merge => match (&a.kind, &b.kind) {
            (OperationKind::Delete { .. }, OperationKind::Delete { .. }) => {
                transform_delete_delete(a, b)
            }
            // Annotations merge by coexisting.
            _ => (a.clone(), b.clone()),
        },
        ConflictStrategy::LastWriteWins => {
            if a.timestamp >= b.timestamp {
                (a.clone(), b.nullify())
            } else {
                (a.nullify(), b.clone())
            }
        }
        ConflictStrategy::PriorityBased => {
            if priority(a, now) >= priority(b, now) {
                (a.clone(), b.nullify())
            } else {
                (a.nullify(), b.clone())
            }
        }
        ConflictStrategy::UserChoice => {
            let id = registry.park(a, b);
            log::debug!("conflict {id} parked for user resolution");
            (a.clone(), b.clone())
        }
    }
}

/// Priority score for an operation: a base of 10, a per-kind weight, and a
/// recency bonus that decays one point per minute of age.
pub fn priority(op: &Operation, now: u64) -> u64 {
    let weight = match &op.kind {
        OperationKind::Annotate(_) => 5,
        OperationKind::Insert { .. } => 3,
        OperationKind::Delete { .. } => 2,
        OperationKind::Move { .. } => 1,
        OperationKind::Retain { .. } => 0,
    };
    let age_minutes = now.saturating_sub(op.timestamp) / 60_000;
    10 + weight + 10u64.saturating_sub(age_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{AnnotationKind, AnnotationStyle};
    use crate::operation::AnnotatePayload;
    use uuid::Uuid;

    const NOW: u64 = 1_000_000;

    fn op(kind: OperationKind, position: usize, timestamp: u64) -> Operation {
        Operation {
            id: Uuid::new_v4(),
            kind,
            position,
            timestamp,
            user_id: "user-1".into(),
            session_id: "session-1".into(),
        }
    }

    fn insert(content: &str, position: usize, timestamp: u64) -> Operation {
        op(OperationKind::Insert { content: content.into() }, position, timestamp)
    }

    fn delete(position: usize, length: usize, timestamp: u64) -> Operation {
        op(OperationKind::Delete { length }, position, timestamp)
    }

    fn annotate(image_id: &str, x: f64, y: f64) -> Operation {
        op(
            OperationKind::Annotate(AnnotatePayload {
                annotation_id: Uuid::new_v4(),
                image_id: image_id.into(),
                annotation_type: AnnotationKind::Circle,
                coordinates: vec![x, y, 12.0],
                style: AnnotationStyle::default(),
                text: None,
            }),
            0,
            NOW,
        )
    }

    #[test]
    fn test_disjoint_inserts_commute() {
        let a = insert("abc", 0, NOW);
        let b = insert("zz", 10, NOW);
        let mut reg = ConflictRegistry::new();

        // Disjoint ranges do not conflict: both directions leave the pair
        // unchanged, so applying in either order agrees.
        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        let (b2, a2) = transform(&b, &a, NOW, &mut reg);
        assert_eq!((a1.position, b1.position), (a2.position, b2.position));
        assert_eq!(b1.position, 10);
        assert_eq!(a1.position, 0);
    }

    #[test]
    fn test_colliding_inserts_tie_goes_to_first() {
        let a = insert("abc", 5, NOW);
        let b = insert("xy", 5, NOW);
        let mut reg = ConflictRegistry::new();

        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(a1.position, 5);
        assert_eq!(b1.position, 5 + 3);
    }

    #[test]
    fn test_lower_insert_is_unshifted() {
        // Ranges [4,7) and [5,7) overlap, so this pair conflicts.
        let a = insert("abc", 4, NOW);
        let b = insert("xy", 5, NOW);
        let mut reg = ConflictRegistry::new();

        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(a1.position, 4);
        assert_eq!(b1.position, 8);
    }

    #[test]
    fn test_overlapping_deletes_merge_exactly_once() {
        // [2,7) and [4,8) merge into [2,8); the second becomes a no-op.
        let a = delete(2, 5, NOW);
        let b = delete(4, 4, NOW);
        let mut reg = ConflictRegistry::new();

        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(a1.position, 2);
        assert_eq!(a1.kind, OperationKind::Delete { length: 6 });
        assert!(b1.is_noop());
    }

    #[test]
    fn test_disjoint_deletes_shift_later_range() {
        let a = delete(2, 3, NOW); // [2, 5)
        let b = delete(10, 2, NOW); // [10, 12)
        let (a1, b1) = transform_delete_delete(&a, &b);
        assert_eq!(a1.position, 2);
        assert_eq!(b1.position, 7);
    }

    #[test]
    fn test_insert_before_delete_shifts_delete_forward() {
        let ins = insert("abcd", 3, NOW); // [3, 7)
        let del = delete(5, 4, NOW); // [5, 9) -- overlaps the insert range
        let mut reg = ConflictRegistry::new();

        let (ins1, del1) = transform(&ins, &del, NOW, &mut reg);
        assert_eq!(ins1.position, 3);
        assert_eq!(del1.position, 5 + 4);
    }

    #[test]
    fn test_insert_after_delete_end_shifts_insert_back() {
        let del = delete(2, 5, NOW); // [2, 7)
        let ins = insert("ab", 7, NOW); // exactly at the end
        let (ins1, del1) = transform_insert_delete(&ins, &del);
        assert_eq!(ins1.position, 2);
        assert_eq!(del1.position, 2);
    }

    #[test]
    fn test_earlier_insert_inside_delete_is_absorbed() {
        let ins = insert("xy", 4, NOW - 10); // inside [2, 7), landed first
        let del = delete(2, 5, NOW);
        let mut reg = ConflictRegistry::new();

        let (ins1, del1) = transform(&ins, &del, NOW, &mut reg);
        assert_eq!(ins1, ins);
        assert_eq!(del1.kind, OperationKind::Delete { length: 7 });
    }

    #[test]
    fn test_later_insert_inside_delete_is_nullified() {
        let del = delete(2, 5, NOW - 10);
        let ins = insert("xy", 4, NOW);
        let mut reg = ConflictRegistry::new();

        let (del1, ins1) = transform(&del, &ins, NOW, &mut reg);
        assert_eq!(del1, del);
        assert!(ins1.is_noop());
    }

    #[test]
    fn test_move_resolved_by_timestamp() {
        let a = op(OperationKind::Move { target_id: "img-1".into() }, 0, NOW - 5);
        let b = op(OperationKind::Move { target_id: "img-2".into() }, 0, NOW);
        let mut reg = ConflictRegistry::new();

        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(a1, a);
        assert!(b1.is_noop());

        // Reversed argument order does not change the outcome.
        let (b2, a2) = transform(&b, &a, NOW, &mut reg);
        assert!(b2.is_noop());
        assert_eq!(a2, a);
    }

    #[test]
    fn test_close_annotations_nudged_by_fixed_magnitude() {
        let a = annotate("img-1", 100.0, 100.0);
        let b = annotate("img-1", 104.0, 103.0);
        let mut reg = ConflictRegistry::new();

        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(a1, a);

        let (OperationKind::Annotate(pb), OperationKind::Annotate(pb1)) = (&b.kind, &b1.kind)
        else {
            panic!("expected annotate operations");
        };
        let dx = pb1.coordinates[0] - pb.coordinates[0];
        let dy = pb1.coordinates[1] - pb.coordinates[1];
        let magnitude = (dx * dx + dy * dy).sqrt();
        assert!((magnitude - DE_OVERLAP_MAGNITUDE).abs() < 1e-9);
    }

    #[test]
    fn test_de_overlap_is_deterministic() {
        let a = annotate("img-1", 50.0, 50.0);
        let b = annotate("img-1", 52.0, 51.0);
        let mut reg = ConflictRegistry::new();

        let (_, first) = transform(&a, &b, NOW, &mut reg);
        let (_, second) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(first, second);
    }

    #[test]
    fn test_distant_annotations_pass_through() {
        let a = annotate("img-1", 10.0, 10.0);
        let b = annotate("img-1", 200.0, 200.0);
        let mut reg = ConflictRegistry::new();

        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(a1, a);
        assert_eq!(b1, b);
    }

    #[test]
    fn test_annotations_on_different_images_never_conflict() {
        let a = annotate("img-1", 10.0, 10.0);
        let b = annotate("img-2", 10.0, 10.0);
        assert!(!conflicts(&a, &b));
    }

    #[test]
    fn test_priority_weights() {
        let annotate_op = annotate("img-1", 0.0, 0.0);
        let insert_op = insert("a", 0, NOW);
        assert!(priority(&annotate_op, NOW) > priority(&insert_op, NOW));

        // Recency bonus decays with age.
        let fresh = insert("a", 0, NOW);
        let stale = insert("a", 0, NOW - 15 * 60_000);
        assert!(priority(&fresh, NOW) > priority(&stale, NOW));
        assert_eq!(priority(&stale, NOW), 10 + 3);
    }

    #[test]
    fn test_priority_fallback_nullifies_loser() {
        // Annotate vs insert with overlapping ranges has no direct rule.
        let a = annotate("img-1", 0.0, 0.0);
        let b = insert("x", 0, NOW);
        let mut reg = ConflictRegistry::new();

        let (a1, b1) = transform(&a, &b, NOW, &mut reg);
        assert_eq!(a1, a);
        assert!(b1.is_noop());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_registry_resolve_picks_winner() {
        let a = insert("abc", 0, NOW);
        let b = delete(0, 2, NOW);
        let mut reg = ConflictRegistry::new();
        let id = reg.park(&a, &b);
        assert_eq!(reg.pending_for_session("session-1").len(), 1);

        let (a1, b1) = reg
            .resolve(
                &id,
                ConflictResolution {
                    strategy: ConflictStrategy::UserChoice,
                    winner: Some(b.id),
                    merged: None,
                    requires_user_input: false,
                },
            )
            .unwrap();
        assert!(a1.is_noop());
        assert_eq!(b1, b);
        assert!(reg.is_empty());
    }
}
