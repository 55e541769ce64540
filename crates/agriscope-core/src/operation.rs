//! Operation model: the canonical representation of an edit intent.
//!
//! Every mutation to a shared workspace is expressed as an [`Operation`]
//! before it is sequenced, transformed against concurrent history, and
//! applied to session state.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::annotation::{AnnotationKind, AnnotationStyle};

/// Unique identifier for operations.
pub type OperationId = Uuid;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Payload of an annotate operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatePayload {
    /// Identifier of the annotation being created or changed.
    pub annotation_id: Uuid,
    /// Crop image the annotation is attached to.
    pub image_id: String,
    /// Shape of the annotation.
    pub annotation_type: AnnotationKind,
    /// Flattened coordinates, `[x0, y0, x1, y1, ...]`; meaning varies by shape.
    pub coordinates: Vec<f64>,
    /// Stroke and fill styling.
    pub style: AnnotationStyle,
    /// Label text, for text annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// The kind-specific payload of an operation.
///
/// A closed tagged union: payload fields are typed per kind, and conversion
/// from loose client JSON happens once at the ingress boundary (see
/// `sanitize`). A zero-length `Retain` is the canonical nullified no-op
/// produced by conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    /// Insert text content into the shared notes surface.
    Insert { content: String },
    /// Delete a range from the shared notes surface.
    Delete { length: usize },
    /// Keep a range unchanged; `length == 0` means no-op.
    Retain { length: usize },
    /// Create or modify an annotation on a crop image.
    Annotate(AnnotatePayload),
    /// Reorder a crop image to the operation's position.
    Move { target_id: String },
}

impl OperationKind {
    /// Short name used in logs and update envelopes.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Insert { .. } => "insert",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Retain { .. } => "retain",
            OperationKind::Annotate(_) => "annotate",
            OperationKind::Move { .. } => "move",
        }
    }
}

/// An atomic, typed edit intent within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique within the session.
    pub id: OperationId,
    #[serde(flatten)]
    pub kind: OperationKind,
    /// Position in the target surface (character index or image slot).
    pub position: usize,
    /// Client-supplied unix-millisecond timestamp.
    pub timestamp: u64,
    /// Author of the edit.
    pub user_id: String,
    /// Session the edit belongs to.
    pub session_id: String,
}

impl Operation {
    /// Create an operation stamped with a fresh id and the current time.
    pub fn new(
        kind: OperationKind,
        position: usize,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            position,
            timestamp: now_ms(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Effective length for range math.
    ///
    /// Inserts span their content's character count, deletes and retains
    /// their stored length, annotate and move a single slot. Kinds without
    /// an explicit length default to 1.
    pub fn len(&self) -> usize {
        match &self.kind {
            OperationKind::Insert { content } => content.chars().count().max(1),
            OperationKind::Delete { length } => *length,
            OperationKind::Retain { length } => *length,
            OperationKind::Annotate(_) | OperationKind::Move { .. } => 1,
        }
    }

    /// Exclusive end of the affected range.
    pub fn end(&self) -> usize {
        self.position + self.len()
    }

    /// Whether the affected ranges of two operations overlap.
    pub fn range_overlaps(&self, other: &Operation) -> bool {
        self.position < other.end() && other.position < self.end()
    }

    /// Whether this operation has been nullified by conflict resolution.
    pub fn is_noop(&self) -> bool {
        matches!(self.kind, OperationKind::Retain { length: 0 })
    }

    /// Replace this operation's effect with a zero-length retain, keeping
    /// its identity and provenance.
    pub fn nullify(&self) -> Operation {
        Operation {
            kind: OperationKind::Retain { length: 0 },
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, position: usize) -> Operation {
        Operation::new(kind, position, "user-1", "session-1")
    }

    #[test]
    fn test_insert_length_from_content() {
        let o = op(OperationKind::Insert { content: "abc".into() }, 0);
        assert_eq!(o.len(), 3);
        assert_eq!(o.end(), 3);
    }

    #[test]
    fn test_empty_insert_defaults_to_one() {
        let o = op(OperationKind::Insert { content: String::new() }, 5);
        assert_eq!(o.len(), 1);
    }

    #[test]
    fn test_range_overlap() {
        let a = op(OperationKind::Delete { length: 5 }, 2); // [2, 7)
        let b = op(OperationKind::Delete { length: 4 }, 4); // [4, 8)
        let c = op(OperationKind::Delete { length: 2 }, 7); // [7, 9)
        assert!(a.range_overlaps(&b));
        assert!(b.range_overlaps(&a));
        assert!(!a.range_overlaps(&c));
    }

    #[test]
    fn test_nullify_keeps_identity() {
        let o = op(OperationKind::Insert { content: "x".into() }, 3);
        let n = o.nullify();
        assert_eq!(n.id, o.id);
        assert_eq!(n.position, o.position);
        assert!(n.is_noop());
    }

    #[test]
    fn test_kind_serde_tag() {
        let o = op(OperationKind::Delete { length: 2 }, 1);
        let json = serde_json::to_string(&o).unwrap();
        assert!(json.contains(r#""type":"delete""#));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, o);
    }
}
