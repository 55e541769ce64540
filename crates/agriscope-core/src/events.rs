//! Wire contract: inbound client events and outbound broadcasts.
//!
//! Events are JSON with a `type` tag, e.g.
//! `{ "type": "start-drawing", "tool_id": "circle", ... }`.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::annotation::Annotation;
use crate::drawing::DrawingOverrides;
use crate::operation::Operation;
use crate::processor::UpdateEnvelope;
use crate::sanitize::RawOperation;
use crate::session::{ChatMessage, Participant, ParticipantRole, WorkspaceState};
use crate::transform::{ConflictResolution, PendingConflict};

/// What an annotation-update event does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationAction {
    Create,
    Update,
    Delete,
}

/// Messages sent by clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join (or create) a session.
    JoinSession {
        name: String,
        #[serde(default)]
        role: ParticipantRole,
        /// Title used when the join creates the session.
        #[serde(default)]
        title: Option<String>,
    },
    /// Leave the current session.
    LeaveSession,
    /// Apply one workspace operation.
    WorkspaceUpdate { data: RawOperation },
    /// Create, update, or delete an annotation.
    AnnotationUpdate {
        #[serde(default)]
        annotation_id: Option<Uuid>,
        image_id: String,
        operation: AnnotationAction,
        #[serde(default)]
        data: Value,
    },
    /// Apply a list of operations with batch sequencing.
    BatchOperations { operations: Vec<RawOperation> },
    /// Begin a drawing gesture.
    StartDrawing {
        tool_id: String,
        image_id: String,
        #[serde(default)]
        layer_id: Option<String>,
        point: Point,
        #[serde(default)]
        settings: DrawingOverrides,
    },
    /// Extend the current drawing path.
    ContinueDrawing { point: Point },
    /// Complete the drawing into an annotation.
    FinishDrawing {
        #[serde(default)]
        point: Option<Point>,
        #[serde(default)]
        text: Option<String>,
    },
    /// Discard the current drawing.
    CancelDrawing,
    /// Post a chat message.
    ChatMessage { text: String },
    /// Resolve a parked conflict.
    ResolveConflict {
        conflict_id: String,
        resolution: ConflictResolution,
    },
}

/// Messages broadcast to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    WorkspaceUpdated {
        #[serde(skip_serializing_if = "Option::is_none")]
        update: Option<UpdateEnvelope>,
        /// Present when a state patch (not an operation) changed the
        /// workspace.
        #[serde(skip_serializing_if = "Option::is_none")]
        workspace: Option<WorkspaceState>,
    },
    AnnotationCreated {
        annotation: Annotation,
        update: UpdateEnvelope,
    },
    AnnotationUpdated {
        annotation: Annotation,
        update: UpdateEnvelope,
    },
    AnnotationDeleted {
        annotation_id: Uuid,
        image_id: String,
    },
    DrawingStarted {
        user_id: String,
        tool_id: String,
        image_id: String,
        point: Point,
    },
    DrawingProgress {
        user_id: String,
        point: Point,
        path_len: usize,
    },
    DrawingCancelled { user_id: String },
    BatchUpdates { updates: Vec<UpdateEnvelope> },
    ConflictResolved {
        conflict_id: String,
        operations: Vec<Operation>,
    },
    PendingConflicts { conflicts: Vec<PendingConflict> },
    ChatMessage { message: ChatMessage },
    ParticipantJoined { participant: Participant },
    ParticipantLeft { user_id: String },
    SessionClosed { session_id: String },
    Error { message: String },
}

/// Delivery scope of an outbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastScope {
    /// Everyone in the session.
    Session(String),
    /// One user only.
    User(String),
    /// Every session in a growing region (e.g. a weather advisory).
    Region(String),
}

/// An outbound event with its delivery scope.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub scope: BroadcastScope,
    pub event: ServerEvent,
}

/// Room-scoped publish primitives provided by the transport layer.
///
/// The engine never manages raw connections; it queues [`OutboundEvent`]s
/// and the transport drains them through this interface.
pub trait Broadcaster {
    fn broadcast_to_session(&self, session_id: &str, event: &ServerEvent);
    fn broadcast_to_user(&self, user_id: &str, event: &ServerEvent);
    fn broadcast_to_region(&self, region_id: &str, event: &ServerEvent);

    /// Route one outbound event by its scope.
    fn deliver(&self, outbound: &OutboundEvent) {
        match &outbound.scope {
            BroadcastScope::Session(id) => self.broadcast_to_session(id, &outbound.event),
            BroadcastScope::User(id) => self.broadcast_to_user(id, &outbound.event),
            BroadcastScope::Region(id) => self.broadcast_to_region(id, &outbound.event),
        }
    }
}
