//! The collaboration engine: one service object owning session state,
//! operation history, drawing state, and the outbound event queue.
//!
//! Handlers run to completion; concurrency is logical (interleaved messages
//! from different users), so no internal locking is needed. The transport
//! layer drains queued broadcasts via [`CollabEngine::take_outgoing`].

use serde_json::Value;
use uuid::Uuid;

use crate::annotation::{Annotation, AnnotationMetadata};
use crate::error::{CollabError, CollabResult};
use crate::events::{AnnotationAction, BroadcastScope, ClientEvent, OutboundEvent, ServerEvent};
use crate::drawing::{DrawingOverrides, DrawingStateMachine};
use crate::operation::{AnnotatePayload, Operation, OperationKind, now_ms};
use crate::processor::{EventProcessor, UpdateEnvelope};
use crate::sanitize::{self, RawOperation};
use crate::session::{
    ChatMessage, IDLE_TIMEOUT_MS, JoinPolicy, ParticipantRole, PermissiveJoinPolicy, SessionStore,
    WorkspacePatch, WorkspaceState,
};
use crate::transform::{ConflictResolution, PendingConflict};
use kurbo::Point;

/// Owns all collaboration state for one process.
pub struct CollabEngine {
    sessions: SessionStore,
    processor: EventProcessor,
    drawing: DrawingStateMachine,
    join_policy: Box<dyn JoinPolicy + Send + Sync>,
    outgoing: Vec<OutboundEvent>,
}

impl Default for CollabEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CollabEngine {
    pub fn new() -> Self {
        Self::with_policy(Box::new(PermissiveJoinPolicy))
    }

    /// Build an engine with an injected join policy.
    pub fn with_policy(join_policy: Box<dyn JoinPolicy + Send + Sync>) -> Self {
        Self {
            sessions: SessionStore::new(),
            processor: EventProcessor::new(),
            drawing: DrawingStateMachine::new(),
            join_policy,
            outgoing: Vec::new(),
        }
    }

    /// Drain queued outbound broadcasts.
    pub fn take_outgoing(&mut self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.outgoing)
    }

    fn queue_session(&mut self, session_id: &str, event: ServerEvent) {
        self.outgoing.push(OutboundEvent {
            scope: BroadcastScope::Session(session_id.to_string()),
            event,
        });
    }

    fn queue_user(&mut self, user_id: &str, event: ServerEvent) {
        self.outgoing.push(OutboundEvent {
            scope: BroadcastScope::User(user_id.to_string()),
            event,
        });
    }

    // --- Inbound message contract ---

    /// Dispatch one inbound client event.
    ///
    /// Validation and state errors surface to the caller without mutating
    /// session state; the transport reports them to the offending client
    /// only.
    pub fn handle_event(
        &mut self,
        session_id: &str,
        user_id: &str,
        event: ClientEvent,
    ) -> CollabResult<()> {
        match event {
            ClientEvent::JoinSession { name, role, title } => {
                self.join_session(session_id, user_id, &name, role, title)
            }
            ClientEvent::LeaveSession => self.leave_session(session_id, user_id),
            ClientEvent::WorkspaceUpdate { data } => {
                self.workspace_update(session_id, user_id, data)
            }
            ClientEvent::AnnotationUpdate { annotation_id, image_id, operation, data } => {
                self.annotation_update(session_id, user_id, annotation_id, &image_id, operation, data)
            }
            ClientEvent::BatchOperations { operations } => {
                self.batch_operations(session_id, user_id, operations)
            }
            ClientEvent::StartDrawing { tool_id, image_id, layer_id, point, settings } => {
                self.start_drawing(session_id, user_id, &tool_id, &image_id, layer_id, point, settings)
            }
            ClientEvent::ContinueDrawing { point } => {
                self.continue_drawing(session_id, user_id, point)
            }
            ClientEvent::FinishDrawing { point, text } => {
                self.finish_drawing(session_id, user_id, point, text)
            }
            ClientEvent::CancelDrawing => self.cancel_drawing(session_id, user_id),
            ClientEvent::ChatMessage { text } => self.chat_message(session_id, user_id, &text),
            ClientEvent::ResolveConflict { conflict_id, resolution } => {
                self.resolve_conflict(session_id, &conflict_id, resolution)
            }
        }
    }

    fn join_session(
        &mut self,
        session_id: &str,
        user_id: &str,
        name: &str,
        role: ParticipantRole,
        title: Option<String>,
    ) -> CollabResult<()> {
        if !self.sessions.contains(session_id) {
            self.sessions.create_session(
                session_id,
                title.unwrap_or_else(|| "Untitled session".to_string()),
                user_id,
            );
        }
        if !self
            .sessions
            .can_user_join(session_id, user_id, self.join_policy.as_ref())?
        {
            return Err(CollabError::Validation(format!(
                "user {user_id} may not join session {session_id}"
            )));
        }
        let participant = self.sessions.add_participant(session_id, user_id, name, role)?;
        self.queue_session(session_id, ServerEvent::ParticipantJoined { participant });

        // Late joiners need to know about conflicts still awaiting a human.
        let conflicts: Vec<PendingConflict> = self
            .processor
            .pending_conflicts(session_id)
            .into_iter()
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            self.queue_user(user_id, ServerEvent::PendingConflicts { conflicts });
        }
        Ok(())
    }

    fn leave_session(&mut self, session_id: &str, user_id: &str) -> CollabResult<()> {
        self.sessions.remove_participant(session_id, user_id)?;
        if self.drawing.is_drawing(session_id, user_id) {
            let _ = self.drawing.cancel(session_id, user_id);
        }
        self.queue_session(session_id, ServerEvent::ParticipantLeft { user_id: user_id.into() });
        Ok(())
    }

    fn workspace_update(
        &mut self,
        session_id: &str,
        user_id: &str,
        raw: RawOperation,
    ) -> CollabResult<()> {
        self.sessions.get(session_id)?;
        let envelope = self.processor.process(session_id, user_id, raw)?;
        self.sessions.touch(session_id, user_id);
        self.apply_envelope(session_id, envelope)
    }

    fn batch_operations(
        &mut self,
        session_id: &str,
        user_id: &str,
        raws: Vec<RawOperation>,
    ) -> CollabResult<()> {
        self.sessions.get(session_id)?;
        let envelopes = self.processor.process_batch(session_id, user_id, raws)?;
        self.sessions.touch(session_id, user_id);
        for envelope in &envelopes {
            self.apply_operation(session_id, &envelope.data)?;
        }
        self.queue_session(session_id, ServerEvent::BatchUpdates { updates: envelopes });
        Ok(())
    }

    /// Apply a processed operation and broadcast the matching event.
    fn apply_envelope(&mut self, session_id: &str, envelope: UpdateEnvelope) -> CollabResult<()> {
        if let OperationKind::Annotate(payload) = &envelope.data.kind {
            let (annotation, created) =
                self.upsert_annotation(session_id, payload, &envelope.data.user_id)?;
            let event = if created {
                ServerEvent::AnnotationCreated { annotation, update: envelope }
            } else {
                ServerEvent::AnnotationUpdated { annotation, update: envelope }
            };
            self.queue_session(session_id, event);
        } else {
            self.apply_operation(session_id, &envelope.data)?;
            self.queue_session(
                session_id,
                ServerEvent::WorkspaceUpdated { update: Some(envelope), workspace: None },
            );
        }
        Ok(())
    }

    /// Mutate workspace state according to one transformed operation.
    fn apply_operation(&mut self, session_id: &str, op: &Operation) -> CollabResult<()> {
        if let OperationKind::Annotate(payload) = &op.kind {
            self.upsert_annotation(session_id, payload, &op.user_id)?;
            return Ok(());
        }

        let session = self.sessions.get_mut(session_id)?;
        let workspace = &mut session.workspace;
        match &op.kind {
            OperationKind::Insert { content } => {
                let at = char_to_byte(&workspace.shared_notes, op.position);
                workspace.shared_notes.insert_str(at, content);
            }
            OperationKind::Delete { length } => {
                let start = char_to_byte(&workspace.shared_notes, op.position);
                let end = char_to_byte(&workspace.shared_notes, op.position + length);
                workspace.shared_notes.replace_range(start..end, "");
            }
            OperationKind::Retain { .. } => {}
            OperationKind::Move { target_id } => {
                if let Some(from) = workspace.crop_images.iter().position(|i| &i.id == target_id) {
                    let image = workspace.crop_images.remove(from);
                    let to = op.position.min(workspace.crop_images.len());
                    workspace.crop_images.insert(to, image);
                } else {
                    log::warn!("move targets unknown crop image {target_id}, skipping");
                }
            }
            // Handled by the early return above.
            OperationKind::Annotate(_) => {}
        }
        Ok(())
    }

    /// Create or update the annotation an annotate operation describes.
    fn upsert_annotation(
        &mut self,
        session_id: &str,
        payload: &AnnotatePayload,
        user_id: &str,
    ) -> CollabResult<(Annotation, bool)> {
        let session = self.sessions.get_mut(session_id)?;
        for annotations in session.workspace.annotations.values_mut() {
            if let Some(existing) = annotations.iter_mut().find(|a| a.id == payload.annotation_id) {
                existing.coordinates = payload.coordinates.clone();
                existing.style = payload.style.clone();
                if payload.text.is_some() {
                    existing.text = payload.text.clone();
                }
                existing.metadata.version += 1;
                return Ok((existing.clone(), false));
            }
        }

        let annotation = Annotation {
            id: payload.annotation_id,
            kind: payload.annotation_type,
            coordinates: payload.coordinates.clone(),
            style: payload.style.clone(),
            text: payload.text.clone(),
            measurements: None,
            metadata: AnnotationMetadata {
                created_by: user_id.to_string(),
                created_at: now_ms(),
                image_id: payload.image_id.clone(),
                layer_id: None,
                version: 1,
            },
        };
        session
            .workspace
            .annotations
            .entry(crate::session::DEFAULT_LAYER.to_string())
            .or_default()
            .push(annotation.clone());
        Ok((annotation, true))
    }

    fn annotation_update(
        &mut self,
        session_id: &str,
        user_id: &str,
        annotation_id: Option<Uuid>,
        image_id: &str,
        action: AnnotationAction,
        data: Value,
    ) -> CollabResult<()> {
        self.sessions.get(session_id)?;
        match action {
            AnnotationAction::Create => {
                let mut raw: RawOperation = serde_json::from_value(data)?;
                raw.op_type = Some("annotate".into());
                raw.image_id = Some(image_id.to_string());
                raw.annotation_id = annotation_id;
                self.workspace_update(session_id, user_id, raw)
            }
            AnnotationAction::Update => {
                let annotation_id = annotation_id.ok_or_else(|| {
                    CollabError::Validation("annotation update requires an annotation_id".into())
                })?;
                let raw_update: sanitize::RawAnnotationUpdate = serde_json::from_value(data)?;
                let update = sanitize::sanitize_annotation_update(raw_update);

                let annotation = {
                    let session = self.sessions.get_mut(session_id)?;
                    let existing = find_annotation_mut(&mut session.workspace, annotation_id)
                        .ok_or_else(|| CollabError::not_found("annotation", annotation_id.to_string()))?;
                    existing.apply_update(update);
                    existing.clone()
                };

                // Round-trip through the processor so concurrent edits to the
                // same annotation transform against this change.
                let envelope = self.processor.process(
                    session_id,
                    user_id,
                    annotation_to_raw(&annotation),
                )?;
                self.sessions.touch(session_id, user_id);
                self.queue_session(
                    session_id,
                    ServerEvent::AnnotationUpdated { annotation, update: envelope },
                );
                Ok(())
            }
            AnnotationAction::Delete => {
                let annotation_id = annotation_id.ok_or_else(|| {
                    CollabError::Validation("annotation delete requires an annotation_id".into())
                })?;
                let removed = {
                    let session = self.sessions.get_mut(session_id)?;
                    remove_annotation(&mut session.workspace, annotation_id)
                        .ok_or_else(|| CollabError::not_found("annotation", annotation_id.to_string()))?
                };

                // Keep the history aware of the touched image region.
                self.processor
                    .process(session_id, user_id, annotation_to_raw(&removed))?;
                self.sessions.touch(session_id, user_id);
                self.queue_session(
                    session_id,
                    ServerEvent::AnnotationDeleted {
                        annotation_id,
                        image_id: removed.metadata.image_id.clone(),
                    },
                );
                Ok(())
            }
        }
    }

    // --- Drawing lifecycle ---

    fn start_drawing(
        &mut self,
        session_id: &str,
        user_id: &str,
        tool_id: &str,
        image_id: &str,
        layer_id: Option<String>,
        point: Point,
        settings: DrawingOverrides,
    ) -> CollabResult<()> {
        self.sessions.get(session_id)?;
        self.drawing
            .start(session_id, user_id, tool_id, image_id, layer_id, point, settings)?;
        self.sessions.touch(session_id, user_id);
        self.queue_session(
            session_id,
            ServerEvent::DrawingStarted {
                user_id: user_id.into(),
                tool_id: tool_id.into(),
                image_id: image_id.into(),
                point,
            },
        );
        Ok(())
    }

    fn continue_drawing(&mut self, session_id: &str, user_id: &str, point: Point) -> CollabResult<()> {
        let state = self.drawing.append(session_id, user_id, point)?;
        let path_len = state.current_path.len();
        self.queue_session(
            session_id,
            ServerEvent::DrawingProgress { user_id: user_id.into(), point, path_len },
        );
        Ok(())
    }

    fn finish_drawing(
        &mut self,
        session_id: &str,
        user_id: &str,
        end: Option<Point>,
        text: Option<String>,
    ) -> CollabResult<()> {
        let draft = self.drawing.finish(session_id, user_id, end, text)?;
        let layer_id = draft.metadata.layer_id.clone();

        // The draft goes through the sanitize/transform pipeline like any
        // other annotate operation; the transformed payload (possibly nudged
        // off a concurrent near-identical mark) is what gets persisted.
        let envelope = self
            .processor
            .process(session_id, user_id, annotation_to_raw(&draft))?;
        self.sessions.touch(session_id, user_id);

        let OperationKind::Annotate(payload) = &envelope.data.kind else {
            return Err(CollabError::Validation("drawing produced a non-annotate operation".into()));
        };
        let mut annotation = draft;
        annotation.coordinates = payload.coordinates.clone();
        annotation.style = payload.style.clone();

        let session = self.sessions.get_mut(session_id)?;
        session
            .workspace
            .annotations
            .entry(layer_id.unwrap_or_else(|| crate::session::DEFAULT_LAYER.to_string()))
            .or_default()
            .push(annotation.clone());

        self.queue_session(
            session_id,
            ServerEvent::AnnotationCreated { annotation, update: envelope },
        );
        Ok(())
    }

    fn cancel_drawing(&mut self, session_id: &str, user_id: &str) -> CollabResult<()> {
        self.drawing.cancel(session_id, user_id)?;
        self.queue_session(session_id, ServerEvent::DrawingCancelled { user_id: user_id.into() });
        Ok(())
    }

    fn chat_message(&mut self, session_id: &str, user_id: &str, text: &str) -> CollabResult<()> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            text: sanitize::scrub_text(text),
            timestamp: now_ms(),
        };
        self.sessions.append_chat(session_id, message.clone())?;
        self.sessions.touch(session_id, user_id);
        self.queue_session(session_id, ServerEvent::ChatMessage { message });
        Ok(())
    }

    // --- Conflict resolution ---

    /// Apply an out-of-band resolution to a parked conflict.
    pub fn resolve_conflict(
        &mut self,
        session_id: &str,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> CollabResult<()> {
        let (op_a, op_b) = self
            .processor
            .resolve_conflict(conflict_id, resolution)
            .ok_or_else(|| CollabError::not_found("conflict", conflict_id))?;
        self.apply_operation(session_id, &op_a)?;
        self.apply_operation(session_id, &op_b)?;
        self.queue_session(
            session_id,
            ServerEvent::ConflictResolved {
                conflict_id: conflict_id.to_string(),
                operations: vec![op_a, op_b],
            },
        );
        Ok(())
    }

    // --- Query API ---

    /// Annotations of a session, optionally restricted to one layer, sorted
    /// by creation time ascending.
    pub fn session_annotations(
        &self,
        session_id: &str,
        layer_id: Option<&str>,
    ) -> CollabResult<Vec<Annotation>> {
        let session = self.sessions.get(session_id)?;
        let mut annotations: Vec<Annotation> = session
            .workspace
            .annotations
            .iter()
            .filter(|(layer, _)| layer_id.is_none_or(|l| l == layer.as_str()))
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        annotations.sort_by_key(|a| a.metadata.created_at);
        Ok(annotations)
    }

    /// Conflicts awaiting user resolution in a session.
    pub fn pending_conflicts(&self, session_id: &str) -> Vec<&PendingConflict> {
        self.processor.pending_conflicts(session_id)
    }

    /// Shallow-merge a partial workspace state (collaborator facade for the
    /// persistence layer).
    pub fn update_workspace(&mut self, session_id: &str, patch: WorkspacePatch) -> CollabResult<()> {
        let workspace = self.sessions.update_workspace(session_id, patch)?.clone();
        self.queue_session(
            session_id,
            ServerEvent::WorkspaceUpdated { update: None, workspace: Some(workspace) },
        );
        Ok(())
    }

    /// Direct access to the session store (persistence facade).
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionStore {
        &mut self.sessions
    }

    // --- Maintenance ---

    /// Close and evict idle sessions, dropping their processor and drawing
    /// state. Returns the evicted session ids.
    pub fn sweep_idle(&mut self, now: u64) -> Vec<String> {
        let evicted = self.sessions.sweep_idle(now, IDLE_TIMEOUT_MS);
        for session_id in &evicted {
            self.processor.drop_session(session_id);
            self.drawing.drop_session(session_id);
            self.queue_session(session_id, ServerEvent::SessionClosed {
                session_id: session_id.clone(),
            });
        }
        evicted
    }
}

/// Find an annotation by id across all layers of a workspace.
fn find_annotation_mut(workspace: &mut WorkspaceState, id: Uuid) -> Option<&mut Annotation> {
    workspace
        .annotations
        .values_mut()
        .flat_map(|list| list.iter_mut())
        .find(|a| a.id == id)
}

/// Remove an annotation by id from whichever layer holds it.
fn remove_annotation(workspace: &mut WorkspaceState, id: Uuid) -> Option<Annotation> {
    for annotations in workspace.annotations.values_mut() {
        if let Some(index) = annotations.iter().position(|a| a.id == id) {
            return Some(annotations.remove(index));
        }
    }
    None
}

/// Express an annotation as a raw annotate operation for the sanitize
/// pipeline.
fn annotation_to_raw(annotation: &Annotation) -> RawOperation {
    RawOperation {
        op_type: Some("annotate".into()),
        annotation_id: Some(annotation.id),
        image_id: Some(annotation.metadata.image_id.clone()),
        annotation_type: Some(annotation.kind.as_str().to_string()),
        coordinates: Some(
            annotation
                .coordinates
                .iter()
                .map(|&c| serde_json::json!(c))
                .collect(),
        ),
        style: Some(sanitize::RawStyle {
            color: Some(annotation.style.color.clone()),
            stroke_width: Some(annotation.style.stroke_width),
            fill_color: annotation.style.fill_color.clone(),
        }),
        text: annotation.text.clone(),
        ..Default::default()
    }
}

/// Byte offset of a character index, clamped to the string's end.
fn char_to_byte(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(byte, _)| byte)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::AnnotationKind;
    use crate::session::CropImage;
    use serde_json::json;

    const SESSION: &str = "session-1";

    fn engine_with_session() -> CollabEngine {
        let mut engine = CollabEngine::new();
        engine
            .handle_event(
                SESSION,
                "grower-1",
                ClientEvent::JoinSession {
                    name: "Amara".into(),
                    role: ParticipantRole::Grower,
                    title: Some("Maize blight triage".into()),
                },
            )
            .unwrap();
        engine.take_outgoing();
        engine
    }

    fn draw_circle(engine: &mut CollabEngine, user: &str, x: f64, y: f64) {
        engine
            .handle_event(
                SESSION,
                user,
                ClientEvent::StartDrawing {
                    tool_id: "circle".into(),
                    image_id: "img-1".into(),
                    layer_id: None,
                    point: Point::new(x, y),
                    settings: DrawingOverrides::default(),
                },
            )
            .unwrap();
        engine
            .handle_event(
                SESSION,
                user,
                ClientEvent::FinishDrawing { point: Some(Point::new(x + 8.0, y)), text: None },
            )
            .unwrap();
    }

    #[test]
    fn test_finished_drawing_is_retrievable() {
        let mut engine = engine_with_session();
        draw_circle(&mut engine, "grower-1", 100.0, 100.0);

        let annotations = engine.session_annotations(SESSION, None).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].kind, AnnotationKind::Circle);
        assert_eq!(annotations[0].metadata.version, 1);

        let events = engine.take_outgoing();
        assert!(events.iter().any(|e| matches!(
            e.event,
            ServerEvent::AnnotationCreated { .. }
        )));
    }

    #[test]
    fn test_concurrent_marks_are_nudged_apart() {
        let mut engine = engine_with_session();
        draw_circle(&mut engine, "grower-1", 100.0, 100.0);
        // A second mark almost on top of the first, backdated so the first
        // circle's history entry falls inside its transform window.
        let raw = RawOperation {
            op_type: Some("annotate".into()),
            image_id: Some("img-1".into()),
            annotation_type: Some("circle".into()),
            coordinates: Some(vec![json!(102.0), json!(101.0), json!(8.0)]),
            timestamp: Some(0),
            ..Default::default()
        };
        engine
            .handle_event(SESSION, "expert-1", ClientEvent::WorkspaceUpdate { data: raw })
            .unwrap();

        let annotations = engine.session_annotations(SESSION, None).unwrap();
        assert_eq!(annotations.len(), 2);
        let second = &annotations[1];
        // Nudged off (102, 101) by a magnitude-15 vector.
        let dx = second.coordinates[0] - 102.0;
        let dy = second.coordinates[1] - 101.0;
        assert!(((dx * dx + dy * dy).sqrt() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_annotation_update_bumps_version() {
        let mut engine = engine_with_session();
        draw_circle(&mut engine, "grower-1", 50.0, 50.0);
        let id = engine.session_annotations(SESSION, None).unwrap()[0].id;

        engine
            .handle_event(
                SESSION,
                "expert-1",
                ClientEvent::AnnotationUpdate {
                    annotation_id: Some(id),
                    image_id: "img-1".into(),
                    operation: AnnotationAction::Update,
                    data: json!({ "text": "chlorotic lesion" }),
                },
            )
            .unwrap();

        let annotations = engine.session_annotations(SESSION, None).unwrap();
        assert_eq!(annotations[0].metadata.version, 2);
        assert_eq!(annotations[0].text.as_deref(), Some("chlorotic lesion"));
    }

    #[test]
    fn test_annotation_delete_removes_from_layer() {
        let mut engine = engine_with_session();
        draw_circle(&mut engine, "grower-1", 50.0, 50.0);
        let id = engine.session_annotations(SESSION, None).unwrap()[0].id;

        engine
            .handle_event(
                SESSION,
                "grower-1",
                ClientEvent::AnnotationUpdate {
                    annotation_id: Some(id),
                    image_id: "img-1".into(),
                    operation: AnnotationAction::Delete,
                    data: json!({}),
                },
            )
            .unwrap();

        assert!(engine.session_annotations(SESSION, None).unwrap().is_empty());
        let events = engine.take_outgoing();
        assert!(events.iter().any(|e| matches!(
            e.event,
            ServerEvent::AnnotationDeleted { .. }
        )));
    }

    #[test]
    fn test_rectangle_validation_round_trip() {
        let mut engine = engine_with_session();

        // Two coordinates are rejected before any state mutates.
        let err = engine.handle_event(
            SESSION,
            "grower-1",
            ClientEvent::AnnotationUpdate {
                annotation_id: None,
                image_id: "img-1".into(),
                operation: AnnotationAction::Create,
                data: json!({ "annotation_type": "rectangle", "coordinates": [5.0, 5.0] }),
            },
        );
        assert!(matches!(err, Err(CollabError::Validation(_))));
        assert!(engine.session_annotations(SESSION, None).unwrap().is_empty());

        // Four coordinates succeed and the annotation is retrievable.
        engine
            .handle_event(
                SESSION,
                "grower-1",
                ClientEvent::AnnotationUpdate {
                    annotation_id: None,
                    image_id: "img-1".into(),
                    operation: AnnotationAction::Create,
                    data: json!({
                        "annotation_type": "rectangle",
                        "coordinates": [5.0, 5.0, 40.0, 30.0]
                    }),
                },
            )
            .unwrap();

        let annotations = engine.session_annotations(SESSION, None).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].kind, AnnotationKind::Rectangle);
    }

    #[test]
    fn test_unknown_annotation_update_is_not_found() {
        let mut engine = engine_with_session();
        let err = engine.handle_event(
            SESSION,
            "grower-1",
            ClientEvent::AnnotationUpdate {
                annotation_id: Some(Uuid::new_v4()),
                image_id: "img-1".into(),
                operation: AnnotationAction::Update,
                data: json!({ "text": "ghost" }),
            },
        );
        assert!(matches!(err, Err(CollabError::NotFound { .. })));
    }

    #[test]
    fn test_text_operations_edit_shared_notes() {
        let mut engine = engine_with_session();
        let insert = RawOperation {
            op_type: Some("insert".into()),
            position: Some(0.0),
            content: Some(json!("rust pustules on lower leaves")),
            ..Default::default()
        };
        engine
            .handle_event(SESSION, "grower-1", ClientEvent::WorkspaceUpdate { data: insert })
            .unwrap();

        let delete = RawOperation {
            op_type: Some("delete".into()),
            position: Some(0.0),
            length: Some(5.0),
            ..Default::default()
        };
        engine
            .handle_event(SESSION, "grower-1", ClientEvent::WorkspaceUpdate { data: delete })
            .unwrap();

        let notes = &engine.sessions().get(SESSION).unwrap().workspace.shared_notes;
        assert_eq!(notes, "pustules on lower leaves");
    }

    #[test]
    fn test_move_reorders_crop_images() {
        let mut engine = engine_with_session();
        engine
            .update_workspace(
                SESSION,
                WorkspacePatch {
                    crop_images: Some(vec![
                        CropImage {
                            id: "img-1".into(),
                            url: "https://plots.example/1.jpg".into(),
                            caption: None,
                            uploaded_by: "grower-1".into(),
                            uploaded_at: 1,
                        },
                        CropImage {
                            id: "img-2".into(),
                            url: "https://plots.example/2.jpg".into(),
                            caption: None,
                            uploaded_by: "grower-1".into(),
                            uploaded_at: 2,
                        },
                    ]),
                    ..Default::default()
                },
            )
            .unwrap();

        let mv = RawOperation {
            op_type: Some("move".into()),
            target_id: Some("img-2".into()),
            position: Some(0.0),
            ..Default::default()
        };
        engine
            .handle_event(SESSION, "grower-1", ClientEvent::WorkspaceUpdate { data: mv })
            .unwrap();

        let images = &engine.sessions().get(SESSION).unwrap().workspace.crop_images;
        assert_eq!(images[0].id, "img-2");
        assert_eq!(images[1].id, "img-1");
    }

    #[test]
    fn test_batch_operations_broadcast_sequenced_updates() {
        let mut engine = engine_with_session();
        let ops = vec![
            RawOperation {
                op_type: Some("insert".into()),
                position: Some(0.0),
                content: Some(json!("a")),
                ..Default::default()
            },
            RawOperation {
                op_type: Some("insert".into()),
                position: Some(100.0),
                content: Some(json!("b")),
                ..Default::default()
            },
        ];
        engine
            .handle_event(SESSION, "grower-1", ClientEvent::BatchOperations { operations: ops })
            .unwrap();

        let events = engine.take_outgoing();
        let batch = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::BatchUpdates { updates } => Some(updates),
                _ => None,
            })
            .expect("batch-updates event");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].sequence_number + 1, batch[1].sequence_number);
    }

    #[test]
    fn test_layer_filter_and_creation_order() {
        let mut engine = engine_with_session();
        draw_circle(&mut engine, "grower-1", 10.0, 10.0);
        draw_circle(&mut engine, "grower-1", 500.0, 500.0);

        let all = engine.session_annotations(SESSION, None).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].metadata.created_at <= all[1].metadata.created_at);

        assert!(engine
            .session_annotations(SESSION, Some("overlay"))
            .unwrap()
            .is_empty());
        assert_eq!(
            engine
                .session_annotations(SESSION, Some(crate::session::DEFAULT_LAYER))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_chat_messages_are_scrubbed_and_broadcast() {
        let mut engine = engine_with_session();
        engine
            .handle_event(
                SESSION,
                "grower-1",
                ClientEvent::ChatMessage { text: "see <script>x()</script>the stem".into() },
            )
            .unwrap();

        let session = engine.sessions().get(SESSION).unwrap();
        assert_eq!(session.chat_history.len(), 1);
        assert_eq!(session.chat_history[0].text, "see the stem");

        let events = engine.take_outgoing();
        assert!(events.iter().any(|e| matches!(e.event, ServerEvent::ChatMessage { .. })));
    }

    #[test]
    fn test_sweep_drops_all_session_state() {
        let mut engine = engine_with_session();
        draw_circle(&mut engine, "grower-1", 10.0, 10.0);
        engine.take_outgoing();

        // Backdate everything past the idle threshold.
        let now = now_ms() + 25 * 60 * 60 * 1_000;
        let evicted = engine.sweep_idle(now);
        assert_eq!(evicted, vec![SESSION.to_string()]);
        assert!(engine.sessions().get(SESSION).is_err());

        let events = engine.take_outgoing();
        assert!(events.iter().any(|e| matches!(e.event, ServerEvent::SessionClosed { .. })));
    }

    #[test]
    fn test_operations_against_missing_session_fail() {
        let mut engine = CollabEngine::new();
        let err = engine.handle_event(
            "nope",
            "user-1",
            ClientEvent::ChatMessage { text: "hello".into() },
        );
        assert!(matches!(err, Err(CollabError::NotFound { .. })));
    }
}
