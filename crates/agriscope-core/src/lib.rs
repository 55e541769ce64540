//! Agriscope Core Library
//!
//! Real-time collaboration consistency engine for crop-image diagnosis
//! sessions: the operation model, the pairwise operational transform,
//! conflict resolution, sequencing and validation, per-session state, and
//! the drawing state machine that feeds it.

pub mod annotation;
pub mod drawing;
pub mod engine;
pub mod error;
pub mod events;
pub mod operation;
pub mod processor;
pub mod sanitize;
pub mod session;
pub mod transform;

pub use annotation::{Annotation, AnnotationKind, AnnotationStyle, Measurements};
pub use drawing::{DrawingOverrides, DrawingState, DrawingStateMachine, TOOL_REGISTRY};
pub use engine::CollabEngine;
pub use error::{CollabError, CollabResult};
pub use events::{BroadcastScope, Broadcaster, ClientEvent, OutboundEvent, ServerEvent};
pub use operation::{Operation, OperationKind};
pub use processor::{EventProcessor, UpdateEnvelope};
pub use session::{SessionState, SessionStatus, SessionStore};
pub use transform::{ConflictRegistry, ConflictResolution, ConflictStrategy, transform};
