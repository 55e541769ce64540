//! Session state store: canonical per-session workspace state, participant
//! roster, and chat log.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::annotation::Annotation;
use crate::error::{CollabError, CollabResult};
use crate::operation::now_ms;

/// Chat log cap per session; oldest messages drop first.
pub const MAX_CHAT_HISTORY: usize = 100;
/// Sessions idle longer than this are closed and evicted by the sweep.
pub const IDLE_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1_000;
/// Reference cadence for the idle sweep.
pub const IDLE_SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Layer annotations land on when the client names none.
pub const DEFAULT_LAYER: &str = "base";

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Paused,
    Completed,
}

/// Role of a participant within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    Expert,
    #[default]
    Grower,
    Observer,
}

/// A user present in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub name: String,
    pub role: ParticipantRole,
    pub joined_at: u64,
    pub last_activity: u64,
}

/// A chat message in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: String,
    pub text: String,
    pub timestamp: u64,
}

/// A crop photo under discussion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropImage {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub uploaded_by: String,
    pub uploaded_at: u64,
}

/// A recommendation left by an agronomy expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertRecommendation {
    pub id: Uuid,
    pub expert_id: String,
    pub text: String,
    pub created_at: u64,
}

/// The shared, mutable collaborative surface of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceState {
    /// Crop photos, in presentation order; `Move` operations reorder this.
    pub crop_images: Vec<CropImage>,
    /// Opaque output of the external diagnosis pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_data: Option<Value>,
    /// Annotations grouped by layer.
    pub annotations: HashMap<String, Vec<Annotation>>,
    pub expert_recommendations: Vec<ExpertRecommendation>,
    /// Document-like surface edited by insert/delete/retain operations.
    pub shared_notes: String,
}

/// Partial workspace update; present fields replace the existing ones
/// wholesale (shallow merge, last write wins per top-level field).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspacePatch {
    #[serde(default)]
    pub crop_images: Option<Vec<CropImage>>,
    #[serde(default)]
    pub diagnostic_data: Option<Value>,
    #[serde(default)]
    pub annotations: Option<HashMap<String, Vec<Annotation>>>,
    #[serde(default)]
    pub expert_recommendations: Option<Vec<ExpertRecommendation>>,
    #[serde(default)]
    pub shared_notes: Option<String>,
}

/// Canonical state of one live collaboration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub title: String,
    pub created_by: String,
    pub created_at: u64,
    pub participants: Vec<Participant>,
    pub workspace: WorkspaceState,
    pub chat_history: Vec<ChatMessage>,
    pub status: SessionStatus,
}

impl SessionState {
    /// Most recent activity: the later of creation and any participant's
    /// last activity.
    pub fn last_activity(&self) -> u64 {
        self.participants
            .iter()
            .map(|p| p.last_activity)
            .fold(self.created_at, u64::max)
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}

/// Authorization hook for joining sessions.
///
/// The default admits any user into any active session. Deployments inject a
/// real capability check here without touching the engine contract.
pub trait JoinPolicy {
    fn can_join(&self, session: &SessionState, user_id: &str) -> bool;
}

/// Admits everyone into active sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveJoinPolicy;

impl JoinPolicy for PermissiveJoinPolicy {
    fn can_join(&self, session: &SessionState, _user_id: &str) -> bool {
        session.status == SessionStatus::Active
    }
}

/// In-memory store of all live sessions plus a reverse user index.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, SessionState>,
    /// user_id -> sessions the user participates in.
    user_index: HashMap<String, HashSet<String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new active session.
    pub fn create_session(
        &mut self,
        session_id: impl Into<String>,
        title: impl Into<String>,
        created_by: impl Into<String>,
    ) {
        let session_id = session_id.into();
        let state = SessionState {
            session_id: session_id.clone(),
            title: title.into(),
            created_by: created_by.into(),
            created_at: now_ms(),
            participants: Vec::new(),
            workspace: WorkspaceState::default(),
            chat_history: Vec::new(),
            status: SessionStatus::Active,
        };
        self.sessions.insert(session_id, state);
    }

    pub fn get(&self, session_id: &str) -> CollabResult<&SessionState> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))
    }

    pub fn get_mut(&mut self, session_id: &str) -> CollabResult<&mut SessionState> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Sessions a user currently participates in.
    pub fn sessions_for_user(&self, user_id: &str) -> Vec<&SessionState> {
        let Some(ids) = self.user_index.get(user_id) else {
            return Vec::new();
        };
        let mut sessions: Vec<_> = ids.iter().filter_map(|id| self.sessions.get(id)).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Whether a user may join a session under the given policy.
    pub fn can_user_join(
        &self,
        session_id: &str,
        user_id: &str,
        policy: &dyn JoinPolicy,
    ) -> CollabResult<bool> {
        Ok(policy.can_join(self.get(session_id)?, user_id))
    }

    /// Add a participant, replacing any prior entry for the same user.
    /// Returns the roster entry as recorded.
    pub fn add_participant(
        &mut self,
        session_id: &str,
        user_id: impl Into<String>,
        name: impl Into<String>,
        role: ParticipantRole,
    ) -> CollabResult<Participant> {
        let user_id = user_id.into();
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        let now = now_ms();
        let participant = Participant {
            user_id: user_id.clone(),
            name: name.into(),
            role,
            joined_at: now,
            last_activity: now,
        };
        // Rejoin replaces the prior entry; the roster never holds duplicates.
        session.participants.retain(|p| p.user_id != user_id);
        session.participants.push(participant.clone());
        self.user_index
            .entry(user_id)
            .or_default()
            .insert(session_id.to_string());
        Ok(participant)
    }

    pub fn remove_participant(&mut self, session_id: &str, user_id: &str) -> CollabResult<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        session.participants.retain(|p| p.user_id != user_id);
        if let Some(ids) = self.user_index.get_mut(user_id) {
            ids.remove(session_id);
            if ids.is_empty() {
                self.user_index.remove(user_id);
            }
        }
        Ok(())
    }

    /// Record activity for a participant.
    pub fn touch(&mut self, session_id: &str, user_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            let now = now_ms();
            if let Some(p) = session.participants.iter_mut().find(|p| p.user_id == user_id) {
                p.last_activity = now;
            }
        }
    }

    /// Shallow-merge a partial workspace update into a session.
    pub fn update_workspace(
        &mut self,
        session_id: &str,
        patch: WorkspacePatch,
    ) -> CollabResult<&WorkspaceState> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        let workspace = &mut session.workspace;
        if let Some(crop_images) = patch.crop_images {
            workspace.crop_images = crop_images;
        }
        if let Some(diagnostic_data) = patch.diagnostic_data {
            workspace.diagnostic_data = Some(diagnostic_data);
        }
        if let Some(annotations) = patch.annotations {
            workspace.annotations = annotations;
        }
        if let Some(recommendations) = patch.expert_recommendations {
            workspace.expert_recommendations = recommendations;
        }
        if let Some(notes) = patch.shared_notes {
            workspace.shared_notes = notes;
        }
        Ok(&session.workspace)
    }

    pub fn set_status(&mut self, session_id: &str, status: SessionStatus) -> CollabResult<()> {
        self.get_mut(session_id)?.status = status;
        Ok(())
    }

    /// Append a chat message, trimming the log to the newest
    /// [`MAX_CHAT_HISTORY`] entries.
    pub fn append_chat(&mut self, session_id: &str, message: ChatMessage) -> CollabResult<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::not_found("session", session_id))?;
        session.chat_history.push(message);
        if session.chat_history.len() > MAX_CHAT_HISTORY {
            let excess = session.chat_history.len() - MAX_CHAT_HISTORY;
            session.chat_history.drain(..excess);
        }
        Ok(())
    }

    /// Close and evict sessions idle longer than `max_idle_ms`.
    /// Returns the evicted session ids.
    pub fn sweep_idle(&mut self, now: u64, max_idle_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now.saturating_sub(s.last_activity()) > max_idle_ms)
            .map(|s| s.session_id.clone())
            .collect();

        for session_id in &expired {
            if let Some(mut session) = self.sessions.remove(session_id) {
                session.status = SessionStatus::Completed;
                log::info!(
                    "session {} closed after {}ms idle",
                    session_id,
                    now.saturating_sub(session.last_activity())
                );
                for participant in &session.participants {
                    if let Some(ids) = self.user_index.get_mut(&participant.user_id) {
                        ids.remove(session_id);
                        if ids.is_empty() {
                            self.user_index.remove(&participant.user_id);
                        }
                    }
                }
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
