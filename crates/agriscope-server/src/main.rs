//! Agriscope WebSocket Relay Server
//!
//! Bridges clients to the collaboration engine: inbound frames become
//! [`ClientEvent`]s, the engine's queued broadcasts fan out over per-session
//! rooms.
//!
//! ## Protocol
//!
//! Connect to `/ws?session=<session-id>&user=<user-id>`, then exchange JSON
//! frames:
//! ```json
//! { "type": "join-session", "name": "Amara", "role": "grower" }
//! { "type": "start-drawing", "tool_id": "circle", "image_id": "img-1", "point": { "x": 10, "y": 20 } }
//! { "type": "chat-message", "text": "look at the lower leaves" }
//! ```

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, sync::Mutex, time::Duration};
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use agriscope_core::engine::CollabEngine;
use agriscope_core::events::{BroadcastScope, Broadcaster, ClientEvent, OutboundEvent, ServerEvent};
use agriscope_core::operation::now_ms;
use agriscope_core::session::IDLE_SWEEP_INTERVAL_SECS;

const CHANNEL_CAPACITY: usize = 256;

/// A frame fanned out to a room: origin user plus serialized event.
type Frame = (String, String);

/// Shared application state.
struct AppState {
    /// The single-owner collaboration engine. Handlers lock, run to
    /// completion, and release before any await point.
    engine: Mutex<CollabEngine>,
    /// Fan-out channels keyed by scope (`session:`, `user:`, `region:`).
    rooms: DashMap<String, broadcast::Sender<Frame>>,
}

impl AppState {
    fn new() -> Self {
        Self {
            engine: Mutex::new(CollabEngine::new()),
            rooms: DashMap::new(),
        }
    }

    fn room(&self, key: &str) -> broadcast::Sender<Frame> {
        self.rooms
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn send_to_room(&self, key: &str, origin: &str, event: &ServerEvent) {
        if let Some(room) = self.rooms.get(key) {
            match serde_json::to_string(event) {
                Ok(json) => {
                    let _ = room.send((origin.to_string(), json));
                }
                Err(err) => warn!("failed to serialize outbound event: {err}"),
            }
        }
    }

    /// Route the engine's queued broadcasts into their rooms.
    fn fan_out(&self, origin: &str, outgoing: Vec<OutboundEvent>) {
        for outbound in outgoing {
            self.deliver_from(origin, &outbound);
        }
    }

    fn deliver_from(&self, origin: &str, outbound: &OutboundEvent) {
        match &outbound.scope {
            BroadcastScope::Session(id) => {
                self.send_to_room(&format!("session:{id}"), origin, &outbound.event)
            }
            BroadcastScope::User(id) => {
                // Direct frames always reach the target, even if it is the
                // origin connection.
                self.send_to_room(&format!("user:{id}"), "", &outbound.event)
            }
            BroadcastScope::Region(id) => {
                self.send_to_room(&format!("region:{id}"), origin, &outbound.event)
            }
        }
    }
}

impl Broadcaster for AppState {
    fn broadcast_to_session(&self, session_id: &str, event: &ServerEvent) {
        self.send_to_room(&format!("session:{session_id}"), "", event);
    }

    fn broadcast_to_user(&self, user_id: &str, event: &ServerEvent) {
        self.send_to_room(&format!("user:{user_id}"), "", event);
    }

    fn broadcast_to_region(&self, region_id: &str, event: &ServerEvent) {
        self.send_to_room(&format!("region:{region_id}"), "", event);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agriscope_server=info,tower_http=info".into()),
        )
        .init();

    let state = Arc::new(AppState::new());

    // Idle-session reaper: fixed cadence, non-overlapping ticks.
    let reaper_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(IDLE_SWEEP_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outgoing = {
                let mut engine = reaper_state.engine.lock().expect("engine lock");
                let evicted = engine.sweep_idle(now_ms());
                if !evicted.is_empty() {
                    info!("idle sweep evicted {} session(s)", evicted.len());
                }
                engine.take_outgoing()
            };
            for outbound in &outgoing {
                reaper_state.deliver(outbound);
            }
        }
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 4040));
    info!("Agriscope relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://localhost:4040/ws");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind listen address");
    axum::serve(listener, app).await.expect("serve");
}

/// Index page
async fn index() -> &'static str {
    "Agriscope Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// Connection identity, from query parameters.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    session: String,
    user: String,
    #[serde(default)]
    region: Option<String>,
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

/// Handle a WebSocket connection for one (session, user) pair.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let conn_id = Uuid::new_v4();
    let session_id = params.session;
    let user_id = params.user;
    info!("connection {conn_id} opened: user {user_id} on session {session_id}");

    let mut session_rx = state.room(&format!("session:{session_id}")).subscribe();
    let mut user_rx = state.room(&format!("user:{user_id}")).subscribe();
    let mut region_rx = params
        .region
        .as_deref()
        .map(|region| state.room(&format!("region:{region}")).subscribe());

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // Frames from the client.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                let result = {
                                    let mut engine = state.engine.lock().expect("engine lock");
                                    engine
                                        .handle_event(&session_id, &user_id, event)
                                        .map(|()| engine.take_outgoing())
                                };
                                match result {
                                    Ok(outgoing) => state.fan_out(&user_id, outgoing),
                                    Err(err) => {
                                        // Errors go back to the offending
                                        // client only; session state is
                                        // untouched.
                                        warn!("rejected event from {user_id}: {err}");
                                        let error = ServerEvent::Error { message: err.to_string() };
                                        if let Ok(json) = serde_json::to_string(&error) {
                                            if sender.send(Message::Text(json.into())).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                            Err(err) => {
                                warn!("invalid frame from {user_id}: {err}");
                                let error = ServerEvent::Error {
                                    message: format!("invalid message: {err}"),
                                };
                                if let Ok(json) = serde_json::to_string(&error) {
                                    let _ = sender.send(Message::Text(json.into())).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ignore binary, ping, pong.
                    Some(Err(err)) => {
                        warn!("websocket error for {user_id}: {err}");
                        break;
                    }
                }
            }

            // Session-scoped broadcasts; the origin already holds the
            // authoritative result, so it is not echoed.
            frame = session_rx.recv() => {
                match frame {
                    Ok((origin, json)) => {
                        if origin != user_id
                            && sender.send(Message::Text(json.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("connection for {user_id} lagged, dropped {skipped} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Direct frames for this user.
            frame = user_rx.recv() => {
                match frame {
                    Ok((_, json)) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("user channel for {user_id} lagged, dropped {skipped} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Region-wide advisories, when subscribed.
            frame = async {
                match &mut region_rx {
                    Some(rx) => rx.recv().await.ok(),
                    None => std::future::pending().await,
                }
            } => {
                if let Some((origin, json)) = frame {
                    if origin != user_id
                        && sender.send(Message::Text(json.into())).await.is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    // Cleanup on disconnect.
    let outgoing = {
        let mut engine = state.engine.lock().expect("engine lock");
        match engine.handle_event(&session_id, &user_id, ClientEvent::LeaveSession) {
            Ok(()) => engine.take_outgoing(),
            Err(_) => Vec::new(), // Session may already be swept.
        }
    };
    state.fan_out(&user_id, outgoing);
    info!("connection {conn_id} closed: user {user_id} on session {session_id}");
}
