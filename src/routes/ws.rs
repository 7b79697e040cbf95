//! WebSocket handler — frame dispatch over one session per connection.
//!
//! DESIGN
//! ======
//! On upgrade, the connection gets a client ID and a `SessionCoordinator`,
//! then enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Store push frames (game/presence/lobby changes) → forward to client
//!
//! Handler functions validate and call the coordinator, returning an
//! `Outcome`; the dispatch layer owns all outbound concerns. Pushes pass
//! through `note_outbound` so the coordinator's local snapshot stays in step
//! with what the client saw.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Store notifies watchers → frames forwarded to the client
//! 4. Close → teardown fires deferred presence writes and drops watchers

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, Status};
use crate::services::game::LeaveOutcome;
use crate::services::session::{SessionCoordinator, UserIdentity};
use crate::state::{AppState, GameSession};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. Handlers never send frames
/// directly; change propagation to other clients rides the store watchers.
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Send empty done to sender.
    Done,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    // Identity is minted by the external auth layer; the server consumes an
    // opaque id plus display name.
    let Some(user_id) = params.get("user_id").and_then(|s| s.parse::<Uuid>().ok()) else {
        return (StatusCode::UNAUTHORIZED, "user_id required").into_response();
    };
    let Some(name) = params.get("name").filter(|n| !n.is_empty()).cloned() else {
        return (StatusCode::UNAUTHORIZED, "name required").into_response();
    };

    let user = UserIdentity { id: user_id, display_name: name };
    ws.on_upgrade(move |socket| run_ws(socket, state, user))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user: UserIdentity) {
    let client_id = Uuid::new_v4();

    // Per-connection channel the store pushes change frames into.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);
    let mut coordinator = SessionCoordinator::new(client_id, user, client_tx);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", coordinator.user().id.to_string())
        .with_data("name", coordinator.user().display_name.clone());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, user_id = %coordinator.user().id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut coordinator, &text).await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                coordinator.note_outbound(&frame);
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Fires armed disconnect writes and drops this connection's watchers —
    // the path that still runs after an abrupt client crash.
    coordinator.teardown(&state).await;
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the
/// sender. Split from the socket loop so tests can exercise dispatch
/// end-to-end without a transport.
async fn process_inbound_text(
    state: &AppState,
    coordinator: &mut SessionCoordinator,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %coordinator.client_id(), error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new())
                .with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated user id as `from`.
    req.from = Some(coordinator.user().id.to_string());

    info!(
        client_id = %coordinator.client_id(),
        id = %req.id,
        syscall = %req.syscall,
        status = ?req.status,
        "ws: recv frame"
    );

    let result = match req.prefix() {
        "game" => handle_game(state, coordinator, &req).await,
        "lobby" => handle_lobby(state, coordinator, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// GAME HANDLERS
// =============================================================================

async fn handle_game(
    state: &AppState,
    coordinator: &mut SessionCoordinator,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "create" => match coordinator.create_game(state).await {
            Ok(session) => Ok(Outcome::Reply(session_data(&session))),
            Err(e) => Err(req.error_from(&e)),
        },
        "join" => {
            let Some(game_id) = requested_game_id(req) else {
                return Err(req.error("game_id required"));
            };
            match coordinator.join_game(state, game_id).await {
                Ok(session) => Ok(Outcome::Reply(session_data(&session))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "subscribe" => {
            let Some(game_id) = requested_game_id(req) else {
                return Err(req.error("game_id required"));
            };
            match coordinator.subscribe_game(state, game_id).await {
                Ok((session, presence)) => {
                    let mut data = session_data(&session);
                    data.insert(
                        "presence".into(),
                        serde_json::to_value(presence).unwrap_or_default(),
                    );
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "move" => {
            let Some(cell) = req
                .data
                .get("cell")
                .and_then(serde_json::Value::as_u64)
                .and_then(|c| usize::try_from(c).ok())
            else {
                return Err(req.error("cell required"));
            };
            match coordinator.make_move(state, cell).await {
                Ok(session) => Ok(Outcome::Reply(session_data(&session))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "leave" => match coordinator.leave_game(state).await {
            Ok((outcome, games)) => {
                let mut data = Data::new();
                data.insert("outcome".into(), serde_json::json!(outcome_label(&outcome)));
                data.insert("games".into(), serde_json::to_value(games).unwrap_or_default());
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        _ => Err(req.error(format!("unknown game op: {op}"))),
    }
}

// =============================================================================
// LOBBY HANDLERS
// =============================================================================

async fn handle_lobby(
    state: &AppState,
    coordinator: &mut SessionCoordinator,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "subscribe" => {
            let games = coordinator.subscribe_lobby(state).await;
            let mut data = Data::new();
            data.insert("games".into(), serde_json::to_value(games).unwrap_or_default());
            Ok(Outcome::Reply(data))
        }
        "unsubscribe" => {
            coordinator.unsubscribe_lobby(state).await;
            Ok(Outcome::Done)
        }
        _ => Err(req.error(format!("unknown lobby op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn requested_game_id(req: &Frame) -> Option<Uuid> {
    req.game_id.or_else(|| {
        req.data
            .get("game_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    })
}

fn session_data(session: &GameSession) -> Data {
    let mut data = Data::new();
    data.insert("game".into(), serde_json::to_value(session).unwrap_or_default());
    data
}

fn outcome_label(outcome: &LeaveOutcome) -> &'static str {
    match outcome {
        LeaveOutcome::Absent => "absent",
        LeaveOutcome::Deleted => "deleted",
        LeaveOutcome::Forfeited(_) => "forfeited",
        LeaveOutcome::Ignored => "ignored",
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame
            .data
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let message = frame
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
