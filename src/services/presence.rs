//! Presence service — per-player liveness over the store's presence channel.
//!
//! DESIGN
//! ======
//! Presence is a best-effort signal, independent of game consistency. Each
//! player owns exactly one slot per game and never writes the other slot.
//! Liveness combines two mechanisms: a deferred offline write the store
//! fires on transport disconnect (survives client crashes), and an explicit
//! offline write on graceful leave. The stored `online` flag is a hint — a
//! client can vanish without the deferred write landing promptly — so
//! callers must combine it with a recency check on `last_seen` before
//! calling a player online.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::frame::{Frame, now_ms};
use crate::rules::Player;
use crate::state::{AppState, GamePresence, PresenceRecord};
use crate::store::StoreError;

/// How long after `last_seen` a player still counts as online.
pub const DEFAULT_GRACE_MS: i64 = 10_000;

/// Derived liveness judgment for one player slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    /// No record yet — the player never announced itself.
    Unknown,
}

// =============================================================================
// DERIVED LIVENESS
// =============================================================================

/// Recency check at an explicit instant. Pure; the entry point for tests.
#[must_use]
pub fn is_online_at(last_seen: i64, now: i64, grace_ms: i64) -> bool {
    now - last_seen < grace_ms
}

/// Whether `last_seen` is within the grace period of the current time.
#[must_use]
pub fn is_online(last_seen: i64, grace_ms: i64) -> bool {
    is_online_at(last_seen, now_ms(), grace_ms)
}

/// Judge a slot: online only when the stored flag says so AND the record is
/// recent; a stale `online=true` is reported offline. No record is unknown.
#[must_use]
pub fn status_at(record: Option<PresenceRecord>, now: i64, grace_ms: i64) -> PresenceStatus {
    match record {
        None => PresenceStatus::Unknown,
        Some(rec) if rec.online && is_online_at(rec.last_seen, now, grace_ms) => PresenceStatus::Online,
        Some(_) => PresenceStatus::Offline,
    }
}

// =============================================================================
// WRITES
// =============================================================================

/// Arm the deferred offline write for `(game, player)` on connection `conn`,
/// then immediately mark the player online. Called whenever a player's
/// symbol becomes known: on create for X, on join for O, and again when a
/// reconnecting client re-identifies its symbol.
///
/// # Errors
///
/// Returns `NotFound` when the game is gone; callers treat presence as
/// best-effort and log rather than fail the surrounding operation.
pub async fn setup_disconnect_handler(
    state: &AppState,
    conn: Uuid,
    game_id: Uuid,
    player: Player,
) -> Result<(), StoreError> {
    state.store.register_disconnect_write(conn, game_id, player).await;
    set_online(state, game_id, player).await
}

/// Mark a player online now.
///
/// # Errors
///
/// Returns `NotFound` when the game is gone.
pub async fn set_online(state: &AppState, game_id: Uuid, player: Player) -> Result<(), StoreError> {
    state
        .store
        .write_presence(game_id, player, PresenceRecord { online: true, last_seen: now_ms() })
        .await
}

/// Mark a player offline now.
///
/// # Errors
///
/// Returns `NotFound` when the game is gone.
pub async fn set_offline(state: &AppState, game_id: Uuid, player: Player) -> Result<(), StoreError> {
    state
        .store
        .write_presence(game_id, player, PresenceRecord { online: false, last_seen: now_ms() })
        .await
}

/// Best-effort offline write on graceful leave — in addition to, not
/// instead of, the armed disconnect write. Never fails the caller.
pub async fn cleanup_presence(state: &AppState, game_id: Uuid, player: Player) {
    if let Err(e) = set_offline(state, game_id, player).await {
        debug!(game_id = %game_id, %player, error = %e, "presence cleanup skipped");
    }
}

// =============================================================================
// LISTENERS
// =============================================================================

/// Watch a game's presence sub-document. Returns the current value, or
/// `None` when the game does not exist.
pub async fn listen_to_presence(
    state: &AppState,
    game_id: Uuid,
    watcher: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Option<GamePresence> {
    state.store.subscribe_presence(game_id, watcher, tx).await
}

pub async fn stop_listening_to_presence(state: &AppState, game_id: Uuid, watcher: Uuid) {
    state.store.unsubscribe_presence(game_id, watcher).await;
}

// =============================================================================
// TESTS
// =============================================================================
