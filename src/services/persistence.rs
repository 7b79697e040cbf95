//! Persistence service — background flush of game documents to Postgres.
//!
//! DESIGN
//! ======
//! The store is authoritative in memory; a background task drains its dirty
//! and deleted sets on an interval, upserts/deletes rows, and then evicts
//! finished games nobody watches. Unfinished games hydrate back into the
//! store at startup so the lobby and rejoin survive a restart.
//!
//! ERROR HANDLING
//! ==============
//! Dirty flags are cleared only after successful writes. This prioritizes
//! durability over duplicate flush attempts: repeated upserts are acceptable,
//! silent data loss is not. Rows that fail to decode during hydration are
//! logged and skipped rather than taking the server down.

use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::state::{AppState, GamePresence, GameSession, GameStatus, PlayerSlots};

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Spawn the background persistence task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState) -> JoinHandle<()> {
    let flush_interval_ms = env_parse("FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS);
    info!(flush_interval_ms, "game persistence flush configured");
    tokio::spawn(async move {
        loop {
            flush_cycle(&state).await;
            tokio::time::sleep(Duration::from_millis(flush_interval_ms)).await;
        }
    })
}

/// One flush pass: dirty upserts, deferred deletes, then eviction of idle
/// finished games. Failures retain the dirty/deleted sets for the next pass.
async fn flush_cycle(state: &AppState) {
    let dirty = state.store.snapshot_dirty().await;
    if !dirty.is_empty() {
        let versions: Vec<(Uuid, i64)> = dirty.iter().map(|d| (d.id, d.version)).collect();
        match flush_games(&state.pool, &dirty).await {
            Ok(()) => state.store.ack_flushed(&versions).await,
            Err(e) => {
                error!(error = %e, count = dirty.len(), "game flush failed; retrying next cycle");
            }
        }
    }

    let deleted = state.store.snapshot_deleted().await;
    if !deleted.is_empty() {
        match delete_games(&state.pool, &deleted).await {
            Ok(()) => state.store.ack_deleted(&deleted).await,
            Err(e) => {
                error!(error = %e, count = deleted.len(), "game delete flush failed; retrying next cycle");
            }
        }
    }

    let evicted = state.store.evict_idle_finished().await;
    if evicted > 0 {
        info!(evicted, "idle finished games evicted");
    }
}

#[cfg(test)]
pub(crate) async fn flush_cycle_for_tests(state: &AppState) {
    flush_cycle(state).await;
}

// =============================================================================
// ROW MAPPING
// =============================================================================

type GameRow = (
    Uuid,                     // id
    serde_json::Value,        // board
    String,                   // current_player
    String,                   // status
    Uuid,                     // player_x
    Option<Uuid>,             // player_o
    String,                   // creator_name
    Option<serde_json::Value>, // result
    i64,                      // version
    i64,                      // created_at
    i64,                      // updated_at
);

fn session_from_row(row: GameRow) -> Option<GameSession> {
    let (id, board, current_player, status, player_x, player_o, creator_name, result, version, created_at, updated_at) =
        row;

    let board = serde_json::from_value(board)
        .map_err(|e| warn!(game_id = %id, error = %e, "skipping row with undecodable board"))
        .ok()?;
    let current_player = serde_json::from_value(serde_json::Value::String(current_player))
        .map_err(|e| warn!(game_id = %id, error = %e, "skipping row with undecodable player"))
        .ok()?;
    let status: GameStatus = status
        .parse()
        .map_err(|e: String| warn!(game_id = %id, error = %e, "skipping row with undecodable status"))
        .ok()?;
    let result = match result {
        None => None,
        Some(value) => Some(
            serde_json::from_value(value)
                .map_err(|e| warn!(game_id = %id, error = %e, "skipping row with undecodable result"))
                .ok()?,
        ),
    };

    Some(GameSession {
        id,
        board,
        current_player,
        status,
        players: PlayerSlots { x: player_x, o: player_o },
        // X is always the creator.
        creator_id: player_x,
        creator_name,
        created_at,
        updated_at,
        result,
        presence: GamePresence::default(),
        version,
    })
}

// =============================================================================
// QUERIES
// =============================================================================

/// Batch upsert game documents. Presence never reaches the database.
///
/// # Errors
///
/// Returns a database error; the caller keeps dirty flags set for retry.
pub async fn flush_games(pool: &PgPool, games: &[GameSession]) -> Result<(), sqlx::Error> {
    for game in games {
        sqlx::query(
            "INSERT INTO games (id, board, current_player, status, player_x, player_o, creator_name, result, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO UPDATE SET \
                 board = EXCLUDED.board, current_player = EXCLUDED.current_player, \
                 status = EXCLUDED.status, player_o = EXCLUDED.player_o, \
                 result = EXCLUDED.result, version = EXCLUDED.version, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(game.id)
        .bind(serde_json::to_value(game.board).unwrap_or_default())
        .bind(game.current_player.as_str())
        .bind(game.status.as_str())
        .bind(game.players.x)
        .bind(game.players.o)
        .bind(&game.creator_name)
        .bind(game.result.as_ref().map(|r| serde_json::to_value(r).unwrap_or_default()))
        .bind(game.version)
        .bind(game.created_at)
        .bind(game.updated_at)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Remove deleted documents' rows.
///
/// # Errors
///
/// Returns a database error; the caller keeps the deleted set for retry.
pub async fn delete_games(pool: &PgPool, ids: &[Uuid]) -> Result<(), sqlx::Error> {
    for id in ids {
        sqlx::query("DELETE FROM games WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Load every unfinished game into the store at startup. Returns how many
/// were hydrated.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn hydrate_unfinished(state: &AppState) -> Result<usize, sqlx::Error> {
    let rows = sqlx::query_as::<_, GameRow>(
        "SELECT id, board, current_player, status, player_x, player_o, creator_name, result, version, created_at, updated_at \
         FROM games WHERE status <> 'finished'",
    )
    .fetch_all(&state.pool)
    .await?;

    let sessions: Vec<GameSession> = rows.into_iter().filter_map(session_from_row).collect();
    let count = sessions.len();
    state.store.hydrate(sessions).await;
    Ok(count)
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
