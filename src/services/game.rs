//! Game service — session lifecycle against the shared document store.
//!
//! DESIGN
//! ======
//! Every mutating operation is an explicit read-then-validate-then-write
//! sequence: take a fresh snapshot, validate against it, then submit one
//! atomic patch. A cached snapshot is never trusted for a write decision.
//! `join_game` and `make_move` guard their patch on the snapshot version, so
//! two writers racing from the same pre-image cannot both commit — the loser
//! re-reads (join) or is told to retry (move) instead of clobbering the
//! winner.
//!
//! ERROR HANDLING
//! ==============
//! Validation failures are expected in normal operation and are never logged
//! as exceptional. A version conflict is the one retryable class: the state
//! moved underneath the caller, and the caller decides whether to try again
//! — the service never retries a move on its own, since a silent replay
//! could double-apply it.

use tracing::{error, info};
use uuid::Uuid;

use crate::frame::{ErrorCode, Frame};
use crate::rules::{self, Board, GameResult, MoveError, Player};
use crate::state::{AppState, GameListItem, GamePresence, GameSession, GameStatus, PlayerSlots};
use crate::store::{GameStore, SessionPatch, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("game not found: {0}")]
    NotFound(Uuid),
    #[error("game is {0}, operation needs a different state")]
    InvalidState(GameStatus),
    #[error("you are already in this game")]
    AlreadyJoined,
    #[error("you are not a player in this game")]
    NotAPlayer,
    #[error("it is not your turn, wait for the other player")]
    NotYourTurn,
    #[error("invalid move: cell {0} is occupied or out of range")]
    InvalidMove(usize),
    #[error("no active game for this session")]
    NoActiveGame,
    #[error("the game changed concurrently, retry the request")]
    Conflict,
    #[error("internal invariant violation: {0}")]
    Invariant(MoveError),
}

impl ErrorCode for GameError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_GAME_NOT_FOUND",
            Self::InvalidState(_) => "E_INVALID_STATE",
            Self::AlreadyJoined => "E_ALREADY_JOINED",
            Self::NotAPlayer => "E_NOT_A_PLAYER",
            Self::NotYourTurn => "E_NOT_YOUR_TURN",
            Self::InvalidMove(_) => "E_INVALID_MOVE",
            Self::NoActiveGame => "E_NO_ACTIVE_GAME",
            Self::Conflict => "E_CONFLICT",
            Self::Invariant(_) => "E_INTERNAL",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

impl From<StoreError> for GameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Conflict { .. } => Self::Conflict,
        }
    }
}

/// What `leave_game` did. Leaving is idempotent: absent and
/// already-finished games are left untouched.
#[derive(Debug)]
pub enum LeaveOutcome {
    /// The game no longer exists.
    Absent,
    /// Waiting game deleted by its creator.
    Deleted,
    /// Playing game finished with the opponent declared winner.
    Forfeited(Box<GameSession>),
    /// Nothing to do (already finished, or a waiting game the caller
    /// does not own).
    Ignored,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Create a new waiting game owned by `user_id`. The creator always plays X.
pub async fn create_game(state: &AppState, user_id: Uuid, user_name: &str) -> GameSession {
    let now = crate::frame::now_ms();
    let session = GameSession {
        id: GameStore::allocate_id(),
        board: Board::empty(),
        current_player: Player::X,
        status: GameStatus::Waiting,
        players: PlayerSlots { x: user_id, o: None },
        creator_id: user_id,
        creator_name: user_name.to_string(),
        created_at: now,
        updated_at: now,
        result: None,
        presence: GamePresence::default(),
        version: 1,
    };
    state.store.create(session.clone()).await;
    session
}

fn validate_join(game: &GameSession, user_id: Uuid) -> Result<(), GameError> {
    if game.status != GameStatus::Waiting {
        return Err(GameError::InvalidState(game.status));
    }
    if game.players.x == user_id {
        return Err(GameError::AlreadyJoined);
    }
    Ok(())
}

/// Join a waiting game as O, atomically flipping it to playing.
///
/// # Errors
///
/// `NotFound`, `InvalidState` (not waiting), `AlreadyJoined` (creator
/// joining its own game). Losing the join race surfaces as whatever the
/// fresh read reveals — usually `InvalidState`, since the winner already
/// flipped the game to playing.
pub async fn join_game(state: &AppState, game_id: Uuid, user_id: Uuid) -> Result<GameSession, GameError> {
    let game = state
        .store
        .read_once(game_id)
        .await
        .ok_or(GameError::NotFound(game_id))?;
    validate_join(&game, user_id)?;

    let patch = SessionPatch {
        player_o: Some(user_id),
        status: Some(GameStatus::Playing),
        ..SessionPatch::default()
    };
    match state.store.apply_patch_guarded(game_id, game.version, patch).await {
        Ok(updated) => {
            info!(game_id = %game_id, joiner = %user_id, "game joined");
            Ok(updated)
        }
        Err(StoreError::Conflict { .. }) => {
            // Lost a race. Re-read once: the fresh snapshot turns the
            // conflict into the validation error that now applies.
            let fresh = state
                .store
                .read_once(game_id)
                .await
                .ok_or(GameError::NotFound(game_id))?;
            validate_join(&fresh, user_id)?;
            Err(GameError::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply one move for `user_id` at `cell_index`.
///
/// Writes exactly one field-set: `{board, current_player}` while the game
/// continues, or `{board, status, result}` when the move ends it.
///
/// # Errors
///
/// `NotFound`, `InvalidState` (not playing), `NotAPlayer`, `NotYourTurn`,
/// `InvalidMove`, or `Conflict` when a concurrent write landed between the
/// read and the patch.
pub async fn make_move(
    state: &AppState,
    game_id: Uuid,
    cell_index: usize,
    user_id: Uuid,
) -> Result<GameSession, GameError> {
    let game = state
        .store
        .read_once(game_id)
        .await
        .ok_or(GameError::NotFound(game_id))?;

    if game.status != GameStatus::Playing {
        return Err(GameError::InvalidState(game.status));
    }
    let symbol = game.players.symbol_of(user_id).ok_or(GameError::NotAPlayer)?;
    if game.current_player != symbol {
        return Err(GameError::NotYourTurn);
    }
    if !game.board.is_valid_move(cell_index) {
        return Err(GameError::InvalidMove(cell_index));
    }

    // Validation above makes this infallible; a failure here is a bug, not
    // caller input, and must not be reported as one.
    let board = game.board.apply_move(cell_index, symbol).map_err(|e| {
        error!(game_id = %game_id, cell_index, error = %e, "validated move failed to apply");
        GameError::Invariant(e)
    })?;

    let result = rules::evaluate(&board);
    let patch = if result.is_terminal() {
        SessionPatch {
            board: Some(board),
            status: Some(GameStatus::Finished),
            result: Some(result),
            ..SessionPatch::default()
        }
    } else {
        SessionPatch {
            board: Some(board),
            current_player: Some(symbol.other()),
            ..SessionPatch::default()
        }
    };

    let updated = state.store.apply_patch_guarded(game_id, game.version, patch).await?;
    info!(game_id = %game_id, cell_index, player = %symbol, status = %updated.status, "move applied");
    Ok(updated)
}

/// Leave a game.
///
/// A waiting game is deleted when its creator walks away. A playing game
/// finishes with the opponent declared winner — always, even if the leaver
/// was ahead on the board; the winning line stays empty because the win was
/// not board-derived. Finished and absent games are untouched.
///
/// # Errors
///
/// Only store-level failures; leaving is otherwise idempotent.
pub async fn leave_game(state: &AppState, game_id: Uuid, user_id: Uuid) -> Result<LeaveOutcome, GameError> {
    let Some(game) = state.store.read_once(game_id).await else {
        return Ok(LeaveOutcome::Absent);
    };

    match game.status {
        GameStatus::Waiting if game.players.x == user_id => {
            state.store.delete(game_id).await;
            info!(game_id = %game_id, "waiting game deleted by creator");
            Ok(LeaveOutcome::Deleted)
        }
        GameStatus::Waiting | GameStatus::Finished => Ok(LeaveOutcome::Ignored),
        GameStatus::Playing => {
            let winner = if game.players.x == user_id { Player::O } else { Player::X };
            let patch = SessionPatch {
                status: Some(GameStatus::Finished),
                result: Some(GameResult::Win { winner, winning_line: vec![] }),
                ..SessionPatch::default()
            };
            match state.store.apply_patch(game_id, patch).await {
                Ok(updated) => {
                    info!(game_id = %game_id, leaver = %user_id, %winner, "game forfeited");
                    Ok(LeaveOutcome::Forfeited(Box::new(updated)))
                }
                // Deleted underneath us; same end state for the caller.
                Err(StoreError::NotFound(_)) => Ok(LeaveOutcome::Absent),
                Err(e) => Err(e.into()),
            }
        }
    }
}

// =============================================================================
// LISTENERS
// =============================================================================

/// Watch one game. Returns the current snapshot (the initial delivery), or
/// `None` when the game does not exist.
pub async fn listen_to_game(
    state: &AppState,
    game_id: Uuid,
    watcher: Uuid,
    tx: tokio::sync::mpsc::Sender<Frame>,
) -> Option<GameSession> {
    state.store.subscribe_game(game_id, watcher, tx).await
}

pub async fn stop_listening_to_game(state: &AppState, game_id: Uuid, watcher: Uuid) {
    state.store.unsubscribe_game(game_id, watcher).await;
}

/// Watch the lobby. Returns the current waiting set, newest first.
pub async fn listen_to_available_games(
    state: &AppState,
    watcher: Uuid,
    tx: tokio::sync::mpsc::Sender<Frame>,
) -> Vec<GameListItem> {
    state.store.subscribe_lobby(watcher, tx).await
}

pub async fn stop_listening_to_available_games(state: &AppState, watcher: Uuid) {
    state.store.unsubscribe_lobby(watcher).await;
}

#[cfg(test)]
#[path = "game_test.rs"]
mod tests;
