//! Session coordinator — one client's view of the game world.
//!
//! DESIGN
//! ======
//! Each WebSocket connection owns exactly one `SessionCoordinator`,
//! constructed at upgrade and torn down on close — no ambient singletons.
//! The coordinator tracks the client's current game id, the last known
//! session snapshot, and the last presence sub-document, switching store
//! subscriptions as the current game changes.
//!
//! The last known snapshot pre-validates move intents: a move that is
//! out of turn or targets an occupied cell — when the snapshot already says
//! so — is rejected before touching the store. The game service re-validates
//! against a fresh read regardless; the local check only saves the round
//! trip.
//!
//! ERROR HANDLING
//! ==============
//! Every action records its outcome in `last_error` instead of escaping:
//! failures become state the transport turns into error frames, never
//! unhandled panics.

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::frame::Frame;
use crate::services::game::{self, GameError, LeaveOutcome};
use crate::services::presence;
use crate::state::{AppState, GameListItem, GamePresence, GameSession, GameStatus};

/// Opaque identity handed over by the external auth collaborator.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub id: Uuid,
    pub display_name: String,
}

pub struct SessionCoordinator {
    client_id: Uuid,
    user: UserIdentity,
    /// Outbound channel the store pushes change frames into.
    tx: mpsc::Sender<Frame>,
    current_game_id: Option<Uuid>,
    current_game: Option<GameSession>,
    last_presence: Option<GamePresence>,
    lobby_subscribed: bool,
    last_error: Option<String>,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(client_id: Uuid, user: UserIdentity, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            client_id,
            user,
            tx,
            current_game_id: None,
            current_game: None,
            last_presence: None,
            lobby_subscribed: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    #[must_use]
    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    #[must_use]
    pub fn current_game_id(&self) -> Option<Uuid> {
        self.current_game_id
    }

    #[must_use]
    pub fn current_game(&self) -> Option<&GameSession> {
        self.current_game.as_ref()
    }

    #[must_use]
    pub fn last_presence(&self) -> Option<&GamePresence> {
        self.last_presence.as_ref()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record the action outcome as state: success clears the error,
    /// failure stores the human-readable message.
    fn finish<T>(&mut self, result: &Result<T, GameError>) {
        match result {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.to_string()),
        }
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

impl SessionCoordinator {
    /// Create a game and switch this session onto it.
    ///
    /// # Errors
    ///
    /// Store-level failures while subscribing to the new game.
    pub async fn create_game(&mut self, state: &AppState) -> Result<GameSession, GameError> {
        let result = self.create_game_inner(state).await;
        self.finish(&result);
        result
    }

    async fn create_game_inner(&mut self, state: &AppState) -> Result<GameSession, GameError> {
        let session = game::create_game(state, self.user.id, &self.user.display_name).await;
        let (snapshot, _) = self.watch_game(state, session.id).await?;
        Ok(snapshot)
    }

    /// Join a waiting game and switch this session onto it.
    ///
    /// # Errors
    ///
    /// The full join taxonomy: `NotFound`, `InvalidState`, `AlreadyJoined`.
    pub async fn join_game(&mut self, state: &AppState, game_id: Uuid) -> Result<GameSession, GameError> {
        let result = self.join_game_inner(state, game_id).await;
        self.finish(&result);
        result
    }

    async fn join_game_inner(&mut self, state: &AppState, game_id: Uuid) -> Result<GameSession, GameError> {
        game::join_game(state, game_id, self.user.id).await?;
        let (snapshot, _) = self.watch_game(state, game_id).await?;
        Ok(snapshot)
    }

    /// Subscribe to an existing game without mutating it — the rejoin and
    /// spectate path. Re-arms the disconnect handler when this user holds a
    /// player slot.
    ///
    /// # Errors
    ///
    /// `NotFound` when the game does not exist.
    pub async fn subscribe_game(
        &mut self,
        state: &AppState,
        game_id: Uuid,
    ) -> Result<(GameSession, GamePresence), GameError> {
        let result = self.watch_game(state, game_id).await;
        self.finish(&result);
        result
    }

    /// Submit a move on the current game.
    ///
    /// # Errors
    ///
    /// The move taxonomy, locally pre-checked where the last snapshot
    /// already answers.
    pub async fn make_move(&mut self, state: &AppState, cell_index: usize) -> Result<GameSession, GameError> {
        let result = self.make_move_inner(state, cell_index).await;
        self.finish(&result);
        result
    }

    async fn make_move_inner(&mut self, state: &AppState, cell_index: usize) -> Result<GameSession, GameError> {
        let Some(game_id) = self.current_game_id else {
            return Err(GameError::NoActiveGame);
        };

        // Local pre-check: skip the store round trip when the last known
        // snapshot already rejects the intent.
        if let Some(snapshot) = self.current_game.as_ref().filter(|g| g.id == game_id) {
            if snapshot.status == GameStatus::Playing {
                if let Some(symbol) = snapshot.players.symbol_of(self.user.id) {
                    if snapshot.current_player != symbol {
                        return Err(GameError::NotYourTurn);
                    }
                }
                if !snapshot.board.is_valid_move(cell_index) {
                    return Err(GameError::InvalidMove(cell_index));
                }
            }
        }

        let updated = game::make_move(state, game_id, cell_index, self.user.id).await?;
        self.current_game = Some(updated.clone());
        Ok(updated)
    }

    /// Leave the current game, then fall back to the lobby subscription.
    /// Returns what happened and the fresh lobby snapshot.
    ///
    /// # Errors
    ///
    /// `NoActiveGame` when this session is not in a game.
    pub async fn leave_game(
        &mut self,
        state: &AppState,
    ) -> Result<(LeaveOutcome, Vec<GameListItem>), GameError> {
        let result = self.leave_game_inner(state).await;
        self.finish(&result);
        result
    }

    async fn leave_game_inner(
        &mut self,
        state: &AppState,
    ) -> Result<(LeaveOutcome, Vec<GameListItem>), GameError> {
        let Some(game_id) = self.current_game_id else {
            return Err(GameError::NoActiveGame);
        };

        // Graceful presence cleanup for our slot — the armed disconnect
        // write stays in place as the backstop.
        if let Some(symbol) = self
            .current_game
            .as_ref()
            .and_then(|g| g.players.symbol_of(self.user.id))
        {
            presence::cleanup_presence(state, game_id, symbol).await;
        }

        let outcome = game::leave_game(state, game_id, self.user.id).await?;
        self.unwatch_current(state).await;
        let games = self.subscribe_lobby(state).await;
        Ok((outcome, games))
    }

    /// Watch the lobby. Idempotent; returns the current waiting set.
    pub async fn subscribe_lobby(&mut self, state: &AppState) -> Vec<GameListItem> {
        self.lobby_subscribed = true;
        game::listen_to_available_games(state, self.client_id, self.tx.clone()).await
    }

    pub async fn unsubscribe_lobby(&mut self, state: &AppState) {
        if self.lobby_subscribed {
            game::stop_listening_to_available_games(state, self.client_id).await;
            self.lobby_subscribed = false;
        }
    }
}

// =============================================================================
// SUBSCRIPTION SWITCHING
// =============================================================================

impl SessionCoordinator {
    /// Point this session at `game_id`: drop the previous game and lobby
    /// watchers, register the new ones, refresh the local snapshots, and
    /// (re)arm the disconnect write when this user holds a slot.
    async fn watch_game(
        &mut self,
        state: &AppState,
        game_id: Uuid,
    ) -> Result<(GameSession, GamePresence), GameError> {
        self.unwatch_current(state).await;
        self.unsubscribe_lobby(state).await;

        let Some(session) =
            game::listen_to_game(state, game_id, self.client_id, self.tx.clone()).await
        else {
            return Err(GameError::NotFound(game_id));
        };
        let presence = presence::listen_to_presence(state, game_id, self.client_id, self.tx.clone())
            .await
            .unwrap_or_default();

        self.current_game_id = Some(game_id);
        self.current_game = Some(session.clone());
        self.last_presence = Some(presence);

        if let Some(symbol) = session.players.symbol_of(self.user.id) {
            if let Err(e) = presence::setup_disconnect_handler(state, self.client_id, game_id, symbol).await {
                warn!(game_id = %game_id, error = %e, "presence arming failed");
            }
        }

        Ok((session, presence))
    }

    async fn unwatch_current(&mut self, state: &AppState) {
        if let Some(old) = self.current_game_id.take() {
            game::stop_listening_to_game(state, old, self.client_id).await;
            presence::stop_listening_to_presence(state, old, self.client_id).await;
        }
        self.current_game = None;
        self.last_presence = None;
    }

    /// Keep the local view in step with frames flowing out to the client.
    /// A null `game:changed` means the document was deleted — the session
    /// falls back to having no current game.
    pub fn note_outbound(&mut self, frame: &Frame) {
        if frame.game_id.is_none() || frame.game_id != self.current_game_id {
            return;
        }
        match frame.syscall.as_str() {
            "game:changed" => match frame.data.get("game") {
                Some(value) if !value.is_null() => {
                    if let Ok(session) = serde_json::from_value::<GameSession>(value.clone()) {
                        self.current_game = Some(session);
                    }
                }
                _ => {
                    self.current_game = None;
                    self.current_game_id = None;
                    self.last_presence = None;
                }
            },
            "presence:changed" => {
                if let Some(value) = frame.data.get("presence") {
                    self.last_presence = serde_json::from_value(value.clone()).ok();
                }
            }
            _ => {}
        }
    }

    /// Tear down on connection close: fire deferred presence writes and
    /// drop every watcher registration this connection holds.
    pub async fn teardown(&mut self, state: &AppState) {
        state.store.connection_closed(self.client_id).await;
        self.current_game_id = None;
        self.current_game = None;
        self.last_presence = None;
        self.lobby_subscribed = false;
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
