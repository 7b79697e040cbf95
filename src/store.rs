//! Authoritative game-document store.
//!
//! DESIGN
//! ======
//! The single shared mutable resource is the map of `GameSession` documents.
//! The store exposes a document-database surface: atomic snapshot reads,
//! atomic multi-field patches (plain and version-guarded), full-document
//! delete, and subscriptions by key (game, presence) and by query (waiting
//! games for the lobby). Every successful mutation notifies subscribers with
//! the full new value; deletion notifies with null.
//!
//! Readers and writers never hold the lock across a caller's read-modify-write
//! cycle — services read a snapshot, validate, and then submit a patch. The
//! guarded patch compares the document version so a patch computed from a
//! stale snapshot is rejected instead of silently clobbering a concurrent
//! write.
//!
//! Presence flows through its own watcher channel: presence writes do not
//! bump the document version, do not mark the document dirty, and do not fire
//! game watchers.
//!
//! DURABILITY
//! ==========
//! Mutations mark documents dirty and deletions are recorded; the persistence
//! service drains both sets on an interval. Deferred disconnect writes are
//! registered per connection and fire when the transport reports the
//! connection closed — the server-side mechanism that still runs after an
//! abrupt client crash.

use std::collections::{HashMap, HashSet};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::frame::{Data, Frame, now_ms};
use crate::rules::{Board, GameResult, Player};
use crate::state::{GameListItem, GamePresence, GameSession, GameStatus, PresenceRecord};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("game not found: {0}")]
    NotFound(Uuid),
    #[error("version conflict: expected {expected}, current {current}")]
    Conflict { expected: i64, current: i64 },
}

/// Atomic multi-field patch. Exactly the fields set here change, in one
/// critical section; `updated_at` and `version` are stamped by the store.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub board: Option<Board>,
    pub current_player: Option<Player>,
    pub status: Option<GameStatus>,
    pub player_o: Option<Uuid>,
    pub result: Option<GameResult>,
}

/// Deferred presence write, fired when the owning connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferredOffline {
    game_id: Uuid,
    player: Player,
}

struct LiveGame {
    doc: GameSession,
    game_watchers: HashMap<Uuid, mpsc::Sender<Frame>>,
    presence_watchers: HashMap<Uuid, mpsc::Sender<Frame>>,
}

impl LiveGame {
    fn new(doc: GameSession) -> Self {
        Self { doc, game_watchers: HashMap::new(), presence_watchers: HashMap::new() }
    }
}

#[derive(Default)]
struct StoreInner {
    games: HashMap<Uuid, LiveGame>,
    lobby_watchers: HashMap<Uuid, mpsc::Sender<Frame>>,
    disconnect_writes: HashMap<Uuid, Vec<DeferredOffline>>,
    dirty: HashSet<Uuid>,
    deleted: HashSet<Uuid>,
}

pub struct GameStore {
    inner: RwLock<StoreInner>,
}

impl Default for GameStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// DOCUMENT OPERATIONS
// =============================================================================

impl GameStore {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(StoreInner::default()) }
    }

    /// Server-generated document key.
    #[must_use]
    pub fn allocate_id() -> Uuid {
        Uuid::new_v4()
    }

    /// Insert a new document and notify lobby watchers.
    pub async fn create(&self, doc: GameSession) -> Uuid {
        let id = doc.id;
        let mut inner = self.inner.write().await;
        inner.games.insert(id, LiveGame::new(doc));
        inner.dirty.insert(id);
        notify_lobby(&inner);
        info!(game_id = %id, "game created");
        id
    }

    /// Atomic snapshot of one document.
    pub async fn read_once(&self, id: Uuid) -> Option<GameSession> {
        let inner = self.inner.read().await;
        inner.games.get(&id).map(|live| live.doc.clone())
    }

    /// Apply a patch unconditionally.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    pub async fn apply_patch(&self, id: Uuid, patch: SessionPatch) -> Result<GameSession, StoreError> {
        self.patch_inner(id, None, patch).await
    }

    /// Apply a patch only if the document version still matches
    /// `expected_version` — the compare-and-swap that serializes two writers
    /// racing from the same snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Conflict`.
    pub async fn apply_patch_guarded(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: SessionPatch,
    ) -> Result<GameSession, StoreError> {
        self.patch_inner(id, Some(expected_version), patch).await
    }

    async fn patch_inner(
        &self,
        id: Uuid,
        expected_version: Option<i64>,
        patch: SessionPatch,
    ) -> Result<GameSession, StoreError> {
        let mut inner = self.inner.write().await;
        let live = inner.games.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if let Some(expected) = expected_version {
            if live.doc.version != expected {
                return Err(StoreError::Conflict { expected, current: live.doc.version });
            }
        }

        let doc = &mut live.doc;
        if let Some(board) = patch.board {
            doc.board = board;
        }
        if let Some(current_player) = patch.current_player {
            doc.current_player = current_player;
        }
        if let Some(status) = patch.status {
            doc.status = status;
        }
        if let Some(player_o) = patch.player_o {
            doc.players.o = Some(player_o);
        }
        if let Some(result) = patch.result {
            doc.result = Some(result);
        }
        doc.version += 1;
        doc.updated_at = now_ms();

        let snapshot = doc.clone();
        notify_game(live, Some(&snapshot));
        inner.dirty.insert(id);
        notify_lobby(&inner);
        debug!(game_id = %id, version = snapshot.version, status = %snapshot.status, "game patched");
        Ok(snapshot)
    }

    /// Delete a document. Game and presence watchers observe null; lobby
    /// watchers get the shrunk set. Returns false if it was already gone.
    pub async fn delete(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let Some(live) = inner.games.remove(&id) else {
            return false;
        };
        notify_game(&live, None);
        notify_presence(&live, id, None);
        inner.dirty.remove(&id);
        inner.deleted.insert(id);
        notify_lobby(&inner);
        info!(game_id = %id, "game deleted");
        true
    }

    /// Write one player's presence record. Outside the document consistency
    /// invariants: no version bump, no dirty flag, presence watchers only.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    pub async fn write_presence(
        &self,
        id: Uuid,
        player: Player,
        record: PresenceRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let live = inner.games.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        live.doc.presence.set(player, record);
        let presence = live.doc.presence;
        notify_presence(live, id, Some(&presence));
        debug!(game_id = %id, %player, online = record.online, "presence written");
        Ok(())
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

impl GameStore {
    /// Register a game watcher and return the current snapshot so the caller
    /// can deliver the initial value promptly. Returns `None` without
    /// registering when the document does not exist.
    pub async fn subscribe_game(
        &self,
        id: Uuid,
        watcher: Uuid,
        tx: mpsc::Sender<Frame>,
    ) -> Option<GameSession> {
        let mut inner = self.inner.write().await;
        let live = inner.games.get_mut(&id)?;
        live.game_watchers.insert(watcher, tx);
        Some(live.doc.clone())
    }

    pub async fn unsubscribe_game(&self, id: Uuid, watcher: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(live) = inner.games.get_mut(&id) {
            live.game_watchers.remove(&watcher);
        }
    }

    /// Register a presence watcher; returns the current presence
    /// sub-document, or `None` without registering when the game is absent.
    pub async fn subscribe_presence(
        &self,
        id: Uuid,
        watcher: Uuid,
        tx: mpsc::Sender<Frame>,
    ) -> Option<GamePresence> {
        let mut inner = self.inner.write().await;
        let live = inner.games.get_mut(&id)?;
        live.presence_watchers.insert(watcher, tx);
        Some(live.doc.presence)
    }

    pub async fn unsubscribe_presence(&self, id: Uuid, watcher: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(live) = inner.games.get_mut(&id) {
            live.presence_watchers.remove(&watcher);
        }
    }

    /// Register a lobby watcher and return the current waiting set, newest
    /// first.
    pub async fn subscribe_lobby(&self, watcher: Uuid, tx: mpsc::Sender<Frame>) -> Vec<GameListItem> {
        let mut inner = self.inner.write().await;
        inner.lobby_watchers.insert(watcher, tx);
        waiting_games(&inner)
    }

    pub async fn unsubscribe_lobby(&self, watcher: Uuid) {
        let mut inner = self.inner.write().await;
        inner.lobby_watchers.remove(&watcher);
    }
}

// =============================================================================
// DISCONNECT HANDLING
// =============================================================================

impl GameStore {
    /// Register a deferred offline write for `(game, player)`, owned by
    /// connection `conn`. Re-registering the same pair replaces the earlier
    /// registration.
    pub async fn register_disconnect_write(&self, conn: Uuid, game_id: Uuid, player: Player) {
        let mut inner = self.inner.write().await;
        let writes = inner.disconnect_writes.entry(conn).or_default();
        writes.retain(|w| !(w.game_id == game_id && w.player == player));
        writes.push(DeferredOffline { game_id, player });
        debug!(%conn, %game_id, %player, "disconnect write registered");
    }

    /// Fire all deferred writes owned by `conn` and drop every watcher
    /// registration it holds. Called by the transport when the connection
    /// closes, however it closed.
    pub async fn connection_closed(&self, conn: Uuid) {
        let mut inner = self.inner.write().await;
        let writes = inner.disconnect_writes.remove(&conn).unwrap_or_default();
        let now = now_ms();
        for write in writes {
            // Deleted games have nothing to mark; firing is idempotent.
            if let Some(live) = inner.games.get_mut(&write.game_id) {
                live.doc
                    .presence
                    .set(write.player, PresenceRecord { online: false, last_seen: now });
                let presence = live.doc.presence;
                notify_presence(live, write.game_id, Some(&presence));
                info!(%conn, game_id = %write.game_id, player = %write.player, "deferred offline write fired");
            }
        }

        inner.lobby_watchers.remove(&conn);
        for live in inner.games.values_mut() {
            live.game_watchers.remove(&conn);
            live.presence_watchers.remove(&conn);
        }
    }
}

// =============================================================================
// DURABILITY HOOKS
// =============================================================================

impl GameStore {
    /// Clone every dirty document for flushing. Dirty flags stay set until
    /// [`GameStore::ack_flushed`] confirms the write.
    pub async fn snapshot_dirty(&self) -> Vec<GameSession> {
        let inner = self.inner.read().await;
        inner
            .dirty
            .iter()
            .filter_map(|id| inner.games.get(id).map(|live| live.doc.clone()))
            .collect()
    }

    /// Clear dirty flags for flushed documents, unless the document changed
    /// again after the snapshot was taken.
    pub async fn ack_flushed(&self, flushed: &[(Uuid, i64)]) {
        let mut inner = self.inner.write().await;
        for (id, flushed_version) in flushed {
            let can_clear = match inner.games.get(id) {
                Some(live) => live.doc.version == *flushed_version,
                None => true,
            };
            if can_clear {
                inner.dirty.remove(id);
            }
        }
    }

    /// Ids deleted in memory but not yet removed from the database.
    pub async fn snapshot_deleted(&self) -> Vec<Uuid> {
        let inner = self.inner.read().await;
        inner.deleted.iter().copied().collect()
    }

    pub async fn ack_deleted(&self, ids: &[Uuid]) {
        let mut inner = self.inner.write().await;
        for id in ids {
            inner.deleted.remove(id);
        }
    }

    /// Load documents at startup without notifying or dirtying.
    pub async fn hydrate(&self, docs: Vec<GameSession>) {
        let mut inner = self.inner.write().await;
        for doc in docs {
            inner.games.entry(doc.id).or_insert_with(|| LiveGame::new(doc));
        }
    }

    /// Drop finished games nobody is watching and whose state is already
    /// flushed. Returns how many were evicted.
    pub async fn evict_idle_finished(&self) -> usize {
        let mut inner = self.inner.write().await;
        let evictable: Vec<Uuid> = inner
            .games
            .iter()
            .filter(|(id, live)| {
                live.doc.status == GameStatus::Finished
                    && live.game_watchers.is_empty()
                    && live.presence_watchers.is_empty()
                    && !inner.dirty.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &evictable {
            inner.games.remove(id);
            info!(game_id = %id, "evicted finished game from memory");
        }
        evictable.len()
    }
}

// =============================================================================
// NOTIFICATION
// =============================================================================

fn game_changed_frame(id: Uuid, session: Option<&GameSession>) -> Frame {
    let mut data = Data::new();
    let value = session.map_or(serde_json::Value::Null, |s| {
        serde_json::to_value(s).unwrap_or_default()
    });
    data.insert("game".into(), value);
    Frame::request("game:changed", data).with_game_id(id)
}

fn presence_changed_frame(id: Uuid, presence: Option<&GamePresence>) -> Frame {
    let mut data = Data::new();
    let value = presence.map_or(serde_json::Value::Null, |p| {
        serde_json::to_value(p).unwrap_or_default()
    });
    data.insert("presence".into(), value);
    Frame::request("presence:changed", data).with_game_id(id)
}

fn lobby_changed_frame(games: &[GameListItem]) -> Frame {
    let mut data = Data::new();
    data.insert("games".into(), serde_json::to_value(games).unwrap_or_default());
    Frame::request("lobby:changed", data)
}

/// The waiting set projected for the lobby, `created_at` descending.
fn waiting_games(inner: &StoreInner) -> Vec<GameListItem> {
    let mut games: Vec<GameListItem> = inner
        .games
        .values()
        .filter(|live| live.doc.status == GameStatus::Waiting)
        .map(|live| GameListItem::from_session(&live.doc))
        .collect();
    games.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    games
}

fn notify_game(live: &LiveGame, session: Option<&GameSession>) {
    let frame = game_changed_frame(session.map_or_else(|| live.doc.id, |s| s.id), session);
    for tx in live.game_watchers.values() {
        // Best-effort: if a watcher's channel is full, skip it.
        let _ = tx.try_send(frame.clone());
    }
}

fn notify_presence(live: &LiveGame, id: Uuid, presence: Option<&GamePresence>) {
    let frame = presence_changed_frame(id, presence);
    for tx in live.presence_watchers.values() {
        let _ = tx.try_send(frame.clone());
    }
}

fn notify_lobby(inner: &StoreInner) {
    if inner.lobby_watchers.is_empty() {
        return;
    }
    let frame = lobby_changed_frame(&waiting_games(inner));
    for tx in inner.lobby_watchers.values() {
        let _ = tx.try_send(frame.clone());
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
