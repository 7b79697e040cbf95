use super::*;
use crate::state::test_helpers;
use tokio::time::{Duration, timeout};

async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("frame channel closed unexpectedly")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no frame"
    );
}

fn session_from_frame(frame: &Frame) -> Option<GameSession> {
    let value = frame.data.get("game").expect("game payload");
    if value.is_null() {
        None
    } else {
        Some(serde_json::from_value(value.clone()).expect("valid session json"))
    }
}

// =============================================================================
// DOCUMENT OPERATIONS
// =============================================================================

#[tokio::test]
async fn create_then_read_once_round_trips() {
    let store = GameStore::new();
    let session = test_helpers::waiting_session(Uuid::new_v4(), "Alice");
    let id = store.create(session.clone()).await;

    let read = store.read_once(id).await.expect("game should exist");
    assert_eq!(read.id, session.id);
    assert_eq!(read.status, GameStatus::Waiting);
    assert_eq!(read.players.o, None);
    assert!(read.board.cells().iter().all(Option::is_none));
    assert_eq!(read.current_player, Player::X);
}

#[tokio::test]
async fn read_once_absent_returns_none() {
    let store = GameStore::new();
    assert!(store.read_once(Uuid::new_v4()).await.is_none());
}

#[tokio::test]
async fn patch_sets_fields_and_bumps_version() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;
    let joiner = Uuid::new_v4();

    let patch = SessionPatch {
        player_o: Some(joiner),
        status: Some(GameStatus::Playing),
        ..SessionPatch::default()
    };
    let updated = store.apply_patch(id, patch).await.unwrap();

    assert_eq!(updated.players.o, Some(joiner));
    assert_eq!(updated.status, GameStatus::Playing);
    assert_eq!(updated.version, 2);
    assert!(updated.updated_at >= updated.created_at);
}

#[tokio::test]
async fn patch_missing_game_is_not_found() {
    let store = GameStore::new();
    let result = store.apply_patch(Uuid::new_v4(), SessionPatch::default()).await;
    assert!(matches!(result.unwrap_err(), StoreError::NotFound(_)));
}

#[tokio::test]
async fn guarded_patch_rejects_stale_version() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    // First writer commits from version 1.
    store
        .apply_patch_guarded(id, 1, SessionPatch { status: Some(GameStatus::Playing), ..SessionPatch::default() })
        .await
        .unwrap();

    // Second writer raced from the same version-1 snapshot and must lose.
    let result = store
        .apply_patch_guarded(id, 1, SessionPatch { status: Some(GameStatus::Finished), ..SessionPatch::default() })
        .await;
    match result.unwrap_err() {
        StoreError::Conflict { expected, current } => {
            assert_eq!(expected, 1);
            assert_eq!(current, 2);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let read = store.read_once(id).await.unwrap();
    assert_eq!(read.status, GameStatus::Playing);
}

#[tokio::test]
async fn delete_returns_false_when_absent() {
    let store = GameStore::new();
    assert!(!store.delete(Uuid::new_v4()).await);
}

// =============================================================================
// GAME SUBSCRIPTIONS
// =============================================================================

#[tokio::test]
async fn subscribe_game_returns_snapshot_and_delivers_changes() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let watcher = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    let initial = store.subscribe_game(id, watcher, tx).await.expect("game exists");
    assert_eq!(initial.version, 1);

    store
        .apply_patch(id, SessionPatch { status: Some(GameStatus::Playing), ..SessionPatch::default() })
        .await
        .unwrap();

    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.syscall, "game:changed");
    assert_eq!(frame.game_id, Some(id));
    let session = session_from_frame(&frame).expect("non-null session");
    assert_eq!(session.status, GameStatus::Playing);
    assert_eq!(session.version, 2);
}

#[tokio::test]
async fn subscribe_game_absent_does_not_register() {
    let store = GameStore::new();
    let (tx, _rx) = mpsc::channel::<Frame>(8);
    assert!(store.subscribe_game(Uuid::new_v4(), Uuid::new_v4(), tx).await.is_none());
}

#[tokio::test]
async fn unsubscribe_game_stops_delivery() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let watcher = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    store.subscribe_game(id, watcher, tx).await.unwrap();
    store.unsubscribe_game(id, watcher).await;

    store
        .apply_patch(id, SessionPatch { status: Some(GameStatus::Playing), ..SessionPatch::default() })
        .await
        .unwrap();
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn delete_delivers_null_to_game_watchers() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let watcher = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    store.subscribe_game(id, watcher, tx).await.unwrap();

    assert!(store.delete(id).await);

    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.syscall, "game:changed");
    assert!(session_from_frame(&frame).is_none());
    assert!(store.read_once(id).await.is_none());
}

// =============================================================================
// LOBBY SUBSCRIPTIONS
// =============================================================================

#[tokio::test]
async fn lobby_snapshot_is_sorted_newest_first() {
    let store = GameStore::new();
    let mut older = test_helpers::waiting_session(Uuid::new_v4(), "Older");
    older.created_at = 1_000;
    let mut newer = test_helpers::waiting_session(Uuid::new_v4(), "Newer");
    newer.created_at = 2_000;
    store.create(older).await;
    store.create(newer).await;

    let (tx, _rx) = mpsc::channel::<Frame>(8);
    let games = store.subscribe_lobby(Uuid::new_v4(), tx).await;
    assert_eq!(games.len(), 2);
    assert_eq!(games[0].creator_name, "Newer");
    assert_eq!(games[1].creator_name, "Older");
}

#[tokio::test]
async fn lobby_redelivers_full_set_on_every_change() {
    let store = GameStore::new();
    let watcher = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    let initial = store.subscribe_lobby(watcher, tx).await;
    assert!(initial.is_empty());

    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.syscall, "lobby:changed");
    let games: Vec<GameListItem> =
        serde_json::from_value(frame.data.get("games").unwrap().clone()).unwrap();
    assert_eq!(games.len(), 1);
    assert_eq!(games[0].id, id);

    // A join removes the game from the waiting set.
    store
        .apply_patch(
            id,
            SessionPatch {
                player_o: Some(Uuid::new_v4()),
                status: Some(GameStatus::Playing),
                ..SessionPatch::default()
            },
        )
        .await
        .unwrap();
    let frame = recv_frame(&mut rx).await;
    let games: Vec<GameListItem> =
        serde_json::from_value(frame.data.get("games").unwrap().clone()).unwrap();
    assert!(games.is_empty());
}

#[tokio::test]
async fn unsubscribe_lobby_stops_delivery() {
    let store = GameStore::new();
    let watcher = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    store.subscribe_lobby(watcher, tx).await;
    store.unsubscribe_lobby(watcher).await;

    store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;
    assert_no_frame(&mut rx).await;
}

// =============================================================================
// PRESENCE CHANNEL
// =============================================================================

#[tokio::test]
async fn presence_write_notifies_presence_watchers_only() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let (game_tx, mut game_rx) = mpsc::channel::<Frame>(8);
    let (presence_tx, mut presence_rx) = mpsc::channel::<Frame>(8);
    store.subscribe_game(id, Uuid::new_v4(), game_tx).await.unwrap();
    store.subscribe_presence(id, Uuid::new_v4(), presence_tx).await.unwrap();

    store
        .write_presence(id, Player::X, PresenceRecord { online: true, last_seen: 123 })
        .await
        .unwrap();

    let frame = recv_frame(&mut presence_rx).await;
    assert_eq!(frame.syscall, "presence:changed");
    let presence: GamePresence =
        serde_json::from_value(frame.data.get("presence").unwrap().clone()).unwrap();
    assert_eq!(presence.x, Some(PresenceRecord { online: true, last_seen: 123 }));

    // The game channel stays quiet, and the document version is untouched.
    assert_no_frame(&mut game_rx).await;
    assert_eq!(store.read_once(id).await.unwrap().version, 1);
}

#[tokio::test]
async fn presence_write_on_absent_game_is_not_found() {
    let store = GameStore::new();
    let result = store
        .write_presence(Uuid::new_v4(), Player::X, PresenceRecord { online: true, last_seen: 0 })
        .await;
    assert!(matches!(result.unwrap_err(), StoreError::NotFound(_)));
}

// =============================================================================
// DISCONNECT HANDLING
// =============================================================================

#[tokio::test]
async fn connection_closed_fires_deferred_offline_write() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    store.subscribe_presence(id, Uuid::new_v4(), tx).await.unwrap();

    let conn = Uuid::new_v4();
    store.register_disconnect_write(conn, id, Player::X).await;
    store
        .write_presence(id, Player::X, PresenceRecord { online: true, last_seen: now_ms() })
        .await
        .unwrap();
    let _online = recv_frame(&mut rx).await;

    store.connection_closed(conn).await;

    let frame = recv_frame(&mut rx).await;
    let presence: GamePresence =
        serde_json::from_value(frame.data.get("presence").unwrap().clone()).unwrap();
    let record = presence.x.expect("presence record");
    assert!(!record.online);
    assert!(record.last_seen > 0);
}

#[tokio::test]
async fn reregistering_disconnect_write_replaces_earlier_one() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    store.subscribe_presence(id, Uuid::new_v4(), tx).await.unwrap();

    let conn = Uuid::new_v4();
    store.register_disconnect_write(conn, id, Player::X).await;
    store.register_disconnect_write(conn, id, Player::X).await;
    store.connection_closed(conn).await;

    // Exactly one offline notification, not two.
    let _offline = recv_frame(&mut rx).await;
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn connection_closed_on_deleted_game_is_a_no_op() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;
    let conn = Uuid::new_v4();
    store.register_disconnect_write(conn, id, Player::X).await;
    store.delete(id).await;

    // Must not panic or resurrect the document.
    store.connection_closed(conn).await;
    assert!(store.read_once(id).await.is_none());
}

#[tokio::test]
async fn connection_closed_drops_watcher_registrations() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    store.subscribe_game(id, conn, tx.clone()).await.unwrap();
    store.subscribe_lobby(conn, tx).await;

    store.connection_closed(conn).await;

    store
        .apply_patch(id, SessionPatch { status: Some(GameStatus::Playing), ..SessionPatch::default() })
        .await
        .unwrap();
    assert_no_frame(&mut rx).await;
}

// =============================================================================
// DURABILITY HOOKS
// =============================================================================

#[tokio::test]
async fn dirty_snapshot_and_ack_lifecycle() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;

    let dirty = store.snapshot_dirty().await;
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].id, id);

    store.ack_flushed(&[(id, dirty[0].version)]).await;
    assert!(store.snapshot_dirty().await.is_empty());
}

#[tokio::test]
async fn ack_flushed_keeps_dirty_when_version_moved_on() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;
    let snapshot = store.snapshot_dirty().await.remove(0);

    // Document changes again after the snapshot was taken.
    store
        .apply_patch(id, SessionPatch { status: Some(GameStatus::Playing), ..SessionPatch::default() })
        .await
        .unwrap();

    store.ack_flushed(&[(id, snapshot.version)]).await;
    let dirty = store.snapshot_dirty().await;
    assert_eq!(dirty.len(), 1, "newer version must stay dirty");
}

#[tokio::test]
async fn delete_moves_id_from_dirty_to_deleted() {
    let store = GameStore::new();
    let id = store
        .create(test_helpers::waiting_session(Uuid::new_v4(), "Alice"))
        .await;
    store.delete(id).await;

    assert!(store.snapshot_dirty().await.is_empty());
    assert_eq!(store.snapshot_deleted().await, vec![id]);

    store.ack_deleted(&[id]).await;
    assert!(store.snapshot_deleted().await.is_empty());
}

#[tokio::test]
async fn hydrate_does_not_mark_dirty_or_notify() {
    let store = GameStore::new();
    let watcher = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(8);
    store.subscribe_lobby(watcher, tx).await;

    let session = test_helpers::waiting_session(Uuid::new_v4(), "Alice");
    let id = session.id;
    store.hydrate(vec![session]).await;

    assert!(store.read_once(id).await.is_some());
    assert!(store.snapshot_dirty().await.is_empty());
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn evict_idle_finished_skips_watched_and_dirty_games() {
    let store = GameStore::new();

    let mut finished = test_helpers::waiting_session(Uuid::new_v4(), "Done");
    finished.status = GameStatus::Finished;
    let finished_id = store.create(finished).await;

    let mut watched = test_helpers::waiting_session(Uuid::new_v4(), "Watched");
    watched.status = GameStatus::Finished;
    let watched_id = store.create(watched).await;
    let (tx, _rx) = mpsc::channel::<Frame>(8);
    store.subscribe_game(watched_id, Uuid::new_v4(), tx).await.unwrap();

    // Both are dirty from creation; nothing evicts yet.
    assert_eq!(store.evict_idle_finished().await, 0);

    let dirty = store.snapshot_dirty().await;
    let acks: Vec<(Uuid, i64)> = dirty.iter().map(|d| (d.id, d.version)).collect();
    store.ack_flushed(&acks).await;

    // Only the unwatched flushed game goes.
    assert_eq!(store.evict_idle_finished().await, 1);
    assert!(store.read_once(finished_id).await.is_none());
    assert!(store.read_once(watched_id).await.is_some());
}
