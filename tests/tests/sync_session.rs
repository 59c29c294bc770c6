//! End-to-end tests of the comment sync engine against the mock server.
//!
//! Everything runs under a paused tokio clock, so reconnect backoff, poll
//! ticks and highlight expiry are deterministic.

use std::sync::Arc;
use std::time::Duration;

use lumix_api::{CommentId, MovieId, NoticeKind, Reaction};
use lumix_client::{CommentSync, SyncSession, SyncUpdate, TransportState};
use lumix_mock_server::MockServer;
use tests::{comment_text, init_tracing, RecordingNotifier};
use tokio::sync::broadcast;

fn setup() -> (MockServer, CommentSync, RecordingNotifier) {
    init_tracing();
    let server = MockServer::new();
    let notifier = RecordingNotifier::new();
    let sync = CommentSync::new(
        Arc::new(server.clone()),
        Arc::new(server.clone()),
        Arc::new(notifier.clone()),
    );
    (server, sync, notifier)
}

fn movie() -> MovieId {
    MovieId::from("m1")
}

/// Let spawned tasks run (and the paused clock jump to pending timers).
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

async fn wait_for_state(session: &SyncSession, want: TransportState) {
    let mut rx = session.transport_state();
    while *rx.borrow() != want {
        rx.changed().await.expect("transport task went away");
    }
}

async fn next_update(rx: &mut broadcast::Receiver<SyncUpdate>) -> SyncUpdate {
    rx.recv().await.expect("update stream closed")
}

fn ids(list: &[CommentId]) -> Vec<String> {
    let mut out: Vec<String> = list.iter().map(|id| id.0.clone()).collect();
    out.sort();
    out
}

#[tokio::test(start_paused = true)]
async fn open_loads_the_current_thread_immediately() {
    let (server, sync, _notifier) = setup();
    let first = server.test_seed_comment(&movie(), "first comment");
    let reply = server.test_seed_reply(&movie(), &first.id, "a reply");
    let second = server.test_seed_comment(&movie(), "second comment");

    let session = sync.open(movie());
    let mut updates = session.updates();
    let update = next_update(&mut updates).await;

    assert_eq!(
        ids(&update.diff.inserted),
        ids(&[first.id.clone(), reply.id.clone(), second.id.clone()])
    );
    assert!(update.diff.updated.is_empty() && update.diff.deleted.is_empty());
    // Server order: newest first.
    assert_eq!(update.comments[0].id, second.id);
    assert_eq!(update.comments[1].id, first.id);
    assert_eq!(update.comments[1].replies[0].id, reply.id);

    // Everything that was inserted is highlighted for now.
    let highlights = session.highlights();
    assert!(highlights.is_marked(&first.id));
    assert!(highlights.is_marked(&reply.id));
}

#[tokio::test(start_paused = true)]
async fn pushed_comments_arrive_and_are_highlighted() {
    let (server, sync, _notifier) = setup();
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;

    let pushed = server.test_push_comment(&movie(), &comment_text());
    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.inserted, vec![pushed.id.clone()]);
    assert_eq!(update.comments[0].id, pushed.id);
    assert!(session.highlights().is_marked(&pushed.id));
}

#[tokio::test(start_paused = true)]
async fn highlight_expires_after_the_ttl() {
    let (server, sync, _notifier) = setup();
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;

    let pushed = server.test_push_comment(&movie(), "fresh");
    next_update(&mut updates).await;
    assert!(session.highlights().is_marked(&pushed.id));

    tokio::time::advance(Duration::from_millis(3_100)).await;
    assert!(!session.highlights().is_marked(&pushed.id));
}

#[tokio::test(start_paused = true)]
async fn snapshots_update_in_place_and_preserve_identity() {
    let (server, sync, _notifier) = setup();
    let liked = server.test_seed_comment(&movie(), "gets a like");
    let untouched = server.test_seed_comment(&movie(), "unchanged");

    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    let initial = next_update(&mut updates).await;
    let untouched_before = initial
        .comments
        .iter()
        .find(|n| n.id == untouched.id)
        .unwrap()
        .clone();

    let mut thread = server.test_comments(&movie());
    thread.iter_mut().find(|c| c.id == liked.id).unwrap().like_count = 4;
    server.test_set_comments(&movie(), thread);
    server.test_push_snapshot(&movie());

    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.updated, vec![liked.id.clone()]);
    assert!(update.diff.inserted.is_empty() && update.diff.deleted.is_empty());
    assert_eq!(
        update.comments.iter().find(|n| n.id == liked.id).unwrap().like_count,
        4
    );
    // The untouched comment kept its exact node.
    let untouched_after = update
        .comments
        .iter()
        .find(|n| n.id == untouched.id)
        .unwrap();
    assert!(Arc::ptr_eq(&untouched_before, untouched_after));
}

#[tokio::test(start_paused = true)]
async fn comments_absent_from_a_snapshot_are_removed() {
    let (server, sync, _notifier) = setup();
    let doomed = server.test_seed_comment(&movie(), "doomed");
    let doomed_reply = server.test_seed_reply(&movie(), &doomed.id, "taken down with it");
    let survivor = server.test_seed_comment(&movie(), "survivor");

    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    next_update(&mut updates).await;

    let thread: Vec<_> = server
        .test_comments(&movie())
        .into_iter()
        .filter(|c| c.id != doomed.id)
        .collect();
    server.test_set_comments(&movie(), thread);
    server.test_push_snapshot(&movie());

    let update = next_update(&mut updates).await;
    assert_eq!(
        ids(&update.diff.deleted),
        ids(&[doomed.id.clone(), doomed_reply.id.clone()])
    );
    assert_eq!(update.comments.len(), 1);
    assert_eq!(update.comments[0].id, survivor.id);
}

#[tokio::test(start_paused = true)]
async fn repeated_push_failures_degrade_to_polling() {
    let (server, sync, notifier) = setup();
    server.test_disable_push();

    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Polling).await;
    settle().await;
    assert_eq!(notifier.count_of(NoticeKind::Warning), 1);

    // The poll loop now picks up server-side changes.
    let added = server.test_seed_comment(&movie(), "seen via polling");
    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.inserted, vec![added.id.clone()]);
    assert_eq!(*session.transport_state().borrow(), TransportState::Polling);
}

#[tokio::test(start_paused = true)]
async fn posting_while_connected_goes_over_push_and_echoes_back() {
    let (server, sync, _notifier) = setup();
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;

    session.post_comment("hello from me", None);
    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.inserted.len(), 1);
    assert_eq!(update.comments[0].content, "hello from me");
    assert!(session.highlights().is_marked(&update.comments[0].id));

    let server_side = server.test_comments(&movie());
    assert_eq!(server_side.len(), 1);
    assert_eq!(server_side[0].content, "hello from me");
}

#[tokio::test(start_paused = true)]
async fn posting_while_polling_falls_back_to_a_direct_write() {
    let (server, sync, _notifier) = setup();
    server.test_disable_push();
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Polling).await;

    session.post_comment("posted over http", None);
    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.inserted.len(), 1);
    assert_eq!(
        server.test_comments(&movie())[0].content,
        "posted over http"
    );
}

#[tokio::test(start_paused = true)]
async fn replies_post_under_their_parent() {
    let (server, sync, _notifier) = setup();
    let parent = server.test_seed_comment(&movie(), "parent");
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    next_update(&mut updates).await;

    session.post_comment("a reply", Some(parent.id.clone()));
    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.inserted.len(), 1);
    let parent_node = update.comments.iter().find(|n| n.id == parent.id).unwrap();
    assert_eq!(parent_node.replies.len(), 1);
    assert_eq!(parent_node.replies[0].content, "a reply");
}

#[tokio::test(start_paused = true)]
async fn editing_updates_the_node_in_place() {
    let (server, sync, notifier) = setup();
    let target = server.test_seed_comment(&movie(), "tpyo");
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    next_update(&mut updates).await;

    session.edit_comment(target.id.clone(), "typo, fixed");
    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.updated, vec![target.id.clone()]);
    assert_eq!(update.comments[0].content, "typo, fixed");
    assert!(update.comments[0].updated_at.is_some());
    assert!(session.highlights().is_marked(&target.id));
    settle().await;
    assert_eq!(notifier.count_of(NoticeKind::Info), 1);
}

#[tokio::test(start_paused = true)]
async fn deleting_removes_the_node_without_waiting_for_a_snapshot() {
    let (server, sync, _notifier) = setup();
    let doomed = server.test_seed_comment(&movie(), "delete me");
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    next_update(&mut updates).await;

    session.delete_comment(doomed.id.clone());
    let update = next_update(&mut updates).await;
    assert_eq!(update.diff.deleted, vec![doomed.id.clone()]);
    assert!(update.comments.is_empty());
    assert!(server.test_comments(&movie()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn reactions_apply_optimistically_and_stick_on_success() {
    let (server, sync, _notifier) = setup();
    let target = server.test_seed_comment(&movie(), "like me");
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    next_update(&mut updates).await;

    session.toggle_like(target.id.clone());
    let update = next_update(&mut updates).await;
    assert_eq!(update.comments[0].like_count, 1);
    assert_eq!(update.comments[0].user_reaction, Some(Reaction::Like));

    settle().await;
    // No rollback arrived, and the server agrees.
    assert!(matches!(
        updates.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(server.test_comments(&movie())[0].like_count, 1);
}

#[tokio::test(start_paused = true)]
async fn a_failed_reaction_rolls_back_exactly() {
    let (server, sync, notifier) = setup();
    let target = server.test_seed_comment(&movie(), "like me");
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    next_update(&mut updates).await;

    server.test_fail_reacts(1);
    session.toggle_dislike(target.id.clone());
    let optimistic = next_update(&mut updates).await;
    assert_eq!(optimistic.comments[0].dislike_count, 1);
    assert_eq!(optimistic.comments[0].user_reaction, Some(Reaction::Dislike));

    let rolled_back = next_update(&mut updates).await;
    assert_eq!(rolled_back.comments[0].dislike_count, 0);
    assert_eq!(rolled_back.comments[0].user_reaction, None);
    assert_eq!(notifier.count_of(NoticeKind::Error), 1);
}

#[tokio::test(start_paused = true)]
async fn in_flight_reactions_roll_back_independently() {
    let (server, sync, notifier) = setup();
    let target = server.test_seed_comment(&movie(), "contested");
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;
    next_update(&mut updates).await;

    server.test_fail_reacts(2);
    // Two toggles before either request resolves: the second captures the
    // already-mutated state. Each failure restores its own snapshot, so the
    // last processed response wins.
    session.toggle_like(target.id.clone());
    session.toggle_like(target.id.clone());
    settle().await;

    let mut last = None;
    while let Ok(update) = updates.try_recv() {
        last = Some(update);
    }
    let last = last.expect("no updates seen");
    assert_eq!(last.comments[0].user_reaction, Some(Reaction::Like));
    assert_eq!(last.comments[0].like_count, 1);
    assert_eq!(notifier.count_of(NoticeKind::Error), 2);
}

#[tokio::test(start_paused = true)]
async fn sessions_for_different_movies_are_independent() {
    let (server, sync, _notifier) = setup();
    let other = MovieId::from("m2");
    let session_a = sync.open(movie());
    let session_b = sync.open(other.clone());
    let mut updates_a = session_a.updates();
    let mut updates_b = session_b.updates();
    wait_for_state(&session_a, TransportState::Connected).await;
    wait_for_state(&session_b, TransportState::Connected).await;

    server.test_push_comment(&movie(), "only for m1");
    let update = next_update(&mut updates_a).await;
    assert_eq!(update.comments[0].content, "only for m1");
    settle().await;
    assert!(matches!(
        updates_b.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(start_paused = true)]
async fn closing_a_session_tears_the_feed_down() {
    let (server, sync, _notifier) = setup();
    let session = sync.open(movie());
    wait_for_state(&session, TransportState::Connected).await;
    assert_eq!(server.test_feed_count(&movie()), 1);

    session.close();
    settle().await;
    server.test_push_comment(&movie(), "nobody is listening");
    assert_eq!(server.test_feed_count(&movie()), 0);
}

#[tokio::test(start_paused = true)]
async fn an_unexpected_feed_drop_reconnects() {
    let (server, sync, _notifier) = setup();
    let session = sync.open(movie());
    let mut updates = session.updates();
    wait_for_state(&session, TransportState::Connected).await;

    server.test_drop_feeds();
    // Reconnect happens after the fixed 3s delay.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(server.test_feed_count(&movie()), 1);
    assert_eq!(*session.transport_state().borrow(), TransportState::Connected);

    let pushed = server.test_push_comment(&movie(), "after the reconnect");
    let update = next_update(&mut updates).await;
    assert_eq!(update.comments[0].id, pushed.id);
}
