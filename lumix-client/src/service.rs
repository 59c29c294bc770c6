use std::{collections::HashMap, sync::Arc};

use tokio::sync::{broadcast, mpsc, watch};

use crate::api::{
    ApiError, Comment, CommentBackend, CommentId, FeedMessage, MovieId, NewComment, NoticeKind,
    NotificationSink, PushChannel, Reaction,
};
use crate::highlight::HighlightTracker;
use crate::reaction::{self, PendingReaction};
use crate::transport::{SyncConfig, TransportEvent, TransportManager, TransportState};
use crate::tree::{CommentNode, CommentTree, TreeDiff};

/// One merged-view change, published to every subscriber after each applied
/// mutation. `comments` is the full top-level list (cheap `Arc` clones);
/// `diff` tells the UI what to animate without recomputing anything.
#[derive(Clone, Debug)]
pub struct SyncUpdate {
    pub comments: Vec<Arc<CommentNode>>,
    pub diff: TreeDiff,
}

/// Entry point: holds the collaborators and opens per-movie sync sessions.
pub struct CommentSync {
    backend: Arc<dyn CommentBackend>,
    push: Arc<dyn PushChannel>,
    notifier: Arc<dyn NotificationSink>,
    config: SyncConfig,
}

impl CommentSync {
    pub fn new(
        backend: Arc<dyn CommentBackend>,
        push: Arc<dyn PushChannel>,
        notifier: Arc<dyn NotificationSink>,
    ) -> CommentSync {
        CommentSync {
            backend,
            push,
            notifier,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> CommentSync {
        self.config = config;
        self
    }

    /// Start a sync session for one movie: empty tree, transport started, and
    /// an immediate one-shot fetch so the first view does not wait for the
    /// first push or poll tick. Sessions for different movies are fully
    /// independent; dropping the returned handle closes the session.
    pub fn open(&self, movie: MovieId) -> SyncSession {
        let (transport, mut transport_rx) = TransportManager::start(
            self.push.clone(),
            self.backend.clone(),
            movie.clone(),
            self.config.clone(),
        );
        let transport = Arc::new(transport);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(64);
        let highlights = HighlightTracker::new(self.config.highlight_ttl);
        let state_rx = transport.state();

        // Pump transport events into the session's single inbox.
        let pump_tx = msg_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = transport_rx.recv().await {
                if pump_tx.send(SessionMsg::Transport(ev)).is_err() {
                    break;
                }
            }
        });

        // One-shot initial fetch. If the session is closed before it lands,
        // the completion goes to a dropped channel and is ignored.
        let backend = self.backend.clone();
        let fetch_movie = movie.clone();
        let fetch_tx = msg_tx.clone();
        tokio::spawn(async move {
            let res = backend.fetch_comments(&fetch_movie).await;
            let _ = fetch_tx.send(SessionMsg::FetchedInitial(res));
        });

        let state = SessionState {
            movie: movie.clone(),
            tree: CommentTree::new(),
            highlights: highlights.clone(),
            pending: HashMap::new(),
            updates: updates_tx.clone(),
            backend: self.backend.clone(),
            notifier: self.notifier.clone(),
            transport: transport.clone(),
            msg_tx: msg_tx.clone(),
            notified_of_polling: false,
        };
        tokio::spawn(session_loop(state, msg_rx));

        SyncSession {
            movie,
            msg_tx,
            transport,
            updates: updates_tx,
            state_rx,
            highlights,
        }
    }
}

/// Handle on one movie's live comment session. All mutations funnel through
/// the session's single loop, so no two of them ever interleave on the tree.
pub struct SyncSession {
    movie: MovieId,
    msg_tx: mpsc::UnboundedSender<SessionMsg>,
    transport: Arc<TransportManager>,
    updates: broadcast::Sender<SyncUpdate>,
    state_rx: watch::Receiver<TransportState>,
    highlights: HighlightTracker,
}

impl SyncSession {
    pub fn movie(&self) -> &MovieId {
        &self.movie
    }

    /// Subscribe to merged-tree updates. Every applied mutation with a
    /// non-empty diff produces one `SyncUpdate`.
    pub fn updates(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    pub fn transport_state(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    /// Query handle for "is this comment new" highlighting.
    pub fn highlights(&self) -> HighlightTracker {
        self.highlights.clone()
    }

    /// Post a comment (or a reply, with `parent_id`). Goes over the push
    /// channel when connected, over a direct backend write otherwise. The
    /// result lands asynchronously: as a tree insert on success, as an error
    /// notification on failure.
    pub fn post_comment(&self, content: impl Into<String>, parent_id: Option<CommentId>) {
        let _ = self.msg_tx.send(SessionMsg::Post {
            comment: NewComment {
                content: content.into(),
                parent_id,
            },
        });
    }

    pub fn edit_comment(&self, id: CommentId, content: impl Into<String>) {
        let _ = self.msg_tx.send(SessionMsg::Edit {
            id,
            content: content.into(),
        });
    }

    pub fn delete_comment(&self, id: CommentId) {
        let _ = self.msg_tx.send(SessionMsg::Delete { id });
    }

    pub fn toggle_like(&self, id: CommentId) {
        let _ = self.msg_tx.send(SessionMsg::Toggle {
            id,
            kind: Reaction::Like,
        });
    }

    pub fn toggle_dislike(&self, id: CommentId) {
        let _ = self.msg_tx.send(SessionMsg::Toggle {
            id,
            kind: Reaction::Dislike,
        });
    }

    /// Stop the transport and discard the tree. Dropping the handle does the
    /// same thing.
    pub fn close(self) {}
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.transport.stop();
        let _ = self.msg_tx.send(SessionMsg::Close);
    }
}

enum SessionMsg {
    Transport(TransportEvent),
    FetchedInitial(Result<Vec<Comment>, ApiError>),
    Post {
        comment: NewComment,
    },
    Posted(Result<Option<Comment>, ApiError>),
    Edit {
        id: CommentId,
        content: String,
    },
    Edited(Result<Comment, ApiError>),
    Delete {
        id: CommentId,
    },
    Deleted {
        id: CommentId,
        result: Result<(), ApiError>,
    },
    Toggle {
        id: CommentId,
        kind: Reaction,
    },
    Reacted {
        id: CommentId,
        pending: PendingReaction,
        result: Result<(), ApiError>,
    },
    Close,
}

struct SessionState {
    movie: MovieId,
    tree: CommentTree,
    highlights: HighlightTracker,
    pending: HashMap<CommentId, PendingReaction>,
    updates: broadcast::Sender<SyncUpdate>,
    backend: Arc<dyn CommentBackend>,
    notifier: Arc<dyn NotificationSink>,
    transport: Arc<TransportManager>,
    msg_tx: mpsc::UnboundedSender<SessionMsg>,
    notified_of_polling: bool,
}

impl SessionState {
    fn publish(&self, diff: TreeDiff) {
        let _ = self.updates.send(SyncUpdate {
            comments: self.tree.comments().to_vec(),
            diff,
        });
    }

    /// Publish a non-empty diff and keep the highlight set in step with it.
    fn after_merge(&mut self, diff: TreeDiff) {
        if diff.is_empty() {
            return;
        }
        for id in &diff.inserted {
            self.highlights.mark(id.clone());
        }
        for id in &diff.deleted {
            self.highlights.clear(id);
        }
        self.publish(diff);
    }

    fn apply_snapshot(&mut self, list: Vec<Comment>) {
        let diff = self.tree.reconcile(list);
        self.after_merge(diff);
    }

    fn apply_upsert(&mut self, comment: Comment) {
        let diff = self.tree.upsert(comment);
        self.after_merge(diff);
    }
}

async fn session_loop(mut st: SessionState, mut inbox: mpsc::UnboundedReceiver<SessionMsg>) {
    while let Some(msg) = inbox.recv().await {
        match msg {
            SessionMsg::Close => break,

            SessionMsg::Transport(TransportEvent::StateChanged(state)) => {
                tracing::debug!(movie = %st.movie, ?state, "transport state changed");
                if state == TransportState::Polling && !st.notified_of_polling {
                    st.notified_of_polling = true;
                    st.notifier.notify(
                        NoticeKind::Warning,
                        "Live comment updates are unavailable, refreshing periodically instead",
                    );
                }
            }
            SessionMsg::Transport(TransportEvent::Feed(FeedMessage::Snapshot(list))) => {
                st.apply_snapshot(list)
            }
            SessionMsg::Transport(TransportEvent::Feed(FeedMessage::NewComment(comment))) => {
                st.apply_upsert(comment)
            }

            SessionMsg::FetchedInitial(Ok(list)) => st.apply_snapshot(list),
            SessionMsg::FetchedInitial(Err(e)) => {
                tracing::warn!(movie = %st.movie, ?e, "initial comment fetch failed");
                st.notifier
                    .notify(NoticeKind::Error, "Could not load comments, please retry");
            }

            SessionMsg::Post { comment } => {
                let transport = st.transport.clone();
                let tx = st.msg_tx.clone();
                tokio::spawn(async move {
                    let res = transport.send_comment(comment).await;
                    let _ = tx.send(SessionMsg::Posted(res));
                });
            }
            // Direct-write path: insert the created comment right away.
            SessionMsg::Posted(Ok(Some(comment))) => st.apply_upsert(comment),
            // Push path: the created comment arrives as its own feed echo.
            SessionMsg::Posted(Ok(None)) => {}
            SessionMsg::Posted(Err(e)) => {
                tracing::warn!(movie = %st.movie, ?e, "comment post failed");
                st.notifier
                    .notify(NoticeKind::Error, "Could not post your comment");
            }

            SessionMsg::Edit { id, content } => {
                let backend = st.backend.clone();
                let movie = st.movie.clone();
                let tx = st.msg_tx.clone();
                tokio::spawn(async move {
                    let res = backend.edit_comment(&movie, &id, content).await;
                    let _ = tx.send(SessionMsg::Edited(res));
                });
            }
            SessionMsg::Edited(Ok(comment)) => {
                let id = comment.id.clone();
                let diff = st.tree.upsert(comment);
                st.highlights.mark(id);
                st.after_merge(diff);
                st.notifier.notify(NoticeKind::Info, "Comment updated");
            }
            SessionMsg::Edited(Err(e)) => {
                tracing::warn!(movie = %st.movie, ?e, "comment edit failed");
                st.notifier
                    .notify(NoticeKind::Error, "Could not update the comment");
            }

            SessionMsg::Delete { id } => {
                let backend = st.backend.clone();
                let movie = st.movie.clone();
                let tx = st.msg_tx.clone();
                tokio::spawn(async move {
                    let result = backend.delete_comment(&movie, &id).await;
                    let _ = tx.send(SessionMsg::Deleted { id, result });
                });
            }
            SessionMsg::Deleted { id, result: Ok(()) } => {
                let diff = st.tree.remove(&id);
                st.after_merge(diff);
                st.notifier.notify(NoticeKind::Info, "Comment deleted");
            }
            SessionMsg::Deleted { id, result: Err(e) } => {
                tracing::warn!(movie = %st.movie, comment = %id, ?e, "comment deletion failed");
                st.notifier
                    .notify(NoticeKind::Error, "Could not delete the comment");
            }

            SessionMsg::Toggle { id, kind } => {
                let Some(node) = st.tree.get(&id) else {
                    tracing::warn!(comment = %id, "reaction toggled on a comment not in the tree");
                    continue;
                };
                // Optimistic: snapshot, mutate locally, then ask the backend.
                let pending = PendingReaction::capture(node);
                st.tree.with_node_mut(&id, |n| reaction::toggle(n, kind));
                st.pending.insert(id.clone(), pending.clone());
                st.publish(TreeDiff::updated_only(id.clone()));

                let backend = st.backend.clone();
                let tx = st.msg_tx.clone();
                tokio::spawn(async move {
                    let result = backend.react(&id, kind).await;
                    let _ = tx.send(SessionMsg::Reacted {
                        id,
                        pending,
                        result,
                    });
                });
            }
            SessionMsg::Reacted {
                id,
                pending,
                result: Ok(()),
            } => {
                // Optimistic state stands until the next reconciliation.
                if st.pending.get(&id) == Some(&pending) {
                    st.pending.remove(&id);
                }
            }
            SessionMsg::Reacted {
                id,
                pending,
                result: Err(e),
            } => {
                tracing::warn!(comment = %id, ?e, "reaction request failed, rolling back");
                st.tree.with_node_mut(&id, |n| pending.restore(n));
                if st.pending.get(&id) == Some(&pending) {
                    st.pending.remove(&id);
                }
                st.publish(TreeDiff::updated_only(id));
                st.notifier
                    .notify(NoticeKind::Error, "Could not send your reaction");
            }
        }
    }
    tracing::debug!(movie = %st.movie, "comment session closed");
}
