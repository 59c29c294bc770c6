use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;

use crate::api::{
    ApiError, Comment, CommentBackend, FeedMessage, MovieId, NewComment, PushChannel,
    TransportError,
};

// Push reconnect attempts are spaced by RECONNECT_DELAY.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
// After MAX_PUSH_ATTEMPTS consecutive failures the session falls back to polling.
const MAX_PUSH_ATTEMPTS: u32 = 3;
// Interval of the polling fallback loop.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Knobs for one sync session. Defaults match the production values.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub reconnect_delay: Duration,
    pub max_push_attempts: u32,
    pub poll_interval: Duration,
    pub highlight_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            reconnect_delay: RECONNECT_DELAY,
            max_push_attempts: MAX_PUSH_ATTEMPTS,
            poll_interval: POLL_INTERVAL,
            highlight_ttl: crate::highlight::HIGHLIGHT_TTL,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    /// Push channel open.
    Connected,
    /// Terminal fallback for the session; a normal operating mode, not an
    /// error state. Only a fresh `start` attempts push again.
    Polling,
}

/// What the transport hands to the session, from either delivery mode.
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(TransportState),
    Feed(FeedMessage),
}

enum Command {
    Publish {
        payload: NewComment,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Owns exactly one live delivery mode for one movie and emits a uniform
/// stream of feed events regardless of origin. Push failures are retried with
/// a fixed delay; after `max_push_attempts` consecutive failures the manager
/// degrades to a fixed-interval poll loop instead of failing the session.
pub struct TransportManager {
    movie: MovieId,
    backend: Arc<dyn CommentBackend>,
    state_rx: watch::Receiver<TransportState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl TransportManager {
    /// Spawn the delivery task for `movie` and return the manager plus the
    /// event stream it feeds.
    pub fn start(
        push: Arc<dyn PushChannel>,
        backend: Arc<dyn CommentBackend>,
        movie: MovieId,
        config: SyncConfig,
    ) -> (TransportManager, mpsc::UnboundedReceiver<TransportEvent>) {
        let (state_tx, state_rx) = watch::channel(TransportState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run(
            push,
            backend.clone(),
            movie.clone(),
            config,
            state_tx,
            events_tx,
            cmd_rx,
            cancel_rx,
        ));
        let manager = TransportManager {
            movie,
            backend,
            state_rx,
            cmd_tx,
            cancel: Mutex::new(Some(cancel_tx)),
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// Deliver a new comment. Publishes over the push channel when connected;
    /// in every other state (or if the publish fails under us) this falls
    /// back to a direct backend write, so delivery is never silently dropped.
    /// Returns the created comment for the direct path; the push path answers
    /// through the feed instead.
    pub async fn send_comment(&self, comment: NewComment) -> Result<Option<Comment>, ApiError> {
        if self.current_state() == TransportState::Connected {
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = Command::Publish {
                payload: comment.clone(),
                reply: reply_tx,
            };
            if self.cmd_tx.send(cmd).is_ok() {
                match reply_rx.await {
                    Ok(Ok(())) => return Ok(None),
                    Ok(Err(e)) => {
                        tracing::warn!(?e, "push publish failed, falling back to direct write")
                    }
                    Err(_) => tracing::warn!("push channel went away, falling back to direct write"),
                }
            }
        }
        self.backend.post_comment(&self.movie, comment).await.map(Some)
    }

    /// Cancel timers, subscriptions and the poll loop. Idempotent.
    pub fn stop(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(
    state_tx: &watch::Sender<TransportState>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    state: TransportState,
) {
    if state_tx.send_replace(state) != state {
        let _ = events_tx.send(TransportEvent::StateChanged(state));
    }
}

fn refuse_pending_commands(cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
    while let Ok(Command::Publish { reply, .. }) = cmd_rx.try_recv() {
        let _ = reply.send(Err(TransportError::Closed));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    push: Arc<dyn PushChannel>,
    backend: Arc<dyn CommentBackend>,
    movie: MovieId,
    config: SyncConfig,
    state_tx: watch::Sender<TransportState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let topic = format!("comments/{movie}");
    let mut attempts = 0;
    while attempts < config.max_push_attempts {
        set_state(&state_tx, &events_tx, TransportState::Connecting);
        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                set_state(&state_tx, &events_tx, TransportState::Disconnected);
                return;
            }
            opened = push.open(&topic) => opened,
        };
        match opened {
            Ok(mut sub) => {
                attempts = 0;
                set_state(&state_tx, &events_tx, TransportState::Connected);
                tracing::debug!(%topic, "push channel open");
                loop {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            sub.close().await;
                            set_state(&state_tx, &events_tx, TransportState::Disconnected);
                            return;
                        }
                        cmd = cmd_rx.recv() => {
                            let Some(Command::Publish { payload, reply }) = cmd else { continue };
                            let text = serde_json::to_string(&payload)
                                .expect("serializing comment payload");
                            match sub.publish(text).await {
                                Ok(()) => {
                                    let _ = reply.send(Ok(()));
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                    break;
                                }
                            }
                        }
                        msg = sub.next() => match msg {
                            Some(Ok(text)) => match serde_json::from_str::<FeedMessage>(&text) {
                                Ok(m) => {
                                    let _ = events_tx.send(TransportEvent::Feed(m));
                                }
                                Err(e) => {
                                    tracing::warn!(?e, "undecodable push payload, skipping")
                                }
                            },
                            Some(Err(e)) => {
                                tracing::warn!(?e, "push channel error");
                                break;
                            }
                            None => {
                                tracing::warn!("push channel closed by remote");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => tracing::warn!(?e, "failed to open push channel"),
        }
        set_state(&state_tx, &events_tx, TransportState::Disconnected);
        refuse_pending_commands(&mut cmd_rx);
        attempts += 1;
        if attempts >= config.max_push_attempts {
            break;
        }
        tokio::select! {
            _ = &mut cancel_rx => return,
            _ = time::sleep(config.reconnect_delay) => {}
        }
    }

    tracing::warn!(
        attempts,
        "push channel failed repeatedly, falling back to polling"
    );
    set_state(&state_tx, &events_tx, TransportState::Polling);
    let mut ticker = time::interval(config.poll_interval);
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                set_state(&state_tx, &events_tx, TransportState::Disconnected);
                return;
            }
            cmd = cmd_rx.recv() => {
                if let Some(Command::Publish { reply, .. }) = cmd {
                    let _ = reply.send(Err(TransportError::Closed));
                }
            }
            _ = ticker.tick() => {
                // The fetch itself must also yield to a stop() request.
                let fetched = tokio::select! {
                    _ = &mut cancel_rx => {
                        set_state(&state_tx, &events_tx, TransportState::Disconnected);
                        return;
                    }
                    fetched = backend.fetch_comments(&movie) => fetched,
                };
                match fetched {
                    Ok(comments) => {
                        let _ = events_tx.send(TransportEvent::Feed(FeedMessage::Snapshot(comments)));
                    }
                    Err(e) => tracing::warn!(?e, "poll fetch failed"),
                }
            },
        }
    }
}
