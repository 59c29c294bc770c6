use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use lumix_api::{
    ApiError, Comment, CommentBackend, CommentId, FeedMessage, MovieId, NewComment, PushChannel,
    PushSubscription, Reaction, TransportError, UserId,
};

/// In-memory stand-in for the comment backend and its pub/sub broker, for
/// tests. Implements both collaborator traits over one shared state, plus
/// `test_*` knobs to reach in from test code.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    user: UserId,
    user_name: String,
    threads: HashMap<MovieId, Vec<Comment>>,
    feeds: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    refuse_push_opens: u32,
    push_disabled: bool,
    fail_posts: u32,
    fail_reacts: u32,
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer {
            inner: Arc::new(Mutex::new(Inner {
                user: UserId::from("viewer"),
                user_name: "The Viewer".to_string(),
                threads: HashMap::new(),
                feeds: HashMap::new(),
                refuse_push_opens: 0,
                push_disabled: false,
                fail_posts: 0,
                fail_reacts: 0,
            })),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `n` push-channel opens.
    pub fn test_refuse_push(&self, n: u32) {
        self.locked().refuse_push_opens = n;
    }

    /// Refuse every push-channel open from now on.
    pub fn test_disable_push(&self) {
        self.locked().push_disabled = true;
    }

    /// Fail the next `n` post requests.
    pub fn test_fail_posts(&self, n: u32) {
        self.locked().fail_posts = n;
    }

    /// Fail the next `n` reaction requests.
    pub fn test_fail_reacts(&self, n: u32) {
        self.locked().fail_reacts = n;
    }

    /// Drop every open feed, as if the broker connection died.
    pub fn test_drop_feeds(&self) {
        self.locked().feeds.clear();
    }

    /// Number of live feeds on a movie's topic (dead senders pruned).
    pub fn test_feed_count(&self, movie: &MovieId) -> usize {
        let mut inner = self.locked();
        let topic = topic_for(movie);
        match inner.feeds.get_mut(&topic) {
            Some(feeds) => {
                feeds.retain(|f| !f.is_closed());
                feeds.len()
            }
            None => 0,
        }
    }

    /// Seed a top-level comment without touching any feed.
    pub fn test_seed_comment(&self, movie: &MovieId, content: &str) -> Comment {
        let mut inner = self.locked();
        let comment = inner.make_comment(content.to_string(), None);
        inner.thread_mut(movie).insert(0, comment.clone());
        comment
    }

    /// Seed a reply without touching any feed.
    pub fn test_seed_reply(&self, movie: &MovieId, parent: &CommentId, content: &str) -> Comment {
        let mut inner = self.locked();
        let reply = inner.make_comment(content.to_string(), Some(parent.clone()));
        let thread = inner.thread_mut(movie);
        let parent = thread
            .iter_mut()
            .find(|c| c.id == *parent)
            .expect("seeding a reply under an unknown parent");
        parent.replies.push(reply.clone());
        reply
    }

    /// Create a comment as if another client posted it, and push it to every
    /// feed on the movie's topic.
    pub fn test_push_comment(&self, movie: &MovieId, content: &str) -> Comment {
        let mut inner = self.locked();
        let comment = inner.make_comment(content.to_string(), None);
        inner.thread_mut(movie).insert(0, comment.clone());
        inner.broadcast(movie, &FeedMessage::NewComment(comment.clone()));
        comment
    }

    /// Replace a movie's whole thread. The next snapshot (poll tick or
    /// `test_push_snapshot`) reveals the change.
    pub fn test_set_comments(&self, movie: &MovieId, comments: Vec<Comment>) {
        self.locked().threads.insert(movie.clone(), comments);
    }

    /// Push the movie's full current thread as a snapshot over the feed.
    pub fn test_push_snapshot(&self, movie: &MovieId) {
        let mut inner = self.locked();
        let list = inner.threads.get(movie).cloned().unwrap_or_default();
        inner.broadcast(movie, &FeedMessage::Snapshot(list));
    }

    /// Server-side view of a thread, for asserting against.
    pub fn test_comments(&self, movie: &MovieId) -> Vec<Comment> {
        self.locked().threads.get(movie).cloned().unwrap_or_default()
    }
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}

fn topic_for(movie: &MovieId) -> String {
    format!("comments/{movie}")
}

fn find_in_thread<'a>(thread: &'a mut [Comment], id: &CommentId) -> Option<&'a mut Comment> {
    for comment in thread.iter_mut() {
        if comment.id == *id {
            return Some(comment);
        }
        if let Some(reply) = comment.replies.iter_mut().find(|r| r.id == *id) {
            return Some(reply);
        }
    }
    None
}

impl Inner {
    fn thread_mut(&mut self, movie: &MovieId) -> &mut Vec<Comment> {
        self.threads.entry(movie.clone()).or_default()
    }

    fn make_comment(&self, content: String, parent_id: Option<CommentId>) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4().to_string()),
            content,
            author: self.user.clone(),
            author_name: self.user_name.clone(),
            created_at: Utc::now(),
            updated_at: None,
            parent_id,
            like_count: 0,
            dislike_count: 0,
            user_reaction: None,
            replies: Vec::new(),
        }
    }

    fn broadcast(&mut self, movie: &MovieId, msg: &FeedMessage) {
        let text = serde_json::to_string(msg).expect("serializing feed message");
        if let Some(feeds) = self.feeds.get_mut(&topic_for(movie)) {
            feeds.retain(|f| f.send(text.clone()).is_ok());
        }
    }

    fn create_comment(
        &mut self,
        movie: &MovieId,
        new: NewComment,
    ) -> Result<Comment, ApiError> {
        let comment = self.make_comment(new.content, new.parent_id.clone());
        let thread = self.thread_mut(movie);
        match new.parent_id {
            None => thread.insert(0, comment.clone()),
            Some(parent_id) => {
                let parent = thread
                    .iter_mut()
                    .find(|c| c.id == parent_id)
                    .ok_or(ApiError::CommentNotFound(parent_id))?;
                parent.replies.push(comment.clone());
            }
        }
        Ok(comment)
    }

    fn find_comment_mut(&mut self, id: &CommentId) -> Option<&mut Comment> {
        self.threads
            .values_mut()
            .find_map(|thread| find_in_thread(thread, id))
    }
}

#[async_trait]
impl CommentBackend for MockServer {
    async fn fetch_comments(&self, movie: &MovieId) -> Result<Vec<Comment>, ApiError> {
        Ok(self.locked().threads.get(movie).cloned().unwrap_or_default())
    }

    async fn post_comment(&self, movie: &MovieId, comment: NewComment) -> Result<Comment, ApiError> {
        let mut inner = self.locked();
        if inner.fail_posts > 0 {
            inner.fail_posts -= 1;
            return Err(ApiError::Server("induced post failure".to_string()));
        }
        let created = inner.create_comment(movie, comment)?;
        inner.broadcast(movie, &FeedMessage::NewComment(created.clone()));
        Ok(created)
    }

    async fn edit_comment(
        &self,
        movie: &MovieId,
        comment: &CommentId,
        content: String,
    ) -> Result<Comment, ApiError> {
        let mut inner = self.locked();
        let thread = inner
            .threads
            .get_mut(movie)
            .ok_or_else(|| ApiError::CommentNotFound(comment.clone()))?;
        let target = find_in_thread(thread, comment)
            .ok_or_else(|| ApiError::CommentNotFound(comment.clone()))?;
        target.content = content;
        target.updated_at = Some(Utc::now());
        Ok(target.clone())
    }

    async fn delete_comment(&self, movie: &MovieId, comment: &CommentId) -> Result<(), ApiError> {
        let mut inner = self.locked();
        let thread = inner
            .threads
            .get_mut(movie)
            .ok_or_else(|| ApiError::CommentNotFound(comment.clone()))?;
        if let Some(pos) = thread.iter().position(|c| c.id == *comment) {
            thread.remove(pos);
            return Ok(());
        }
        for parent in thread.iter_mut() {
            if let Some(pos) = parent.replies.iter().position(|r| r.id == *comment) {
                parent.replies.remove(pos);
                return Ok(());
            }
        }
        Err(ApiError::CommentNotFound(comment.clone()))
    }

    async fn react(&self, comment: &CommentId, kind: Reaction) -> Result<(), ApiError> {
        let mut inner = self.locked();
        if inner.fail_reacts > 0 {
            inner.fail_reacts -= 1;
            return Err(ApiError::Server("induced reaction failure".to_string()));
        }
        let target = inner
            .find_comment_mut(comment)
            .ok_or_else(|| ApiError::CommentNotFound(comment.clone()))?;
        // Same toggle rules as the client applies optimistically.
        match (kind, target.user_reaction) {
            (Reaction::Like, Some(Reaction::Like)) => {
                target.user_reaction = None;
                target.like_count = target.like_count.saturating_sub(1);
            }
            (Reaction::Like, Some(Reaction::Dislike)) => {
                target.user_reaction = Some(Reaction::Like);
                target.dislike_count = target.dislike_count.saturating_sub(1);
                target.like_count += 1;
            }
            (Reaction::Like, None) => {
                target.user_reaction = Some(Reaction::Like);
                target.like_count += 1;
            }
            (Reaction::Dislike, Some(Reaction::Dislike)) => {
                target.user_reaction = None;
                target.dislike_count = target.dislike_count.saturating_sub(1);
            }
            (Reaction::Dislike, Some(Reaction::Like)) => {
                target.user_reaction = Some(Reaction::Dislike);
                target.like_count = target.like_count.saturating_sub(1);
                target.dislike_count += 1;
            }
            (Reaction::Dislike, None) => {
                target.user_reaction = Some(Reaction::Dislike);
                target.dislike_count += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PushChannel for MockServer {
    async fn open(&self, topic: &str) -> Result<Box<dyn PushSubscription>, TransportError> {
        let mut inner = self.locked();
        if inner.push_disabled {
            return Err(TransportError::Open("push disabled".to_string()));
        }
        if inner.refuse_push_opens > 0 {
            inner.refuse_push_opens -= 1;
            return Err(TransportError::Open("induced open failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.feeds.entry(topic.to_string()).or_default().push(tx);
        Ok(Box::new(MockSubscription {
            topic: topic.to_string(),
            rx,
            server: self.clone(),
        }))
    }
}

struct MockSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<String>,
    server: MockServer,
}

#[async_trait]
impl PushSubscription for MockSubscription {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn publish(&mut self, payload: String) -> Result<(), TransportError> {
        let new: NewComment = serde_json::from_str(&payload)
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        let movie = self
            .topic
            .strip_prefix("comments/")
            .map(MovieId::from)
            .ok_or_else(|| TransportError::Publish(format!("unknown topic {}", self.topic)))?;
        let mut inner = self.server.locked();
        let created = inner
            .create_comment(&movie, new)
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        inner.broadcast(&movie, &FeedMessage::NewComment(created));
        Ok(())
    }

    async fn close(self: Box<Self>) {
        // Dropping the receiver is enough; dead senders are pruned on the
        // next broadcast.
    }
}
