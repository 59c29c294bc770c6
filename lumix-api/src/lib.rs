use std::fmt;

use async_trait::async_trait;
use chrono::Utc;

mod error;
pub use error::{ApiError, TransportError};

pub type Time = chrono::DateTime<Utc>;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct MovieId(pub String);

impl fmt::Display for MovieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for MovieId {
    fn from(s: &str) -> MovieId {
        MovieId(s.to_string())
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct CommentId(pub String);

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for CommentId {
    fn from(s: &str) -> CommentId {
        CommentId(s.to_string())
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> UserId {
        UserId(s.to_string())
    }
}

/// The viewing user's reaction to a comment. At most one of the two at a time.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reaction {
    Like,
    Dislike,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    pub author: UserId,
    pub author_name: String,
    pub created_at: Time,
    #[serde(default)]
    pub updated_at: Option<Time>,

    /// None for top-level comments, the parent's id for replies.
    #[serde(default)]
    pub parent_id: Option<CommentId>,

    pub like_count: u32,
    pub dislike_count: u32,

    /// The viewing user's reaction, if any. Scoped to the requesting session.
    #[serde(default)]
    pub user_reaction: Option<Reaction>,

    /// Replies in the order the server sends them. One level of nesting.
    #[serde(default)]
    pub replies: Vec<Comment>,
}

/// Payload for creating a comment, over the push channel or over HTTP.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
}

/// A message delivered on a movie's comment topic.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FeedMessage {
    /// The full current comment list, in server order (newest first).
    Snapshot(Vec<Comment>),
    /// A single comment another client just created.
    NewComment(Comment),
}

/// The backend service owning comment storage. Wire format is its business;
/// the sync engine only sees these calls.
#[async_trait]
pub trait CommentBackend: Send + Sync {
    async fn fetch_comments(&self, movie: &MovieId) -> Result<Vec<Comment>, ApiError>;

    async fn post_comment(&self, movie: &MovieId, comment: NewComment) -> Result<Comment, ApiError>;

    async fn edit_comment(
        &self,
        movie: &MovieId,
        comment: &CommentId,
        content: String,
    ) -> Result<Comment, ApiError>;

    async fn delete_comment(&self, movie: &MovieId, comment: &CommentId) -> Result<(), ApiError>;

    async fn react(&self, comment: &CommentId, kind: Reaction) -> Result<(), ApiError>;
}

/// A persistent server-to-client delivery path (publish/subscribe).
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn open(&self, topic: &str) -> Result<Box<dyn PushSubscription>, TransportError>;
}

/// One open subscription on a topic.
#[async_trait]
pub trait PushSubscription: Send {
    /// Next raw payload. `Some(Err(_))` is a transport fault, `None` means the
    /// remote closed the stream; both are unexpected unless `close` was called.
    async fn next(&mut self) -> Option<Result<String, TransportError>>;

    async fn publish(&mut self, payload: String) -> Result<(), TransportError>;

    /// Clean local close.
    async fn close(self: Box<Self>);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

/// External sink for user-visible transient notifications (toasts). The sync
/// engine calls into it on failures; it never stores notification state.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, kind: NoticeKind, message: &str);
}

/// Sink that swallows every notification, for callers that render nothing.
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _kind: NoticeKind, _message: &str) {}
}
