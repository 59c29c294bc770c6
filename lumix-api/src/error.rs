use crate::{CommentId, MovieId};

/// Failure of a backend request (post/edit/delete/react/fetch). Surfaced to
/// the user as a transient notification; never fatal.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("comment not found: {0}")]
    CommentNotFound(CommentId),

    #[error("movie not found: {0}")]
    MovieNotFound(MovieId),

    #[error("server error: {0}")]
    Server(String),
}

/// Failure of the push channel. Recovered locally through reconnect and
/// polling fallback; never surfaced to the user directly.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open push channel: {0}")]
    Open(String),

    #[error("failed to publish on push channel: {0}")]
    Publish(String),

    #[error("push channel closed unexpectedly")]
    Closed,
}
