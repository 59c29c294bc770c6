mod highlight;
pub use highlight::HighlightTracker;

mod reaction;
pub use reaction::{toggle, PendingReaction};

mod service;
pub use service::{CommentSync, SyncSession, SyncUpdate};

mod transport;
pub use transport::{SyncConfig, TransportEvent, TransportManager, TransportState};

mod tree;
pub use tree::{CommentNode, CommentTree, TreeDiff};

pub mod api {
    pub use lumix_api::*;
}
