use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::api::CommentId;

/// How long a freshly-inserted comment stays flagged "new".
pub const HIGHLIGHT_TTL: Duration = Duration::from_secs(3);

/// Ephemeral "this comment is new" marking with automatic expiry.
///
/// Each id carries its own deadline, so marking many ids at once (a snapshot
/// full of new comments) never makes their expiries interfere. Re-marking an
/// id restarts its window. Cloning shares the underlying set, so the session
/// loop can mark while the UI queries.
#[derive(Clone, Debug)]
pub struct HighlightTracker {
    marked: Arc<Mutex<HashMap<CommentId, Instant>>>,
    ttl: Duration,
}

impl HighlightTracker {
    pub fn new(ttl: Duration) -> HighlightTracker {
        HighlightTracker {
            marked: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<CommentId, Instant>> {
        self.marked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark(&self, id: CommentId) {
        let now = Instant::now();
        let mut marked = self.locked();
        // Opportunistic sweep of entries nobody queried before they expired.
        marked.retain(|_, deadline| *deadline > now);
        marked.insert(id, now + self.ttl);
    }

    pub fn is_marked(&self, id: &CommentId) -> bool {
        let now = Instant::now();
        let mut marked = self.locked();
        match marked.get(id) {
            Some(deadline) if *deadline > now => true,
            Some(_) => {
                marked.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn clear(&self, id: &CommentId) {
        self.locked().remove(id);
    }
}

impl Default for HighlightTracker {
    fn default() -> HighlightTracker {
        HighlightTracker::new(HIGHLIGHT_TTL)
    }
}
