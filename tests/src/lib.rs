//! Shared helpers for the integration tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lumix_api::{NoticeKind, NotificationSink};
use rand::Rng;

/// Route engine logs to the test writer. Repeat calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Random plausible comment body.
pub fn comment_text() -> String {
    lipsum::lipsum_words(rand::thread_rng().gen_range(3..10))
}

/// Notification sink that records what the engine surfaced to the user.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<(NoticeKind, String)>>>,
}

impl RecordingNotifier {
    pub fn new() -> RecordingNotifier {
        RecordingNotifier::default()
    }

    fn locked(&self) -> MutexGuard<'_, Vec<(NoticeKind, String)>> {
        self.notices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notices(&self) -> Vec<(NoticeKind, String)> {
        self.locked().clone()
    }

    pub fn count_of(&self, kind: NoticeKind) -> usize {
        self.locked().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, kind: NoticeKind, message: &str) {
        self.locked().push((kind, message.to_string()));
    }
}
