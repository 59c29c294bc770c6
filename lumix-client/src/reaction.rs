use crate::api::Reaction;
use crate::tree::CommentNode;

/// Snapshot of a comment's reaction fields taken right before an optimistic
/// toggle, used to roll the comment back if the backend rejects the request.
/// The session keeps at most one per comment id; a newer toggle replaces it,
/// and each in-flight request carries the snapshot captured at its own issue
/// time so that every failure restores the immediately-prior state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingReaction {
    pub reaction: Option<Reaction>,
    pub like_count: u32,
    pub dislike_count: u32,
}

impl PendingReaction {
    pub fn capture(node: &CommentNode) -> PendingReaction {
        PendingReaction {
            reaction: node.user_reaction,
            like_count: node.like_count,
            dislike_count: node.dislike_count,
        }
    }

    pub fn restore(&self, node: &mut CommentNode) {
        node.user_reaction = self.reaction;
        node.like_count = self.like_count;
        node.dislike_count = self.dislike_count;
    }
}

/// Apply one like/dislike toggle to a comment, instantly and locally.
///
/// Toggling the current reaction clears it; toggling the opposite one swaps
/// it, adjusting both counters in the same step. Counters saturate at zero so
/// a server/client disagreement can never drive them negative.
pub fn toggle(node: &mut CommentNode, kind: Reaction) {
    match (kind, node.user_reaction) {
        (Reaction::Like, Some(Reaction::Like)) => {
            node.user_reaction = None;
            node.like_count = node.like_count.saturating_sub(1);
        }
        (Reaction::Like, Some(Reaction::Dislike)) => {
            node.user_reaction = Some(Reaction::Like);
            node.dislike_count = node.dislike_count.saturating_sub(1);
            node.like_count += 1;
        }
        (Reaction::Like, None) => {
            node.user_reaction = Some(Reaction::Like);
            node.like_count += 1;
        }
        (Reaction::Dislike, Some(Reaction::Dislike)) => {
            node.user_reaction = None;
            node.dislike_count = node.dislike_count.saturating_sub(1);
        }
        (Reaction::Dislike, Some(Reaction::Like)) => {
            node.user_reaction = Some(Reaction::Dislike);
            node.like_count = node.like_count.saturating_sub(1);
            node.dislike_count += 1;
        }
        (Reaction::Dislike, None) => {
            node.user_reaction = Some(Reaction::Dislike);
            node.dislike_count += 1;
        }
    }
}
