use std::{collections::HashMap, sync::Arc};

use crate::api::{Comment, CommentId, Reaction, Time, UserId};

/// One comment in the merged client-side view. Distinct from the wire
/// [`Comment`] so that replies can be shared as `Arc`s: a node whose fields
/// and replies did not change across a merge keeps its exact `Arc`, which is
/// what lets the UI skip re-rendering it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentNode {
    pub id: CommentId,
    pub content: String,
    pub author: UserId,
    pub author_name: String,
    pub created_at: Time,
    pub updated_at: Option<Time>,
    pub parent_id: Option<CommentId>,
    pub like_count: u32,
    pub dislike_count: u32,
    pub user_reaction: Option<Reaction>,
    pub replies: Vec<Arc<CommentNode>>,
}

impl CommentNode {
    /// Build a node from a freshly-received comment, recording it and all of
    /// its replies as inserted. Replies that do not reference their carrying
    /// parent are dropped with a warning.
    fn from_wire(c: Comment, diff: &mut TreeDiff) -> CommentNode {
        diff.inserted.push(c.id.clone());
        let mut replies = Vec::with_capacity(c.replies.len());
        for reply in c.replies {
            if reply.parent_id.as_ref() != Some(&c.id) {
                tracing::warn!(comment = %reply.id, parent = %c.id, "reply does not reference its parent, dropping");
                continue;
            }
            replies.push(Arc::new(CommentNode::from_wire(reply, diff)));
        }
        CommentNode {
            id: c.id,
            content: c.content,
            author: c.author,
            author_name: c.author_name,
            created_at: c.created_at,
            updated_at: c.updated_at,
            parent_id: c.parent_id,
            like_count: c.like_count,
            dislike_count: c.dislike_count,
            user_reaction: c.user_reaction,
            replies,
        }
    }

    /// Whether the mutable fields match the incoming version. Replies are
    /// compared separately; everything else is immutable for a given id.
    fn same_fields(&self, c: &Comment) -> bool {
        self.content == c.content
            && self.like_count == c.like_count
            && self.dislike_count == c.dislike_count
            && self.user_reaction == c.user_reaction
            && self.updated_at == c.updated_at
    }

    fn apply_fields(&mut self, c: &Comment) {
        self.content = c.content.clone();
        self.like_count = c.like_count;
        self.dislike_count = c.dislike_count;
        self.user_reaction = c.user_reaction;
        self.updated_at = c.updated_at;
    }

    fn collect_ids(&self, out: &mut Vec<CommentId>) {
        out.push(self.id.clone());
        for reply in &self.replies {
            reply.collect_ids(out);
        }
    }
}

/// Change summary of one merge, in terms of comment ids (reply ids included).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeDiff {
    pub inserted: Vec<CommentId>,
    pub updated: Vec<CommentId>,
    pub deleted: Vec<CommentId>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub(crate) fn updated_only(id: CommentId) -> TreeDiff {
        TreeDiff {
            updated: vec![id],
            ..TreeDiff::default()
        }
    }
}

/// The merged comment view for one movie. Top-level order is the server's
/// order (newest first); the tree never re-sorts on its own.
#[derive(Clone, Debug, Default)]
pub struct CommentTree {
    comments: Vec<Arc<CommentNode>>,
}

impl CommentTree {
    pub fn new() -> CommentTree {
        CommentTree::default()
    }

    pub fn comments(&self) -> &[Arc<CommentNode>] {
        &self.comments
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn get(&self, id: &CommentId) -> Option<&Arc<CommentNode>> {
        for node in &self.comments {
            if node.id == *id {
                return Some(node);
            }
            if let Some(reply) = node.replies.iter().find(|r| r.id == *id) {
                return Some(reply);
            }
        }
        None
    }

    /// Mutate one node in place (copy-on-write). Returns false when the id is
    /// not in the tree.
    pub fn with_node_mut(&mut self, id: &CommentId, f: impl FnOnce(&mut CommentNode)) -> bool {
        for node in &mut self.comments {
            if node.id == *id {
                f(Arc::make_mut(node));
                return true;
            }
            if node.replies.iter().any(|r| r.id == *id) {
                let node = Arc::make_mut(node);
                if let Some(reply) = node.replies.iter_mut().find(|r| r.id == *id) {
                    f(Arc::make_mut(reply));
                    return true;
                }
            }
        }
        false
    }

    /// Merge a full snapshot into the tree. Matching is id-based at each
    /// level: matched nodes are updated in place only if their fields differ,
    /// unmatched incoming comments are inserted, and existing comments absent
    /// from the snapshot are removed together with their replies. A comment
    /// whose parent changed simply fails to match at its old location, which
    /// makes a parent reassignment a delete-then-insert.
    pub fn reconcile(&mut self, incoming: Vec<Comment>) -> TreeDiff {
        let mut diff = TreeDiff::default();
        let current = std::mem::take(&mut self.comments);
        self.comments = reconcile_level(current, incoming, None, &mut diff);
        diff
    }

    /// Merge a single comment (a push delta or a local optimistic insert)
    /// without any deletions. Id-matched comments get a field update, which
    /// makes this idempotent against a snapshot or echo that already carried
    /// the same comment.
    pub fn upsert(&mut self, comment: Comment) -> TreeDiff {
        let mut diff = TreeDiff::default();
        match comment.parent_id.clone() {
            None => {
                if let Some(pos) = self.comments.iter().position(|n| n.id == comment.id) {
                    update_in_place(&mut self.comments[pos], &comment, &mut diff);
                } else {
                    // Server order is newest first, so fresh comments go to the front.
                    let node = CommentNode::from_wire(comment, &mut diff);
                    self.comments.insert(0, Arc::new(node));
                }
            }
            Some(parent_id) => {
                let Some(parent) = self.comments.iter_mut().find(|n| n.id == parent_id) else {
                    tracing::warn!(comment = %comment.id, parent = %parent_id, "no parent in tree for incoming reply, dropping");
                    return diff;
                };
                if let Some(pos) = parent.replies.iter().position(|r| r.id == comment.id) {
                    if !parent.replies[pos].same_fields(&comment) {
                        let parent = Arc::make_mut(parent);
                        update_in_place(&mut parent.replies[pos], &comment, &mut diff);
                    }
                } else {
                    let parent = Arc::make_mut(parent);
                    let node = CommentNode::from_wire(comment, &mut diff);
                    parent.replies.push(Arc::new(node));
                }
            }
        }
        diff
    }

    /// Remove one comment (and its replies) from the tree, at either level.
    pub fn remove(&mut self, id: &CommentId) -> TreeDiff {
        let mut diff = TreeDiff::default();
        if let Some(pos) = self.comments.iter().position(|n| n.id == *id) {
            self.comments.remove(pos).collect_ids(&mut diff.deleted);
            return diff;
        }
        for parent in &mut self.comments {
            if let Some(pos) = parent.replies.iter().position(|r| r.id == *id) {
                let parent = Arc::make_mut(parent);
                parent.replies.remove(pos).collect_ids(&mut diff.deleted);
                return diff;
            }
        }
        tracing::warn!(comment = %id, "removal requested for a comment not in the tree");
        diff
    }
}

fn update_in_place(node: &mut Arc<CommentNode>, incoming: &Comment, diff: &mut TreeDiff) {
    if node.same_fields(incoming) {
        return;
    }
    Arc::make_mut(node).apply_fields(incoming);
    diff.updated.push(incoming.id.clone());
}

fn reconcile_level(
    current: Vec<Arc<CommentNode>>,
    incoming: Vec<Comment>,
    parent: Option<&CommentId>,
    diff: &mut TreeDiff,
) -> Vec<Arc<CommentNode>> {
    let mut existing: HashMap<CommentId, Arc<CommentNode>> = current
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();
    let mut next = Vec::with_capacity(incoming.len());
    for mut inc in incoming {
        if let Some(parent_id) = parent {
            if inc.parent_id.as_ref() != Some(parent_id) {
                tracing::warn!(comment = %inc.id, parent = %parent_id, "reply does not reference its parent, dropping");
                continue;
            }
        } else if inc.parent_id.is_some() {
            // Server order authority: keep it where the server put it.
            tracing::warn!(comment = %inc.id, "top-level comment carries a parent id");
        }
        match existing.remove(&inc.id) {
            Some(mut node) => {
                let fields_changed = !node.same_fields(&inc);
                let incoming_replies = std::mem::take(&mut inc.replies);
                let new_replies =
                    reconcile_level(node.replies.clone(), incoming_replies, Some(&inc.id), diff);
                let replies_changed = new_replies.len() != node.replies.len()
                    || new_replies
                        .iter()
                        .zip(node.replies.iter())
                        .any(|(a, b)| !Arc::ptr_eq(a, b));
                if fields_changed || replies_changed {
                    let node_mut = Arc::make_mut(&mut node);
                    if fields_changed {
                        node_mut.apply_fields(&inc);
                        diff.updated.push(inc.id.clone());
                    }
                    node_mut.replies = new_replies;
                }
                next.push(node);
            }
            None => next.push(Arc::new(CommentNode::from_wire(inc, diff))),
        }
    }
    for node in existing.into_values() {
        node.collect_ids(&mut diff.deleted);
    }
    next
}
