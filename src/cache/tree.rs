//! Persistent reply-tree operations.
//!
//! Comments form a tree of unbounded depth. Every operation here is a pure,
//! single depth-first traversal that returns a new tree: the matched node and
//! its ancestors are rebuilt, every other node is shared by `Arc` with the
//! input. A missing target id is a normal outcome (the node may already have
//! been removed by a concurrent event), never an error.

use std::sync::Arc;

use super::{Item, ItemId, REPLIES_COUNT_FIELD};

/// Outcome of a tree operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOutcome {
    /// A node matched and the tree was rebuilt
    Applied,
    /// No node carried the target id; the tree is unchanged
    NotFound,
}

/// Find the first node with `id` in depth-first order
pub fn find<'a>(tree: &'a [Arc<Item>], id: &ItemId) -> Option<&'a Arc<Item>> {
    for node in tree {
        if &node.id == id {
            return Some(node);
        }
        if let Some(found) = find(&node.replies, id) {
            return Some(found);
        }
    }
    None
}

/// Replace the first node matching `id` with `patch(node)`.
///
/// Returns `None` when the id is absent. The patched node keeps the original
/// identity even if `patch` tries to change it.
pub fn try_replace<F>(tree: &[Arc<Item>], id: &ItemId, patch: F) -> Option<Vec<Arc<Item>>>
where
    F: FnOnce(&Item) -> Item,
{
    let mut patch = Some(patch);
    replace_in(tree, id, &mut patch)
}

fn replace_in<F>(nodes: &[Arc<Item>], id: &ItemId, patch: &mut Option<F>) -> Option<Vec<Arc<Item>>>
where
    F: FnOnce(&Item) -> Item,
{
    for (idx, node) in nodes.iter().enumerate() {
        let rebuilt = if &node.id == id {
            let f = patch.take()?;
            let mut patched = f(node);
            patched.id = node.id.clone();
            Some(patched)
        } else {
            replace_in(&node.replies, id, patch).map(|replies| node.with_replies(replies))
        };

        if let Some(rebuilt) = rebuilt {
            let mut out = nodes.to_vec();
            out[idx] = Arc::new(rebuilt);
            return Some(out);
        }
    }
    None
}

/// Locate-and-replace; an absent id yields the input tree unchanged
pub fn locate_and_replace<F>(tree: &[Arc<Item>], id: &ItemId, patch: F) -> (Vec<Arc<Item>>, TreeOutcome)
where
    F: FnOnce(&Item) -> Item,
{
    match try_replace(tree, id, patch) {
        Some(next) => (next, TreeOutcome::Applied),
        None => (tree.to_vec(), TreeOutcome::NotFound),
    }
}

/// Prepend `child` to the replies of `parent_id` and bump its reply counter
pub fn try_insert_child(tree: &[Arc<Item>], parent_id: &ItemId, child: Arc<Item>) -> Option<Vec<Arc<Item>>> {
    try_replace(tree, parent_id, move |parent| {
        let mut replies = Vec::with_capacity(parent.replies.len() + 1);
        replies.push(child);
        replies.extend(parent.replies.iter().cloned());

        let mut next = parent.with_replies(replies);
        next.set_field(REPLIES_COUNT_FIELD, parent.counter(REPLIES_COUNT_FIELD) + 1);
        next
    })
}

/// Locate-and-insert-child; an absent parent yields the input tree unchanged
pub fn locate_and_insert_child(
    tree: &[Arc<Item>],
    parent_id: &ItemId,
    child: Arc<Item>,
) -> (Vec<Arc<Item>>, TreeOutcome) {
    match try_insert_child(tree, parent_id, child) {
        Some(next) => (next, TreeOutcome::Applied),
        None => (tree.to_vec(), TreeOutcome::NotFound),
    }
}

/// Remove the first node matching `id` together with its descendants.
///
/// The direct parent's reply counter becomes the length of its remaining
/// replies.
pub fn try_remove(tree: &[Arc<Item>], id: &ItemId) -> Option<Vec<Arc<Item>>> {
    for (idx, node) in tree.iter().enumerate() {
        if &node.id == id {
            let mut out = tree.to_vec();
            out.remove(idx);
            return Some(out);
        }

        if let Some(replies) = remove_reply(node, id) {
            let mut out = tree.to_vec();
            out[idx] = Arc::new(replies);
            return Some(out);
        }
    }
    None
}

fn remove_reply(node: &Item, id: &ItemId) -> Option<Item> {
    for (idx, child) in node.replies.iter().enumerate() {
        if &child.id == id {
            let mut replies = node.replies.clone();
            replies.remove(idx);
            let len = replies.len() as i64;
            let mut parent = node.with_replies(replies);
            parent.set_field(REPLIES_COUNT_FIELD, len);
            return Some(parent);
        }

        if let Some(rebuilt) = remove_reply(child, id) {
            let mut replies = node.replies.clone();
            replies[idx] = Arc::new(rebuilt);
            return Some(node.with_replies(replies));
        }
    }
    None
}

/// Locate-and-remove; an absent id yields the input tree unchanged
pub fn locate_and_remove(tree: &[Arc<Item>], id: &ItemId) -> (Vec<Arc<Item>>, TreeOutcome) {
    match try_remove(tree, id) {
        Some(next) => (next, TreeOutcome::Applied),
        None => (tree.to_vec(), TreeOutcome::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str, replies: Vec<Item>) -> Item {
        let mut item = Item::new(id).with_field(REPLIES_COUNT_FIELD, replies.len() as i64);
        item.replies = replies.into_iter().map(Arc::new).collect();
        item
    }

    fn sample_tree() -> Vec<Arc<Item>> {
        vec![
            Arc::new(comment(
                "1",
                vec![
                    comment("2", vec![comment("4", vec![])]),
                    comment("3", vec![]),
                ],
            )),
            Arc::new(comment("5", vec![])),
        ]
    }

    #[test]
    fn test_find_nested() {
        let tree = sample_tree();
        assert!(find(&tree, &ItemId::from("4")).is_some());
        assert!(find(&tree, &ItemId::from("9")).is_none());
    }

    #[test]
    fn test_replace_nested_shares_untouched_nodes() {
        let tree = sample_tree();
        let (next, outcome) = locate_and_replace(&tree, &ItemId::from("4"), |node| {
            node.clone().with_field("text", "edited")
        });

        assert_eq!(outcome, TreeOutcome::Applied);
        let edited = find(&next, &ItemId::from("4")).unwrap();
        assert_eq!(edited.field("text").and_then(|v| v.as_str()), Some("edited"));

        // Sibling subtrees off the path are shared, not copied
        assert!(Arc::ptr_eq(&tree[1], &next[1]));
        assert!(Arc::ptr_eq(&tree[0].replies[1], &next[0].replies[1]));
        // Path nodes are rebuilt
        assert!(!Arc::ptr_eq(&tree[0], &next[0]));
    }

    #[test]
    fn test_replace_then_reverse_is_identity() {
        let tree = sample_tree();
        let id = ItemId::from("2");
        let original = find(&tree, &id).unwrap().as_ref().clone();

        let (patched, _) = locate_and_replace(&tree, &id, |node| node.clone().with_field("likes", 10));
        assert_ne!(patched, tree);

        let (restored, _) = locate_and_replace(&patched, &id, |_| original);
        assert_eq!(restored, tree);
    }

    #[test]
    fn test_replace_cannot_change_identity() {
        let tree = sample_tree();
        let (next, _) = locate_and_replace(&tree, &ItemId::from("5"), |_| Item::new("other"));
        assert_eq!(next[1].id, ItemId::from("5"));
    }

    #[test]
    fn test_replace_missing_id_is_noop() {
        let tree = sample_tree();
        let (next, outcome) = locate_and_replace(&tree, &ItemId::from("404"), |node| node.clone());

        assert_eq!(outcome, TreeOutcome::NotFound);
        assert_eq!(next, tree);
        assert!(tree.iter().zip(next.iter()).all(|(a, b)| Arc::ptr_eq(a, b)));
    }

    #[test]
    fn test_insert_child_increments_counter() {
        let tree = sample_tree();
        let (next, outcome) =
            locate_and_insert_child(&tree, &ItemId::from("2"), Arc::new(Item::new("6")));

        assert_eq!(outcome, TreeOutcome::Applied);
        let parent = find(&next, &ItemId::from("2")).unwrap();
        assert_eq!(parent.replies[0].id, ItemId::from("6"));
        assert_eq!(parent.replies.len(), 2);
        assert_eq!(parent.counter(REPLIES_COUNT_FIELD), 2);
    }

    #[test]
    fn test_insert_child_missing_parent() {
        let tree = sample_tree();
        let (next, outcome) =
            locate_and_insert_child(&tree, &ItemId::from("404"), Arc::new(Item::new("6")));
        assert_eq!(outcome, TreeOutcome::NotFound);
        assert_eq!(next, tree);
    }

    #[test]
    fn test_remove_nested_reply() {
        let tree = vec![Arc::new(comment("1", vec![comment("2", vec![])]))];
        let (next, outcome) = locate_and_remove(&tree, &ItemId::from("2"));

        assert_eq!(outcome, TreeOutcome::Applied);
        assert_eq!(next, vec![Arc::new(comment("1", vec![]))]);
    }

    #[test]
    fn test_remove_cascades_descendants() {
        let tree = sample_tree();
        let (next, _) = locate_and_remove(&tree, &ItemId::from("2"));

        assert!(find(&next, &ItemId::from("2")).is_none());
        assert!(find(&next, &ItemId::from("4")).is_none());
        let parent = find(&next, &ItemId::from("1")).unwrap();
        assert_eq!(parent.replies.len(), 1);
        assert_eq!(parent.counter(REPLIES_COUNT_FIELD), 1);
    }

    #[test]
    fn test_remove_recounts_from_remaining_replies() {
        // Server counter is stale (says 7) but only two replies are loaded
        let mut parent = comment("1", vec![comment("2", vec![]), comment("3", vec![])]);
        parent.set_field(REPLIES_COUNT_FIELD, 7);
        let tree = vec![Arc::new(parent)];

        let (next, _) = locate_and_remove(&tree, &ItemId::from("3"));
        assert_eq!(next[0].counter(REPLIES_COUNT_FIELD), 1);
    }

    #[test]
    fn test_remove_top_level() {
        let tree = sample_tree();
        let (next, outcome) = locate_and_remove(&tree, &ItemId::from("5"));

        assert_eq!(outcome, TreeOutcome::Applied);
        assert_eq!(next.len(), 1);
        assert!(Arc::ptr_eq(&tree[0], &next[0]));
    }

    #[test]
    fn test_remove_missing_id() {
        let tree = sample_tree();
        let (next, outcome) = locate_and_remove(&tree, &ItemId::from("404"));
        assert_eq!(outcome, TreeOutcome::NotFound);
        assert_eq!(next, tree);
    }
}
