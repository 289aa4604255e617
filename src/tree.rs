//! Comment tree assembly.

use crate::{
    model::{Post, TreeOrder},
    store::{Store, StoreError},
};

/// Flatten the thread under `root_id` in pre-order.
///
/// Siblings come best-first by `order`, and each reply is followed by its own
/// subtree before the next sibling. Traversal keeps an explicit stack of
/// sibling iterators so deep threads do not grow the call stack.
pub fn assemble<S: Store + ?Sized>(
    store: &S,
    root_id: &str,
    order: TreeOrder,
) -> Result<Vec<Post>, StoreError> {
    let Some(root) = store.get_post(root_id)? else {
        return Ok(Vec::new());
    };
    let mut out = vec![root];
    let mut stack = vec![store.children_of(root_id, order)?.into_iter()];
    while let Some(siblings) = stack.last_mut() {
        match siblings.next() {
            Some(post) => {
                let replies = store.children_of(&post.id, order)?;
                out.push(post);
                stack.push(replies.into_iter());
            }
            None => {
                stack.pop();
            }
        }
    }
    Ok(out)
}

/// Nesting depth of each post in an assembled tree, parallel to `posts`.
///
/// The root is depth 0. Posts whose parent is not earlier in the slice are
/// treated as depth 0.
pub fn depths(posts: &[Post]) -> Vec<usize> {
    let mut by_id = std::collections::HashMap::new();
    let mut out = Vec::with_capacity(posts.len());
    for post in posts {
        let depth = by_id.get(post.parent.as_str()).map_or(0, |d| d + 1);
        by_id.insert(post.id.as_str(), depth);
        out.push(depth);
    }
    out
}
