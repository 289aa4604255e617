//! Materialized store: the local, rebuildable projection of relay events.

mod aggregate;
mod sqlite;

pub use sqlite::SqliteStore;

use std::time::Duration;

use crate::{
    model::{
        ChannelCount, InvalidColumn, Metadata, Post, PostFilter, TreeOrder, User, Vote, VoteFilter,
    },
    tree,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    InvalidColumn(#[from] InvalidColumn),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result of a write against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The mutation and all of its aggregate effects were committed.
    Applied,
    /// A row with the same key already exists; nothing changed.
    Conflict,
    /// The voter already voted on this target with a different event; the
    /// earlier vote stands.
    AlreadyVoted,
    /// The vote's target is not materialized yet; it was parked and will be
    /// applied when the target arrives.
    Deferred,
    /// Accepted input with no effect: a deletion for someone else's post, a
    /// tombstoned post, or stale metadata.
    Skipped,
}

/// Operations over the materialized tables.
///
/// Implementations synchronize internally; every write method applies its
/// aggregate effects atomically.
pub trait Store: Send + Sync {
    /// Insert a post, snapshot author reputation, inherit the thread channel
    /// for comments, and bump every ancestor's `children` count.
    fn insert_post(&self, post: &Post) -> Result<WriteOutcome, StoreError>;

    /// Record a vote and apply its score, ranking and reputation effects.
    fn insert_vote(&self, vote: &Vote) -> Result<WriteOutcome, StoreError>;

    /// Remove `id` if it is authored by `author`.
    ///
    /// Ancestor `children` counts are left as they are and descendants are
    /// kept.
    fn delete_post(&self, id: &str, author: &str) -> Result<WriteOutcome, StoreError>;

    /// Replace the author's profile if `metadata` is newer than the stored one.
    fn upsert_metadata(&self, metadata: &Metadata) -> Result<WriteOutcome, StoreError>;

    fn fetch_posts(&self, filter: &PostFilter) -> Result<Vec<Post>, StoreError>;

    fn fetch_votes(&self, filter: &VoteFilter) -> Result<Vec<Vote>, StoreError>;

    fn get_post(&self, id: &str) -> Result<Option<Post>, StoreError>;

    /// Direct replies to `parent`, best first.
    fn children_of(&self, parent: &str, order: TreeOrder) -> Result<Vec<Post>, StoreError>;

    /// Top-level post of the thread containing `id`.
    fn root_of(&self, id: &str) -> Result<Option<Post>, StoreError>;

    fn get_user(&self, pubkey: &str) -> Result<Option<User>, StoreError>;

    fn get_metadata(&self, pubkey: &str) -> Result<Option<Metadata>, StoreError>;

    fn has_voted(&self, voter: &str, target: &str) -> Result<bool, StoreError>;

    /// Top-level post counts per channel, busiest first.
    fn channel_counts(&self) -> Result<Vec<ChannelCount>, StoreError>;

    /// Newest `created_at` previously seen from `relay`.
    fn cursor(&self, relay: &str) -> Result<Option<u64>, StoreError>;

    fn save_cursor(&self, relay: &str, since: u64) -> Result<(), StoreError>;

    /// Drop votes parked longer than `max_age` whose target never arrived.
    fn prune_pending_votes(&self, max_age: Duration) -> Result<usize, StoreError>;

    /// Root post followed by its descendants in display order.
    ///
    /// Empty when `root` does not exist.
    fn get_post_tree(&self, root: &str, order: TreeOrder) -> Result<Vec<Post>, StoreError> {
        tree::assemble(self, root, order)
    }
}
