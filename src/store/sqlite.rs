//! SQLite-backed [`Store`].
//!
//! All writes go through one connection guarded by a mutex, each inside an
//! immediate transaction. Reads on a file database use a small pool of
//! read-only connections so listings do not queue behind ingestion.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use rusqlite::{
    params, params_from_iter, types::Value, Connection, OpenFlags, OptionalExtension, Row,
    Transaction, TransactionBehavior,
};

use super::{aggregate, Store, StoreError, WriteOutcome};
use crate::model::{
    ChannelCount, Direction, Metadata, Post, PostFilter, PostScope, TreeOrder, User, Vote,
    VoteFilter, VoteOrder, ALL_CHANNELS, LOW_REPUTATION_FLOOR,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_PATH: &str = ":memory:";

const POST_COLUMNS: &str =
    "id, score, children, pubkey, created_at, title, body, channel, parent, ranking";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS posts (
    id TEXT PRIMARY KEY,
    score INTEGER NOT NULL DEFAULT 0,
    children INTEGER NOT NULL DEFAULT 0,
    pubkey TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    channel TEXT NOT NULL DEFAULT '',
    parent TEXT NOT NULL DEFAULT '',
    ranking REAL NOT NULL,
    user_score INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS posts_parent ON posts(parent);
CREATE INDEX IF NOT EXISTS posts_channel ON posts(channel);
CREATE INDEX IF NOT EXISTS posts_pubkey ON posts(pubkey);
CREATE INDEX IF NOT EXISTS posts_ranking ON posts(ranking);
CREATE TABLE IF NOT EXISTS votes (
    pubkey TEXT NOT NULL,
    target TEXT NOT NULL,
    channel TEXT NOT NULL DEFAULT '',
    direction INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (pubkey, target)
);
CREATE INDEX IF NOT EXISTS votes_channel ON votes(channel);
CREATE TABLE IF NOT EXISTS pending_votes (
    pubkey TEXT NOT NULL,
    target TEXT NOT NULL,
    direction INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    parked_at INTEGER NOT NULL,
    PRIMARY KEY (pubkey, target)
);
CREATE INDEX IF NOT EXISTS pending_votes_target ON pending_votes(target);
CREATE INDEX IF NOT EXISTS pending_votes_parked ON pending_votes(parked_at);
CREATE TABLE IF NOT EXISTS users (
    pubkey TEXT PRIMARY KEY,
    reputation INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS metadata (
    pubkey TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    about TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tombstones (
    id TEXT NOT NULL,
    pubkey TEXT NOT NULL,
    -- 1 once the deletion matched the post's real author
    confirmed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, pubkey)
);
CREATE TABLE IF NOT EXISTS cursors (
    relay TEXT PRIMARY KEY,
    since INTEGER NOT NULL
);
"#;

pub struct SqliteStore {
    writer: Mutex<Connection>,
    /// `None` for in-memory stores, which read through the writer.
    path: Option<PathBuf>,
    readers: Mutex<Vec<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`. The literal
    /// `:memory:` opens a private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.as_os_str() == MEMORY_PATH {
            return Self::open_in_memory();
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened store");
        ensure_schema(&conn)?;
        Ok(Self {
            writer: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Open a private in-memory database.
    ///
    /// Meant for tests and one-shot tools: there is a single connection, so
    /// reads wait for any write in progress. Use a file path for concurrent
    /// readers.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            writer: Mutex::new(conn),
            path: None,
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Run `f` in an immediate transaction on the writer and commit.
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, StoreError> {
        let Some(path) = &self.path else {
            let conn = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
            return Ok(f(&*conn)?);
        };
        let pooled = self
            .readers
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn
            }
        };
        let out = f(&conn);
        if let Ok(mut readers) = self.readers.lock() {
            readers.push(conn);
        }
        Ok(out?)
    }
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        score: row.get(1)?,
        children: row.get::<_, i64>(2)? as u64,
        author: row.get(3)?,
        created_at: row.get::<_, i64>(4)? as u64,
        title: row.get(5)?,
        body: row.get(6)?,
        channel: row.get(7)?,
        parent: row.get(8)?,
        ranking: row.get(9)?,
    })
}

fn vote_from_row(row: &Row<'_>) -> rusqlite::Result<Vote> {
    Ok(Vote {
        voter: row.get(0)?,
        target: row.get(1)?,
        channel: row.get(2)?,
        direction: Direction::from_up(row.get(3)?),
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

fn is_every_channel(channel: &str) -> bool {
    channel.is_empty() || channel == ALL_CHANNELS
}

/// Escape LIKE wildcards so `text` matches literally with `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Append `LIMIT`/`OFFSET` for a page. Without an explicit limit the whole
/// remainder is returned.
fn push_paging(sql: &mut String, args: &mut Vec<Value>, limit: Option<u32>, page: u32, size: u32) {
    let offset = i64::from(page) * i64::from(size);
    match limit {
        Some(limit) => {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(i64::from(limit)));
        }
        None if offset > 0 => sql.push_str(" LIMIT -1"),
        None => return,
    }
    if offset > 0 {
        sql.push_str(" OFFSET ?");
        args.push(Value::Integer(offset));
    }
}

fn posts_query(filter: &PostFilter) -> (String, Vec<Value>) {
    let mut sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE 1 = 1");
    let mut args = Vec::new();
    if !is_every_channel(&filter.channel) {
        sql.push_str(" AND channel = ?");
        args.push(Value::Text(filter.channel.clone()));
    }
    if let Some(author) = &filter.author {
        sql.push_str(" AND pubkey = ?");
        args.push(Value::Text(author.clone()));
    }
    if let Some(word) = filter.contains.as_deref().filter(|w| !w.is_empty()) {
        // Whole-word match: the word alone, at the start, at the end, in the
        // middle, or starting a line of the body.
        let escaped = escape_like(word);
        let start = format!("{escaped} %");
        let end = format!("% {escaped}");
        let middle = format!("% {escaped} %");
        let line = format!("%\n{escaped} %");
        sql.push_str(
            " AND ((title != '' AND (title = ? OR title LIKE ? ESCAPE '\\' \
             OR title LIKE ? ESCAPE '\\' OR title LIKE ? ESCAPE '\\')) \
             OR body = ? OR body LIKE ? ESCAPE '\\' OR body LIKE ? ESCAPE '\\' \
             OR body LIKE ? ESCAPE '\\' OR body LIKE ? ESCAPE '\\')",
        );
        let title_patterns = [word.to_string(), start.clone(), end.clone(), middle.clone()];
        let body_patterns = [word.to_string(), start, end, middle, line];
        args.extend(title_patterns.into_iter().chain(body_patterns).map(Value::Text));
    }
    match filter.scope {
        PostScope::All => {}
        PostScope::Posts => sql.push_str(" AND parent = ''"),
        PostScope::Comments => sql.push_str(" AND parent != ''"),
    }
    if filter.hide_low_reputation {
        sql.push_str(" AND user_score > ?");
        args.push(Value::Integer(LOW_REPUTATION_FLOOR));
    }
    if let Some(order) = filter.order {
        sql.push_str(&format!(" ORDER BY {} DESC", order.column()));
    }
    push_paging(&mut sql, &mut args, filter.limit, filter.page, filter.page_size);
    (sql, args)
}

fn votes_query(filter: &VoteFilter) -> (String, Vec<Value>) {
    let mut sql =
        String::from("SELECT pubkey, target, channel, direction, created_at FROM votes WHERE 1 = 1");
    let mut args = Vec::new();
    if let Some(voter) = &filter.voter {
        sql.push_str(" AND pubkey = ?");
        args.push(Value::Text(voter.clone()));
    }
    if !is_every_channel(&filter.channel) {
        sql.push_str(" AND channel = ?");
        args.push(Value::Text(filter.channel.clone()));
    }
    if let Some(VoteOrder::CreatedAt) = filter.order {
        sql.push_str(" ORDER BY created_at DESC");
    }
    push_paging(&mut sql, &mut args, filter.limit, filter.page, filter.page_size);
    (sql, args)
}

fn get_post(conn: &Connection, id: &str) -> rusqlite::Result<Option<Post>> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
        params![id],
        post_from_row,
    )
    .optional()
}

impl Store for SqliteStore {
    fn insert_post(&self, post: &Post) -> Result<WriteOutcome, StoreError> {
        self.write(|tx| {
            let tombstoned: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM tombstones WHERE id = ?1 AND pubkey = ?2)",
                params![post.id, post.author],
                |row| row.get(0),
            )?;
            if tombstoned {
                tx.execute(
                    "UPDATE tombstones SET confirmed = 1 WHERE id = ?1 AND pubkey = ?2",
                    params![post.id, post.author],
                )?;
                aggregate::discard_pending_votes(tx, &post.id)?;
                return Ok(WriteOutcome::Skipped);
            }
            let channel = if post.is_comment() {
                aggregate::thread_channel(tx, &post.parent)?
            } else {
                post.channel.clone()
            };
            let reputation = aggregate::ensure_user(tx, &post.author)?;
            let inserted = tx.execute(
                "INSERT INTO posts(id, score, children, pubkey, created_at, title, body, channel,
                                   parent, ranking, user_score)
                 VALUES(?1, 0, 0, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    post.id,
                    post.author,
                    post.created_at as i64,
                    post.title,
                    post.body,
                    channel,
                    post.parent,
                    crate::ranking::rank(0, post.created_at),
                    reputation,
                ],
            )?;
            if inserted == 0 {
                return Ok(WriteOutcome::Conflict);
            }
            if post.is_comment() {
                aggregate::propagate_children(tx, &post.parent)?;
            }
            let drained = aggregate::drain_pending_votes(tx, &post.id)?;
            if drained > 0 {
                tracing::debug!(id = %post.id, votes = drained, "applied parked votes");
            }
            Ok(WriteOutcome::Applied)
        })
    }

    fn insert_vote(&self, vote: &Vote) -> Result<WriteOutcome, StoreError> {
        self.write(|tx| aggregate::apply_vote(tx, vote))
    }

    fn delete_post(&self, id: &str, author: &str) -> Result<WriteOutcome, StoreError> {
        self.write(|tx| {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT pubkey FROM posts WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                Some(owner) if owner != author => Ok(WriteOutcome::Skipped),
                Some(_) => {
                    tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
                    record_tombstone(tx, id, author, true)?;
                    Ok(WriteOutcome::Applied)
                }
                // Deletion ahead of its post: suppress the post when it shows up.
                None => {
                    record_tombstone(tx, id, author, false)?;
                    Ok(WriteOutcome::Deferred)
                }
            }
        })
    }

    fn upsert_metadata(&self, metadata: &Metadata) -> Result<WriteOutcome, StoreError> {
        self.write(|tx| {
            let changed = tx.execute(
                "INSERT INTO metadata(pubkey, name, about, created_at) VALUES(?1, ?2, ?3, ?4)
                 ON CONFLICT(pubkey) DO UPDATE SET
                     name = excluded.name,
                     about = excluded.about,
                     created_at = excluded.created_at
                 WHERE excluded.created_at > metadata.created_at",
                params![
                    metadata.pubkey,
                    metadata.name,
                    metadata.about,
                    metadata.created_at as i64
                ],
            )?;
            if changed == 0 {
                return Ok(WriteOutcome::Skipped);
            }
            aggregate::ensure_user(tx, &metadata.pubkey)?;
            Ok(WriteOutcome::Applied)
        })
    }

    fn fetch_posts(&self, filter: &PostFilter) -> Result<Vec<Post>, StoreError> {
        let (sql, args) = posts_query(filter);
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), post_from_row)?;
            rows.collect()
        })
    }

    fn fetch_votes(&self, filter: &VoteFilter) -> Result<Vec<Vote>, StoreError> {
        let (sql, args) = votes_query(filter);
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), vote_from_row)?;
            rows.collect()
        })
    }

    fn get_post(&self, id: &str) -> Result<Option<Post>, StoreError> {
        self.read(|conn| get_post(conn, id))
    }

    fn children_of(&self, parent: &str, order: TreeOrder) -> Result<Vec<Post>, StoreError> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE parent = ?1 ORDER BY {} DESC, created_at DESC",
            order.column()
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![parent], post_from_row)?;
            rows.collect()
        })
    }

    fn root_of(&self, id: &str) -> Result<Option<Post>, StoreError> {
        self.read(|conn| {
            let mut current = get_post(conn, id)?;
            while let Some(post) = current.as_ref().filter(|p| p.is_comment()) {
                match get_post(conn, &post.parent)? {
                    Some(parent) => current = Some(parent),
                    None => return Ok(None),
                }
            }
            Ok(current)
        })
    }

    fn get_user(&self, pubkey: &str) -> Result<Option<User>, StoreError> {
        self.read(|conn| {
            conn.query_row(
                "SELECT pubkey, reputation FROM users WHERE pubkey = ?1",
                params![pubkey],
                |row| {
                    Ok(User {
                        pubkey: row.get(0)?,
                        reputation: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    fn get_metadata(&self, pubkey: &str) -> Result<Option<Metadata>, StoreError> {
        self.read(|conn| {
            conn.query_row(
                "SELECT pubkey, name, about, created_at FROM metadata WHERE pubkey = ?1",
                params![pubkey],
                |row| {
                    Ok(Metadata {
                        pubkey: row.get(0)?,
                        name: row.get(1)?,
                        about: row.get(2)?,
                        created_at: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()
        })
    }

    fn has_voted(&self, voter: &str, target: &str) -> Result<bool, StoreError> {
        self.read(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM votes WHERE pubkey = ?1 AND target = ?2)
                     OR EXISTS(SELECT 1 FROM pending_votes WHERE pubkey = ?1 AND target = ?2)",
                params![voter, target],
                |row| row.get(0),
            )
        })
    }

    fn channel_counts(&self) -> Result<Vec<ChannelCount>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel, COUNT(*) AS n FROM posts
                 WHERE parent = '' AND channel != ''
                 GROUP BY channel ORDER BY n DESC, channel",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ChannelCount {
                    channel: row.get(0)?,
                    posts: row.get::<_, i64>(1)? as u64,
                })
            })?;
            rows.collect()
        })
    }

    fn cursor(&self, relay: &str) -> Result<Option<u64>, StoreError> {
        self.read(|conn| {
            conn.query_row(
                "SELECT since FROM cursors WHERE relay = ?1",
                params![relay],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|since| since.map(|s| s as u64))
        })
    }

    fn prune_pending_votes(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = aggregate::unix_now().saturating_sub(max_age.as_secs());
        self.write(|tx| {
            tx.execute(
                "DELETE FROM pending_votes WHERE parked_at < ?1",
                params![cutoff as i64],
            )
        })
    }

    fn save_cursor(&self, relay: &str, since: u64) -> Result<(), StoreError> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO cursors(relay, since) VALUES(?1, ?2)
                 ON CONFLICT(relay) DO UPDATE SET since = MAX(since, excluded.since)",
                params![relay, since as i64],
            )?;
            Ok(())
        })
    }
}

fn record_tombstone(
    tx: &Transaction<'_>,
    id: &str,
    author: &str,
    confirmed: bool,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO tombstones(id, pubkey, confirmed) VALUES(?1, ?2, ?3)
         ON CONFLICT(id, pubkey) DO UPDATE SET confirmed = MAX(confirmed, excluded.confirmed)",
        params![id, author, confirmed],
    )?;
    Ok(())
}
