//! Derived-field maintenance applied inside store transactions.
//!
//! Every function here runs against an open transaction so that a post
//! insert and its reply-count propagation, or a vote and its score, ranking
//! and reputation updates, commit together.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, OptionalExtension, Transaction};

use crate::{
    model::{Direction, Vote},
    ranking::rank,
    store::WriteOutcome,
};

/// Reputation of `pubkey`, creating the user with zero reputation if unseen.
pub(super) fn ensure_user(tx: &Transaction<'_>, pubkey: &str) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO users(pubkey, reputation) VALUES(?1, 0) ON CONFLICT(pubkey) DO NOTHING",
        params![pubkey],
    )?;
    tx.query_row(
        "SELECT reputation FROM users WHERE pubkey = ?1",
        params![pubkey],
        |row| row.get(0),
    )
}

/// Channel of the thread root above `parent`, if the chain reaches one.
pub(super) fn thread_channel(tx: &Transaction<'_>, parent: &str) -> rusqlite::Result<String> {
    let mut current = parent.to_string();
    loop {
        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT parent, channel FROM posts WHERE id = ?1",
                params![current],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((grandparent, _)) if !grandparent.is_empty() => current = grandparent,
            Some((_, channel)) => return Ok(channel),
            None => return Ok(String::new()),
        }
    }
}

/// Add one to `children` on `parent` and every ancestor above it.
///
/// One statement per level; stops at the root or at the first ancestor that
/// is not materialized.
pub(super) fn propagate_children(tx: &Transaction<'_>, parent: &str) -> rusqlite::Result<usize> {
    let mut next = parent.to_string();
    let mut levels = 0;
    while !next.is_empty() {
        let grandparent: Option<String> = tx
            .query_row(
                "UPDATE posts SET children = children + 1 WHERE id = ?1 RETURNING parent",
                params![next],
                |row| row.get(0),
            )
            .optional()?;
        match grandparent {
            Some(gp) => {
                levels += 1;
                next = gp;
            }
            None => break,
        }
    }
    Ok(levels)
}

/// Whether `id` was removed by its own author.
///
/// Only confirmed tombstones count: a deletion that arrived before its post
/// names an author nobody has checked yet, so it proves nothing about `id`.
pub(super) fn is_deleted(tx: &Transaction<'_>, id: &str) -> rusqlite::Result<bool> {
    tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM tombstones WHERE id = ?1 AND confirmed = 1)",
        params![id],
        |row| row.get(0),
    )
}

/// Forget votes parked for `target`; it will never be materialized.
pub(super) fn discard_pending_votes(tx: &Transaction<'_>, target: &str) -> rusqlite::Result<usize> {
    tx.execute("DELETE FROM pending_votes WHERE target = ?1", params![target])
}

/// Record `vote` and apply its effects, or park it if the target is unknown.
/// Tell a replay of the stored vote apart from a second vote by the same voter.
fn vote_conflict(tx: &Transaction<'_>, table: &str, vote: &Vote) -> rusqlite::Result<WriteOutcome> {
    let (direction, created_at): (bool, i64) = tx.query_row(
        &format!("SELECT direction, created_at FROM {table} WHERE pubkey = ?1 AND target = ?2"),
        params![vote.voter, vote.target],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let replay = direction == (vote.direction == Direction::Up)
        && created_at == vote.created_at as i64;
    Ok(if replay {
        WriteOutcome::Conflict
    } else {
        WriteOutcome::AlreadyVoted
    })
}

pub(super) fn apply_vote(tx: &Transaction<'_>, vote: &Vote) -> rusqlite::Result<WriteOutcome> {
    let channel: Option<String> = tx
        .query_row(
            "SELECT channel FROM posts WHERE id = ?1",
            params![vote.target],
            |row| row.get(0),
        )
        .optional()?;
    let Some(channel) = channel else {
        if is_deleted(tx, &vote.target)? {
            return Ok(WriteOutcome::Skipped);
        }
        let parked = tx.execute(
            "INSERT INTO pending_votes(pubkey, target, direction, created_at, parked_at)
             VALUES(?1, ?2, ?3, ?4, ?5) ON CONFLICT(pubkey, target) DO NOTHING",
            params![
                vote.voter,
                vote.target,
                vote.direction == Direction::Up,
                vote.created_at as i64,
                unix_now() as i64
            ],
        )?;
        if parked == 0 {
            return vote_conflict(tx, "pending_votes", vote);
        }
        return Ok(WriteOutcome::Deferred);
    };

    let inserted = tx.execute(
        "INSERT INTO votes(pubkey, target, channel, direction, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5) ON CONFLICT(pubkey, target) DO NOTHING",
        params![
            vote.voter,
            vote.target,
            channel,
            vote.direction == Direction::Up,
            vote.created_at as i64
        ],
    )?;
    if inserted == 0 {
        return vote_conflict(tx, "votes", vote);
    }

    let delta = vote.direction.delta();
    let (score, created_at, author): (i64, i64, String) = tx.query_row(
        "UPDATE posts SET score = score + ?1 WHERE id = ?2 RETURNING score, created_at, pubkey",
        params![delta, vote.target],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    tx.execute(
        "UPDATE posts SET ranking = ?1 WHERE id = ?2",
        params![rank(score, created_at as u64), vote.target],
    )?;
    ensure_user(tx, &author)?;
    tx.execute(
        "UPDATE users SET reputation = reputation + ?1 WHERE pubkey = ?2",
        params![delta, author],
    )?;
    Ok(WriteOutcome::Applied)
}

/// Apply every vote parked for `target`, now that it exists.
pub(super) fn drain_pending_votes(tx: &Transaction<'_>, target: &str) -> rusqlite::Result<usize> {
    let parked: Vec<Vote> = {
        let mut stmt = tx.prepare(
            "SELECT pubkey, direction, created_at FROM pending_votes WHERE target = ?1
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![target], |row| {
            Ok(Vote {
                voter: row.get(0)?,
                target: target.to_string(),
                channel: String::new(),
                direction: Direction::from_up(row.get(1)?),
                created_at: row.get::<_, i64>(2)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    discard_pending_votes(tx, target)?;
    let mut applied = 0;
    for vote in &parked {
        if apply_vote(tx, vote)? == WriteOutcome::Applied {
            applied += 1;
        }
    }
    Ok(applied)
}

pub(super) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
