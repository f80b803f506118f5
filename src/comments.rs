//! Threaded market discussion with voting.
//!
//! One level of threading: top-level comments and replies. Votes are
//! idempotent per (user, comment); flipping direction removes the old
//! vote and applies the new one in a single transaction. Every mutation
//! emits a CommentUpdate through the fanout bus.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::fanout::{CommentEventKind, EngineEvent, Fanout};
use crate::ledger::{self, Tx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDirection {
    Up,
    Down,
    None,
}

impl VoteDirection {
    fn code(&self) -> i16 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
            VoteDirection::None => 0,
        }
    }

    fn from_code(code: i16) -> Self {
        match code {
            1 => VoteDirection::Up,
            -1 => VoteDirection::Down,
            _ => VoteDirection::None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommentRecord {
    pub id: Uuid,
    pub market_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub author_id: Uuid,
    pub content: String,
    pub upvotes: i32,
    pub downvotes: i32,
    pub reply_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn comment_from_row(row: &PgRow) -> CommentRecord {
    CommentRecord {
        id: row.get("id"),
        market_id: row.get("market_id"),
        parent_id: row.get("parent_id"),
        author_id: row.get("author_id"),
        content: row.get("content"),
        upvotes: row.get("upvotes"),
        downvotes: row.get("downvotes"),
        reply_count: row.get("reply_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn get_comment_with_lock(
    tx: &mut Tx<'_>,
    comment_id: Uuid,
) -> Result<CommentRecord, EngineError> {
    let row = sqlx::query("SELECT * FROM comments WHERE id = $1 FOR UPDATE")
        .bind(comment_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(EngineError::NotFound("comment"))?;
    Ok(comment_from_row(&row))
}

pub async fn create_comment(
    pool: &PgPool,
    fanout: &Fanout,
    market_id: Uuid,
    author_id: Uuid,
    content: String,
    parent_id: Option<Uuid>,
) -> Result<CommentRecord, EngineError> {
    if content.trim().is_empty() {
        return Err(EngineError::Validation("comment content is empty".into()));
    }

    let comment = ledger::with_engine_tx!(pool, tx, {
        let market_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM markets WHERE id = $1)")
                .bind(market_id)
                .fetch_one(tx.as_mut())
                .await?;
        if !market_exists {
            return Err(EngineError::NotFound("market"));
        }

        if let Some(parent_id) = parent_id {
            let parent = get_comment_with_lock(&mut tx, parent_id).await?;
            if parent.parent_id.is_some() {
                return Err(EngineError::Validation(
                    "replies to replies are not allowed".into(),
                ));
            }
            if parent.market_id != market_id {
                return Err(EngineError::Validation(
                    "parent comment belongs to another market".into(),
                ));
            }
            sqlx::query("UPDATE comments SET reply_count = reply_count + 1 WHERE id = $1")
                .bind(parent_id)
                .execute(tx.as_mut())
                .await?;
        }

        let row = sqlx::query(
            "INSERT INTO comments (id, market_id, parent_id, author_id, content)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(market_id)
        .bind(parent_id)
        .bind(author_id)
        .bind(&content)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(comment_from_row(&row))
    })?;

    fanout.publish(
        author_id,
        EngineEvent::CommentUpdate {
            market_id,
            comment_id: comment.id,
            event: CommentEventKind::Created,
            parent_id: comment.parent_id,
            upvotes: Some(0),
            downvotes: Some(0),
            comment: Some(comment.content.clone()),
        },
    );
    Ok(comment)
}

pub async fn update_comment(
    pool: &PgPool,
    fanout: &Fanout,
    comment_id: Uuid,
    author_id: Uuid,
    content: String,
) -> Result<CommentRecord, EngineError> {
    if content.trim().is_empty() {
        return Err(EngineError::Validation("comment content is empty".into()));
    }

    let comment = ledger::with_engine_tx!(pool, tx, {
        let existing = get_comment_with_lock(&mut tx, comment_id).await?;
        if existing.author_id != author_id {
            return Err(EngineError::Validation(
                "only the author may edit a comment".into(),
            ));
        }
        let row = sqlx::query(
            "UPDATE comments SET content = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(&content)
        .bind(comment_id)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(comment_from_row(&row))
    })?;

    fanout.publish(
        author_id,
        EngineEvent::CommentUpdate {
            market_id: comment.market_id,
            comment_id,
            event: CommentEventKind::Updated,
            parent_id: comment.parent_id,
            upvotes: None,
            downvotes: None,
            comment: Some(comment.content.clone()),
        },
    );
    Ok(comment)
}

/// Delete a comment. Replies of a top-level comment are removed with it;
/// deleting a reply decrements its parent's reply count.
pub async fn delete_comment(
    pool: &PgPool,
    fanout: &Fanout,
    comment_id: Uuid,
    author_id: Uuid,
) -> Result<(), EngineError> {
    let (market_id, parent_id) = ledger::with_engine_tx!(pool, tx, {
        let existing = get_comment_with_lock(&mut tx, comment_id).await?;
        if existing.author_id != author_id {
            return Err(EngineError::Validation(
                "only the author may delete a comment".into(),
            ));
        }

        if let Some(parent_id) = existing.parent_id {
            sqlx::query(
                "UPDATE comments SET reply_count = GREATEST(0, reply_count - 1) WHERE id = $1",
            )
            .bind(parent_id)
            .execute(tx.as_mut())
            .await?;
        }

        // Replies cascade via the self-referential foreign key.
        sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(comment_id)
            .execute(tx.as_mut())
            .await?;
        Ok((existing.market_id, existing.parent_id))
    })?;

    fanout.publish(
        author_id,
        EngineEvent::CommentUpdate {
            market_id,
            comment_id,
            event: CommentEventKind::Deleted,
            parent_id,
            upvotes: None,
            downvotes: None,
            comment: None,
        },
    );
    Ok(())
}

/// Idempotent per-(user, comment) voting. Re-sending the current
/// direction is a no-op; switching direction removes the old vote and
/// applies the new one atomically.
pub async fn vote_comment(
    pool: &PgPool,
    fanout: &Fanout,
    comment_id: Uuid,
    user_id: Uuid,
    direction: VoteDirection,
) -> Result<CommentRecord, EngineError> {
    let comment = ledger::with_engine_tx!(pool, tx, {
        let comment = get_comment_with_lock(&mut tx, comment_id).await?;

        let previous: Option<i16> = sqlx::query_scalar(
            "SELECT direction FROM comment_votes WHERE user_id = $1 AND comment_id = $2",
        )
        .bind(user_id)
        .bind(comment_id)
        .fetch_optional(tx.as_mut())
        .await?;
        let previous = previous.map(VoteDirection::from_code).unwrap_or(VoteDirection::None);

        if previous == direction {
            return Ok(comment);
        }

        let mut up_delta: i32 = 0;
        let mut down_delta: i32 = 0;
        match previous {
            VoteDirection::Up => up_delta -= 1,
            VoteDirection::Down => down_delta -= 1,
            VoteDirection::None => {}
        }
        match direction {
            VoteDirection::Up => up_delta += 1,
            VoteDirection::Down => down_delta += 1,
            VoteDirection::None => {}
        }

        if direction == VoteDirection::None {
            sqlx::query("DELETE FROM comment_votes WHERE user_id = $1 AND comment_id = $2")
                .bind(user_id)
                .bind(comment_id)
                .execute(tx.as_mut())
                .await?;
        } else {
            sqlx::query(
                "INSERT INTO comment_votes (user_id, comment_id, direction)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (user_id, comment_id) DO UPDATE SET direction = $3",
            )
            .bind(user_id)
            .bind(comment_id)
            .bind(direction.code())
            .execute(tx.as_mut())
            .await?;
        }

        let row = sqlx::query(
            "UPDATE comments SET
                upvotes = GREATEST(0, upvotes + $1),
                downvotes = GREATEST(0, downvotes + $2)
             WHERE id = $3
             RETURNING *",
        )
        .bind(up_delta)
        .bind(down_delta)
        .bind(comment_id)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(comment_from_row(&row))
    })?;

    fanout.publish(
        user_id,
        EngineEvent::CommentUpdate {
            market_id: comment.market_id,
            comment_id,
            event: CommentEventKind::Voted,
            parent_id: comment.parent_id,
            upvotes: Some(comment.upvotes),
            downvotes: Some(comment.downvotes),
            comment: None,
        },
    );
    Ok(comment)
}

/// Top-level comments for a market, newest first, each with its replies.
pub async fn list_comments(
    pool: &PgPool,
    market_id: Uuid,
    limit: i64,
) -> Result<Vec<(CommentRecord, Vec<CommentRecord>)>, EngineError> {
    let top_level = sqlx::query(
        "SELECT * FROM comments
         WHERE market_id = $1 AND parent_id IS NULL
         ORDER BY created_at DESC
         LIMIT $2",
    )
    .bind(market_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(EngineError::from)?;

    let mut threads = Vec::with_capacity(top_level.len());
    for row in &top_level {
        let parent = comment_from_row(row);
        let replies = sqlx::query(
            "SELECT * FROM comments WHERE parent_id = $1 ORDER BY created_at ASC",
        )
        .bind(parent.id)
        .fetch_all(pool)
        .await
        .map_err(EngineError::from)?;
        let replies = replies.iter().map(comment_from_row).collect();
        threads.push((parent, replies));
    }
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_codes_round_trip() {
        for direction in [VoteDirection::Up, VoteDirection::Down, VoteDirection::None] {
            assert_eq!(VoteDirection::from_code(direction.code()), direction);
        }
    }
}
