use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;

use shared::domain::{ChannelId, MessageId, UserId};

use crate::{millis, Storage};

impl Storage {
    /// Zeroes the member's unread and mention counters, opens the channel and
    /// returns the messages withdrawn since the previous read, oldest first.
    /// `None` when the user has no active membership.
    pub async fn mark_read(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<MessageId>>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            "UPDATE memberships SET
                unread_msg_count = 0,
                mention_count = 0,
                last_viewed_at = MAX(last_viewed_at, ?),
                opened = 1,
                updated_at = ?
             WHERE channel_id = ? AND user_id = ? AND deleted = 0
             RETURNING withdraw_cursor, seq_start",
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(channel_id.0)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let cursor = row.get::<i64, _>(0);
        let seq_start = row.get::<i64, _>(1);

        let withdrawn = sqlx::query(
            "SELECT id, message_id, seq FROM withdrawals
             WHERE channel_id = ? AND id > ?
             ORDER BY id ASC",
        )
        .bind(channel_id.0)
        .bind(cursor)
        .fetch_all(&mut *tx)
        .await?;

        let next_cursor = withdrawn
            .last()
            .map(|r| r.get::<i64, _>(0))
            .unwrap_or(cursor);
        let visible: Vec<MessageId> = withdrawn
            .iter()
            .filter(|r| r.get::<i64, _>(2) > seq_start)
            .map(|r| MessageId(r.get::<i64, _>(1)))
            .collect();

        sqlx::query(
            "UPDATE memberships SET withdraw_cursor = ? WHERE channel_id = ? AND user_id = ?",
        )
        .bind(next_cursor)
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?;

        // Nothing left to roll back on these once they are read.
        sqlx::query(
            "UPDATE message_receipts SET unread = 0, mention = 0
             WHERE channel_id = ? AND user_id = ? AND reverted = 0 AND (unread = 1 OR mention = 1)",
        )
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(visible))
    }

    /// Clears the open flag. Returns false if it was not set.
    pub async fn mark_closed(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE memberships SET opened = 0, updated_at = ?
             WHERE channel_id = ? AND user_id = ? AND opened = 1",
        )
        .bind(millis(now))
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn opened_channels(&self, user_id: UserId) -> Result<Vec<ChannelId>> {
        let rows = sqlx::query(
            "SELECT channel_id FROM memberships WHERE user_id = ? AND opened = 1 AND deleted = 0",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| ChannelId(r.get::<i64, _>(0))).collect())
    }
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
