use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use shared::domain::{
    ChannelId, DeliveryStatus, MessageId, MessageKind, ModerationStatus, UserId, WithdrawReason,
};

use crate::{
    delivery_status_str, from_millis, message_kind_str, millis, moderation_status_str,
    parse_delivery_status, parse_message_kind, parse_moderation_status, parse_withdraw_reason,
    withdraw_reason_str, MessageRecord, Storage,
};

const MESSAGE_COLUMNS: &str = "id, cid, channel_id, user_id, kind, content, file, duration, mentions, \
     moderation_status, status, withdraw_reason, seq, created_at, updated_at, withdrawn_at";

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub cid: String,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file: Option<String>,
    pub duration: Option<i64>,
    pub mentions: Vec<UserId>,
    pub moderation_status: ModerationStatus,
    pub status: DeliveryStatus,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

/// Counter increment for one recipient of a message. `msg_count` always moves;
/// a recipient without `unread` had the channel open and is read through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub user_id: UserId,
    pub unread: bool,
    pub mention: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub text: String,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RemovalOutcome {
    pub channel_id: Option<ChannelId>,
    /// Members whose counters were rolled back.
    pub reverted: Vec<UserId>,
    /// `(member, counter)` pairs where the rollback hit zero and was clamped.
    /// A non-empty list means counters had already drifted.
    pub clamped: Vec<(UserId, &'static str)>,
    pub total_clamped: bool,
    pub total_msg_count: i64,
}

impl Storage {
    pub async fn find_message_by_cid(&self, cid: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE cid = ?"))
            .bind(cid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn get_message(&self, message_id: MessageId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Messages with `seq` in `[seq_start, seq_end]`, ascending.
    pub async fn list_range(
        &self,
        channel_id: ChannelId,
        seq_start: i64,
        seq_end: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ? AND seq >= ? AND seq <= ?
             ORDER BY seq ASC"
        ))
        .bind(channel_id.0)
        .bind(seq_start)
        .bind(seq_end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Newest message still visible to members, skipping `exclude`.
    pub async fn latest_visible_message(
        &self,
        channel_id: ChannelId,
        exclude: MessageId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ? AND id <> ? AND status IN ('pending', 'normal')
             ORDER BY seq DESC
             LIMIT 1"
        ))
        .bind(channel_id.0)
        .bind(exclude.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn list_by_moderation_status(
        &self,
        status: ModerationStatus,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE moderation_status = ?
             ORDER BY id DESC
             LIMIT ?"
        ))
        .bind(moderation_status_str(status))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Persists a message together with its counter effects and the channel
    /// aggregate. Either all of it lands or none of it does; the seq slot was
    /// claimed beforehand and stays burnt on failure.
    pub async fn record_message(
        &self,
        message: &NewMessage,
        deltas: &[CounterDelta],
        last_msg: &LastMessage,
    ) -> Result<MessageId> {
        let created_at = millis(message.created_at);
        let counted = i64::from(message.kind.is_counted());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE channels SET
                total_msg_count = total_msg_count + ?,
                last_msg = ?,
                last_msg_at = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(counted)
        .bind(&last_msg.text)
        .bind(last_msg.at.map(millis))
        .bind(created_at)
        .bind(message.channel_id.0)
        .execute(&mut *tx)
        .await?;

        let rec = sqlx::query(
            "INSERT INTO messages
                (cid, channel_id, user_id, kind, content, file, duration, mentions,
                 moderation_status, status, seq, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&message.cid)
        .bind(message.channel_id.0)
        .bind(message.sender_id.0)
        .bind(message_kind_str(message.kind))
        .bind(message.content.as_deref())
        .bind(message.file.as_deref())
        .bind(message.duration)
        .bind(serde_json::to_string(
            &message.mentions.iter().map(|id| id.0).collect::<Vec<_>>(),
        )?)
        .bind(moderation_status_str(message.moderation_status))
        .bind(delivery_status_str(message.status))
        .bind(message.seq)
        .bind(created_at)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        for delta in deltas {
            sqlx::query(
                "INSERT INTO message_receipts (message_id, channel_id, user_id, msg_count, unread, mention)
                 VALUES (?, ?, ?, 1, ?, ?)",
            )
            .bind(message_id.0)
            .bind(message.channel_id.0)
            .bind(delta.user_id.0)
            .bind(i64::from(delta.unread))
            .bind(i64::from(delta.mention))
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE memberships SET
                    msg_count = msg_count + 1,
                    unread_msg_count = unread_msg_count + ?,
                    mention_count = mention_count + ?,
                    last_viewed_at = CASE WHEN ? THEN last_viewed_at ELSE MAX(last_viewed_at, ?) END,
                    updated_at = ?
                 WHERE channel_id = ? AND user_id = ? AND deleted = 0",
            )
            .bind(i64::from(delta.unread))
            .bind(i64::from(delta.mention))
            .bind(delta.unread)
            .bind(created_at)
            .bind(created_at)
            .bind(message.channel_id.0)
            .bind(delta.user_id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(message_id)
    }

    /// Moves a live message into `target` (withdrawn or deleted) and reverses
    /// every counter increment it caused that has not been reversed yet.
    /// Returns `None` when the message was already terminal, leaving all
    /// state untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn remove_message(
        &self,
        message_id: MessageId,
        target: DeliveryStatus,
        reason: Option<WithdrawReason>,
        moderation: Option<ModerationStatus>,
        last_msg: Option<&LastMessage>,
        now: DateTime<Utc>,
    ) -> Result<Option<RemovalOutcome>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            "UPDATE messages SET
                status = ?,
                withdraw_reason = COALESCE(?, withdraw_reason),
                moderation_status = COALESCE(?, moderation_status),
                withdrawn_at = ?,
                updated_at = ?
             WHERE id = ? AND status IN ('pending', 'normal')
             RETURNING channel_id, seq, kind",
        )
        .bind(delivery_status_str(target))
        .bind(reason.map(withdraw_reason_str))
        .bind(moderation.map(moderation_status_str))
        .bind(millis(now))
        .bind(millis(now))
        .bind(message_id.0)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let channel_id = ChannelId(row.get::<i64, _>(0));
        let seq = row.get::<i64, _>(1);
        let kind = parse_message_kind(&row.get::<String, _>(2));

        let mut outcome = RemovalOutcome {
            channel_id: Some(channel_id),
            ..RemovalOutcome::default()
        };

        let receipts = sqlx::query(
            "SELECT r.user_id, r.msg_count, r.unread, r.mention,
                    m.msg_count, m.unread_msg_count, m.mention_count
             FROM message_receipts r
             INNER JOIN memberships m ON m.channel_id = r.channel_id AND m.user_id = r.user_id
             WHERE r.message_id = ? AND r.reverted = 0",
        )
        .bind(message_id.0)
        .fetch_all(&mut *tx)
        .await?;

        for receipt in receipts {
            let user_id = UserId(receipt.get::<i64, _>(0));
            let (msg, unread, mention) = (
                receipt.get::<i64, _>(1),
                receipt.get::<i64, _>(2),
                receipt.get::<i64, _>(3),
            );
            for (name, delta, current) in [
                ("msg_count", msg, receipt.get::<i64, _>(4)),
                ("unread_msg_count", unread, receipt.get::<i64, _>(5)),
                ("mention_count", mention, receipt.get::<i64, _>(6)),
            ] {
                if delta > current {
                    outcome.clamped.push((user_id, name));
                }
            }

            sqlx::query(
                "UPDATE memberships SET
                    msg_count = MAX(msg_count - ?, 0),
                    unread_msg_count = MAX(unread_msg_count - ?, 0),
                    mention_count = MAX(mention_count - ?, 0),
                    updated_at = ?
                 WHERE channel_id = ? AND user_id = ?",
            )
            .bind(msg)
            .bind(unread)
            .bind(mention)
            .bind(millis(now))
            .bind(channel_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
            outcome.reverted.push(user_id);
        }

        sqlx::query("UPDATE message_receipts SET reverted = 1 WHERE message_id = ? AND reverted = 0")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;

        let counted = i64::from(kind.is_counted());
        let total_before: i64 =
            sqlx::query_scalar("SELECT total_msg_count FROM channels WHERE id = ?")
                .bind(channel_id.0)
                .fetch_one(&mut *tx)
                .await?;
        outcome.total_clamped = counted > total_before;
        outcome.total_msg_count = (total_before - counted).max(0);

        sqlx::query(
            "UPDATE channels SET
                total_msg_count = MAX(total_msg_count - ?, 0),
                last_msg = CASE WHEN ? THEN ? ELSE last_msg END,
                last_msg_at = CASE WHEN ? THEN ? ELSE last_msg_at END,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(counted)
        .bind(last_msg.is_some())
        .bind(last_msg.map(|m| m.text.as_str()))
        .bind(last_msg.is_some())
        .bind(last_msg.and_then(|m| m.at).map(millis))
        .bind(millis(now))
        .bind(channel_id.0)
        .execute(&mut *tx)
        .await?;

        if target == DeliveryStatus::Withdrawn {
            sqlx::query(
                "INSERT INTO withdrawals (channel_id, message_id, seq, reason, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(channel_id.0)
            .bind(message_id.0)
            .bind(seq)
            .bind(withdraw_reason_str(reason.unwrap_or(WithdrawReason::Admin)))
            .bind(millis(now))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(outcome))
    }

    /// Records a moderation status. A prohibited message is never re-labelled.
    /// A `normal` verdict also releases a pending message for delivery.
    pub async fn set_moderation_status(
        &self,
        message_id: MessageId,
        status: ModerationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET
                moderation_status = ?,
                status = CASE WHEN status = 'pending' AND ? = 'normal' THEN 'normal' ELSE status END,
                updated_at = ?
             WHERE id = ? AND moderation_status <> 'prohibited'",
        )
        .bind(moderation_status_str(status))
        .bind(moderation_status_str(status))
        .bind(millis(now))
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

/// True when `error` is the per-channel seq uniqueness violation.
pub fn is_seq_collision(error: &anyhow::Error) -> bool {
    unique_violation_on(error, "messages.seq")
}

/// True when `error` is the client token uniqueness violation.
pub fn is_cid_collision(error: &anyhow::Error) -> bool {
    unique_violation_on(error, "messages.cid")
}

fn unique_violation_on(error: &anyhow::Error, column: &str) -> bool {
    error
        .downcast_ref::<sqlx::Error>()
        .and_then(|err| err.as_database_error())
        .is_some_and(|db| db.is_unique_violation() && db.message().contains(column))
}

fn message_from_row(r: &SqliteRow) -> Result<MessageRecord> {
    let mentions: Vec<i64> = serde_json::from_str(&r.get::<String, _>("mentions"))?;
    Ok(MessageRecord {
        message_id: MessageId(r.get::<i64, _>("id")),
        cid: r.get::<String, _>("cid"),
        channel_id: ChannelId(r.get::<i64, _>("channel_id")),
        sender_id: UserId(r.get::<i64, _>("user_id")),
        kind: parse_message_kind(&r.get::<String, _>("kind")),
        content: r.get::<Option<String>, _>("content"),
        file: r.get::<Option<String>, _>("file"),
        duration: r.get::<Option<i64>, _>("duration"),
        mentions: mentions.into_iter().map(UserId).collect(),
        moderation_status: parse_moderation_status(&r.get::<String, _>("moderation_status")),
        status: parse_delivery_status(&r.get::<String, _>("status")),
        withdraw_reason: r
            .get::<Option<String>, _>("withdraw_reason")
            .as_deref()
            .and_then(parse_withdraw_reason),
        seq: r.get::<i64, _>("seq"),
        created_at: from_millis(r.get::<i64, _>("created_at")),
        updated_at: from_millis(r.get::<i64, _>("updated_at")),
        withdrawn_at: r.get::<Option<i64>, _>("withdrawn_at").map(from_millis),
    })
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
