use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use shared::domain::{ChannelId, Role, UserId};

use crate::{
    channels::refresh_member_aggregate, from_millis, millis, parse_role, parse_user_state,
    role_str, MembershipRecord, Storage, StoredMember,
};

const MEMBERSHIP_COLUMNS: &str = "channel_id, user_id, friend_id, role, remark_nickname, msg_count, \
     unread_msg_count, mention_count, last_viewed_at, opened, muted, banned, blacklisted, deleted, \
     seq_start, withdraw_cursor";

impl Storage {
    pub async fn get_membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<Option<MembershipRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE channel_id = ? AND user_id = ?"
        ))
        .bind(channel_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(membership_from_row))
    }

    /// Active memberships of a channel.
    pub async fn active_memberships(&self, channel_id: ChannelId) -> Result<Vec<MembershipRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships
             WHERE channel_id = ? AND deleted = 0
             ORDER BY created_at ASC, user_id ASC"
        ))
        .bind(channel_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(membership_from_row).collect())
    }

    /// Active memberships of a user across all channels.
    pub async fn memberships_for_user(&self, user_id: UserId) -> Result<Vec<MembershipRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE user_id = ? AND deleted = 0"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(membership_from_row).collect())
    }

    pub async fn list_members(&self, channel_id: ChannelId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT u.id, u.nickname, u.avatar, u.state, m.role, m.banned, m.muted
             FROM memberships m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.channel_id = ? AND m.deleted = 0
             ORDER BY u.created_at ASC, u.id ASC",
        )
        .bind(channel_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMember {
                user_id: UserId(r.get::<i64, _>(0)),
                nickname: r.get::<String, _>(1),
                avatar: r.get::<String, _>(2),
                state: parse_user_state(&r.get::<String, _>(3)),
                role: parse_role(&r.get::<String, _>(4)),
                banned: r.get::<bool, _>(5),
                muted: r.get::<bool, _>(6),
            })
            .collect())
    }

    /// Adds users to a channel, re-activating rows of former members instead of
    /// inserting new ones. Every added member starts at the channel's live
    /// `seq_end` with zeroed counters. Returns the refreshed member count and avatar.
    pub async fn add_members(
        &self,
        channel_id: ChannelId,
        user_ids: &[UserId],
        role: Role,
        avatar_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(i64, String)> {
        let mut tx = self.pool.begin().await?;
        touch_channel(&mut tx, channel_id, now).await?;

        for user_id in user_ids {
            if reactivate_deleted_row(&mut tx, channel_id, *user_id, role, now).await? {
                continue;
            }
            sqlx::query(
                "INSERT INTO memberships
                    (channel_id, user_id, role, last_viewed_at, seq_start, withdraw_cursor, created_at, updated_at)
                 VALUES (?, ?, ?, ?,
                    (SELECT seq_end FROM channels WHERE id = ?),
                    (SELECT COALESCE(MAX(id), 0) FROM withdrawals WHERE channel_id = ?),
                    ?, ?)",
            )
            .bind(channel_id.0)
            .bind(user_id.0)
            .bind(role_str(role))
            .bind(millis(now))
            .bind(channel_id.0)
            .bind(channel_id.0)
            .bind(millis(now))
            .bind(millis(now))
            .execute(&mut *tx)
            .await?;
        }

        let aggregate = refresh_member_aggregate(&mut tx, channel_id, avatar_limit, now).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    /// Soft-removes memberships. Counters are left as they are.
    pub async fn remove_members(
        &self,
        channel_id: ChannelId,
        user_ids: &[UserId],
        avatar_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(i64, String)> {
        let mut tx = self.pool.begin().await?;
        touch_channel(&mut tx, channel_id, now).await?;

        for user_id in user_ids {
            sqlx::query(
                "UPDATE memberships SET deleted = 1, opened = 0, deleted_at = ?, updated_at = ?
                 WHERE channel_id = ? AND user_id = ? AND deleted = 0",
            )
            .bind(millis(now))
            .bind(millis(now))
            .bind(channel_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        }

        let aggregate = refresh_member_aggregate(&mut tx, channel_id, avatar_limit, now).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    pub async fn set_roles(
        &self,
        channel_id: ChannelId,
        user_ids: &[UserId],
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for user_id in user_ids {
            sqlx::query(
                "UPDATE memberships SET role = ?, updated_at = ?
                 WHERE channel_id = ? AND user_id = ? AND deleted = 0",
            )
            .bind(role_str(role))
            .bind(millis(now))
            .bind(channel_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_banned(
        &self,
        channel_id: ChannelId,
        user_ids: &[UserId],
        banned: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for user_id in user_ids {
            sqlx::query(
                "UPDATE memberships SET banned = ?, updated_at = ?
                 WHERE channel_id = ? AND user_id = ? AND deleted = 0",
            )
            .bind(banned)
            .bind(millis(now))
            .bind(channel_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_member_preferences(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        muted: Option<bool>,
        blacklisted: Option<bool>,
        remark_nickname: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE memberships SET
                muted = COALESCE(?, muted),
                blacklisted = COALESCE(?, blacklisted),
                remark_nickname = COALESCE(?, remark_nickname),
                updated_at = ?
             WHERE channel_id = ? AND user_id = ? AND deleted = 0",
        )
        .bind(muted)
        .bind(blacklisted)
        .bind(remark_nickname)
        .bind(millis(now))
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Members that should get an out-of-band push for a new message: not the
    /// sender, not looking at the channel, not muted, account usable, push on.
    pub async fn push_targets(&self, channel_id: ChannelId, sender_id: UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT m.user_id
             FROM memberships m
             INNER JOIN users u ON u.id = m.user_id
             WHERE m.channel_id = ?
               AND m.user_id <> ?
               AND m.deleted = 0
               AND m.opened = 0
               AND m.muted = 0
               AND u.state = 'normal'
               AND u.push_enabled = 1",
        )
        .bind(channel_id.0)
        .bind(sender_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }
}

async fn touch_channel(
    conn: &mut SqliteConnection,
    channel_id: ChannelId,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE channels SET updated_at = ? WHERE id = ?")
        .bind(millis(now))
        .bind(channel_id.0)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Brings a soft-deleted row back with a fresh history window. Receipts from the
/// previous membership are neutralised so later withdrawals leave the new
/// counters alone. Returns false when there is no deleted row to revive.
pub(crate) async fn reactivate_deleted_row(
    conn: &mut SqliteConnection,
    channel_id: ChannelId,
    user_id: UserId,
    role: Role,
    now: DateTime<Utc>,
) -> Result<bool> {
    let revived = sqlx::query(
        "UPDATE memberships SET
            deleted = 0,
            deleted_at = NULL,
            role = ?,
            msg_count = 0,
            unread_msg_count = 0,
            mention_count = 0,
            last_viewed_at = ?,
            opened = 0,
            muted = 0,
            banned = 0,
            blacklisted = 0,
            seq_start = (SELECT seq_end FROM channels WHERE id = ?),
            withdraw_cursor = (SELECT COALESCE(MAX(id), 0) FROM withdrawals WHERE channel_id = ?),
            updated_at = ?
         WHERE channel_id = ? AND user_id = ? AND deleted = 1",
    )
    .bind(role_str(role))
    .bind(millis(now))
    .bind(channel_id.0)
    .bind(channel_id.0)
    .bind(millis(now))
    .bind(channel_id.0)
    .bind(user_id.0)
    .execute(&mut *conn)
    .await?
    .rows_affected()
        > 0;

    if revived {
        sqlx::query(
            "UPDATE message_receipts SET reverted = 1
             WHERE channel_id = ? AND user_id = ? AND reverted = 0",
        )
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&mut *conn)
        .await?;
    }
    Ok(revived)
}

pub(crate) fn membership_from_row(r: &SqliteRow) -> MembershipRecord {
    MembershipRecord {
        channel_id: ChannelId(r.get::<i64, _>("channel_id")),
        user_id: UserId(r.get::<i64, _>("user_id")),
        friend_id: r.get::<Option<i64>, _>("friend_id").map(UserId),
        role: parse_role(&r.get::<String, _>("role")),
        remark_nickname: r.get::<Option<String>, _>("remark_nickname"),
        msg_count: r.get::<i64, _>("msg_count"),
        unread_msg_count: r.get::<i64, _>("unread_msg_count"),
        mention_count: r.get::<i64, _>("mention_count"),
        last_viewed_at: from_millis(r.get::<i64, _>("last_viewed_at")),
        opened: r.get::<bool, _>("opened"),
        muted: r.get::<bool, _>("muted"),
        banned: r.get::<bool, _>("banned"),
        blacklisted: r.get::<bool, _>("blacklisted"),
        deleted: r.get::<bool, _>("deleted"),
        seq_start: r.get::<i64, _>("seq_start"),
        withdraw_cursor: r.get::<i64, _>("withdraw_cursor"),
    }
}

#[cfg(test)]
#[path = "tests/members_tests.rs"]
mod tests;
