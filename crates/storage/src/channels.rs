use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection};

use shared::domain::{ChannelId, ChannelKind, ChannelStatus, Role, UserId};

use crate::{
    channel_kind_str, channel_status_str, from_millis, members, millis, parse_channel_status,
    role_str, ChannelRecord, Storage,
};

const CHANNEL_COLUMNS: &str = "id, kind, status, name, avatar, owner_id, creator_id, member_count, \
     member_count_limit, seq_end, total_msg_count, last_msg, last_msg_at, owner_invite_only, \
     banned, member_masked, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewChannel {
    pub kind: ChannelKind,
    pub name: String,
    pub owner_id: Option<UserId>,
    pub creator_id: UserId,
    pub member_count_limit: i64,
}

#[derive(Debug, Clone)]
pub struct NewMember {
    pub user_id: UserId,
    pub role: Role,
    pub friend_id: Option<UserId>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelSettingsPatch {
    pub name: Option<String>,
    pub owner_invite_only: Option<bool>,
    pub banned: Option<bool>,
    pub member_masked: Option<bool>,
}

impl ChannelSettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.owner_invite_only.is_none()
            && self.banned.is_none()
            && self.member_masked.is_none()
    }
}

impl Storage {
    /// Inserts the channel and its initial memberships in one transaction.
    pub async fn create_channel(
        &self,
        channel: &NewChannel,
        members: &[NewMember],
        avatar_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<ChannelId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO channels (kind, name, owner_id, creator_id, member_count_limit, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(channel_kind_str(channel.kind))
        .bind(&channel.name)
        .bind(channel.owner_id.map(|id| id.0))
        .bind(channel.creator_id.0)
        .bind(channel.member_count_limit)
        .bind(millis(now))
        .bind(millis(now))
        .fetch_one(&mut *tx)
        .await?;
        let channel_id = ChannelId(rec.get::<i64, _>(0));

        for member in members {
            sqlx::query(
                "INSERT INTO memberships (channel_id, user_id, friend_id, role, last_viewed_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(channel_id.0)
            .bind(member.user_id.0)
            .bind(member.friend_id.map(|id| id.0))
            .bind(role_str(member.role))
            .bind(millis(now))
            .bind(millis(now))
            .bind(millis(now))
            .execute(&mut *tx)
            .await?;
        }

        refresh_member_aggregate(&mut tx, channel_id, avatar_limit, now).await?;
        tx.commit().await?;
        Ok(channel_id)
    }

    pub async fn get_channel(&self, channel_id: ChannelId) -> Result<Option<ChannelRecord>> {
        let row = sqlx::query(&format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?"))
            .bind(channel_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(channel_from_row))
    }

    pub async fn channels_by_ids(&self, channel_ids: &[ChannelId]) -> Result<Vec<ChannelRecord>> {
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id IN ("));
        let mut ids = query.separated(", ");
        for channel_id in channel_ids {
            ids.push_bind(channel_id.0);
        }
        ids.push_unseparated(") ORDER BY COALESCE(last_msg_at, created_at) DESC");
        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(channel_from_row).collect())
    }

    /// Atomically claims the next sequence slot. Runs outside any transaction,
    /// so a slot is never handed out twice even if the caller's insert fails.
    pub async fn next_seq(&self, channel_id: ChannelId) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE channels SET seq_end = seq_end + 1 WHERE id = ? RETURNING seq_end",
        )
        .bind(channel_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.get::<i64, _>(0))
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))
    }

    pub async fn update_channel_settings(
        &self,
        channel_id: ChannelId,
        patch: &ChannelSettingsPatch,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE channels SET
                name = COALESCE(?, name),
                owner_invite_only = COALESCE(?, owner_invite_only),
                banned = COALESCE(?, banned),
                member_masked = COALESCE(?, member_masked),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(patch.name.as_deref())
        .bind(patch.owner_invite_only)
        .bind(patch.banned)
        .bind(patch.member_masked)
        .bind(millis(now))
        .bind(channel_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_channel_status(
        &self,
        channel_id: ChannelId,
        status: ChannelStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE channels SET status = ?, updated_at = ? WHERE id = ?")
            .bind(channel_status_str(status))
            .bind(millis(now))
            .bind(channel_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft-deletes the channel and every active membership. Returns the users removed.
    pub async fn remove_channel(
        &self,
        channel_id: ChannelId,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE channels SET status = 'deleted', member_count = 0, deleted_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(channel_id.0)
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query(
            "UPDATE memberships SET deleted = 1, opened = 0, deleted_at = ?, updated_at = ?
             WHERE channel_id = ? AND deleted = 0
             RETURNING user_id",
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(channel_id.0)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    /// Direct channel previously paired for `user_id -> friend_id`, deleted or not.
    pub async fn find_direct_channel(
        &self,
        user_id: UserId,
        friend_id: UserId,
    ) -> Result<Option<ChannelId>> {
        let row = sqlx::query(
            "SELECT channel_id FROM memberships WHERE user_id = ? AND friend_id = ?",
        )
        .bind(user_id.0)
        .bind(friend_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ChannelId(r.get::<i64, _>(0))))
    }

    /// Restores a direct pairing. Deleted sides are re-activated with a fresh
    /// window; a side that never left keeps its counters but loses any blacklist.
    pub async fn reactivate_direct(
        &self,
        channel_id: ChannelId,
        users: [UserId; 2],
        avatar_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE channels SET status = 'normal', deleted_at = NULL, updated_at = ? WHERE id = ?")
            .bind(millis(now))
            .bind(channel_id.0)
            .execute(&mut *tx)
            .await?;
        for user_id in users {
            sqlx::query(
                "UPDATE memberships SET blacklisted = 0, updated_at = ?
                 WHERE channel_id = ? AND user_id = ? AND deleted = 0",
            )
            .bind(millis(now))
            .bind(channel_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
            members::reactivate_deleted_row(&mut tx, channel_id, user_id, Role::Member, now)
                .await?;
        }
        refresh_member_aggregate(&mut tx, channel_id, avatar_limit, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Recomputes member count and composite avatar straight from membership rows.
    pub async fn recount_members(
        &self,
        channel_id: ChannelId,
        avatar_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let (count, _) = refresh_member_aggregate(&mut tx, channel_id, avatar_limit, now).await?;
        tx.commit().await?;
        Ok(count)
    }
}

/// Writes member_count and (for groups) the avatar mosaic of the first
/// `avatar_limit` active members in join order of their accounts.
pub(crate) async fn refresh_member_aggregate(
    conn: &mut SqliteConnection,
    channel_id: ChannelId,
    avatar_limit: i64,
    now: DateTime<Utc>,
) -> Result<(i64, String)> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM memberships WHERE channel_id = ? AND deleted = 0",
    )
    .bind(channel_id.0)
    .fetch_one(&mut *conn)
    .await?;

    let avatars: Vec<String> = sqlx::query_scalar(
        "SELECT u.avatar
         FROM memberships m
         INNER JOIN users u ON u.id = m.user_id
         WHERE m.channel_id = ? AND m.deleted = 0 AND u.state = 'normal'
         ORDER BY u.created_at ASC, u.id ASC
         LIMIT ?",
    )
    .bind(channel_id.0)
    .bind(avatar_limit)
    .fetch_all(&mut *conn)
    .await?;

    let row = sqlx::query(
        "UPDATE channels SET
            member_count = ?,
            avatar = CASE WHEN kind = 'group' THEN ? ELSE avatar END,
            updated_at = ?
         WHERE id = ?
         RETURNING avatar",
    )
    .bind(count)
    .bind(avatars.join(","))
    .bind(millis(now))
    .bind(channel_id.0)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| anyhow!("channel {channel_id} not found"))?;

    Ok((count, row.get::<String, _>(0)))
}

pub(crate) fn channel_from_row(r: &SqliteRow) -> ChannelRecord {
    ChannelRecord {
        channel_id: ChannelId(r.get::<i64, _>("id")),
        kind: match r.get::<String, _>("kind").as_str() {
            "direct" => ChannelKind::Direct,
            _ => ChannelKind::Group,
        },
        status: parse_channel_status(&r.get::<String, _>("status")),
        name: r.get::<String, _>("name"),
        avatar: r.get::<String, _>("avatar"),
        owner_id: r.get::<Option<i64>, _>("owner_id").map(UserId),
        creator_id: UserId(r.get::<i64, _>("creator_id")),
        member_count: r.get::<i64, _>("member_count"),
        member_count_limit: r.get::<i64, _>("member_count_limit"),
        seq_end: r.get::<i64, _>("seq_end"),
        total_msg_count: r.get::<i64, _>("total_msg_count"),
        last_msg: r.get::<String, _>("last_msg"),
        last_msg_at: r.get::<Option<i64>, _>("last_msg_at").map(from_millis),
        owner_invite_only: r.get::<bool, _>("owner_invite_only"),
        banned: r.get::<bool, _>("banned"),
        member_masked: r.get::<bool, _>("member_masked"),
        created_at: from_millis(r.get::<i64, _>("created_at")),
        updated_at: from_millis(r.get::<i64, _>("updated_at")),
    }
}

#[cfg(test)]
#[path = "tests/channels_tests.rs"]
mod tests;
