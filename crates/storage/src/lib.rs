use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    ChannelId, ChannelKind, ChannelStatus, DeliveryStatus, MessageId, MessageKind,
    ModerationStatus, Role, UserId, UserState, WithdrawReason,
};

mod channels;
mod members;
mod messages;
mod read_state;

pub use channels::{ChannelSettingsPatch, NewChannel, NewMember};
pub use messages::{
    is_cid_collision, is_seq_collision, CounterDelta, LastMessage, NewMessage, RemovalOutcome,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: String,
    pub nickname: String,
    pub avatar: String,
    pub state: UserState,
    pub push_enabled: bool,
    pub prohibited_msg_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub status: ChannelStatus,
    pub name: String,
    pub avatar: String,
    pub owner_id: Option<UserId>,
    pub creator_id: UserId,
    pub member_count: i64,
    pub member_count_limit: i64,
    pub seq_end: i64,
    pub total_msg_count: i64,
    pub last_msg: String,
    pub last_msg_at: Option<DateTime<Utc>>,
    pub owner_invite_only: bool,
    pub banned: bool,
    pub member_masked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelRecord {
    /// Group owner. Direct channels have no owner.
    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.kind == ChannelKind::Group && self.owner_id == Some(user_id)
    }
}

#[derive(Debug, Clone)]
pub struct MembershipRecord {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub friend_id: Option<UserId>,
    pub role: Role,
    pub remark_nickname: Option<String>,
    pub msg_count: i64,
    pub unread_msg_count: i64,
    pub mention_count: i64,
    pub last_viewed_at: DateTime<Utc>,
    pub opened: bool,
    pub muted: bool,
    pub banned: bool,
    pub blacklisted: bool,
    pub deleted: bool,
    pub seq_start: i64,
    pub withdraw_cursor: i64,
}

impl MembershipRecord {
    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: MessageId,
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
    pub withdraw_reason: Option<WithdrawReason>,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub user_id: UserId,
    pub nickname: String,
    pub avatar: String,
    pub state: UserState,
    pub role: Role,
    pub banned: bool,
    pub muted: bool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        // In-memory databases get one connection so writers never meet shared-cache table locks.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, nickname: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, nickname, created_at) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET nickname=excluded.nickname
             RETURNING id",
        )
        .bind(username)
        .bind(nickname)
        .bind(millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, username, nickname, avatar, state, push_enabled, prohibited_msg_count, created_at
             FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn users_by_ids(&self, user_ids: &[UserId]) -> Result<Vec<UserRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, username, nickname, avatar, state, push_enabled, prohibited_msg_count, created_at
             FROM users WHERE id IN (",
        );
        let mut ids = query.separated(", ");
        for user_id in user_ids {
            ids.push_bind(user_id.0);
        }
        ids.push_unseparated(") ORDER BY created_at ASC, id ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn set_user_state(&self, user_id: UserId, state: UserState) -> Result<()> {
        sqlx::query("UPDATE users SET state = ? WHERE id = ?")
            .bind(user_state_str(state))
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_user_avatar(&self, user_id: UserId, avatar: &str) -> Result<()> {
        sqlx::query("UPDATE users SET avatar = ? WHERE id = ?")
            .bind(avatar)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_push_enabled(&self, user_id: UserId, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE users SET push_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_prohibited_count(&self, user_id: UserId) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE users SET prohibited_msg_count = prohibited_msg_count + 1 WHERE id = ?
             RETURNING prohibited_msg_count",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)).unwrap_or_default())
    }
}

pub(crate) fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn user_from_row(r: &SqliteRow) -> UserRecord {
    UserRecord {
        user_id: UserId(r.get::<i64, _>("id")),
        username: r.get::<String, _>("username"),
        nickname: r.get::<String, _>("nickname"),
        avatar: r.get::<String, _>("avatar"),
        state: parse_user_state(&r.get::<String, _>("state")),
        push_enabled: r.get::<bool, _>("push_enabled"),
        prohibited_msg_count: r.get::<i64, _>("prohibited_msg_count"),
        created_at: from_millis(r.get::<i64, _>("created_at")),
    }
}

pub(crate) fn user_state_str(state: UserState) -> &'static str {
    match state {
        UserState::Normal => "normal",
        UserState::Blocked => "blocked",
        UserState::Deleted => "deleted",
    }
}

pub(crate) fn parse_user_state(raw: &str) -> UserState {
    match raw {
        "blocked" => UserState::Blocked,
        "deleted" => UserState::Deleted,
        _ => UserState::Normal,
    }
}

pub(crate) fn role_str(role: Role) -> &'static str {
    match role {
        Role::Owner => "owner",
        Role::Manager => "manager",
        Role::Member => "member",
    }
}

pub(crate) fn parse_role(raw: &str) -> Role {
    match raw {
        "owner" => Role::Owner,
        "manager" => Role::Manager,
        _ => Role::Member,
    }
}

pub(crate) fn channel_kind_str(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Direct => "direct",
        ChannelKind::Group => "group",
    }
}

pub(crate) fn channel_status_str(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Normal => "normal",
        ChannelStatus::Blocked => "blocked",
        ChannelStatus::Deleted => "deleted",
    }
}

pub(crate) fn parse_channel_status(raw: &str) -> ChannelStatus {
    match raw {
        "blocked" => ChannelStatus::Blocked,
        "deleted" => ChannelStatus::Deleted,
        _ => ChannelStatus::Normal,
    }
}

pub(crate) fn message_kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::ContainAt => "contain_at",
        MessageKind::Image => "image",
        MessageKind::Audio => "audio",
        MessageKind::Card => "card",
        MessageKind::System => "system",
        MessageKind::Join => "join",
        MessageKind::Leave => "leave",
        MessageKind::WithdrawBySender => "withdraw_by_sender",
        MessageKind::WithdrawByOwner => "withdraw_by_owner",
        MessageKind::Ban => "ban",
        MessageKind::SettingsChanged => "settings_changed",
    }
}

pub(crate) fn parse_message_kind(raw: &str) -> MessageKind {
    match raw {
        "contain_at" => MessageKind::ContainAt,
        "image" => MessageKind::Image,
        "audio" => MessageKind::Audio,
        "card" => MessageKind::Card,
        "system" => MessageKind::System,
        "join" => MessageKind::Join,
        "leave" => MessageKind::Leave,
        "withdraw_by_sender" => MessageKind::WithdrawBySender,
        "withdraw_by_owner" => MessageKind::WithdrawByOwner,
        "ban" => MessageKind::Ban,
        "settings_changed" => MessageKind::SettingsChanged,
        _ => MessageKind::Text,
    }
}

pub(crate) fn moderation_status_str(status: ModerationStatus) -> &'static str {
    match status {
        ModerationStatus::Pending => "pending",
        ModerationStatus::Normal => "normal",
        ModerationStatus::Suspected => "suspected",
        ModerationStatus::Prohibited => "prohibited",
    }
}

pub(crate) fn parse_moderation_status(raw: &str) -> ModerationStatus {
    match raw {
        "normal" => ModerationStatus::Normal,
        "suspected" => ModerationStatus::Suspected,
        "prohibited" => ModerationStatus::Prohibited,
        _ => ModerationStatus::Pending,
    }
}

pub(crate) fn delivery_status_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Normal => "normal",
        DeliveryStatus::Withdrawn => "withdrawn",
        DeliveryStatus::Deleted => "deleted",
    }
}

pub(crate) fn parse_delivery_status(raw: &str) -> DeliveryStatus {
    match raw {
        "normal" => DeliveryStatus::Normal,
        "withdrawn" => DeliveryStatus::Withdrawn,
        "deleted" => DeliveryStatus::Deleted,
        _ => DeliveryStatus::Pending,
    }
}

pub(crate) fn withdraw_reason_str(reason: WithdrawReason) -> &'static str {
    match reason {
        WithdrawReason::Sender => "sender",
        WithdrawReason::GroupOwner => "group_owner",
        WithdrawReason::ScannerAntispam => "scanner_antispam",
        WithdrawReason::ScannerPorn => "scanner_porn",
        WithdrawReason::ScannerTerrorism => "scanner_terrorism",
        WithdrawReason::Auditor => "auditor",
        WithdrawReason::Admin => "admin",
    }
}

pub(crate) fn parse_withdraw_reason(raw: &str) -> Option<WithdrawReason> {
    Some(match raw {
        "sender" => WithdrawReason::Sender,
        "group_owner" => WithdrawReason::GroupOwner,
        "scanner_antispam" => WithdrawReason::ScannerAntispam,
        "scanner_porn" => WithdrawReason::ScannerPorn,
        "scanner_terrorism" => WithdrawReason::ScannerTerrorism,
        "auditor" => WithdrawReason::Auditor,
        "admin" => WithdrawReason::Admin,
        _ => return None,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
