use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ChannelId, ChannelKind, ChannelStatus, DeliveryStatus, MessageId, MessageKind,
        ModerationStatus, Role, UserId, WithdrawReason,
    },
    error::ApiError,
};

/// What a client submits when sending. The engine derives the stored kind from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        content: String,
        #[serde(default)]
        mentions: Vec<UserId>,
    },
    Media {
        file: String,
        #[serde(default)]
        duration: Option<i64>,
    },
    Card {
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage {
        channel_id: ChannelId,
        cid: String,
        body: MessageBody,
    },
    OpenChannel {
        channel_id: ChannelId,
    },
    CloseChannel {
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },
    WithdrawMessage {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    FetchRange {
        channel_id: ChannelId,
        seq_start: i64,
        seq_end: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub message_id: MessageId,
    pub seq: i64,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub cid: String,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
    pub moderation_status: ModerationStatus,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdraw_reason: Option<WithdrawReason>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub status: ChannelStatus,
    pub name: String,
    pub avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    pub member_count: i64,
    pub member_count_limit: i64,
    pub seq_end: i64,
    pub total_msg_count: i64,
    pub last_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_msg_at: Option<DateTime<Utc>>,
    pub owner_invite_only: bool,
    pub banned: bool,
    pub member_masked: bool,
}

/// The caller's own view of a channel: counters, cursor and visible window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipState {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark_nickname: Option<String>,
    pub seq_start: i64,
    pub msg_count: i64,
    pub unread_msg_count: i64,
    pub mention_count: i64,
    pub last_viewed_at: DateTime<Utc>,
    pub opened: bool,
    pub muted: bool,
    pub banned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelListing {
    pub channel: ChannelSummary,
    pub membership: MembershipState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub nickname: String,
    pub avatar: String,
    pub role: Role,
    pub banned: bool,
    pub muted: bool,
}

/// Partial channel update. Only the attributes that changed are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChannelStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_msg_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_msg_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_invite_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_masked: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessagePush {
        message: MessagePayload,
    },
    MessageWithdrawn {
        channel_id: ChannelId,
        message_id: MessageId,
        cid: String,
        seq: i64,
        reason: WithdrawReason,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
        cid: String,
        seq: i64,
    },
    ChannelAdded {
        channel: ChannelListing,
    },
    ChannelUpdated {
        channel_id: ChannelId,
        attrs: ChannelAttrs,
    },
    MembersAdded {
        channel_id: ChannelId,
        operator_id: UserId,
        user_ids: Vec<UserId>,
    },
    MembersRemoved {
        channel_id: ChannelId,
        operator_id: UserId,
        user_ids: Vec<UserId>,
    },
    MembersBanned {
        channel_id: ChannelId,
        user_ids: Vec<UserId>,
        banned: bool,
    },
    RoleUpdated {
        channel_id: ChannelId,
        user_ids: Vec<UserId>,
        role: Role,
    },
    ReadStateUpdated {
        channel_id: ChannelId,
        msg_count: i64,
        unread_msg_count: i64,
        mention_count: i64,
        last_viewed_at: DateTime<Utc>,
        opened: bool,
    },
    SystemNotice {
        channel_id: ChannelId,
        message_id: MessageId,
        reason: WithdrawReason,
        text: String,
    },
    MessageAccepted {
        cid: String,
        result: SendResult,
    },
    ChannelOpened {
        channel_id: ChannelId,
        withdrawn_message_ids: Vec<MessageId>,
    },
    MessageRange {
        channel_id: ChannelId,
        messages: Vec<MessagePayload>,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Self::MessagePush { message } => Some(message.channel_id),
            Self::MessageWithdrawn { channel_id, .. }
            | Self::MessageDeleted { channel_id, .. }
            | Self::ChannelUpdated { channel_id, .. }
            | Self::MembersAdded { channel_id, .. }
            | Self::MembersRemoved { channel_id, .. }
            | Self::MembersBanned { channel_id, .. }
            | Self::RoleUpdated { channel_id, .. }
            | Self::ReadStateUpdated { channel_id, .. }
            | Self::SystemNotice { channel_id, .. }
            | Self::ChannelOpened { channel_id, .. }
            | Self::MessageRange { channel_id, .. } => Some(*channel_id),
            Self::ChannelAdded { channel } => Some(channel.channel.channel_id),
            Self::MessageAccepted { .. } | Self::Error(_) => None,
        }
    }
}
