//! Message lifecycle rules that do not touch storage.
//!
//! ```text
//! pending -> normal | suspected | prohibited     (moderation)
//! pending | normal -> withdrawn | deleted         (user, owner, moderation, admin)
//! ```
//! `prohibited`, `withdrawn` and `deleted` are terminal.

use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ChannelKind, DeliveryStatus, MessageKind, ModerationStatus, UserId, WithdrawReason,
    },
    error::ApiError,
    protocol::{MessageBody, MessagePayload},
};
use storage::{ChannelRecord, MessageRecord};

const AUDIO_EXTENSIONS: [&str; 4] = [".mp3", ".m4a", ".aac", ".mp4"];

/// Validated content of a send request.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file: Option<String>,
    pub duration: Option<i64>,
    pub mentions: Vec<UserId>,
}

impl Draft {
    pub fn from_body(body: &MessageBody, max_text_chars: usize) -> Result<Self, ApiError> {
        match body {
            MessageBody::Text { content, mentions } => {
                let content = content.trim();
                if content.is_empty() {
                    return Err(ApiError::validation("message content cannot be empty"));
                }
                if content.chars().count() > max_text_chars {
                    return Err(ApiError::validation(format!(
                        "message content exceeds {max_text_chars} characters"
                    )));
                }
                let mut mentions = mentions.clone();
                mentions.sort();
                mentions.dedup();
                Ok(Self {
                    kind: if mentions.is_empty() {
                        MessageKind::Text
                    } else {
                        MessageKind::ContainAt
                    },
                    content: Some(content.to_string()),
                    file: None,
                    duration: None,
                    mentions,
                })
            }
            MessageBody::Media { file, duration } => {
                let file = file.trim();
                if file.is_empty() {
                    return Err(ApiError::validation("media reference cannot be empty"));
                }
                let kind = media_kind(file);
                if duration.is_some_and(|d| d < 0) {
                    return Err(ApiError::validation("duration cannot be negative"));
                }
                Ok(Self {
                    kind,
                    content: None,
                    file: Some(file.to_string()),
                    duration: if kind == MessageKind::Audio {
                        *duration
                    } else {
                        None
                    },
                    mentions: Vec::new(),
                })
            }
            MessageBody::Card { content } => {
                if content.trim().is_empty() {
                    return Err(ApiError::validation("card content cannot be empty"));
                }
                Ok(Self {
                    kind: MessageKind::Card,
                    content: Some(content.clone()),
                    file: None,
                    duration: None,
                    mentions: Vec::new(),
                })
            }
        }
    }
}

pub fn media_kind(file: &str) -> MessageKind {
    let lower = file.to_ascii_lowercase();
    if AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        MessageKind::Audio
    } else {
        MessageKind::Image
    }
}

/// Statuses a message is inserted with. Scanned kinds wait for a verdict.
pub fn initial_statuses(kind: MessageKind) -> (ModerationStatus, DeliveryStatus) {
    if kind.is_scanned() {
        (ModerationStatus::Pending, DeliveryStatus::Pending)
    } else {
        (ModerationStatus::Normal, DeliveryStatus::Normal)
    }
}

pub fn is_removable(status: DeliveryStatus) -> bool {
    matches!(status, DeliveryStatus::Pending | DeliveryStatus::Normal)
}

/// Decides whether `actor` may withdraw `message`. The group owner may withdraw
/// anything at any time; authors only their own, inside the window.
pub fn authorize_withdraw(
    channel: &ChannelRecord,
    message: &MessageRecord,
    actor: UserId,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<WithdrawReason, ApiError> {
    if !message.kind.is_counted() {
        return Err(ApiError::forbidden("system messages cannot be withdrawn"));
    }
    if channel.is_owner(actor) {
        return Ok(if message.sender_id == actor {
            WithdrawReason::Sender
        } else {
            WithdrawReason::GroupOwner
        });
    }
    if message.sender_id != actor {
        return Err(ApiError::forbidden("only the author or the group owner can withdraw"));
    }
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    if (now - message.created_at).num_milliseconds() >= window_ms {
        return Err(ApiError::forbidden("withdraw window has expired"));
    }
    Ok(WithdrawReason::Sender)
}

/// Whether members may still see the body of the message.
pub fn content_visible(message: &MessageRecord) -> bool {
    !message.status.is_terminal() && message.moderation_status != ModerationStatus::Prohibited
}

pub fn payload(message: &MessageRecord) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        cid: message.cid.clone(),
        channel_id: message.channel_id,
        sender_id: message.sender_id,
        kind: message.kind,
        seq: message.seq,
        content: message.content.clone(),
        file: message.file.clone(),
        duration: message.duration,
        mentions: message.mentions.clone(),
        moderation_status: message.moderation_status,
        status: message.status,
        withdraw_reason: message.withdraw_reason,
        sent_at: message.created_at,
    }
}

/// Payload for members: redacted messages keep their slot but lose the body.
pub fn member_payload(message: &MessageRecord) -> MessagePayload {
    let mut payload = payload(message);
    if !content_visible(message) {
        payload.content = None;
        payload.file = None;
        payload.duration = None;
        payload.mentions.clear();
    }
    payload
}

/// Channel list preview for a message.
pub fn summary(
    kind: MessageKind,
    content: Option<&str>,
    sender_nickname: &str,
    channel_kind: ChannelKind,
    max_chars: usize,
) -> String {
    let body = match kind {
        MessageKind::Image => "[image]",
        MessageKind::Audio => "[audio]",
        MessageKind::Card => "[card]",
        _ => content.unwrap_or_default(),
    };
    let body = truncate(body, max_chars);
    if channel_kind == ChannelKind::Group && kind.is_counted() {
        format!("{sender_nickname}: {body}")
    } else {
        body
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

pub fn notice_text(reason: WithdrawReason) -> &'static str {
    match reason {
        WithdrawReason::Sender => "You withdrew a message",
        WithdrawReason::GroupOwner => "Your message was withdrawn by the group owner",
        WithdrawReason::ScannerAntispam => "Your message was withdrawn as spam",
        WithdrawReason::ScannerPorn => "Your message was withdrawn for sexual content",
        WithdrawReason::ScannerTerrorism => "Your message was withdrawn for violent or extremist content",
        WithdrawReason::Auditor => "Your message was withdrawn by a moderator",
        WithdrawReason::Admin => "Your message was removed by an administrator",
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
