use chrono::Utc;
use shared::{
    domain::{
        ChannelId, ChannelKind, ChannelStatus, DeliveryStatus, MessageId, MessageKind,
        ModerationStatus, UserId, UserState, WithdrawReason,
    },
    error::ApiError,
    protocol::{ChannelAttrs, MessageBody, MessagePayload, SendResult, ServerEvent},
};
use storage::{
    ChannelRecord, LastMessage, MembershipRecord, MessageRecord, NewMessage, UserRecord,
};
use tracing::{debug, error, info};

use crate::{
    after_commit, internal,
    lifecycle::{self, Draft},
    moderation, push, read_state, EngineContext,
};

pub const MAX_CID_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub cid: String,
    pub body: MessageBody,
}

/// Stores a message, applies its counter effects and pushes it to the room.
/// A retry with a `cid` the same sender already used in the same channel gets
/// the original result back.
pub async fn send(ctx: &EngineContext, request: SendRequest) -> Result<SendResult, ApiError> {
    let cid = request.cid.trim();
    if cid.is_empty() || cid.chars().count() > MAX_CID_CHARS {
        return Err(ApiError::validation(format!(
            "cid must be 1 to {MAX_CID_CHARS} characters"
        )));
    }
    let draft = Draft::from_body(&request.body, ctx.config.max_text_chars)?;

    let guard = ctx.locks.lock(request.channel_id).await;
    if let Some(existing) = ctx
        .storage
        .find_message_by_cid(cid)
        .await
        .map_err(internal)?
    {
        return replay(&existing, &request);
    }

    let channel = load_channel(ctx, request.channel_id).await?;
    let (sender, members) = ensure_can_send(ctx, &channel, request.sender_id).await?;

    let now = Utc::now();
    let seq = ctx
        .storage
        .next_seq(channel.channel_id)
        .await
        .map_err(internal)?;
    let (moderation_status, status) = lifecycle::initial_statuses(draft.kind);
    let deltas = read_state::plan_send(&members, sender.user_id, &draft.mentions);
    let summary = lifecycle::summary(
        draft.kind,
        draft.content.as_deref(),
        &sender.nickname,
        channel.kind,
        ctx.config.last_msg_max_chars,
    );
    let message = NewMessage {
        cid: cid.to_string(),
        channel_id: channel.channel_id,
        sender_id: sender.user_id,
        kind: draft.kind,
        content: draft.content,
        file: draft.file,
        duration: draft.duration,
        mentions: draft.mentions,
        moderation_status,
        status,
        seq,
        created_at: now,
    };
    let last_msg = LastMessage {
        text: summary.clone(),
        at: Some(now),
    };
    let message_id = ctx
        .storage
        .record_message(&message, &deltas, &last_msg)
        .await
        .map_err(|err| record_failed(ctx, &message, err))?;

    ctx.dispatcher.to_room(
        channel.channel_id,
        ServerEvent::MessagePush {
            message: new_payload(message_id, &message),
        },
    );
    drop(guard);

    info!(
        channel_id = %channel.channel_id,
        %message_id,
        seq,
        kind = ?message.kind,
        recipients = deltas.len(),
        "message stored"
    );

    if message.kind.is_scanned() {
        moderation::spawn_scan(ctx, message.cid.clone(), message.content.unwrap_or_default());
    }
    push::spawn_push(ctx, &channel, message_id, &sender, summary);

    Ok(SendResult {
        message_id,
        seq,
        status,
    })
}

fn replay(existing: &MessageRecord, request: &SendRequest) -> Result<SendResult, ApiError> {
    if existing.sender_id != request.sender_id || existing.channel_id != request.channel_id {
        return Err(ApiError::conflict("cid is already used by another message"));
    }
    debug!(cid = %existing.cid, seq = existing.seq, "duplicate send replayed");
    Ok(SendResult {
        message_id: existing.message_id,
        seq: existing.seq,
        status: existing.status,
    })
}

fn record_failed(ctx: &EngineContext, message: &NewMessage, err: anyhow::Error) -> ApiError {
    if storage::is_seq_collision(&err) {
        ctx.diagnostics.record_seq_collision();
        error!(
            target: "consistency",
            channel_id = %message.channel_id,
            seq = message.seq,
            "sequence slot was issued twice"
        );
    } else if storage::is_cid_collision(&err) {
        return ApiError::conflict("cid is already used by another message");
    }
    internal(err)
}

async fn ensure_can_send(
    ctx: &EngineContext,
    channel: &ChannelRecord,
    sender_id: UserId,
) -> Result<(UserRecord, Vec<MembershipRecord>), ApiError> {
    match channel.status {
        ChannelStatus::Normal => {}
        ChannelStatus::Blocked => return Err(ApiError::forbidden("channel is blocked")),
        ChannelStatus::Deleted => return Err(ApiError::forbidden("channel has been removed")),
    }
    let sender = ctx
        .storage
        .get_user(sender_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    if sender.state != UserState::Normal {
        return Err(ApiError::forbidden("account is not active"));
    }

    let members = ctx
        .storage
        .active_memberships(channel.channel_id)
        .await
        .map_err(internal)?;
    let Some(membership) = members.iter().find(|m| m.user_id == sender_id) else {
        return Err(ApiError::forbidden("user is not a member"));
    };
    if channel.banned && !channel.is_owner(sender_id) {
        return Err(ApiError::forbidden("only the owner may speak in this channel"));
    }
    if membership.banned {
        return Err(ApiError::forbidden("user is banned in this channel"));
    }
    if channel.kind == ChannelKind::Direct {
        let counterpart = membership
            .friend_id
            .and_then(|friend| members.iter().find(|m| m.user_id == friend));
        match counterpart {
            None => return Err(ApiError::forbidden("the other party has left this conversation")),
            Some(friend) if friend.blacklisted => {
                return Err(ApiError::forbidden("the other party is not accepting messages"))
            }
            Some(_) => {}
        }
    }
    Ok((sender, members))
}

/// Records a structural event (join, leave, withdraw notice, ...) with its own
/// seq and pushes it to the room. Callers hold the channel lock.
pub(crate) async fn post_structural(
    ctx: &EngineContext,
    channel: &ChannelRecord,
    actor_id: UserId,
    kind: MessageKind,
    text: String,
) -> Result<MessageId, ApiError> {
    let now = Utc::now();
    let seq = ctx
        .storage
        .next_seq(channel.channel_id)
        .await
        .map_err(internal)?;
    let last_msg = LastMessage {
        text: lifecycle::summary(kind, Some(&text), "", channel.kind, ctx.config.last_msg_max_chars),
        at: Some(now),
    };
    let message = NewMessage {
        cid: format!("sys-{}-{seq}", channel.channel_id),
        channel_id: channel.channel_id,
        sender_id: actor_id,
        kind,
        content: Some(text),
        file: None,
        duration: None,
        mentions: Vec::new(),
        moderation_status: ModerationStatus::Normal,
        status: DeliveryStatus::Normal,
        seq,
        created_at: now,
    };
    let message_id = ctx
        .storage
        .record_message(&message, &[], &last_msg)
        .await
        .map_err(|err| record_failed(ctx, &message, err))?;

    ctx.dispatcher.to_room(
        channel.channel_id,
        ServerEvent::MessagePush {
            message: new_payload(message_id, &message),
        },
    );
    debug!(channel_id = %channel.channel_id, seq, ?kind, "structural event stored");
    Ok(message_id)
}

/// [`post_structural`] for callers whose own change is already committed.
pub(crate) async fn announce(
    ctx: &EngineContext,
    channel: &ChannelRecord,
    actor_id: UserId,
    kind: MessageKind,
    text: String,
) {
    let stored = post_structural(ctx, channel, actor_id, kind, text).await;
    after_commit(ctx, "structural_event", stored);
}

/// Withdraws a message on behalf of its author or the group owner.
pub async fn withdraw(
    ctx: &EngineContext,
    channel_id: ChannelId,
    actor_id: UserId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let _guard = ctx.locks.lock(channel_id).await;
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .filter(|m| m.channel_id == channel_id)
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    let channel = load_channel(ctx, channel_id).await?;

    let is_member = ctx
        .storage
        .get_membership(channel_id, actor_id)
        .await
        .map_err(internal)?
        .is_some_and(|m| m.is_active());
    if !is_member {
        return Err(ApiError::forbidden("user is not a member"));
    }
    let reason = lifecycle::authorize_withdraw(
        &channel,
        &message,
        actor_id,
        Utc::now(),
        ctx.config.withdraw_window,
    )?;
    if !lifecycle::is_removable(message.status)
        || !remove_locked(ctx, &channel, &message, DeliveryStatus::Withdrawn, Some(reason), None)
            .await?
    {
        return Err(ApiError::conflict("message is already withdrawn"));
    }

    let actor = nickname(ctx, actor_id).await;
    let (kind, text) = match reason {
        WithdrawReason::GroupOwner => (
            MessageKind::WithdrawByOwner,
            format!("{actor} withdrew a member's message"),
        ),
        _ => (
            MessageKind::WithdrawBySender,
            format!("{actor} withdrew a message"),
        ),
    };
    announce(ctx, &channel, actor_id, kind, text).await;
    if reason == WithdrawReason::GroupOwner {
        notify_author(ctx, &message, reason);
    }
    Ok(())
}

/// Administrative hard removal. Counters are rolled back exactly like a
/// withdrawal but clients are told the message is gone rather than redacted.
pub async fn delete_message(ctx: &EngineContext, message_id: MessageId) -> Result<(), ApiError> {
    let channel_id = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?
        .channel_id;

    let _guard = ctx.locks.lock(channel_id).await;
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    let channel = load_channel(ctx, channel_id).await?;
    if !lifecycle::is_removable(message.status)
        || !remove_locked(ctx, &channel, &message, DeliveryStatus::Deleted, None, None).await?
    {
        return Err(ApiError::conflict("message is already removed"));
    }
    Ok(())
}

/// Moves `message` into `target`, rolls back its counters and tells the room.
/// Returns false when the message had already left the live states, in which
/// case nothing changed. Callers hold the channel lock.
pub(crate) async fn remove_locked(
    ctx: &EngineContext,
    channel: &ChannelRecord,
    message: &MessageRecord,
    target: DeliveryStatus,
    reason: Option<WithdrawReason>,
    moderation: Option<ModerationStatus>,
) -> Result<bool, ApiError> {
    let replacement = match ctx
        .storage
        .latest_visible_message(channel.channel_id, message.message_id)
        .await
        .map_err(internal)?
    {
        Some(latest) => LastMessage {
            text: lifecycle::summary(
                latest.kind,
                latest.content.as_deref(),
                &nickname(ctx, latest.sender_id).await,
                channel.kind,
                ctx.config.last_msg_max_chars,
            ),
            at: Some(latest.created_at),
        },
        None => LastMessage {
            text: String::new(),
            at: None,
        },
    };

    let Some(outcome) = ctx
        .storage
        .remove_message(
            message.message_id,
            target,
            reason,
            moderation,
            Some(&replacement),
            Utc::now(),
        )
        .await
        .map_err(internal)?
    else {
        return Ok(false);
    };

    for (user_id, counter) in &outcome.clamped {
        ctx.diagnostics.record_counter_underflow();
        error!(
            target: "consistency",
            channel_id = %channel.channel_id,
            message_id = %message.message_id,
            %user_id,
            counter,
            "counter rollback clamped at zero"
        );
    }
    if outcome.total_clamped {
        ctx.diagnostics.record_counter_underflow();
        error!(
            target: "consistency",
            channel_id = %channel.channel_id,
            message_id = %message.message_id,
            "channel total_msg_count rollback clamped at zero"
        );
    }

    let event = match target {
        DeliveryStatus::Deleted => ServerEvent::MessageDeleted {
            channel_id: channel.channel_id,
            message_id: message.message_id,
            cid: message.cid.clone(),
            seq: message.seq,
        },
        _ => ServerEvent::MessageWithdrawn {
            channel_id: channel.channel_id,
            message_id: message.message_id,
            cid: message.cid.clone(),
            seq: message.seq,
            reason: reason.unwrap_or(WithdrawReason::Admin),
        },
    };
    ctx.dispatcher.to_room(channel.channel_id, event);
    ctx.dispatcher.to_room(
        channel.channel_id,
        ServerEvent::ChannelUpdated {
            channel_id: channel.channel_id,
            attrs: ChannelAttrs {
                total_msg_count: Some(outcome.total_msg_count),
                last_msg: Some(replacement.text),
                last_msg_at: replacement.at,
                ..ChannelAttrs::default()
            },
        },
    );
    for user_id in &outcome.reverted {
        let membership = ctx
            .storage
            .get_membership(channel.channel_id, *user_id)
            .await
            .map_err(internal);
        if let Some(membership) = after_commit(ctx, "read_state_notice", membership).flatten() {
            read_state::notify_read_state(ctx, &membership);
        }
    }

    info!(
        channel_id = %channel.channel_id,
        message_id = %message.message_id,
        seq = message.seq,
        ?target,
        ?reason,
        reverted = outcome.reverted.len(),
        "message removed"
    );
    Ok(true)
}

/// Messages of one channel in `[seq_start, seq_end]` as the member may see
/// them: nothing before their join point and at most one window per call.
pub async fn get_range(
    ctx: &EngineContext,
    channel_id: ChannelId,
    user_id: UserId,
    seq_start: i64,
    seq_end: i64,
) -> Result<Vec<MessagePayload>, ApiError> {
    if seq_start < 0 || seq_end < seq_start {
        return Err(ApiError::validation("invalid seq range"));
    }
    let membership = ctx
        .storage
        .get_membership(channel_id, user_id)
        .await
        .map_err(internal)?
        .filter(MembershipRecord::is_active)
        .ok_or_else(|| ApiError::forbidden("user is not a member"))?;
    let channel = load_channel(ctx, channel_id).await?;

    let start = seq_start.max(membership.seq_start + 1);
    let end = seq_end
        .min(start.saturating_add(ctx.config.range_window - 1))
        .min(channel.seq_end);
    if end < start {
        return Ok(Vec::new());
    }
    let messages = ctx
        .storage
        .list_range(channel_id, start, end)
        .await
        .map_err(internal)?;
    Ok(messages.iter().map(lifecycle::member_payload).collect())
}

/// Tells the author's devices why their message disappeared.
pub(crate) fn notify_author(ctx: &EngineContext, message: &MessageRecord, reason: WithdrawReason) {
    ctx.dispatcher.to_users(
        message.channel_id,
        vec![message.sender_id],
        ServerEvent::SystemNotice {
            channel_id: message.channel_id,
            message_id: message.message_id,
            reason,
            text: lifecycle::notice_text(reason).to_string(),
        },
    );
}

pub(crate) async fn load_channel(
    ctx: &EngineContext,
    channel_id: ChannelId,
) -> Result<ChannelRecord, ApiError> {
    ctx.storage
        .get_channel(channel_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("channel not found"))
}

/// Display name used in structural texts and summaries; empty when unknown.
pub(crate) async fn nickname(ctx: &EngineContext, user_id: UserId) -> String {
    let user = ctx.storage.get_user(user_id).await.map_err(internal);
    after_commit(ctx, "nickname", user)
        .flatten()
        .map(|u| u.nickname)
        .unwrap_or_default()
}

fn new_payload(message_id: MessageId, message: &NewMessage) -> MessagePayload {
    MessagePayload {
        message_id,
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
        withdraw_reason: None,
        sent_at: message.created_at,
    }
}

#[cfg(test)]
#[path = "tests/messaging_tests.rs"]
mod tests;
