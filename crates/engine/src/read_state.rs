use chrono::Utc;
use shared::{
    domain::{ChannelId, MessageId, UserId, MENTION_ALL},
    error::ApiError,
    protocol::ServerEvent,
};
use storage::{CounterDelta, MembershipRecord};
use tracing::debug;

use crate::{internal, EngineContext};

/// Counter increments for a new message. The sender is skipped. Members with
/// the channel open are read through; the rest get an unread, plus a mention
/// when named or when everyone is mentioned.
pub fn plan_send(
    members: &[MembershipRecord],
    sender_id: UserId,
    mentions: &[UserId],
) -> Vec<CounterDelta> {
    let mention_all = mentions.contains(&MENTION_ALL);
    members
        .iter()
        .filter(|m| m.is_active() && m.user_id != sender_id)
        .map(|m| {
            let unread = !m.opened;
            CounterDelta {
                user_id: m.user_id,
                unread,
                mention: unread && (mention_all || mentions.contains(&m.user_id)),
            }
        })
        .collect()
}

/// Resets the caller's unread and mention counters, opens the channel for them
/// and returns the ids of messages withdrawn since their previous read.
pub async fn mark_as_read(
    ctx: &EngineContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<Vec<MessageId>, ApiError> {
    let _guard = ctx.locks.lock(channel_id).await;
    let withdrawn = ctx
        .storage
        .mark_read(channel_id, user_id, Utc::now())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::forbidden("user is not a member"))?;

    if let Some(membership) = ctx
        .storage
        .get_membership(channel_id, user_id)
        .await
        .map_err(internal)?
    {
        notify_read_state(ctx, &membership);
    }
    debug!(%channel_id, %user_id, withdrawn = withdrawn.len(), "channel marked as read");
    Ok(withdrawn)
}

/// Clears the open flag on one channel, or on every channel the user has open.
/// Returns the channels that changed.
pub async fn mark_closed(
    ctx: &EngineContext,
    user_id: UserId,
    channel_id: Option<ChannelId>,
) -> Result<Vec<ChannelId>, ApiError> {
    let channels = match channel_id {
        Some(channel_id) => vec![channel_id],
        None => ctx
            .storage
            .opened_channels(user_id)
            .await
            .map_err(internal)?,
    };

    let mut closed = Vec::new();
    for channel_id in channels {
        let _guard = ctx.locks.lock(channel_id).await;
        if ctx
            .storage
            .mark_closed(channel_id, user_id, Utc::now())
            .await
            .map_err(internal)?
        {
            if let Some(membership) = ctx
                .storage
                .get_membership(channel_id, user_id)
                .await
                .map_err(internal)?
            {
                notify_read_state(ctx, &membership);
            }
            closed.push(channel_id);
        }
    }
    Ok(closed)
}

/// Tells every device of the member what its counters are now.
pub(crate) fn notify_read_state(ctx: &EngineContext, membership: &MembershipRecord) {
    ctx.dispatcher.to_users(
        membership.channel_id,
        vec![membership.user_id],
        ServerEvent::ReadStateUpdated {
            channel_id: membership.channel_id,
            msg_count: membership.msg_count,
            unread_msg_count: membership.unread_msg_count,
            mention_count: membership.mention_count,
            last_viewed_at: membership.last_viewed_at,
            opened: membership.opened,
        },
    );
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
