use async_trait::async_trait;
use shared::domain::{ChannelId, ChannelKind, MessageId, UserId};
use storage::{ChannelRecord, UserRecord};
use tracing::debug;

use crate::{background::retry, error::DependencyError, EngineContext};

/// Out-of-band notification for devices that are not looking at the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub user_ids: Vec<UserId>,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn push(&self, notification: &PushNotification) -> Result<(), DependencyError>;
}

/// Best effort. Failures end up in the background supervisor's log only.
pub(crate) fn spawn_push(
    ctx: &EngineContext,
    channel: &ChannelRecord,
    message_id: MessageId,
    sender: &UserRecord,
    body: String,
) {
    let engine = ctx.clone();
    let channel_id = channel.channel_id;
    let sender_id = sender.user_id;
    let title = match channel.kind {
        ChannelKind::Direct => sender.nickname.clone(),
        ChannelKind::Group => channel.name.clone(),
    };

    ctx.tasks.spawn("push", async move {
        let user_ids = engine
            .storage
            .push_targets(channel_id, sender_id)
            .await
            .map_err(DependencyError::storage)?;
        if user_ids.is_empty() {
            return Ok(());
        }
        let notification = PushNotification {
            user_ids,
            channel_id,
            message_id,
            title,
            body,
        };
        let provider = engine.push.clone();
        retry(
            "push",
            engine.config.push_retry_attempts,
            engine.config.retry_base_delay,
            || {
                let provider = provider.clone();
                let notification = notification.clone();
                async move { provider.push(&notification).await }
            },
        )
        .await?;
        debug!(
            %channel_id,
            %message_id,
            targets = notification.user_ids.len(),
            "push delivered"
        );
        Ok(())
    });
}
