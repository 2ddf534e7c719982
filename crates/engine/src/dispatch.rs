use std::sync::Arc;

use shared::{
    domain::{ChannelId, SocketId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    error::DependencyError,
    transport::{ConnectionRegistry, Transport},
    Diagnostics,
};

/// What to do with an event once its turn comes.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Every socket subscribed to the channel.
    Room(ServerEvent),
    /// Every connected device of the given users.
    Users {
        user_ids: Vec<UserId>,
        event: ServerEvent,
    },
    /// Subscribe the users' connected devices to the channel room.
    Join { user_ids: Vec<UserId> },
    /// Unsubscribe the users' connected devices from the channel room.
    Leave { user_ids: Vec<UserId> },
    /// Subscribe specific sockets, e.g. one that just connected.
    JoinSockets { socket_ids: Vec<SocketId> },
}

enum ShardMessage {
    Deliver {
        channel_id: ChannelId,
        delivery: Delivery,
    },
    Flush(oneshot::Sender<()>),
}

/// Fans events out to the transport. Each channel is pinned to one FIFO shard
/// worker, so a socket sees one channel's events in the order they were
/// enqueued. Shards run independently of each other.
#[derive(Clone)]
pub struct Dispatcher {
    shards: Arc<Vec<mpsc::UnboundedSender<ShardMessage>>>,
}

impl Dispatcher {
    pub fn new(
        shard_count: usize,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ConnectionRegistry>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_shard(
                shard,
                rx,
                transport.clone(),
                registry.clone(),
                diagnostics.clone(),
            ));
            shards.push(tx);
        }
        Self {
            shards: Arc::new(shards),
        }
    }

    pub fn to_room(&self, channel_id: ChannelId, event: ServerEvent) {
        self.enqueue(channel_id, Delivery::Room(event));
    }

    pub fn to_users(&self, channel_id: ChannelId, user_ids: Vec<UserId>, event: ServerEvent) {
        if user_ids.is_empty() {
            return;
        }
        self.enqueue(channel_id, Delivery::Users { user_ids, event });
    }

    pub fn join(&self, channel_id: ChannelId, user_ids: Vec<UserId>) {
        if user_ids.is_empty() {
            return;
        }
        self.enqueue(channel_id, Delivery::Join { user_ids });
    }

    pub fn leave(&self, channel_id: ChannelId, user_ids: Vec<UserId>) {
        if user_ids.is_empty() {
            return;
        }
        self.enqueue(channel_id, Delivery::Leave { user_ids });
    }

    pub fn join_sockets(&self, channel_id: ChannelId, socket_ids: Vec<SocketId>) {
        if socket_ids.is_empty() {
            return;
        }
        self.enqueue(channel_id, Delivery::JoinSockets { socket_ids });
    }

    pub fn enqueue(&self, channel_id: ChannelId, delivery: Delivery) {
        let shard = self.shard_for(channel_id);
        if self.shards[shard]
            .send(ShardMessage::Deliver {
                channel_id,
                delivery,
            })
            .is_err()
        {
            warn!(%channel_id, shard, "dispatch shard is gone; event dropped");
        }
    }

    /// Resolves once everything enqueued before the call has been delivered.
    pub async fn flush(&self) {
        let mut pending = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            let (tx, rx) = oneshot::channel();
            if shard.send(ShardMessage::Flush(tx)).is_ok() {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
    }

    fn shard_for(&self, channel_id: ChannelId) -> usize {
        channel_id.0.rem_euclid(self.shards.len() as i64) as usize
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::UnboundedReceiver<ShardMessage>,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ConnectionRegistry>,
    diagnostics: Arc<Diagnostics>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            ShardMessage::Deliver {
                channel_id,
                delivery,
            } => {
                if let Err(error) =
                    deliver(transport.as_ref(), registry.as_ref(), channel_id, delivery).await
                {
                    diagnostics.record_dependency_failure();
                    warn!(%channel_id, shard, %error, "event delivery failed");
                }
            }
            ShardMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(shard, "dispatch shard stopped");
}

async fn deliver(
    transport: &dyn Transport,
    registry: &dyn ConnectionRegistry,
    channel_id: ChannelId,
    delivery: Delivery,
) -> Result<(), DependencyError> {
    match delivery {
        Delivery::Room(event) => transport.emit_to_room(channel_id, &event).await,
        Delivery::Users { user_ids, event } => {
            let sockets = registry.sockets_for_users(&user_ids).await?;
            if sockets.is_empty() {
                return Ok(());
            }
            transport.emit_to_sockets(&sockets, &event).await
        }
        Delivery::Join { user_ids } => {
            let sockets = registry.sockets_for_users(&user_ids).await?;
            if sockets.is_empty() {
                return Ok(());
            }
            transport.join_room(channel_id, &sockets).await
        }
        Delivery::Leave { user_ids } => {
            let sockets = registry.sockets_for_users(&user_ids).await?;
            if sockets.is_empty() {
                return Ok(());
            }
            transport.leave_room(channel_id, &sockets).await
        }
        Delivery::JoinSockets { socket_ids } => transport.join_room(channel_id, &socket_ids).await,
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
