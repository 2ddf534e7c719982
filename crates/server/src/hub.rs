use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use engine::{ConnectionRegistry, DependencyError, Transport};
use shared::{
    domain::{ChannelId, SocketId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Sockets connected to this process and the channel rooms they sit in.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    /// socket -> (owner, outbound queue)
    sockets: RwLock<HashMap<SocketId, (UserId, mpsc::UnboundedSender<ServerEvent>)>>,
    rooms: RwLock<HashMap<ChannelId, HashSet<SocketId>>>,
}

impl LocalHub {
    pub async fn register(&self, user_id: UserId) -> (SocketId, mpsc::UnboundedReceiver<ServerEvent>) {
        let socket_id = SocketId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .sockets
            .write()
            .await
            .insert(socket_id, (user_id, tx));
        (socket_id, rx)
    }

    /// Drops the socket from every room. Returns true when it was the user's
    /// last connection.
    pub async fn unregister(&self, socket_id: SocketId) -> bool {
        let removed = self.inner.sockets.write().await.remove(&socket_id);
        {
            let mut rooms = self.inner.rooms.write().await;
            for members in rooms.values_mut() {
                members.remove(&socket_id);
            }
            rooms.retain(|_, members| !members.is_empty());
        }
        let Some((user_id, _)) = removed else {
            return false;
        };
        !self
            .inner
            .sockets
            .read()
            .await
            .values()
            .any(|(owner, _)| *owner == user_id)
    }

    /// Replies to one socket outside of any room.
    pub async fn send_to(&self, socket_id: SocketId, event: ServerEvent) {
        if let Some((_, tx)) = self.inner.sockets.read().await.get(&socket_id) {
            let _ = tx.send(event);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.sockets.read().await.len()
    }

    async fn deliver(&self, targets: impl IntoIterator<Item = SocketId>, event: &ServerEvent) {
        let sockets = self.inner.sockets.read().await;
        for socket_id in targets {
            match sockets.get(&socket_id) {
                Some((_, tx)) => {
                    if tx.send(event.clone()).is_err() {
                        debug!(%socket_id, "socket closed before delivery");
                    }
                }
                None => debug!(%socket_id, "socket unknown to hub"),
            }
        }
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn emit_to_room(
        &self,
        channel_id: ChannelId,
        event: &ServerEvent,
    ) -> Result<(), DependencyError> {
        let members: Vec<SocketId> = self
            .inner
            .rooms
            .read()
            .await
            .get(&channel_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        self.deliver(members, event).await;
        Ok(())
    }

    async fn emit_to_sockets(
        &self,
        sockets: &[SocketId],
        event: &ServerEvent,
    ) -> Result<(), DependencyError> {
        self.deliver(sockets.iter().copied(), event).await;
        Ok(())
    }

    async fn join_room(
        &self,
        channel_id: ChannelId,
        sockets: &[SocketId],
    ) -> Result<(), DependencyError> {
        let known = self.inner.sockets.read().await;
        let mut rooms = self.inner.rooms.write().await;
        let room = rooms.entry(channel_id).or_default();
        room.extend(sockets.iter().copied().filter(|s| known.contains_key(s)));
        Ok(())
    }

    async fn leave_room(
        &self,
        channel_id: ChannelId,
        sockets: &[SocketId],
    ) -> Result<(), DependencyError> {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(room) = rooms.get_mut(&channel_id) {
            for socket_id in sockets {
                room.remove(socket_id);
            }
            if room.is_empty() {
                rooms.remove(&channel_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionRegistry for LocalHub {
    async fn sockets_for_users(
        &self,
        user_ids: &[UserId],
    ) -> Result<Vec<SocketId>, DependencyError> {
        let wanted: HashSet<UserId> = user_ids.iter().copied().collect();
        Ok(self
            .inner
            .sockets
            .read()
            .await
            .iter()
            .filter(|(_, (owner, _))| wanted.contains(owner))
            .map(|(socket_id, _)| *socket_id)
            .collect())
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
