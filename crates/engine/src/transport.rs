use async_trait::async_trait;
use shared::{
    domain::{ChannelId, SocketId, UserId},
    protocol::ServerEvent,
};

use crate::error::DependencyError;

/// Delivery side of the real-time layer. A room is the set of sockets
/// subscribed to one channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn emit_to_room(
        &self,
        channel_id: ChannelId,
        event: &ServerEvent,
    ) -> Result<(), DependencyError>;

    async fn emit_to_sockets(
        &self,
        sockets: &[SocketId],
        event: &ServerEvent,
    ) -> Result<(), DependencyError>;

    async fn join_room(
        &self,
        channel_id: ChannelId,
        sockets: &[SocketId],
    ) -> Result<(), DependencyError>;

    async fn leave_room(
        &self,
        channel_id: ChannelId,
        sockets: &[SocketId],
    ) -> Result<(), DependencyError>;
}

/// Which sockets each user currently has open.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn sockets_for_users(&self, user_ids: &[UserId])
        -> Result<Vec<SocketId>, DependencyError>;
}
