#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use engine::{
    membership, ConnectionRegistry, DependencyError, EngineConfig, EngineContext,
    ModerationProvider, PushNotification, PushProvider, ScanResult, Transport,
};
use shared::{
    domain::{ChannelId, SocketId, UserId, Verdict},
    protocol::ServerEvent,
};
use storage::Storage;

/// Records what each socket would have received.
#[derive(Default)]
pub struct Hub {
    rooms: Mutex<HashMap<ChannelId, HashSet<SocketId>>>,
    sockets: Mutex<HashMap<UserId, Vec<SocketId>>>,
    inbox: Mutex<HashMap<SocketId, Vec<ServerEvent>>>,
}

impl Hub {
    pub fn connect(&self, user_id: UserId) -> SocketId {
        let socket = SocketId::new();
        self.sockets
            .lock()
            .expect("sockets")
            .entry(user_id)
            .or_default()
            .push(socket);
        socket
    }

    pub fn inbox(&self, socket: SocketId) -> Vec<ServerEvent> {
        self.inbox
            .lock()
            .expect("inbox")
            .get(&socket)
            .cloned()
            .unwrap_or_default()
    }

    fn deliver(&self, sockets: impl IntoIterator<Item = SocketId>, event: &ServerEvent) {
        let mut inbox = self.inbox.lock().expect("inbox");
        for socket in sockets {
            inbox.entry(socket).or_default().push(event.clone());
        }
    }
}

#[async_trait]
impl Transport for Hub {
    async fn emit_to_room(
        &self,
        channel_id: ChannelId,
        event: &ServerEvent,
    ) -> Result<(), DependencyError> {
        let members: Vec<SocketId> = self
            .rooms
            .lock()
            .expect("rooms")
            .get(&channel_id)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        self.deliver(members, event);
        Ok(())
    }

    async fn emit_to_sockets(
        &self,
        sockets: &[SocketId],
        event: &ServerEvent,
    ) -> Result<(), DependencyError> {
        self.deliver(sockets.iter().copied(), event);
        Ok(())
    }

    async fn join_room(
        &self,
        channel_id: ChannelId,
        sockets: &[SocketId],
    ) -> Result<(), DependencyError> {
        self.rooms
            .lock()
            .expect("rooms")
            .entry(channel_id)
            .or_default()
            .extend(sockets.iter().copied());
        Ok(())
    }

    async fn leave_room(
        &self,
        channel_id: ChannelId,
        sockets: &[SocketId],
    ) -> Result<(), DependencyError> {
        if let Some(room) = self.rooms.lock().expect("rooms").get_mut(&channel_id) {
            for socket in sockets {
                room.remove(socket);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionRegistry for Hub {
    async fn sockets_for_users(
        &self,
        user_ids: &[UserId],
    ) -> Result<Vec<SocketId>, DependencyError> {
        let sockets = self.sockets.lock().expect("sockets");
        Ok(user_ids
            .iter()
            .filter_map(|u| sockets.get(u))
            .flatten()
            .copied()
            .collect())
    }
}

/// Blocks any content containing one of the scripted words. Scans wait while
/// a test holds `gate` for writing.
#[derive(Default)]
pub struct WordScanner {
    blocked: Mutex<Vec<(String, String)>>,
    pub gate: tokio::sync::RwLock<()>,
}

impl WordScanner {
    pub fn block(&self, word: &str, category: &str) {
        self.blocked
            .lock()
            .expect("blocked")
            .push((word.to_string(), category.to_string()));
    }
}

#[async_trait]
impl ModerationProvider for WordScanner {
    async fn scan(&self, content: &str) -> Result<ScanResult, DependencyError> {
        let _open = self.gate.read().await;
        let blocked = self.blocked.lock().expect("blocked");
        Ok(blocked
            .iter()
            .find(|(word, _)| content.contains(word.as_str()))
            .map(|(_, category)| ScanResult {
                verdict: Verdict::Block,
                category: category.clone(),
            })
            .unwrap_or(ScanResult {
                verdict: Verdict::Pass,
                category: "normal".into(),
            }))
    }
}

/// Push gateway that can be switched off.
#[derive(Default)]
pub struct Gateway {
    pub down: AtomicBool,
    pub delivered: Mutex<Vec<PushNotification>>,
}

#[async_trait]
impl PushProvider for Gateway {
    async fn push(&self, notification: &PushNotification) -> Result<(), DependencyError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DependencyError::Push("gateway unavailable".into()));
        }
        self.delivered
            .lock()
            .expect("delivered")
            .push(notification.clone());
        Ok(())
    }
}

pub struct World {
    pub ctx: EngineContext,
    pub hub: Arc<Hub>,
    pub scanner: Arc<WordScanner>,
    pub gateway: Arc<Gateway>,
}

pub async fn world() -> World {
    world_with(EngineConfig {
        retry_base_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    })
    .await
}

pub async fn world_with(config: EngineConfig) -> World {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let hub = Arc::new(Hub::default());
    let scanner = Arc::new(WordScanner::default());
    let gateway = Arc::new(Gateway::default());
    let ctx = EngineContext::new(
        storage,
        config,
        hub.clone(),
        hub.clone(),
        scanner.clone(),
        gateway.clone(),
    );
    World {
        ctx,
        hub,
        scanner,
        gateway,
    }
}

impl World {
    pub async fn user(&self, name: &str) -> UserId {
        self.ctx
            .storage
            .create_user(name, name)
            .await
            .expect("user")
    }

    pub async fn connect(&self, user_id: UserId) -> SocketId {
        let socket = self.hub.connect(user_id);
        membership::attach_socket(&self.ctx, user_id, socket)
            .await
            .expect("attach");
        socket
    }

    pub async fn unread(&self, channel_id: ChannelId, user_id: UserId) -> i64 {
        self.ctx
            .storage
            .get_membership(channel_id, user_id)
            .await
            .expect("db")
            .expect("membership")
            .unread_msg_count
    }
}
