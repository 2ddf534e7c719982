use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, SocketId, UserId, Verdict},
    protocol::{MessageBody, SendResult, ServerEvent},
};
use storage::Storage;

use crate::{
    membership,
    messaging::{self, SendRequest},
    DependencyError, EngineConfig, EngineContext, ModerationProvider, PushNotification,
    PushProvider, ScanResult, Transport,
};

#[derive(Debug, Clone)]
pub struct Emitted {
    pub room: Option<ChannelId>,
    pub sockets: Vec<SocketId>,
    pub event: ServerEvent,
}

#[derive(Default)]
pub struct RecordingTransport {
    pub emitted: Mutex<Vec<Emitted>>,
    pub rooms: Mutex<HashMap<ChannelId, HashSet<SocketId>>>,
    pub failing: AtomicBool,
}

impl RecordingTransport {
    pub fn received(&self, socket: SocketId) -> Vec<ServerEvent> {
        self.emitted
            .lock()
            .expect("emitted")
            .iter()
            .filter(|e| e.sockets.contains(&socket))
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn in_room(&self, channel_id: ChannelId, socket: SocketId) -> bool {
        self.rooms
            .lock()
            .expect("rooms")
            .get(&channel_id)
            .is_some_and(|r| r.contains(&socket))
    }

    fn check(&self) -> Result<(), DependencyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DependencyError::Transport("socket layer down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn emit_to_room(
        &self,
        channel_id: ChannelId,
        event: &ServerEvent,
    ) -> Result<(), DependencyError> {
        self.check()?;
        let sockets = self
            .rooms
            .lock()
            .expect("rooms")
            .get(&channel_id)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        self.emitted.lock().expect("emitted").push(Emitted {
            room: Some(channel_id),
            sockets,
            event: event.clone(),
        });
        Ok(())
    }

    async fn emit_to_sockets(
        &self,
        sockets: &[SocketId],
        event: &ServerEvent,
    ) -> Result<(), DependencyError> {
        self.check()?;
        self.emitted.lock().expect("emitted").push(Emitted {
            room: None,
            sockets: sockets.to_vec(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn join_room(
        &self,
        channel_id: ChannelId,
        sockets: &[SocketId],
    ) -> Result<(), DependencyError> {
        self.check()?;
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
        self.check()?;
        if let Some(room) = self.rooms.lock().expect("rooms").get_mut(&channel_id) {
            for socket in sockets {
                room.remove(socket);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct Sessions {
    sockets: Mutex<HashMap<UserId, Vec<SocketId>>>,
}

impl Sessions {
    pub fn connect(&self, user_id: UserId) -> SocketId {
        let socket = SocketId::new();
        self.sockets
            .lock()
            .expect("sessions")
            .entry(user_id)
            .or_default()
            .push(socket);
        socket
    }
}

#[async_trait]
impl crate::ConnectionRegistry for Sessions {
    async fn sockets_for_users(
        &self,
        user_ids: &[UserId],
    ) -> Result<Vec<SocketId>, DependencyError> {
        let sockets = self.sockets.lock().expect("sessions");
        Ok(user_ids
            .iter()
            .filter_map(|u| sockets.get(u))
            .flatten()
            .copied()
            .collect())
    }
}

/// Passes everything unless a verdict was scripted for the exact content.
#[derive(Default)]
pub struct ScriptedScanner {
    script: Mutex<HashMap<String, ScanResult>>,
    pub unavailable: AtomicBool,
    pub calls: AtomicU64,
}

impl ScriptedScanner {
    pub fn script(&self, content: &str, verdict: Verdict, category: &str) {
        self.script.lock().expect("script").insert(
            content.to_string(),
            ScanResult {
                verdict,
                category: category.to_string(),
            },
        );
    }
}

#[async_trait]
impl ModerationProvider for ScriptedScanner {
    async fn scan(&self, content: &str) -> Result<ScanResult, DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DependencyError::Moderation("scanner unreachable".into()));
        }
        Ok(self
            .script
            .lock()
            .expect("script")
            .get(content)
            .cloned()
            .unwrap_or(ScanResult {
                verdict: Verdict::Pass,
                category: "normal".into(),
            }))
    }
}

#[derive(Default)]
pub struct RecordingPush {
    pub sent: Mutex<Vec<PushNotification>>,
    pub failing: AtomicBool,
    pub attempts: AtomicU64,
}

#[async_trait]
impl PushProvider for RecordingPush {
    async fn push(&self, notification: &PushNotification) -> Result<(), DependencyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DependencyError::Push("vendor gateway timeout".into()));
        }
        self.sent.lock().expect("push").push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    pub ctx: EngineContext,
    pub transport: Arc<RecordingTransport>,
    pub sessions: Arc<Sessions>,
    pub scanner: Arc<ScriptedScanner>,
    pub push: Arc<RecordingPush>,
    next_cid: AtomicU64,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry_base_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let transport = Arc::new(RecordingTransport::default());
    let sessions = Arc::new(Sessions::default());
    let scanner = Arc::new(ScriptedScanner::default());
    let push = Arc::new(RecordingPush::default());
    let ctx = EngineContext::new(
        storage,
        config,
        transport.clone(),
        sessions.clone(),
        scanner.clone(),
        push.clone(),
    );
    Harness {
        ctx,
        transport,
        sessions,
        scanner,
        push,
        next_cid: AtomicU64::new(1),
    }
}

impl Harness {
    pub async fn user(&self, name: &str) -> UserId {
        self.ctx
            .storage
            .create_user(name, name)
            .await
            .expect("user")
    }

    pub async fn connect(&self, user_id: UserId) -> SocketId {
        let socket = self.sessions.connect(user_id);
        membership::attach_socket(&self.ctx, user_id, socket)
            .await
            .expect("attach");
        socket
    }

    pub async fn group(&self, owner: UserId, members: &[UserId]) -> ChannelId {
        membership::create_group(&self.ctx, owner, members, Some("team"), None)
            .await
            .expect("group")
            .channel
            .channel_id
    }

    pub fn cid(&self) -> String {
        format!("cid-{}", self.next_cid.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn text(&self, channel_id: ChannelId, sender_id: UserId, content: &str) -> SendResult {
        messaging::send(
            &self.ctx,
            SendRequest {
                channel_id,
                sender_id,
                cid: self.cid(),
                body: MessageBody::Text {
                    content: content.to_string(),
                    mentions: Vec::new(),
                },
            },
        )
        .await
        .expect("send")
    }

    pub async fn settle(&self) {
        self.ctx.settle().await;
    }
}
