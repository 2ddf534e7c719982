use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use engine::{
    membership::{self, MemberPreferences},
    messaging::{self, SendRequest},
    moderation, read_state,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        ChannelId, ChannelStatus, JoinVia, MessageId, ModerationStatus, Role, SocketId, UserId,
        UserState, Verdict,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelAttrs, ChannelListing, ClientRequest, MemberSummary, MembershipState, MessageBody,
        MessagePayload, SendResult, ServerEvent,
    },
};
use storage::ChannelSettingsPatch;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

type Rejection = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<Json<T>, Rejection>;

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::LimitExceeded => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> Rejection {
    (status_for(error.code), Json(error))
}

fn internal(error: anyhow::Error) -> Rejection {
    reject(ApiError::new(ErrorCode::Internal, error.to_string()))
}

pub(crate) fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(create_user))
        .route("/users/:user_id", post(update_user))
        .route("/channels", get(http_list_channels))
        .route("/channels/direct", post(http_create_direct))
        .route("/channels/group", post(http_create_group))
        .route(
            "/channels/:channel_id/members",
            get(http_list_members).post(http_add_members),
        )
        .route("/channels/:channel_id/members/remove", post(http_remove_members))
        .route("/channels/:channel_id/roles", post(http_set_role))
        .route("/channels/:channel_id/bans", post(http_ban_members))
        .route("/channels/:channel_id/settings", post(http_update_settings))
        .route("/channels/:channel_id/preferences", post(http_set_preferences))
        .route(
            "/channels/:channel_id/messages",
            get(http_get_range).post(http_send_message),
        )
        .route(
            "/channels/:channel_id/messages/:message_id/withdraw",
            post(http_withdraw),
        )
        .route("/channels/:channel_id/read", post(http_mark_read))
        .route("/channels/:channel_id/close", post(http_mark_closed))
        .route("/moderation/verdicts", post(http_apply_verdict))
        .route("/admin/messages", get(http_list_flagged))
        .route("/admin/messages/:message_id", delete(http_delete_message))
        .route("/admin/messages/:message_id/audit", post(http_audit_message))
        .route("/admin/channels/:channel_id", delete(http_remove_channel))
        .route("/admin/channels/:channel_id/status", post(http_set_channel_status))
        .route("/admin/channels/:channel_id/recount", post(http_recount_members))
        .route("/admin/users/:user_id/state", post(http_set_user_state))
        .route("/admin/diagnostics", get(http_diagnostics))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateUserResponse {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    push_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CreateDirectRequest {
    user_id: UserId,
    peer_id: UserId,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    user_id: UserId,
    #[serde(default)]
    member_ids: Vec<UserId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    member_count_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AddMembersRequest {
    user_id: UserId,
    member_ids: Vec<UserId>,
    #[serde(default)]
    via: JoinVia,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddMembersResponse {
    added: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct MembersRequest {
    user_id: UserId,
    member_ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct SetRoleRequest {
    user_id: UserId,
    member_ids: Vec<UserId>,
    role: Role,
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    user_id: UserId,
    member_ids: Vec<UserId>,
    banned: bool,
}

#[derive(Debug, Deserialize)]
struct SettingsRequest {
    user_id: UserId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    owner_invite_only: Option<bool>,
    #[serde(default)]
    banned: Option<bool>,
    #[serde(default)]
    member_masked: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PreferencesRequest {
    user_id: UserId,
    #[serde(default)]
    muted: Option<bool>,
    #[serde(default)]
    blacklisted: Option<bool>,
    #[serde(default)]
    remark_nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    user_id: UserId,
    cid: String,
    body: MessageBody,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    user_id: i64,
    seq_start: i64,
    seq_end: i64,
}

#[derive(Debug, Deserialize)]
struct ActorRequest {
    user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkReadResponse {
    withdrawn_message_ids: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct VerdictRequest {
    cid: String,
    verdict: Verdict,
    category: String,
}

#[derive(Debug, Deserialize)]
struct FlaggedQuery {
    status: ModerationStatus,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AuditRequest {
    status: ModerationStatus,
}

#[derive(Debug, Deserialize)]
struct ChannelStatusRequest {
    status: ChannelStatus,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecountResponse {
    member_count: i64,
}

#[derive(Debug, Deserialize)]
struct UserStateRequest {
    state: UserState,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiagnosticsResponse {
    counter_underflows: u64,
    seq_collisions: u64,
    dependency_failures: u64,
    background_tasks: usize,
    connections: usize,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, Rejection> {
    state
        .engine
        .storage
        .health_check()
        .await
        .map_err(internal)?;
    Ok("ok")
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<CreateUserResponse> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::validation("username cannot be empty")));
    }
    let nickname = req
        .nickname
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(username);
    let user_id = state
        .engine
        .storage
        .create_user(username, nickname)
        .await
        .map_err(internal)?;
    info!(%user_id, username, "user created");
    Ok(Json(CreateUserResponse { user_id }))
}

async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<StatusCode, Rejection> {
    let user_id = UserId(user_id);
    let storage = &state.engine.storage;
    storage
        .get_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| reject(ApiError::not_found("user not found")))?;
    if let Some(avatar) = req.avatar.as_deref() {
        storage
            .set_user_avatar(user_id, avatar.trim())
            .await
            .map_err(internal)?;
    }
    if let Some(enabled) = req.push_enabled {
        storage
            .set_push_enabled(user_id, enabled)
            .await
            .map_err(internal)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_channels(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Vec<ChannelListing>> {
    let channels = membership::list_channels(&state.engine, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(channels))
}

async fn http_create_direct(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDirectRequest>,
) -> ApiResult<ChannelListing> {
    let listing = membership::create_direct(&state.engine, req.user_id, req.peer_id)
        .await
        .map_err(reject)?;
    Ok(Json(listing))
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<ChannelListing> {
    let listing = membership::create_group(
        &state.engine,
        req.user_id,
        &req.member_ids,
        req.name.as_deref(),
        req.member_count_limit,
    )
    .await
    .map_err(reject)?;
    Ok(Json(listing))
}

async fn http_list_members(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Vec<MemberSummary>> {
    let members = membership::list_members(&state.engine, ChannelId(channel_id), UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(members))
}

async fn http_add_members(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<AddMembersRequest>,
) -> ApiResult<AddMembersResponse> {
    let added = membership::add_members(
        &state.engine,
        ChannelId(channel_id),
        req.user_id,
        &req.member_ids,
        req.via,
    )
    .await
    .map_err(reject)?;
    Ok(Json(AddMembersResponse { added }))
}

async fn http_remove_members(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<MembersRequest>,
) -> Result<StatusCode, Rejection> {
    membership::remove_members(
        &state.engine,
        ChannelId(channel_id),
        req.user_id,
        &req.member_ids,
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_set_role(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<SetRoleRequest>,
) -> Result<StatusCode, Rejection> {
    membership::set_role(
        &state.engine,
        ChannelId(channel_id),
        req.user_id,
        &req.member_ids,
        req.role,
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_ban_members(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<BanRequest>,
) -> Result<StatusCode, Rejection> {
    membership::ban_members(
        &state.engine,
        ChannelId(channel_id),
        req.user_id,
        &req.member_ids,
        req.banned,
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_update_settings(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<SettingsRequest>,
) -> ApiResult<ChannelAttrs> {
    let patch = ChannelSettingsPatch {
        name: req.name,
        owner_invite_only: req.owner_invite_only,
        banned: req.banned,
        member_masked: req.member_masked,
    };
    let attrs = membership::update_settings(&state.engine, ChannelId(channel_id), req.user_id, patch)
        .await
        .map_err(reject)?;
    Ok(Json(attrs))
}

async fn http_set_preferences(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<PreferencesRequest>,
) -> ApiResult<MembershipState> {
    let preferences = MemberPreferences {
        muted: req.muted,
        blacklisted: req.blacklisted,
        remark_nickname: req.remark_nickname,
    };
    let membership = membership::set_member_preferences(
        &state.engine,
        ChannelId(channel_id),
        req.user_id,
        preferences,
    )
    .await
    .map_err(reject)?;
    Ok(Json(membership))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<SendResult> {
    let result = messaging::send(
        &state.engine,
        SendRequest {
            channel_id: ChannelId(channel_id),
            sender_id: req.user_id,
            cid: req.cid,
            body: req.body,
        },
    )
    .await
    .map_err(reject)?;
    Ok(Json(result))
}

async fn http_get_range(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Query(q): Query<RangeQuery>,
) -> ApiResult<Vec<MessagePayload>> {
    let messages = messaging::get_range(
        &state.engine,
        ChannelId(channel_id),
        UserId(q.user_id),
        q.seq_start,
        q.seq_end,
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_withdraw(
    State(state): State<Arc<AppState>>,
    Path((channel_id, message_id)): Path<(i64, i64)>,
    Json(req): Json<ActorRequest>,
) -> Result<StatusCode, Rejection> {
    messaging::withdraw(
        &state.engine,
        ChannelId(channel_id),
        req.user_id,
        MessageId(message_id),
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<ActorRequest>,
) -> ApiResult<MarkReadResponse> {
    let withdrawn_message_ids =
        read_state::mark_as_read(&state.engine, ChannelId(channel_id), req.user_id)
            .await
            .map_err(reject)?;
    Ok(Json(MarkReadResponse {
        withdrawn_message_ids,
    }))
}

async fn http_mark_closed(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<ActorRequest>,
) -> Result<StatusCode, Rejection> {
    read_state::mark_closed(&state.engine, req.user_id, Some(ChannelId(channel_id)))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_apply_verdict(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerdictRequest>,
) -> Result<StatusCode, Rejection> {
    moderation::apply_moderation_verdict(&state.engine, &req.cid, req.verdict, &req.category)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_flagged(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FlaggedQuery>,
) -> ApiResult<Vec<MessagePayload>> {
    let messages = moderation::list_flagged(&state.engine, q.status, q.limit.unwrap_or(100))
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_audit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<AuditRequest>,
) -> Result<StatusCode, Rejection> {
    moderation::audit_message(&state.engine, MessageId(message_id), req.status)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
) -> Result<StatusCode, Rejection> {
    messaging::delete_message(&state.engine, MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
) -> Result<StatusCode, Rejection> {
    membership::remove_channel(&state.engine, ChannelId(channel_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_set_channel_status(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    Json(req): Json<ChannelStatusRequest>,
) -> Result<StatusCode, Rejection> {
    membership::set_channel_status(&state.engine, ChannelId(channel_id), req.status)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_recount_members(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
) -> ApiResult<RecountResponse> {
    let member_count = membership::recount_members(&state.engine, ChannelId(channel_id))
        .await
        .map_err(reject)?;
    Ok(Json(RecountResponse { member_count }))
}

async fn http_set_user_state(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<UserStateRequest>,
) -> Result<StatusCode, Rejection> {
    let user_id = UserId(user_id);
    let storage = &state.engine.storage;
    storage
        .get_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| reject(ApiError::not_found("user not found")))?;
    storage
        .set_user_state(user_id, req.state)
        .await
        .map_err(internal)?;
    info!(%user_id, state = ?req.state, "user state changed");
    Ok(StatusCode::NO_CONTENT)
}

async fn http_diagnostics(State(state): State<Arc<AppState>>) -> Json<DiagnosticsResponse> {
    let diagnostics = &state.engine.diagnostics;
    Json(DiagnosticsResponse {
        counter_underflows: diagnostics.counter_underflows(),
        seq_collisions: diagnostics.seq_collisions(),
        dependency_failures: diagnostics.dependency_failures(),
        background_tasks: state.engine.tasks.in_flight(),
        connections: state.hub.connection_count().await,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (socket_id, mut outbound) = state.hub.register(user_id).await;
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    match membership::attach_socket(&state.engine, user_id, socket_id).await {
        Ok(channels) => debug!(%user_id, %socket_id, channels = channels.len(), "socket attached"),
        Err(error) => {
            warn!(%user_id, %socket_id, reason = %error.message, "socket rejected");
            state.hub.send_to(socket_id, ServerEvent::Error(error)).await;
            disconnect(&state, user_id, socket_id).await;
            let _ = send_task.await;
            return;
        }
    }

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => handle_request(&state, user_id, request).await,
            Err(error) => Some(ServerEvent::Error(ApiError::validation(format!(
                "malformed request: {error}"
            )))),
        };
        if let Some(reply) = reply {
            state.hub.send_to(socket_id, reply).await;
        }
    }

    disconnect(&state, user_id, socket_id).await;
    send_task.abort();
}

/// Removes the socket; the user's channels are closed once their last device is gone.
pub(crate) async fn disconnect(state: &AppState, user_id: UserId, socket_id: SocketId) {
    if state.hub.unregister(socket_id).await {
        if let Err(error) = read_state::mark_closed(&state.engine, user_id, None).await {
            warn!(%user_id, reason = %error.message, "failed to close channels on disconnect");
        }
    }
}

/// Runs one socket request. The reply goes back to the requesting socket only;
/// room events are delivered by the engine.
pub(crate) async fn handle_request(
    state: &AppState,
    user_id: UserId,
    request: ClientRequest,
) -> Option<ServerEvent> {
    let engine = &state.engine;
    let outcome = match request {
        ClientRequest::SendMessage {
            channel_id,
            cid,
            body,
        } => messaging::send(
            engine,
            SendRequest {
                channel_id,
                sender_id: user_id,
                cid: cid.clone(),
                body,
            },
        )
        .await
        .map(|result| Some(ServerEvent::MessageAccepted { cid, result })),
        ClientRequest::OpenChannel { channel_id } => {
            read_state::mark_as_read(engine, channel_id, user_id)
                .await
                .map(|withdrawn_message_ids| {
                    Some(ServerEvent::ChannelOpened {
                        channel_id,
                        withdrawn_message_ids,
                    })
                })
        }
        ClientRequest::CloseChannel { channel_id } => {
            read_state::mark_closed(engine, user_id, channel_id)
                .await
                .map(|_| None)
        }
        ClientRequest::WithdrawMessage {
            channel_id,
            message_id,
        } => messaging::withdraw(engine, channel_id, user_id, message_id)
            .await
            .map(|()| None),
        ClientRequest::FetchRange {
            channel_id,
            seq_start,
            seq_end,
        } => messaging::get_range(engine, channel_id, user_id, seq_start, seq_end)
            .await
            .map(|messages| {
                Some(ServerEvent::MessageRange {
                    channel_id,
                    messages,
                })
            }),
    };
    outcome.unwrap_or_else(|error| Some(ServerEvent::Error(error)))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
