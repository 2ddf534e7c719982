//! Channel and membership registry: creation, joins, leaves, roles, bans,
//! settings and the aggregates (member count, composite avatar) that depend on
//! them. Every mutation runs under the channel lock and ends with the events
//! describing what changed.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use shared::{
    domain::{
        ChannelId, ChannelKind, ChannelStatus, JoinVia, MessageKind, Role, SocketId, UserId,
        UserState,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelAttrs, ChannelListing, ChannelSummary, MemberSummary, MembershipState, ServerEvent,
    },
};
use storage::{
    ChannelRecord, ChannelSettingsPatch, MembershipRecord, NewChannel, NewMember, UserRecord,
};
use tracing::{info, warn};

use crate::{
    after_commit, internal,
    messaging::{announce, load_channel, nickname},
    read_state, EngineContext,
};

pub const MAX_CHANNEL_NAME_CHARS: usize = 16;

/// Per-member preferences. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberPreferences {
    pub muted: Option<bool>,
    pub blacklisted: Option<bool>,
    pub remark_nickname: Option<String>,
}

/// Opens a direct conversation between two users, re-activating the old pairing
/// if there is one. Returns the conversation as `from_id` sees it.
pub async fn create_direct(
    ctx: &EngineContext,
    from_id: UserId,
    to_id: UserId,
) -> Result<ChannelListing, ApiError> {
    if from_id == to_id {
        return Err(ApiError::validation("cannot open a conversation with yourself"));
    }
    require_normal_users(ctx, &[from_id, to_id]).await?;

    if let Some(channel_id) = ctx
        .storage
        .find_direct_channel(from_id, to_id)
        .await
        .map_err(internal)?
    {
        return reopen_direct(ctx, channel_id, from_id, to_id).await;
    }

    let now = Utc::now();
    let created = ctx
        .storage
        .create_channel(
            &NewChannel {
                kind: ChannelKind::Direct,
                name: String::new(),
                owner_id: None,
                creator_id: from_id,
                member_count_limit: 2,
            },
            &[
                NewMember {
                    user_id: from_id,
                    role: Role::Member,
                    friend_id: Some(to_id),
                },
                NewMember {
                    user_id: to_id,
                    role: Role::Member,
                    friend_id: Some(from_id),
                },
            ],
            ctx.config.avatar_mosaic_size,
            now,
        )
        .await;
    let channel_id = match created {
        Ok(channel_id) => channel_id,
        Err(err) => {
            // Lost a race with a concurrent pairing of the same two users.
            let Some(channel_id) = ctx
                .storage
                .find_direct_channel(from_id, to_id)
                .await
                .map_err(internal)?
            else {
                return Err(internal(err));
            };
            return reopen_direct(ctx, channel_id, from_id, to_id).await;
        }
    };

    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_channel(ctx, channel_id).await?;
    let users = [from_id, to_id];
    ctx.dispatcher.join(channel_id, users.to_vec());
    announce_channel(ctx, &channel, &users).await;
    info!(%channel_id, %from_id, %to_id, "direct channel created");
    listing_for(ctx, &channel, from_id).await
}

async fn reopen_direct(
    ctx: &EngineContext,
    channel_id: ChannelId,
    from_id: UserId,
    to_id: UserId,
) -> Result<ChannelListing, ApiError> {
    let _guard = ctx.locks.lock(channel_id).await;
    let before = load_channel(ctx, channel_id).await?;
    let mut rejoined = Vec::new();
    for user_id in [from_id, to_id] {
        let active = ctx
            .storage
            .get_membership(channel_id, user_id)
            .await
            .map_err(internal)?
            .is_some_and(|m| m.is_active());
        if !active {
            rejoined.push(user_id);
        }
    }

    ctx.storage
        .reactivate_direct(
            channel_id,
            [from_id, to_id],
            ctx.config.avatar_mosaic_size,
            Utc::now(),
        )
        .await
        .map_err(internal)?;
    let channel = load_channel(ctx, channel_id).await?;

    if before.status != channel.status {
        ctx.dispatcher.to_room(
            channel_id,
            ServerEvent::ChannelUpdated {
                channel_id,
                attrs: ChannelAttrs {
                    status: Some(channel.status),
                    member_count: Some(channel.member_count),
                    ..ChannelAttrs::default()
                },
            },
        );
    }
    ctx.dispatcher.join(channel_id, rejoined.clone());
    announce_channel(ctx, &channel, &rejoined).await;
    info!(%channel_id, rejoined = rejoined.len(), "direct channel re-opened");
    listing_for(ctx, &channel, from_id).await
}

/// Creates a group owned by `creator_id`. Members that are not in a normal
/// account state are skipped silently.
pub async fn create_group(
    ctx: &EngineContext,
    creator_id: UserId,
    member_ids: &[UserId],
    name: Option<&str>,
    member_count_limit: Option<i64>,
) -> Result<ChannelListing, ApiError> {
    let creator = require_normal_users(ctx, &[creator_id])
        .await?
        .remove(0);
    let requested: Vec<UserId> = unique(member_ids)
        .into_iter()
        .filter(|id| *id != creator_id)
        .collect();
    let mut users = vec![creator];
    users.extend(
        ctx.storage
            .users_by_ids(&requested)
            .await
            .map_err(internal)?
            .into_iter()
            .filter(|u| u.state == UserState::Normal),
    );

    let limit = member_count_limit.unwrap_or(ctx.config.default_member_limit);
    if limit < 1 {
        return Err(ApiError::validation("member count limit must be positive"));
    }
    if users.len() as i64 > limit {
        return Err(ApiError::new(
            ErrorCode::LimitExceeded,
            "channel member count limit reached",
        ));
    }
    let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => validate_name(name)?,
        None => users
            .iter()
            .take(ctx.config.group_name_members)
            .map(|u| u.nickname.as_str())
            .collect::<Vec<_>>()
            .join("、"),
    };

    let members: Vec<NewMember> = users
        .iter()
        .map(|u| NewMember {
            user_id: u.user_id,
            role: if u.user_id == creator_id {
                Role::Owner
            } else {
                Role::Member
            },
            friend_id: None,
        })
        .collect();
    let channel_id = ctx
        .storage
        .create_channel(
            &NewChannel {
                kind: ChannelKind::Group,
                name,
                owner_id: Some(creator_id),
                creator_id,
                member_count_limit: limit,
            },
            &members,
            ctx.config.avatar_mosaic_size,
            Utc::now(),
        )
        .await
        .map_err(internal)?;

    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_channel(ctx, channel_id).await?;
    let user_ids: Vec<UserId> = users.iter().map(|u| u.user_id).collect();
    ctx.dispatcher.join(channel_id, user_ids.clone());
    announce_channel(ctx, &channel, &user_ids).await;
    let invited = names_of(&users[1..]);
    if !invited.is_empty() {
        announce(
            ctx,
            &channel,
            creator_id,
            MessageKind::Join,
            format!("{} invited {invited} to join the group", users[0].nickname),
        )
        .await;
    }
    info!(%channel_id, %creator_id, members = user_ids.len(), "group created");
    listing_for(ctx, &load_channel(ctx, channel_id).await?, creator_id).await
}

/// Adds users to a group. With `JoinVia::Link` the operator may add themselves
/// without being a member; invites and QR codes come from existing members.
pub async fn add_members(
    ctx: &EngineContext,
    channel_id: ChannelId,
    operator_id: UserId,
    user_ids: &[UserId],
    via: JoinVia,
) -> Result<Vec<UserId>, ApiError> {
    let user_ids = unique(user_ids);
    if user_ids.is_empty() {
        return Err(ApiError::validation("no users to add"));
    }
    if user_ids.contains(&operator_id) && via != JoinVia::Link {
        return Err(ApiError::validation("cannot invite yourself"));
    }

    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_live_group(ctx, channel_id).await?;
    if channel.owner_invite_only && (via != JoinVia::Invite || !channel.is_owner(operator_id)) {
        return Err(ApiError::forbidden("only the owner may invite members"));
    }
    if via != JoinVia::Link {
        active_membership(ctx, channel_id, operator_id).await?;
    }

    let users = ctx
        .storage
        .users_by_ids(&user_ids)
        .await
        .map_err(internal)?;
    if users.len() != user_ids.len() {
        return Err(ApiError::not_found("user not found"));
    }
    if users.iter().any(|u| u.state != UserState::Normal) {
        return Err(ApiError::validation("user account is not active"));
    }
    let active: BTreeSet<UserId> = ctx
        .storage
        .active_memberships(channel_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|m| m.user_id)
        .collect();
    if user_ids.iter().any(|id| active.contains(id)) {
        return Err(ApiError::conflict("user is already a member"));
    }
    if channel.member_count + user_ids.len() as i64 > channel.member_count_limit {
        return Err(ApiError::new(
            ErrorCode::LimitExceeded,
            "channel member count limit reached",
        ));
    }

    let (member_count, avatar) = ctx
        .storage
        .add_members(
            channel_id,
            &user_ids,
            Role::Member,
            ctx.config.avatar_mosaic_size,
            Utc::now(),
        )
        .await
        .map_err(internal)?;
    let channel = ChannelRecord {
        member_count,
        avatar: avatar.clone(),
        ..channel
    };

    ctx.dispatcher.join(channel_id, user_ids.clone());
    announce_channel(ctx, &channel, &user_ids).await;
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::MembersAdded {
            channel_id,
            operator_id,
            user_ids: user_ids.clone(),
        },
    );
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::ChannelUpdated {
            channel_id,
            attrs: ChannelAttrs {
                member_count: Some(member_count),
                avatar: Some(avatar),
                ..ChannelAttrs::default()
            },
        },
    );

    let joined = names_of(&users);
    let text = match via {
        JoinVia::Invite => format!("{} invited {joined} to join the group", nickname(ctx, operator_id).await),
        JoinVia::QrCode => format!("{joined} joined the group via a QR code"),
        JoinVia::Link => format!("{joined} joined the group via a link"),
    };
    announce(ctx, &channel, operator_id, MessageKind::Join, text).await;
    info!(%channel_id, %operator_id, added = user_ids.len(), ?via, "members added");
    Ok(user_ids)
}

/// Removes members. Anyone may leave; removing others takes the owner, or a
/// manager acting on plain members. The owner cannot leave while others remain.
pub async fn remove_members(
    ctx: &EngineContext,
    channel_id: ChannelId,
    operator_id: UserId,
    user_ids: &[UserId],
) -> Result<(), ApiError> {
    let user_ids = unique(user_ids);
    if user_ids.is_empty() {
        return Err(ApiError::validation("no users to remove"));
    }

    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_channel(ctx, channel_id).await?;
    if channel.status == ChannelStatus::Deleted {
        return Err(ApiError::not_found("channel not found"));
    }
    let leaving = user_ids == [operator_id];
    if channel.kind == ChannelKind::Direct && !leaving {
        return Err(ApiError::forbidden("members of a direct channel can only leave"));
    }

    let members: HashMap<UserId, MembershipRecord> = ctx
        .storage
        .active_memberships(channel_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|m| (m.user_id, m))
        .collect();
    let Some(operator) = members.get(&operator_id) else {
        return Err(ApiError::forbidden("user is not a member"));
    };
    if user_ids.iter().any(|id| !members.contains_key(id)) {
        return Err(ApiError::not_found("user is not a member"));
    }
    if channel.kind == ChannelKind::Group
        && user_ids.iter().any(|id| channel.is_owner(*id))
        && channel.member_count > 1
    {
        return Err(ApiError::forbidden(
            "the owner cannot leave while other members remain",
        ));
    }
    if !leaving {
        let allowed = match operator.role {
            Role::Owner => true,
            Role::Manager => user_ids
                .iter()
                .all(|id| members.get(id).is_some_and(|m| m.role == Role::Member)),
            Role::Member => false,
        };
        if !allowed {
            return Err(ApiError::forbidden("insufficient role to remove members"));
        }
    }

    let removed = ctx
        .storage
        .users_by_ids(&user_ids)
        .await
        .map_err(internal)?;
    let (member_count, avatar) = ctx
        .storage
        .remove_members(
            channel_id,
            &user_ids,
            ctx.config.avatar_mosaic_size,
            Utc::now(),
        )
        .await
        .map_err(internal)?;

    if channel.kind == ChannelKind::Group {
        let text = if leaving {
            format!("{} left the group", names_of(&removed))
        } else {
            format!(
                "{} removed {} from the group",
                nickname(ctx, operator_id).await,
                names_of(&removed)
            )
        };
        announce(ctx, &channel, operator_id, MessageKind::Leave, text).await;
    }
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::MembersRemoved {
            channel_id,
            operator_id,
            user_ids: user_ids.clone(),
        },
    );
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::ChannelUpdated {
            channel_id,
            attrs: ChannelAttrs {
                member_count: Some(member_count),
                avatar: Some(avatar),
                ..ChannelAttrs::default()
            },
        },
    );
    ctx.dispatcher.leave(channel_id, user_ids.clone());
    info!(%channel_id, %operator_id, removed = user_ids.len(), "members removed");
    Ok(())
}

/// Promotes or demotes members. Owner only; ownership itself is not transferable here.
pub async fn set_role(
    ctx: &EngineContext,
    channel_id: ChannelId,
    operator_id: UserId,
    user_ids: &[UserId],
    role: Role,
) -> Result<(), ApiError> {
    if role == Role::Owner {
        return Err(ApiError::validation("role must be manager or member"));
    }
    let user_ids = unique(user_ids);
    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_live_group(ctx, channel_id).await?;
    if !channel.is_owner(operator_id) {
        return Err(ApiError::forbidden("only the owner can change roles"));
    }
    if user_ids.contains(&operator_id) {
        return Err(ApiError::validation("the owner's role cannot change"));
    }
    require_members(ctx, channel_id, &user_ids).await?;

    ctx.storage
        .set_roles(channel_id, &user_ids, role, Utc::now())
        .await
        .map_err(internal)?;
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::RoleUpdated {
            channel_id,
            user_ids: user_ids.clone(),
            role,
        },
    );
    info!(%channel_id, %operator_id, ?role, members = user_ids.len(), "roles updated");
    Ok(())
}

/// Mutes (`banned = true`) or unmutes members of a group. Owner only.
pub async fn ban_members(
    ctx: &EngineContext,
    channel_id: ChannelId,
    operator_id: UserId,
    user_ids: &[UserId],
    banned: bool,
) -> Result<(), ApiError> {
    let user_ids = unique(user_ids);
    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_live_group(ctx, channel_id).await?;
    if !channel.is_owner(operator_id) {
        return Err(ApiError::forbidden("only the owner can ban members"));
    }
    if user_ids.contains(&operator_id) {
        return Err(ApiError::validation("the owner cannot be banned"));
    }
    require_members(ctx, channel_id, &user_ids).await?;
    let targets = ctx
        .storage
        .users_by_ids(&user_ids)
        .await
        .map_err(internal)?;

    ctx.storage
        .set_banned(channel_id, &user_ids, banned, Utc::now())
        .await
        .map_err(internal)?;
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::MembersBanned {
            channel_id,
            user_ids: user_ids.clone(),
            banned,
        },
    );
    let text = format!(
        "{} {} {}",
        nickname(ctx, operator_id).await,
        if banned { "muted" } else { "unmuted" },
        names_of(&targets)
    );
    announce(ctx, &channel, operator_id, MessageKind::Ban, text).await;
    Ok(())
}

/// Renames a group or flips its settings. Owner or manager.
pub async fn update_settings(
    ctx: &EngineContext,
    channel_id: ChannelId,
    operator_id: UserId,
    mut patch: ChannelSettingsPatch,
) -> Result<ChannelAttrs, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::validation("nothing to update"));
    }
    if let Some(name) = patch.name.take() {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::validation("channel name cannot be empty"));
        }
        patch.name = Some(validate_name(name)?);
    }

    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_live_group(ctx, channel_id).await?;
    let operator = active_membership(ctx, channel_id, operator_id).await?;
    if operator.role == Role::Member {
        return Err(ApiError::forbidden("only the owner or a manager can change settings"));
    }

    ctx.storage
        .update_channel_settings(channel_id, &patch, Utc::now())
        .await
        .map_err(internal)?;
    let attrs = ChannelAttrs {
        name: patch.name.clone(),
        owner_invite_only: patch.owner_invite_only,
        banned: patch.banned,
        member_masked: patch.member_masked,
        ..ChannelAttrs::default()
    };
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::ChannelUpdated {
            channel_id,
            attrs: attrs.clone(),
        },
    );

    let actor = nickname(ctx, operator_id).await;
    let mut changes = Vec::new();
    if let Some(name) = &patch.name {
        changes.push(format!("renamed the group to \"{name}\""));
    }
    for (flag, on, off) in [
        (patch.owner_invite_only, "restricted invitations to the owner", "allowed members to invite"),
        (patch.banned, "muted all members", "unmuted all members"),
        (patch.member_masked, "hid the member list", "showed the member list"),
    ] {
        if let Some(flag) = flag {
            changes.push((if flag { on } else { off }).to_string());
        }
    }
    announce(
        ctx,
        &channel,
        operator_id,
        MessageKind::SettingsChanged,
        format!("{actor} {}", changes.join(", ")),
    )
    .await;
    Ok(attrs)
}

/// Administrative removal: the channel is marked deleted and every member leaves.
pub async fn remove_channel(ctx: &EngineContext, channel_id: ChannelId) -> Result<(), ApiError> {
    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_channel(ctx, channel_id).await?;
    if channel.status == ChannelStatus::Deleted {
        return Err(ApiError::conflict("channel is already removed"));
    }
    let removed = ctx
        .storage
        .remove_channel(channel_id, Utc::now())
        .await
        .map_err(internal)?;
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::ChannelUpdated {
            channel_id,
            attrs: ChannelAttrs {
                status: Some(ChannelStatus::Deleted),
                member_count: Some(0),
                ..ChannelAttrs::default()
            },
        },
    );
    ctx.dispatcher.leave(channel_id, removed.clone());
    warn!(%channel_id, members = removed.len(), "channel removed");
    Ok(())
}

/// Blocks or unblocks a channel. Removal goes through [`remove_channel`].
pub async fn set_channel_status(
    ctx: &EngineContext,
    channel_id: ChannelId,
    status: ChannelStatus,
) -> Result<(), ApiError> {
    if status == ChannelStatus::Deleted {
        return Err(ApiError::validation("use channel removal to delete a channel"));
    }
    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_channel(ctx, channel_id).await?;
    if channel.status == ChannelStatus::Deleted {
        return Err(ApiError::conflict("channel has been removed"));
    }
    if channel.status == status {
        return Ok(());
    }
    ctx.storage
        .set_channel_status(channel_id, status, Utc::now())
        .await
        .map_err(internal)?;
    ctx.dispatcher.to_room(
        channel_id,
        ServerEvent::ChannelUpdated {
            channel_id,
            attrs: ChannelAttrs {
                status: Some(status),
                ..ChannelAttrs::default()
            },
        },
    );
    warn!(%channel_id, ?status, "channel status changed");
    Ok(())
}

pub async fn set_member_preferences(
    ctx: &EngineContext,
    channel_id: ChannelId,
    user_id: UserId,
    preferences: MemberPreferences,
) -> Result<MembershipState, ApiError> {
    let _guard = ctx.locks.lock(channel_id).await;
    let channel = load_channel(ctx, channel_id).await?;
    active_membership(ctx, channel_id, user_id).await?;
    if preferences.blacklisted.is_some() && channel.kind != ChannelKind::Direct {
        return Err(ApiError::validation("blacklisting applies to direct channels"));
    }
    let remark = preferences.remark_nickname.as_deref().map(str::trim);
    if remark.is_some_and(|r| r.chars().count() > MAX_CHANNEL_NAME_CHARS) {
        return Err(ApiError::validation(format!(
            "remark exceeds {MAX_CHANNEL_NAME_CHARS} characters"
        )));
    }
    ctx.storage
        .set_member_preferences(
            channel_id,
            user_id,
            preferences.muted,
            preferences.blacklisted,
            remark,
            Utc::now(),
        )
        .await
        .map_err(internal)?;
    let membership = active_membership(ctx, channel_id, user_id).await?;
    read_state::notify_read_state(ctx, &membership);
    Ok(membership_state(&membership))
}

/// Every channel the user is an active member of, most recently active first.
pub async fn list_channels(
    ctx: &EngineContext,
    user_id: UserId,
) -> Result<Vec<ChannelListing>, ApiError> {
    let memberships: HashMap<ChannelId, MembershipRecord> = ctx
        .storage
        .memberships_for_user(user_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|m| (m.channel_id, m))
        .collect();
    let channel_ids: Vec<ChannelId> = memberships.keys().copied().collect();
    let channels = ctx
        .storage
        .channels_by_ids(&channel_ids)
        .await
        .map_err(internal)?;
    let friend_ids: Vec<UserId> = memberships.values().filter_map(|m| m.friend_id).collect();
    let friends: HashMap<UserId, UserRecord> = ctx
        .storage
        .users_by_ids(&friend_ids)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|u| (u.user_id, u))
        .collect();

    Ok(channels
        .iter()
        .filter(|c| c.status != ChannelStatus::Deleted)
        .filter_map(|c| {
            let membership = memberships.get(&c.channel_id)?;
            let friend = membership.friend_id.and_then(|id| friends.get(&id));
            Some(listing(c, membership, friend))
        })
        .collect())
}

/// Members of a channel as `requester_id` may see them. In a member-masked
/// group plain members only see the owner, the managers and themselves.
pub async fn list_members(
    ctx: &EngineContext,
    channel_id: ChannelId,
    requester_id: UserId,
) -> Result<Vec<MemberSummary>, ApiError> {
    let channel = load_channel(ctx, channel_id).await?;
    let requester = active_membership(ctx, channel_id, requester_id).await?;
    let masked = channel.member_masked && requester.role == Role::Member;
    Ok(ctx
        .storage
        .list_members(channel_id)
        .await
        .map_err(internal)?
        .into_iter()
        .filter(|m| !masked || m.role != Role::Member || m.user_id == requester_id)
        .map(|m| MemberSummary {
            channel_id,
            user_id: m.user_id,
            nickname: m.nickname,
            avatar: m.avatar,
            role: m.role,
            banned: m.banned,
            muted: m.muted,
        })
        .collect())
}

/// Administrative repair: recomputes member count and avatar from membership rows.
pub async fn recount_members(ctx: &EngineContext, channel_id: ChannelId) -> Result<i64, ApiError> {
    let _guard = ctx.locks.lock(channel_id).await;
    let before = load_channel(ctx, channel_id).await?;
    let count = ctx
        .storage
        .recount_members(channel_id, ctx.config.avatar_mosaic_size, Utc::now())
        .await
        .map_err(internal)?;
    if count != before.member_count {
        warn!(
            %channel_id,
            stored = before.member_count,
            actual = count,
            "member count drifted; corrected"
        );
        ctx.dispatcher.to_room(
            channel_id,
            ServerEvent::ChannelUpdated {
                channel_id,
                attrs: ChannelAttrs {
                    member_count: Some(count),
                    ..ChannelAttrs::default()
                },
            },
        );
    }
    Ok(count)
}

/// Subscribes a freshly connected socket to the rooms of the user's channels.
pub async fn attach_socket(
    ctx: &EngineContext,
    user_id: UserId,
    socket_id: SocketId,
) -> Result<Vec<ChannelId>, ApiError> {
    let channel_ids: Vec<ChannelId> = ctx
        .storage
        .memberships_for_user(user_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|m| m.channel_id)
        .collect();
    for channel_id in &channel_ids {
        ctx.dispatcher.join_sockets(*channel_id, vec![socket_id]);
    }
    Ok(channel_ids)
}

pub fn channel_summary(channel: &ChannelRecord) -> ChannelSummary {
    ChannelSummary {
        channel_id: channel.channel_id,
        kind: channel.kind,
        status: channel.status,
        name: channel.name.clone(),
        avatar: channel.avatar.clone(),
        owner_id: channel.owner_id,
        member_count: channel.member_count,
        member_count_limit: channel.member_count_limit,
        seq_end: channel.seq_end,
        total_msg_count: channel.total_msg_count,
        last_msg: channel.last_msg.clone(),
        last_msg_at: channel.last_msg_at,
        owner_invite_only: channel.owner_invite_only,
        banned: channel.banned,
        member_masked: channel.member_masked,
    }
}

pub fn membership_state(membership: &MembershipRecord) -> MembershipState {
    MembershipState {
        role: membership.role,
        friend_id: membership.friend_id,
        remark_nickname: membership.remark_nickname.clone(),
        seq_start: membership.seq_start,
        msg_count: membership.msg_count,
        unread_msg_count: membership.unread_msg_count,
        mention_count: membership.mention_count,
        last_viewed_at: membership.last_viewed_at,
        opened: membership.opened,
        muted: membership.muted,
        banned: membership.banned,
    }
}

/// Direct channels carry no name or avatar of their own; they show the
/// counterpart (or the remark the member gave them).
fn listing(
    channel: &ChannelRecord,
    membership: &MembershipRecord,
    friend: Option<&UserRecord>,
) -> ChannelListing {
    let mut summary = channel_summary(channel);
    if channel.kind == ChannelKind::Direct {
        if let Some(friend) = friend {
            summary.name = membership
                .remark_nickname
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| friend.nickname.clone());
            summary.avatar = friend.avatar.clone();
        }
    }
    ChannelListing {
        channel: summary,
        membership: membership_state(membership),
    }
}

async fn listing_for(
    ctx: &EngineContext,
    channel: &ChannelRecord,
    user_id: UserId,
) -> Result<ChannelListing, ApiError> {
    let membership = active_membership(ctx, channel.channel_id, user_id).await?;
    let friend = match membership.friend_id {
        Some(friend_id) => ctx.storage.get_user(friend_id).await.map_err(internal)?,
        None => None,
    };
    Ok(listing(channel, &membership, friend.as_ref()))
}

/// Sends each user their own view of a channel they just became part of.
async fn announce_channel(ctx: &EngineContext, channel: &ChannelRecord, user_ids: &[UserId]) {
    for user_id in user_ids {
        let listing = listing_for(ctx, channel, *user_id).await;
        let Some(listing) = after_commit(ctx, "channel_added", listing) else {
            continue;
        };
        ctx.dispatcher.to_users(
            channel.channel_id,
            vec![*user_id],
            ServerEvent::ChannelAdded { channel: listing },
        );
    }
}

async fn load_live_group(
    ctx: &EngineContext,
    channel_id: ChannelId,
) -> Result<ChannelRecord, ApiError> {
    let channel = load_channel(ctx, channel_id).await?;
    if channel.kind != ChannelKind::Group {
        return Err(ApiError::forbidden("operation requires a group channel"));
    }
    match channel.status {
        ChannelStatus::Normal => Ok(channel),
        ChannelStatus::Blocked => Err(ApiError::forbidden("channel is blocked")),
        ChannelStatus::Deleted => Err(ApiError::not_found("channel not found")),
    }
}

async fn active_membership(
    ctx: &EngineContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<MembershipRecord, ApiError> {
    ctx.storage
        .get_membership(channel_id, user_id)
        .await
        .map_err(internal)?
        .filter(MembershipRecord::is_active)
        .ok_or_else(|| ApiError::forbidden("user is not a member"))
}

async fn require_members(
    ctx: &EngineContext,
    channel_id: ChannelId,
    user_ids: &[UserId],
) -> Result<(), ApiError> {
    if user_ids.is_empty() {
        return Err(ApiError::validation("no users given"));
    }
    let active: BTreeSet<UserId> = ctx
        .storage
        .active_memberships(channel_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|m| m.user_id)
        .collect();
    if user_ids.iter().all(|id| active.contains(id)) {
        Ok(())
    } else {
        Err(ApiError::not_found("user is not a member"))
    }
}

async fn require_normal_users(
    ctx: &EngineContext,
    user_ids: &[UserId],
) -> Result<Vec<UserRecord>, ApiError> {
    let mut users = Vec::with_capacity(user_ids.len());
    for user_id in user_ids {
        let user = ctx
            .storage
            .get_user(*user_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found("user not found"))?;
        if user.state != UserState::Normal {
            return Err(ApiError::validation("user account is not active"));
        }
        users.push(user);
    }
    Ok(users)
}

fn validate_name(name: &str) -> Result<String, ApiError> {
    if name.chars().count() > MAX_CHANNEL_NAME_CHARS {
        return Err(ApiError::validation(format!(
            "channel name exceeds {MAX_CHANNEL_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

fn unique(user_ids: &[UserId]) -> Vec<UserId> {
    let mut seen = BTreeSet::new();
    user_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn names_of(users: &[UserRecord]) -> String {
    users
        .iter()
        .map(|u| u.nickname.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
