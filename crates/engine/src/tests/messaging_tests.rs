use super::*;

use std::time::Duration;

use shared::{
    domain::{JoinVia, MENTION_ALL},
    error::ErrorCode,
};

use crate::{
    membership, read_state,
    test_support::{harness, harness_with, test_config},
};

fn text(channel_id: ChannelId, sender_id: UserId, cid: &str, content: &str) -> SendRequest {
    SendRequest {
        channel_id,
        sender_id,
        cid: cid.to_string(),
        body: MessageBody::Text {
            content: content.to_string(),
            mentions: Vec::new(),
        },
    }
}

#[tokio::test]
async fn retried_cid_returns_the_original_result() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;

    let first = send(&h.ctx, text(channel, alice, "same", "hi")).await.expect("first");
    let retry = send(&h.ctx, text(channel, alice, "same", "hi")).await.expect("retry");
    assert_eq!((first.message_id, first.seq), (retry.message_id, retry.seq));

    let stored = h.ctx.storage.get_channel(channel).await.expect("db").expect("channel");
    assert_eq!(stored.seq_end, first.seq);
    assert_eq!(stored.total_msg_count, 1);

    let err = send(&h.ctx, text(channel, bob, "same", "hi")).await.expect_err("stolen cid");
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn invalid_cid_is_rejected_before_anything_happens() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let channel = h.group(alice, &[]).await;
    let seq_end = h.ctx.storage.get_channel(channel).await.expect("db").expect("channel").seq_end;

    let long = "x".repeat(MAX_CID_CHARS + 1);
    for cid in ["", "   ", long.as_str()] {
        let err = send(&h.ctx, text(channel, alice, cid, "hi")).await.expect_err("cid");
        assert_eq!(err.code, ErrorCode::Validation);
    }
    let after = h.ctx.storage.get_channel(channel).await.expect("db").expect("channel");
    assert_eq!(after.seq_end, seq_end);
}

#[tokio::test]
async fn senders_need_an_active_unbanned_membership() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let carol = h.user("carol").await;
    let channel = h.group(alice, &[bob]).await;

    let err = send(&h.ctx, text(channel, carol, "c1", "hi")).await.expect_err("outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);

    membership::ban_members(&h.ctx, channel, alice, &[bob], true)
        .await
        .expect("ban");
    let err = send(&h.ctx, text(channel, bob, "c2", "hi")).await.expect_err("banned");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn globally_banned_group_only_lets_the_owner_speak() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;
    membership::update_settings(
        &h.ctx,
        channel,
        alice,
        storage::ChannelSettingsPatch {
            banned: Some(true),
            ..Default::default()
        },
    )
    .await
    .expect("settings");

    assert!(send(&h.ctx, text(channel, bob, "b1", "hi")).await.is_err());
    send(&h.ctx, text(channel, alice, "a1", "announcement"))
        .await
        .expect("owner speaks");
}

#[tokio::test]
async fn blocked_channels_reject_sends() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let channel = h.group(alice, &[]).await;
    membership::set_channel_status(&h.ctx, channel, ChannelStatus::Blocked)
        .await
        .expect("block");

    let err = send(&h.ctx, text(channel, alice, "x", "hi")).await.expect_err("blocked");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn direct_send_needs_the_counterpart_present_and_not_blacklisting() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = membership::create_direct(&h.ctx, alice, bob)
        .await
        .expect("direct")
        .channel
        .channel_id;

    send(&h.ctx, text(channel, alice, "d1", "hi")).await.expect("first");
    membership::set_member_preferences(
        &h.ctx,
        channel,
        bob,
        membership::MemberPreferences {
            blacklisted: Some(true),
            ..Default::default()
        },
    )
    .await
    .expect("blacklist");
    assert!(send(&h.ctx, text(channel, alice, "d2", "hi")).await.is_err());

    membership::remove_members(&h.ctx, channel, bob, &[bob])
        .await
        .expect("bob leaves");
    let err = send(&h.ctx, text(channel, alice, "d3", "hi")).await.expect_err("gone");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn mentions_count_for_closed_members_only() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let carol = h.user("carol").await;
    let channel = h.group(alice, &[bob, carol]).await;
    read_state::mark_as_read(&h.ctx, channel, carol).await.expect("carol opens");

    send(
        &h.ctx,
        SendRequest {
            channel_id: channel,
            sender_id: alice,
            cid: "m1".into(),
            body: MessageBody::Text {
                content: "@all standup".into(),
                mentions: vec![MENTION_ALL],
            },
        },
    )
    .await
    .expect("send");

    let bob_state = h.ctx.storage.get_membership(channel, bob).await.expect("db").expect("row");
    let carol_state = h.ctx.storage.get_membership(channel, carol).await.expect("db").expect("row");
    assert_eq!((bob_state.unread_msg_count, bob_state.mention_count), (1, 1));
    assert_eq!((carol_state.unread_msg_count, carol_state.mention_count), (0, 0));
    assert_eq!(carol_state.msg_count, 1);
}

#[tokio::test]
async fn media_is_stored_normal_and_never_scanned() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let channel = h.group(alice, &[]).await;

    let result = send(
        &h.ctx,
        SendRequest {
            channel_id: channel,
            sender_id: alice,
            cid: "img".into(),
            body: MessageBody::Media {
                file: "a/b.jpg".into(),
                duration: None,
            },
        },
    )
    .await
    .expect("send");
    h.settle().await;

    assert_eq!(result.status, DeliveryStatus::Normal);
    assert_eq!(h.scanner.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    let stored = h.ctx.storage.get_channel(channel).await.expect("db").expect("channel");
    assert_eq!(stored.last_msg, "alice: [image]");
}

#[tokio::test]
async fn withdraw_twice_is_a_conflict_and_changes_nothing() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;
    h.text(channel, alice, "keep").await;
    let sent = h.text(channel, bob, "oops").await;
    h.settle().await;

    withdraw(&h.ctx, channel, bob, sent.message_id).await.expect("withdraw");
    let once = h.ctx.storage.get_membership(channel, alice).await.expect("db").expect("row");
    let channel_once = h.ctx.storage.get_channel(channel).await.expect("db").expect("channel");

    let err = withdraw(&h.ctx, channel, bob, sent.message_id)
        .await
        .expect_err("second withdraw");
    assert_eq!(err.code, ErrorCode::Conflict);
    let twice = h.ctx.storage.get_membership(channel, alice).await.expect("db").expect("row");
    let channel_twice = h.ctx.storage.get_channel(channel).await.expect("db").expect("channel");

    assert_eq!(once.msg_count, twice.msg_count);
    assert_eq!(once.unread_msg_count, twice.unread_msg_count);
    assert_eq!(channel_once.total_msg_count, channel_twice.total_msg_count);
    assert_eq!(channel_twice.total_msg_count, 1);
    assert_eq!(channel_twice.last_msg, "bob withdrew a message");
}

#[tokio::test]
async fn withdraw_of_unknown_or_foreign_message_is_not_found() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let first = h.group(alice, &[]).await;
    let second = h.group(alice, &[]).await;
    let sent = h.text(first, alice, "hi").await;

    let err = withdraw(&h.ctx, second, alice, sent.message_id).await.expect_err("foreign");
    assert_eq!(err.code, ErrorCode::NotFound);
    let err = withdraw(&h.ctx, first, alice, MessageId(9999)).await.expect_err("unknown");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn author_window_expires() {
    let h = harness_with(crate::EngineConfig {
        withdraw_window: Duration::ZERO,
        ..test_config()
    })
    .await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;
    let sent = h.text(channel, bob, "too late").await;

    let err = withdraw(&h.ctx, channel, bob, sent.message_id).await.expect_err("expired");
    assert_eq!(err.code, ErrorCode::Forbidden);
    withdraw(&h.ctx, channel, alice, sent.message_id).await.expect("owner override");
}

#[tokio::test]
async fn owner_withdrawal_notifies_the_author() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;
    let bob_socket = h.connect(bob).await;
    let sent = h.text(channel, bob, "rude").await;

    withdraw(&h.ctx, channel, alice, sent.message_id).await.expect("withdraw");
    h.settle().await;

    let events = h.transport.received(bob_socket);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageWithdrawn { reason: WithdrawReason::GroupOwner, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::SystemNotice { reason: WithdrawReason::GroupOwner, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::MessagePush { message } if message.kind == MessageKind::WithdrawByOwner
    )));
}

#[tokio::test]
async fn delete_is_distinct_from_withdraw() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;
    let socket = h.connect(bob).await;
    let sent = h.text(channel, alice, "spam").await;

    delete_message(&h.ctx, sent.message_id).await.expect("delete");
    h.settle().await;

    let events = h.transport.received(socket);
    assert!(events.iter().any(|e| matches!(e, ServerEvent::MessageDeleted { .. })));
    assert!(!events.iter().any(|e| matches!(e, ServerEvent::MessageWithdrawn { .. })));
    let bob_state = h.ctx.storage.get_membership(channel, bob).await.expect("db").expect("row");
    assert_eq!(bob_state.unread_msg_count, 0);

    // Deletions are not reported as withdrawals on the next read.
    let withdrawn = read_state::mark_as_read(&h.ctx, channel, bob).await.expect("read");
    assert!(withdrawn.is_empty());
    let err = delete_message(&h.ctx, sent.message_id).await.expect_err("again");
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn range_is_windowed_and_starts_after_the_join_point() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[]).await;
    for i in 0..20 {
        h.text(channel, alice, &format!("m{i}")).await;
    }
    membership::add_members(&h.ctx, channel, alice, &[bob], JoinVia::Invite)
        .await
        .expect("add bob");
    let joined_at = h.ctx.storage.get_membership(channel, bob).await.expect("db").expect("row").seq_start;
    h.text(channel, alice, "welcome").await;

    let all = get_range(&h.ctx, channel, alice, 0, 100).await.expect("alice range");
    assert_eq!(all.len(), 15);
    assert_eq!(all.first().map(|m| m.seq), Some(1));

    let bobs = get_range(&h.ctx, channel, bob, 0, 100).await.expect("bob range");
    assert!(bobs.iter().all(|m| m.seq > joined_at));
    assert!(bobs.iter().any(|m| m.content.as_deref() == Some("welcome")));

    let err = get_range(&h.ctx, channel, alice, 5, 2).await.expect_err("inverted");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn range_at_the_top_of_the_seq_space_is_empty() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let channel = h.group(alice, &[]).await;
    h.text(channel, alice, "hi").await;

    let messages = get_range(&h.ctx, channel, alice, i64::MAX, i64::MAX)
        .await
        .expect("range");
    assert!(messages.is_empty());
    let messages = get_range(&h.ctx, channel, alice, i64::MAX - 3, i64::MAX)
        .await
        .expect("range");
    assert!(messages.is_empty());
}

#[tokio::test]
async fn withdraw_stands_when_its_structural_event_cannot_be_stored() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;
    let bob_socket = h.connect(bob).await;
    let sent = h.text(channel, bob, "rude").await;
    h.settle().await;
    sqlx::query(
        "CREATE TRIGGER refuse_owner_withdrawals BEFORE INSERT ON messages
         WHEN NEW.kind = 'withdraw_by_owner'
         BEGIN SELECT RAISE(ABORT, 'insert refused'); END",
    )
    .execute(h.ctx.storage.pool())
    .await
    .expect("trigger");

    withdraw(&h.ctx, channel, alice, sent.message_id).await.expect("withdraw");
    h.settle().await;

    let stored = h.ctx.storage.get_message(sent.message_id).await.expect("db").expect("message");
    assert_eq!(stored.status, DeliveryStatus::Withdrawn);
    assert_eq!(h.ctx.diagnostics.dependency_failures(), 1);
    let events = h.transport.received(bob_socket);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::SystemNotice { reason: WithdrawReason::GroupOwner, .. }
    )));
    assert!(!events.iter().any(|e| matches!(
        e,
        ServerEvent::MessagePush { message } if message.kind == MessageKind::WithdrawByOwner
    )));
    let err = withdraw(&h.ctx, channel, alice, sent.message_id).await.expect_err("again");
    assert_eq!(err.code, ErrorCode::Conflict);
}
