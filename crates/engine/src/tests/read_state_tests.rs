use super::*;

use chrono::Utc;
use shared::{domain::Role, error::ErrorCode};

use crate::{messaging, test_support::harness};

fn member(user: i64, opened: bool) -> MembershipRecord {
    MembershipRecord {
        channel_id: ChannelId(1),
        user_id: UserId(user),
        friend_id: None,
        role: Role::Member,
        remark_nickname: None,
        msg_count: 0,
        unread_msg_count: 0,
        mention_count: 0,
        last_viewed_at: Utc::now(),
        opened,
        muted: false,
        banned: false,
        blacklisted: false,
        deleted: false,
        seq_start: 0,
        withdraw_cursor: 0,
    }
}

#[test]
fn plan_skips_sender_and_reads_through_open_members() {
    let mut gone = member(4, false);
    gone.deleted = true;
    let members = [member(1, false), member(2, true), member(3, false), gone];

    let plan = plan_send(&members, UserId(1), &[UserId(2), UserId(3)]);
    assert_eq!(
        plan,
        vec![
            CounterDelta {
                user_id: UserId(2),
                unread: false,
                mention: false,
            },
            CounterDelta {
                user_id: UserId(3),
                unread: true,
                mention: true,
            },
        ]
    );
}

#[test]
fn mention_all_reaches_every_closed_member() {
    let members = [member(1, false), member(2, false), member(3, false)];
    let plan = plan_send(&members, UserId(1), &[MENTION_ALL]);
    assert!(plan.iter().all(|d| d.unread && d.mention));
    assert_eq!(plan.len(), 2);
}

#[tokio::test]
async fn mark_as_read_resets_counters_and_reports_withdrawals_once() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;

    let first = h.text(channel, alice, "one").await;
    h.text(channel, alice, "two").await;
    h.settle().await;
    messaging::withdraw(&h.ctx, channel, alice, first.message_id)
        .await
        .expect("withdraw");

    let before = h
        .ctx
        .storage
        .get_membership(channel, bob)
        .await
        .expect("membership")
        .expect("row");
    assert_eq!(before.unread_msg_count, 1);

    let withdrawn = mark_as_read(&h.ctx, channel, bob).await.expect("read");
    assert_eq!(withdrawn, vec![first.message_id]);
    let after = h
        .ctx
        .storage
        .get_membership(channel, bob)
        .await
        .expect("membership")
        .expect("row");
    assert_eq!((after.unread_msg_count, after.mention_count), (0, 0));
    assert!(after.opened);

    let again = mark_as_read(&h.ctx, channel, bob).await.expect("read again");
    assert!(again.is_empty());
}

#[tokio::test]
async fn mark_as_read_requires_membership() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let mallory = h.user("mallory").await;
    let channel = h.group(alice, &[]).await;

    let err = mark_as_read(&h.ctx, channel, mallory)
        .await
        .expect_err("not a member");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn read_state_goes_to_all_devices_of_the_reader() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let channel = h.group(alice, &[bob]).await;
    let phone = h.connect(bob).await;
    let laptop = h.connect(bob).await;

    mark_as_read(&h.ctx, channel, bob).await.expect("read");
    h.settle().await;

    for socket in [phone, laptop] {
        assert!(h
            .transport
            .received(socket)
            .iter()
            .any(|e| matches!(e, ServerEvent::ReadStateUpdated { opened: true, .. })));
    }
}

#[tokio::test]
async fn closing_all_channels_clears_every_open_flag() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let first = h.group(alice, &[bob]).await;
    let second = h.group(alice, &[bob]).await;
    mark_as_read(&h.ctx, first, bob).await.expect("open first");
    mark_as_read(&h.ctx, second, bob).await.expect("open second");

    let mut closed = mark_closed(&h.ctx, bob, None).await.expect("close");
    closed.sort();
    assert_eq!(closed, vec![first, second]);
    assert!(h
        .ctx
        .storage
        .opened_channels(bob)
        .await
        .expect("opened")
        .is_empty());

    let none = mark_closed(&h.ctx, bob, Some(first)).await.expect("close again");
    assert!(none.is_empty());
}
