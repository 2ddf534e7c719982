use super::*;
use crate::{CounterDelta, LastMessage, NewChannel, NewMember, NewMessage};
use shared::domain::{
    ChannelKind, DeliveryStatus, MessageKind, ModerationStatus, Role, WithdrawReason,
};

async fn setup() -> (Storage, UserId, UserId, ChannelId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", "Alice").await.expect("alice");
    let bob = storage.create_user("bob", "Bob").await.expect("bob");
    let channel = storage
        .create_channel(
            &NewChannel {
                kind: ChannelKind::Group,
                name: "team".into(),
                owner_id: Some(alice),
                creator_id: alice,
                member_count_limit: 10,
            },
            &[
                NewMember {
                    user_id: alice,
                    role: Role::Owner,
                    friend_id: None,
                },
                NewMember {
                    user_id: bob,
                    role: Role::Member,
                    friend_id: None,
                },
            ],
            9,
            Utc::now(),
        )
        .await
        .expect("channel");
    (storage, alice, bob, channel)
}

async fn send(storage: &Storage, channel: ChannelId, sender: UserId, to: UserId) -> MessageId {
    let seq = storage.next_seq(channel).await.expect("seq");
    storage
        .record_message(
            &NewMessage {
                cid: format!("c{seq}"),
                channel_id: channel,
                sender_id: sender,
                kind: MessageKind::Text,
                content: Some("hello".into()),
                file: None,
                duration: None,
                mentions: Vec::new(),
                moderation_status: ModerationStatus::Pending,
                status: DeliveryStatus::Pending,
                seq,
                created_at: Utc::now(),
            },
            &[CounterDelta {
                user_id: to,
                unread: true,
                mention: false,
            }],
            &LastMessage {
                text: "hello".into(),
                at: Some(Utc::now()),
            },
        )
        .await
        .expect("record")
}

async fn withdraw(storage: &Storage, message: MessageId) {
    storage
        .remove_message(
            message,
            DeliveryStatus::Withdrawn,
            Some(WithdrawReason::Sender),
            None,
            None,
            Utc::now(),
        )
        .await
        .expect("withdraw")
        .expect("transitioned");
}

#[tokio::test]
async fn mark_read_returns_withdrawals_since_previous_read() {
    let (storage, alice, bob, channel) = setup().await;
    let first = send(&storage, channel, alice, bob).await;
    let second = send(&storage, channel, alice, bob).await;
    let third = send(&storage, channel, alice, bob).await;

    withdraw(&storage, first).await;
    withdraw(&storage, third).await;
    let ids = storage
        .mark_read(channel, bob, Utc::now())
        .await
        .expect("read")
        .expect("member");
    assert_eq!(ids, vec![first, third]);

    let row = storage
        .get_membership(channel, bob)
        .await
        .expect("load")
        .expect("row");
    assert_eq!((row.unread_msg_count, row.mention_count), (0, 0));
    assert!(row.opened);

    assert!(storage
        .mark_read(channel, bob, Utc::now())
        .await
        .expect("read")
        .expect("member")
        .is_empty());

    withdraw(&storage, second).await;
    let ids = storage
        .mark_read(channel, bob, Utc::now())
        .await
        .expect("read")
        .expect("member");
    assert_eq!(ids, vec![second]);
}

#[tokio::test]
async fn read_messages_keep_unread_at_zero_when_withdrawn() {
    let (storage, alice, bob, channel) = setup().await;
    let first = send(&storage, channel, alice, bob).await;
    storage
        .mark_read(channel, bob, Utc::now())
        .await
        .expect("read");
    storage
        .mark_closed(channel, bob, Utc::now())
        .await
        .expect("close");
    send(&storage, channel, alice, bob).await;

    withdraw(&storage, first).await;
    let row = storage
        .get_membership(channel, bob)
        .await
        .expect("load")
        .expect("row");
    assert_eq!(row.unread_msg_count, 1, "only the unread message still counts");
    assert_eq!(row.msg_count, 1);
}

#[tokio::test]
async fn mark_read_requires_active_membership() {
    let (storage, _, _, channel) = setup().await;
    let stranger = storage.create_user("eve", "Eve").await.expect("eve");
    assert!(storage
        .mark_read(channel, stranger, Utc::now())
        .await
        .expect("read")
        .is_none());
}

#[tokio::test]
async fn mark_closed_only_flips_open_rows() {
    let (storage, _, bob, channel) = setup().await;
    assert!(!storage
        .mark_closed(channel, bob, Utc::now())
        .await
        .expect("close"));
    storage
        .mark_read(channel, bob, Utc::now())
        .await
        .expect("read");
    assert_eq!(
        storage.opened_channels(bob).await.expect("opened"),
        vec![channel]
    );
    assert!(storage
        .mark_closed(channel, bob, Utc::now())
        .await
        .expect("close"));
    assert!(storage.opened_channels(bob).await.expect("opened").is_empty());
}
