use super::*;

fn ping(channel_id: ChannelId) -> ServerEvent {
    ServerEvent::MembersBanned {
        channel_id,
        user_ids: Vec::new(),
        banned: false,
    }
}

#[tokio::test]
async fn room_emits_reach_joined_sockets_only() {
    let hub = LocalHub::default();
    let (alice, mut alice_rx) = hub.register(UserId(1)).await;
    let (_bob, mut bob_rx) = hub.register(UserId(2)).await;

    hub.join_room(ChannelId(7), &[alice]).await.expect("join");
    hub.emit_to_room(ChannelId(7), &ping(ChannelId(7)))
        .await
        .expect("emit");

    assert!(matches!(
        alice_rx.try_recv(),
        Ok(ServerEvent::MembersBanned { .. })
    ));
    assert!(bob_rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_sockets_are_not_added_to_rooms() {
    let hub = LocalHub::default();
    hub.join_room(ChannelId(1), &[SocketId::new()])
        .await
        .expect("join");
    assert!(hub.inner.rooms.read().await.get(&ChannelId(1)).map_or(true, |r| r.is_empty()));
}

#[tokio::test]
async fn sockets_for_users_covers_every_device() {
    let hub = LocalHub::default();
    let (phone, _phone_rx) = hub.register(UserId(1)).await;
    let (laptop, _laptop_rx) = hub.register(UserId(1)).await;
    let (_other, _other_rx) = hub.register(UserId(2)).await;

    let mut sockets = hub.sockets_for_users(&[UserId(1)]).await.expect("lookup");
    sockets.sort_by_key(|s| s.0);
    let mut expected = vec![phone, laptop];
    expected.sort_by_key(|s| s.0);
    assert_eq!(sockets, expected);
}

#[tokio::test]
async fn unregister_reports_last_connection_and_leaves_rooms() {
    let hub = LocalHub::default();
    let (phone, _phone_rx) = hub.register(UserId(1)).await;
    let (laptop, _laptop_rx) = hub.register(UserId(1)).await;
    hub.join_room(ChannelId(3), &[phone, laptop])
        .await
        .expect("join");

    assert!(!hub.unregister(phone).await);
    assert!(hub.unregister(laptop).await);
    assert!(!hub.unregister(laptop).await, "already gone");
    assert_eq!(hub.connection_count().await, 0);
    assert!(hub.inner.rooms.read().await.is_empty());
}

#[tokio::test]
async fn delivery_to_closed_receiver_is_not_an_error() {
    let hub = LocalHub::default();
    let (socket, rx) = hub.register(UserId(1)).await;
    drop(rx);
    hub.emit_to_sockets(&[socket], &ping(ChannelId(1)))
        .await
        .expect("emit");
}
