use super::*;

use std::time::Duration;

#[tokio::test]
async fn same_channel_is_exclusive() {
    let locks = ChannelLocks::default();
    let guard = locks.lock(ChannelId(1)).await;

    let contender = locks.clone();
    let waiting = tokio::spawn(async move {
        let _guard = contender.lock(ChannelId(1)).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("released")
        .expect("task");
}

#[tokio::test]
async fn different_channels_do_not_contend() {
    let locks = ChannelLocks::default();
    let _first = locks.lock(ChannelId(1)).await;
    tokio::time::timeout(Duration::from_millis(100), locks.lock(ChannelId(2)))
        .await
        .expect("independent channel");
    assert_eq!(locks.len(), 2);
}

#[tokio::test]
async fn idle_slots_are_pruned() {
    let locks = ChannelLocks::default();
    for id in 0..(PRUNE_THRESHOLD as i64 + 10) {
        drop(locks.lock(ChannelId(id)).await);
    }
    assert!(locks.len() < PRUNE_THRESHOLD);
    assert!(!locks.is_empty());
}
