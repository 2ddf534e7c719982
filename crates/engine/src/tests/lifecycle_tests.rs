use super::*;

use chrono::TimeZone;
use shared::domain::{ChannelId, ChannelStatus, MessageId};

fn channel(kind: ChannelKind, owner: Option<UserId>) -> ChannelRecord {
    let at = Utc.timestamp_millis_opt(0).single().expect("epoch");
    ChannelRecord {
        channel_id: ChannelId(1),
        kind,
        status: ChannelStatus::Normal,
        name: "team".into(),
        avatar: String::new(),
        owner_id: owner,
        creator_id: UserId(1),
        member_count: 3,
        member_count_limit: 10,
        seq_end: 4,
        total_msg_count: 4,
        last_msg: String::new(),
        last_msg_at: None,
        owner_invite_only: false,
        banned: false,
        member_masked: false,
        created_at: at,
        updated_at: at,
    }
}

fn message(sender: UserId, kind: MessageKind, sent_at: DateTime<Utc>) -> MessageRecord {
    MessageRecord {
        message_id: MessageId(10),
        cid: "c-10".into(),
        channel_id: ChannelId(1),
        sender_id: sender,
        kind,
        content: Some("hello".into()),
        file: None,
        duration: None,
        mentions: vec![UserId(3)],
        moderation_status: ModerationStatus::Normal,
        status: DeliveryStatus::Normal,
        withdraw_reason: None,
        seq: 4,
        created_at: sent_at,
        updated_at: sent_at,
        withdrawn_at: None,
    }
}

const WINDOW: Duration = Duration::from_secs(120);

#[test]
fn text_is_trimmed_and_mentions_make_it_a_mention_message() {
    let draft = Draft::from_body(
        &MessageBody::Text {
            content: "  hi all ".into(),
            mentions: vec![UserId(4), UserId(2), UserId(4)],
        },
        100,
    )
    .expect("draft");
    assert_eq!(draft.kind, MessageKind::ContainAt);
    assert_eq!(draft.content.as_deref(), Some("hi all"));
    assert_eq!(draft.mentions, vec![UserId(2), UserId(4)]);
}

#[test]
fn empty_or_oversized_text_is_rejected() {
    let empty = Draft::from_body(
        &MessageBody::Text {
            content: "   ".into(),
            mentions: Vec::new(),
        },
        10,
    )
    .expect_err("empty");
    assert_eq!(empty.code, shared::error::ErrorCode::Validation);

    let long = Draft::from_body(
        &MessageBody::Text {
            content: "x".repeat(11),
            mentions: Vec::new(),
        },
        10,
    )
    .expect_err("long");
    assert_eq!(long.code, shared::error::ErrorCode::Validation);
}

#[test]
fn media_kind_follows_extension() {
    let audio = Draft::from_body(
        &MessageBody::Media {
            file: "voice/abc.M4A".into(),
            duration: Some(7),
        },
        10,
    )
    .expect("audio");
    assert_eq!(audio.kind, MessageKind::Audio);
    assert_eq!(audio.duration, Some(7));

    let image = Draft::from_body(
        &MessageBody::Media {
            file: "img/abc.png".into(),
            duration: Some(7),
        },
        10,
    )
    .expect("image");
    assert_eq!(image.kind, MessageKind::Image);
    assert_eq!(image.duration, None);
}

#[test]
fn only_free_text_waits_for_moderation() {
    assert_eq!(
        initial_statuses(MessageKind::Text),
        (ModerationStatus::Pending, DeliveryStatus::Pending)
    );
    assert_eq!(
        initial_statuses(MessageKind::ContainAt),
        (ModerationStatus::Pending, DeliveryStatus::Pending)
    );
    assert_eq!(
        initial_statuses(MessageKind::Image),
        (ModerationStatus::Normal, DeliveryStatus::Normal)
    );
}

#[test]
fn author_may_withdraw_inside_the_window_only() {
    let now = Utc::now();
    let group = channel(ChannelKind::Group, Some(UserId(1)));

    let fresh = message(UserId(2), MessageKind::Text, now - chrono::Duration::seconds(30));
    assert_eq!(
        authorize_withdraw(&group, &fresh, UserId(2), now, WINDOW).expect("fresh"),
        WithdrawReason::Sender
    );

    let stale = message(UserId(2), MessageKind::Text, now - chrono::Duration::seconds(121));
    let err = authorize_withdraw(&group, &stale, UserId(2), now, WINDOW).expect_err("stale");
    assert_eq!(err.code.class(), shared::error::ErrorClass::Permission);
}

#[test]
fn owner_overrides_window_and_authorship() {
    let now = Utc::now();
    let group = channel(ChannelKind::Group, Some(UserId(1)));
    let stale = message(UserId(2), MessageKind::Text, now - chrono::Duration::minutes(30));

    assert_eq!(
        authorize_withdraw(&group, &stale, UserId(1), now, WINDOW).expect("owner"),
        WithdrawReason::GroupOwner
    );
    let err = authorize_withdraw(&group, &stale, UserId(3), now, WINDOW).expect_err("stranger");
    assert_eq!(err.code, shared::error::ErrorCode::Forbidden);
}

#[test]
fn structural_events_cannot_be_withdrawn() {
    let now = Utc::now();
    let group = channel(ChannelKind::Group, Some(UserId(1)));
    let join = message(UserId(1), MessageKind::Join, now);
    assert!(authorize_withdraw(&group, &join, UserId(1), now, WINDOW).is_err());
}

#[test]
fn direct_channels_have_no_owner_override() {
    let now = Utc::now();
    let direct = channel(ChannelKind::Direct, Some(UserId(1)));
    let theirs = message(UserId(2), MessageKind::Text, now);
    assert!(authorize_withdraw(&direct, &theirs, UserId(1), now, WINDOW).is_err());
}

#[test]
fn redacted_messages_lose_their_body() {
    let mut withdrawn = message(UserId(2), MessageKind::Text, Utc::now());
    withdrawn.status = DeliveryStatus::Withdrawn;
    withdrawn.withdraw_reason = Some(WithdrawReason::Sender);

    let payload = member_payload(&withdrawn);
    assert_eq!(payload.content, None);
    assert!(payload.mentions.is_empty());
    assert_eq!(payload.withdraw_reason, Some(WithdrawReason::Sender));
    assert_eq!(payload.seq, 4);

    let live = message(UserId(2), MessageKind::Text, Utc::now());
    assert_eq!(member_payload(&live).content.as_deref(), Some("hello"));
}

#[test]
fn summaries_are_prefixed_in_groups_and_truncated() {
    assert_eq!(
        summary(MessageKind::Image, None, "ann", ChannelKind::Group, 60),
        "ann: [image]"
    );
    assert_eq!(
        summary(MessageKind::Text, Some("abcdef"), "ann", ChannelKind::Direct, 3),
        "abc..."
    );
    assert_eq!(
        summary(MessageKind::Join, Some("bob joined"), "", ChannelKind::Group, 60),
        "bob joined"
    );
}
