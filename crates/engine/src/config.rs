use std::time::Duration;

use crate::moderation::ModerationPolicy;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an author may withdraw their own message.
    pub withdraw_window: Duration,
    /// Maximum number of seqs returned by one range read.
    pub range_window: i64,
    pub default_member_limit: i64,
    /// Number of member avatars composed into a group avatar.
    pub avatar_mosaic_size: i64,
    /// Number of member nicknames used to name an unnamed group.
    pub group_name_members: usize,
    pub last_msg_max_chars: usize,
    pub max_text_chars: usize,
    pub moderation: ModerationPolicy,
    pub scan_retry_attempts: u32,
    pub push_retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub dispatch_shards: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            withdraw_window: Duration::from_secs(120),
            range_window: 15,
            default_member_limit: 1000,
            avatar_mosaic_size: 9,
            group_name_members: 3,
            last_msg_max_chars: 60,
            max_text_chars: 5000,
            moderation: ModerationPolicy::default(),
            scan_retry_attempts: 3,
            push_retry_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            dispatch_shards: 8,
        }
    }
}
