//! Collaborators used when no external moderation or push vendor is wired in.

use async_trait::async_trait;
use engine::{DependencyError, ModerationProvider, PushNotification, PushProvider, ScanResult};
use shared::domain::Verdict;
use tracing::{debug, info};

/// Lets everything through. Human auditors can still act on messages later.
#[derive(Debug, Default)]
pub struct PassThroughScanner;

#[async_trait]
impl ModerationProvider for PassThroughScanner {
    async fn scan(&self, content: &str) -> Result<ScanResult, DependencyError> {
        debug!(chars = content.chars().count(), "scan skipped");
        Ok(ScanResult {
            verdict: Verdict::Pass,
            category: "normal".into(),
        })
    }
}

/// Writes notifications to the log instead of a vendor gateway.
#[derive(Debug, Default)]
pub struct LogPush;

#[async_trait]
impl PushProvider for LogPush {
    async fn push(&self, notification: &PushNotification) -> Result<(), DependencyError> {
        info!(
            channel_id = %notification.channel_id,
            message_id = %notification.message_id,
            targets = notification.user_ids.len(),
            title = %notification.title,
            "push notification"
        );
        Ok(())
    }
}
