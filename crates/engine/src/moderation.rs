//! Content moderation: the verdict policy table, the scanner collaborator and
//! the code that turns verdicts (scanner or human) into lifecycle transitions.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{DeliveryStatus, MessageId, ModerationStatus, Verdict, WithdrawReason},
    error::ApiError,
    protocol::MessagePayload,
};
use tracing::{info, warn};

use crate::{
    background::retry,
    error::DependencyError,
    after_commit, internal, lifecycle,
    messaging::{self, load_channel},
    EngineContext,
};

pub const DEFAULT_SENSITIVE_CATEGORIES: [&str; 4] = ["politics", "terrorism", "porn", "contraband"];

/// Outcome of looking up a verdict in the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRule {
    Pass,
    Review,
    /// Blocked in a sensitive category: the message is prohibited and withdrawn.
    BlockSensitive,
    /// Blocked in a category outside the sensitive set; treated as a pass.
    BlockDemoted,
}

impl PolicyRule {
    pub fn status(self) -> ModerationStatus {
        match self {
            Self::Pass | Self::BlockDemoted => ModerationStatus::Normal,
            Self::Review => ModerationStatus::Suspected,
            Self::BlockSensitive => ModerationStatus::Prohibited,
        }
    }
}

/// `(verdict, category is sensitive) -> rule`. The only place a block signal
/// is discarded is the `(Block, false)` row.
const POLICY_TABLE: [(Verdict, bool, PolicyRule); 6] = [
    (Verdict::Pass, false, PolicyRule::Pass),
    (Verdict::Pass, true, PolicyRule::Pass),
    (Verdict::Review, false, PolicyRule::Review),
    (Verdict::Review, true, PolicyRule::Review),
    (Verdict::Block, true, PolicyRule::BlockSensitive),
    (Verdict::Block, false, PolicyRule::BlockDemoted),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationPolicy {
    sensitive_categories: BTreeSet<String>,
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_CATEGORIES)
    }
}

impl ModerationPolicy {
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sensitive_categories: categories
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    pub fn is_sensitive(&self, category: &str) -> bool {
        self.sensitive_categories
            .contains(&category.trim().to_ascii_lowercase())
    }

    pub fn rule(&self, verdict: Verdict, category: &str) -> PolicyRule {
        let sensitive = self.is_sensitive(category);
        POLICY_TABLE
            .iter()
            .find(|(v, s, _)| *v == verdict && *s == sensitive)
            .map(|(_, _, rule)| *rule)
            .unwrap_or(PolicyRule::Review)
    }
}

/// Withdraw reason reported for a scanner block in `category`.
pub fn scanner_reason(category: &str) -> WithdrawReason {
    match category.trim().to_ascii_lowercase().as_str() {
        "porn" => WithdrawReason::ScannerPorn,
        "politics" | "terrorism" => WithdrawReason::ScannerTerrorism,
        _ => WithdrawReason::ScannerAntispam,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub verdict: Verdict,
    pub category: String,
}

#[async_trait]
pub trait ModerationProvider: Send + Sync {
    async fn scan(&self, content: &str) -> Result<ScanResult, DependencyError>;
}

/// Applies a scanner verdict to the message sent with `cid`.
pub async fn apply_moderation_verdict(
    ctx: &EngineContext,
    cid: &str,
    verdict: Verdict,
    category: &str,
) -> Result<(), ApiError> {
    let rule = ctx.config.moderation.rule(verdict, category);
    let reason = scanner_reason(category);
    let message_id = ctx
        .storage
        .find_message_by_cid(cid)
        .await
        .map_err(internal)?
        .filter(|m| m.kind.is_scanned())
        .ok_or_else(|| ApiError::not_found("message not found"))?
        .message_id;
    if rule == PolicyRule::BlockDemoted {
        info!(%cid, category, "block verdict outside sensitive set treated as pass");
    }
    transition(ctx, message_id, rule.status(), reason).await
}

/// Human moderator decision. `prohibited` withdraws with the auditor reason.
pub async fn audit_message(
    ctx: &EngineContext,
    message_id: MessageId,
    status: ModerationStatus,
) -> Result<(), ApiError> {
    if status == ModerationStatus::Pending {
        return Err(ApiError::validation("audit status must be a final verdict"));
    }
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    if !message.kind.is_counted() {
        return Err(ApiError::validation("structural events cannot be audited"));
    }
    transition(ctx, message_id, status, WithdrawReason::Auditor).await
}

pub async fn list_flagged(
    ctx: &EngineContext,
    status: ModerationStatus,
    limit: u32,
) -> Result<Vec<MessagePayload>, ApiError> {
    let messages = ctx
        .storage
        .list_by_moderation_status(status, limit.clamp(1, 500))
        .await
        .map_err(internal)?;
    Ok(messages.iter().map(lifecycle::payload).collect())
}

async fn transition(
    ctx: &EngineContext,
    message_id: MessageId,
    status: ModerationStatus,
    reason: WithdrawReason,
) -> Result<(), ApiError> {
    let Some(message) = ctx.storage.get_message(message_id).await.map_err(internal)? else {
        return Err(ApiError::not_found("message not found"));
    };
    let _guard = ctx.locks.lock(message.channel_id).await;
    let message = ctx
        .storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;

    if message.moderation_status == ModerationStatus::Prohibited {
        return Ok(());
    }

    if status != ModerationStatus::Prohibited {
        ctx.storage
            .set_moderation_status(message_id, status, Utc::now())
            .await
            .map_err(internal)?;
        info!(%message_id, ?status, "moderation status recorded");
        return Ok(());
    }

    if !lifecycle::is_removable(message.status) {
        // Already withdrawn or deleted; counters are settled, only the label moves.
        // The latest verdict wins, so a later pass may relabel it normal.
        ctx.storage
            .set_moderation_status(message_id, status, Utc::now())
            .await
            .map_err(internal)?;
        return Ok(());
    }

    let channel = load_channel(ctx, message.channel_id).await?;
    let removed = messaging::remove_locked(
        ctx,
        &channel,
        &message,
        DeliveryStatus::Withdrawn,
        Some(reason),
        Some(ModerationStatus::Prohibited),
    )
    .await?;
    if removed {
        messaging::notify_author(ctx, &message, reason);
        let total = ctx
            .storage
            .increment_prohibited_count(message.sender_id)
            .await
            .map_err(internal);
        let total = after_commit(ctx, "prohibited_count", total);
        warn!(
            %message_id,
            sender_id = %message.sender_id,
            ?reason,
            prohibited_total = ?total,
            "message prohibited"
        );
    }
    Ok(())
}

/// Sends the content to the scanner in the background and applies the verdict.
pub(crate) fn spawn_scan(ctx: &EngineContext, cid: String, content: String) {
    let engine = ctx.clone();
    ctx.tasks.spawn("moderation_scan", async move {
        let provider = engine.moderation.clone();
        let result = retry(
            "moderation_scan",
            engine.config.scan_retry_attempts,
            engine.config.retry_base_delay,
            || {
                let provider = provider.clone();
                let content = content.clone();
                async move { provider.scan(&content).await }
            },
        )
        .await?;
        apply_moderation_verdict(&engine, &cid, result.verdict, &result.category).await?;
        Ok(())
    });
}

#[cfg(test)]
#[path = "tests/moderation_tests.rs"]
mod tests;
