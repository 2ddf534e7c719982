//! Channel consistency and messaging engine.
//!
//! Every mutating operation on a channel runs under that channel's lock:
//! validate, commit to storage, then enqueue notifications before the lock is
//! released. Scanning and mobile push run afterwards as supervised background
//! tasks and never fail the caller.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use shared::error::{ApiError, ErrorCode};
use storage::Storage;
use tracing::{error, warn};

pub mod background;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod locks;
pub mod membership;
pub mod messaging;
pub mod moderation;
pub mod push;
pub mod read_state;
pub mod transport;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub use background::BackgroundTasks;
pub use config::EngineConfig;
pub use dispatch::Dispatcher;
pub use error::DependencyError;
pub use locks::ChannelLocks;
pub use moderation::{ModerationPolicy, ModerationProvider, ScanResult};
pub use push::{PushNotification, PushProvider};
pub use transport::{ConnectionRegistry, Transport};

#[derive(Clone)]
pub struct EngineContext {
    pub storage: Storage,
    pub config: Arc<EngineConfig>,
    pub locks: ChannelLocks,
    pub dispatcher: Dispatcher,
    pub tasks: BackgroundTasks,
    pub moderation: Arc<dyn ModerationProvider>,
    pub push: Arc<dyn PushProvider>,
    pub diagnostics: Arc<Diagnostics>,
}

impl EngineContext {
    /// Must be called from within a tokio runtime; dispatcher shards are spawned here.
    pub fn new(
        storage: Storage,
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ConnectionRegistry>,
        moderation: Arc<dyn ModerationProvider>,
        push: Arc<dyn PushProvider>,
    ) -> Self {
        let diagnostics = Arc::new(Diagnostics::default());
        let dispatcher = Dispatcher::new(
            config.dispatch_shards,
            transport,
            registry,
            diagnostics.clone(),
        );
        Self {
            storage,
            config: Arc::new(config),
            locks: ChannelLocks::default(),
            dispatcher,
            tasks: BackgroundTasks::new(diagnostics.clone()),
            moderation,
            push,
            diagnostics,
        }
    }

    /// Waits until no background task is running and every queued
    /// notification has been handed to the transport.
    pub async fn settle(&self) {
        loop {
            self.tasks.wait_idle().await;
            self.dispatcher.flush().await;
            if self.tasks.in_flight() == 0 {
                break;
            }
        }
    }
}

/// Counters for conditions that indicate a bug or a failing collaborator.
/// They never surface to callers.
#[derive(Debug, Default)]
pub struct Diagnostics {
    counter_underflows: AtomicU64,
    seq_collisions: AtomicU64,
    dependency_failures: AtomicU64,
}

impl Diagnostics {
    pub fn record_counter_underflow(&self) {
        self.counter_underflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seq_collision(&self) {
        self.seq_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dependency_failure(&self) {
        self.dependency_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter_underflows(&self) -> u64 {
        self.counter_underflows.load(Ordering::Relaxed)
    }

    pub fn seq_collisions(&self) -> u64 {
        self.seq_collisions.load(Ordering::Relaxed)
    }

    pub fn dependency_failures(&self) -> u64 {
        self.dependency_failures.load(Ordering::Relaxed)
    }
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "storage operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

/// Unwraps a step that runs after the change is already committed. A failure
/// is logged and counted; the caller still gets its result.
pub(crate) fn after_commit<T>(
    ctx: &EngineContext,
    step: &'static str,
    result: Result<T, ApiError>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            ctx.diagnostics.record_dependency_failure();
            warn!(step, code = ?err.code, reason = %err.message, "post-commit step failed");
            None
        }
    }
}
