use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::{error::DependencyError, Diagnostics};

/// Supervisor for fire-and-forget work. Failures and panics are logged and
/// counted; the in-flight count lets tests wait for quiescence.
#[derive(Clone)]
pub struct BackgroundTasks {
    inner: Arc<TasksInner>,
}

struct TasksInner {
    in_flight: AtomicUsize,
    idle: Notify,
    diagnostics: Arc<Diagnostics>,
}

impl BackgroundTasks {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            inner: Arc::new(TasksInner {
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                diagnostics,
            }),
        }
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), DependencyError>> + Send + 'static,
    {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match tokio::spawn(task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    inner.diagnostics.record_dependency_failure();
                    warn!(task = name, %error, "background task failed");
                }
                Err(join_error) => {
                    inner.diagnostics.record_dependency_failure();
                    error!(task = name, %join_error, "background task panicked");
                }
            }
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Runs `op` up to `attempts` times with exponential backoff starting at `base_delay`.
pub async fn retry<T, F, Fut>(
    name: &'static str,
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, DependencyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DependencyError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    let mut delay = base_delay;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= attempts => return Err(error),
            Err(error) => {
                debug!(task = name, attempt, %error, "retrying after failure");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/background_tests.rs"]
mod tests;
