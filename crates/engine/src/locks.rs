use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use shared::domain::ChannelId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

pub type ChannelGuard = OwnedMutexGuard<()>;

/// One async mutex per channel. Holding the guard serializes every mutation
/// of that channel; different channels never contend.
#[derive(Clone, Default)]
pub struct ChannelLocks {
    inner: Arc<Mutex<HashMap<ChannelId, Arc<AsyncMutex<()>>>>>,
}

impl ChannelLocks {
    pub async fn lock(&self, channel_id: ChannelId) -> ChannelGuard {
        let slot = {
            let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.len() >= PRUNE_THRESHOLD {
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(channel_id).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "tests/locks_tests.rs"]
mod tests;
