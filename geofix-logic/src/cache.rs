use std::sync::{Arc, LazyLock, RwLock};

use log::error;

use crate::fix::Fix;

/// Single slot holding the most recent [Fix] seen by any request. Last writer wins.
///
/// Expiry is never enforced here, [crate::LocationSettings::expiry_ms] is only a hint to the
/// provider.
pub trait LocationStore: Send + Sync {
    fn get(&self) -> Option<Fix>;
    fn set(&self, fix: Fix);
}

#[derive(Debug, Default)]
/// [LocationStore] backed by a lock around the slot, replacing the whole value on write
pub struct SharedLocationCache {
    slot: RwLock<Option<Fix>>,
}

static GLOBAL: LazyLock<Arc<SharedLocationCache>> =
    LazyLock::new(|| Arc::new(SharedLocationCache::default()));

impl SharedLocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache, for hosts that want every helper to share one slot
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }
}

impl LocationStore for SharedLocationCache {
    fn get(&self) -> Option<Fix> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                error!("Location cache lock was poisoned");
                poisoned.into_inner().clone()
            }
        }
    }

    fn set(&self, fix: Fix) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Location cache lock was poisoned");
                poisoned.into_inner()
            }
        };
        *slot = Some(fix);
    }
}
