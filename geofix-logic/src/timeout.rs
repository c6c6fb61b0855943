use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use log::trace;
use tokio_util::sync::CancellationToken;

/// Schedules deferred actions that can be cancelled until they run.
///
/// Every armed deadline is a child of the guard's root token, so [TimeoutGuard::shutdown]
/// cancels all of them at once.
#[derive(Clone, Default)]
pub struct TimeoutGuard {
    root: CancellationToken,
    outstanding: Arc<AtomicUsize>,
}

/// A single armed deadline, cancelling it after it has fired is a no-op
#[derive(Debug)]
pub struct DeadlineHandle {
    token: CancellationToken,
}

impl DeadlineHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl TimeoutGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_expire` after `after` unless the returned handle is cancelled first
    pub fn arm<F>(&self, after: Duration, on_expire: F) -> DeadlineHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.root.child_token();
        let cancelled = token.clone();
        let outstanding = self.outstanding.clone();
        outstanding.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = cancelled.cancelled() => {
                    trace!("Deadline cancelled");
                }

                _ = tokio::time::sleep(after) => {
                    trace!("Deadline of {after:?} expired");
                    on_expire();
                }
            }
            outstanding.fetch_sub(1, Ordering::SeqCst);
        });

        DeadlineHandle { token }
    }

    pub fn cancel(&self, handle: &DeadlineHandle) {
        handle.cancel();
    }

    /// Number of deadlines whose timer task hasn't finished yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }
}
