use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::{error::LocationError, fix::Fix};

/// Caller supplied capability set. At most one of [LocationCallbacks::on_location_received]
/// and [LocationCallbacks::on_error] is called per request, and exactly once.
pub trait LocationCallbacks: Send + Sync {
    /// A subscription for a fresh fix has been armed
    fn on_location_requested(&self) {}
    fn on_location_received(&self, fix: Fix);
    fn on_error(&self, error: LocationError);
}

pub type SessionResult = Result<Fix, LocationError>;

/// Callbacks that forward the terminal outcome into a oneshot channel, used to turn a request
/// into a single awaitable call
pub struct OneshotCallbacks {
    tx: Mutex<Option<oneshot::Sender<SessionResult>>>,
}

impl OneshotCallbacks {
    pub fn new() -> (Self, oneshot::Receiver<SessionResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn finish(&self, res: SessionResult) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = tx {
            // Receiver dropping means the caller stopped waiting
            tx.send(res).ok();
        }
    }
}

impl LocationCallbacks for OneshotCallbacks {
    fn on_location_received(&self, fix: Fix) {
        self.finish(Ok(fix));
    }

    fn on_error(&self, error: LocationError) {
        self.finish(Err(error));
    }
}
