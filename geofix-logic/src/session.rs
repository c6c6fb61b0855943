use std::sync::Arc;

use log::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    callbacks::{LocationCallbacks, SessionResult},
    error::LocationError,
    timeout::DeadlineHandle,
};

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a [Session] is in the acquisition state machine
pub enum SessionState {
    Idle,
    PermissionChecked,
    Connecting,
    Connected,
    CacheHit,
    SettingsCheck,
    Subscribed,
    FixReceived,
    TimedOut,
    Failed,
    Disconnected,
    Delivered,
}

/// State of one `request` call, from the permission check until its single result is
/// delivered. Never reused.
pub(crate) struct Session {
    pub id: SessionId,
    pub resolve_on_error: bool,
    pub force_new_location: bool,
    state: SessionState,
    callbacks: Option<Arc<dyn LocationCallbacks>>,
    delivered: bool,
    deadline: Option<DeadlineHandle>,
}

impl Session {
    pub fn new(
        resolve_on_error: bool,
        force_new_location: bool,
        callbacks: Option<Arc<dyn LocationCallbacks>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resolve_on_error,
            force_new_location,
            state: SessionState::Idle,
            callbacks,
            delivered: false,
            deadline: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn advance(&mut self, next: SessionState) {
        trace!("Session {}: {:?} -> {next:?}", self.id, self.state);
        self.state = next;
    }

    pub fn set_deadline(&mut self, deadline: DeadlineHandle) {
        if let Some(old) = self.deadline.replace(deadline) {
            warn!("Session {} armed a second deadline, cancelling the first", self.id);
            old.cancel();
        }
    }

    pub fn take_deadline(&mut self) -> Option<DeadlineHandle> {
        self.deadline.take()
    }

    /// False for prefetches, nobody is waiting on their outcome
    pub fn has_callbacks(&self) -> bool {
        self.callbacks.is_some()
    }

    /// Take over the caller of `waiting` so both are served by this session's outcome. Only
    /// valid while this session has no caller of its own.
    pub fn adopt(&mut self, mut waiting: Session) {
        trace!("Session {} adopting caller of {}", self.id, waiting.id);
        self.callbacks = waiting.callbacks.take();
        self.resolve_on_error = waiting.resolve_on_error;
        // Past `Connecting` the cached fix was already skipped or absent, so the fix this
        // session delivers is fresh either way
        self.force_new_location |= waiting.force_new_location;
        waiting.delivered = true;

        if self.state == SessionState::Subscribed {
            self.notify_requested();
        }
    }

    /// Throw away a session that has no caller without reporting anything
    pub fn discard(mut self) {
        trace!("Discarding session {}", self.id);
        self.delivered = true;
    }

    pub fn notify_requested(&self) {
        if let Some(callbacks) = &self.callbacks {
            callbacks.on_location_requested();
        }
    }

    /// Hand the terminal result to the caller. Returns false if a result was already
    /// delivered, in which case nothing is called.
    pub fn deliver(&mut self, res: SessionResult) -> bool {
        if self.delivered {
            debug!("Session {} already delivered, dropping {res:?}", self.id);
            return false;
        }
        self.delivered = true;
        self.advance(SessionState::Delivered);

        if let Some(callbacks) = &self.callbacks {
            match res {
                Ok(fix) => callbacks.on_location_received(fix),
                Err(why) => callbacks.on_error(why),
            }
        }
        true
    }

    pub fn fail(&mut self, why: LocationError) -> bool {
        self.deliver(Err(why))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.cancel();
        }
        if !self.delivered {
            debug!("Session {} dropped before delivering", self.id);
            self.fail(LocationError::Closed);
        }
    }
}
