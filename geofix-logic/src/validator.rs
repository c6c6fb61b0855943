use std::sync::Arc;

use log::{debug, info};
use uuid::Uuid;

use crate::{
    connection::LocationProvider,
    helper::{HelperEvent, HelperEventTx},
    session::SessionId,
    settings::UpdateRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Opaque token from the provider that a host can use to show a resolution flow
pub struct ResolutionHandle(Uuid);

impl ResolutionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for ResolutionHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of checking the host's location settings against an [UpdateRequest]
pub enum SettingsStatus {
    /// Settings allow the subscription as-is
    Satisfied,
    /// The user has to change settings, the handle can drive a resolution dialog
    ResolutionRequired(ResolutionHandle),
    /// Settings are inadequate and no dialog can fix them
    ChangeUnavailable,
}

/// Asks the provider whether an [UpdateRequest] can be satisfied and posts the answer back to
/// the helper loop once it arrives.
pub struct SettingsValidator<P: LocationProvider> {
    provider: Arc<P>,
    events: HelperEventTx,
}

impl<P: LocationProvider + 'static> SettingsValidator<P> {
    pub(crate) fn new(provider: Arc<P>, events: HelperEventTx) -> Self {
        Self { provider, events }
    }

    pub(crate) fn check(&self, session: SessionId, request: UpdateRequest) {
        debug!("Checking location settings for session {session}");
        let provider = self.provider.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = provider.check_settings(&request).await;
            match &status {
                SettingsStatus::Satisfied => info!("All location settings are satisfied"),
                SettingsStatus::ResolutionRequired(_) => {
                    info!("Location settings are not satisfied, resolution required")
                }
                SettingsStatus::ChangeUnavailable => {
                    info!("Location settings are inadequate and cannot be fixed here")
                }
            }
            events.send(HelperEvent::Settings(session, status)).ok();
        });
    }
}
