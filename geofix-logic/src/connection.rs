use std::{future::Future, sync::Arc};

use log::{debug, trace};

use crate::{
    fix::Fix,
    helper::{HelperEvent, HelperEventTx},
    session::SessionId,
    settings::UpdateRequest,
    validator::{ResolutionHandle, SettingsStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Why the provider could not be connected to
pub struct ConnectionFailure {
    /// Provider specific error code
    pub code: i32,
    pub message: String,
    /// Present if the user can fix the failure through a resolution flow
    pub resolution: Option<ResolutionHandle>,
}

impl ConnectionFailure {
    pub fn has_resolution(&self) -> bool {
        self.resolution.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendCause {
    ServiceDisconnected,
    NetworkLost,
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Lifecycle notifications of a [ServiceConnection]
pub enum ConnectionEvent {
    Connected,
    ConnectionFailed(ConnectionFailure),
    /// Accepted but not acted upon, the provider reconnects on its own or the request times
    /// out
    Suspended(SuspendCause),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Connection(ConnectionEvent),
    LocationChanged(Fix),
}

/// Callback channel a [LocationProvider] reports through. Each sink is tied to the request
/// that registered it, so reports that arrive after that request has finished are dropped.
#[derive(Clone)]
pub struct EventSink {
    session: SessionId,
    events: HelperEventTx,
}

impl EventSink {
    pub(crate) fn new(session: SessionId, events: HelperEventTx) -> Self {
        Self { session, events }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    fn send(&self, event: ProviderEvent) {
        trace!("Provider event for session {}: {event:?}", self.session);
        // The helper loop may already be gone, nobody is left to care
        self.events
            .send(HelperEvent::Provider(self.session, event))
            .ok();
    }

    pub fn connected(&self) {
        self.send(ProviderEvent::Connection(ConnectionEvent::Connected));
    }

    pub fn connection_failed(&self, failure: ConnectionFailure) {
        self.send(ProviderEvent::Connection(
            ConnectionEvent::ConnectionFailed(failure),
        ));
    }

    pub fn suspended(&self, cause: SuspendCause) {
        self.send(ProviderEvent::Connection(ConnectionEvent::Suspended(cause)));
    }

    pub fn location_changed(&self, fix: Fix) {
        self.send(ProviderEvent::LocationChanged(fix));
    }
}

/// The opaque location service. Implementations report asynchronous outcomes through the
/// [EventSink] they are handed.
pub trait LocationProvider: Send + Sync + 'static {
    /// Begin connecting, the outcome is reported through `events`
    fn connect(&self, events: EventSink);
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn is_connecting(&self) -> bool;
    /// Best-effort last known fix, without subscribing
    fn last_location(&self) -> Option<Fix>;
    /// Check whether the host's settings allow `request`
    fn check_settings(
        &self,
        request: &UpdateRequest,
    ) -> impl Future<Output = SettingsStatus> + Send;
    /// Subscribe to updates, fixes are reported through `events`
    fn request_updates(&self, request: &UpdateRequest, events: EventSink);
    /// Drop the active subscription, if any
    fn remove_updates(&self);
}

/// Lifecycle wrapper around a [LocationProvider] connection
pub struct ServiceConnection<P: LocationProvider> {
    provider: Arc<P>,
    events: HelperEventTx,
}

impl<P: LocationProvider> ServiceConnection<P> {
    pub(crate) fn new(provider: Arc<P>, events: HelperEventTx) -> Self {
        Self { provider, events }
    }

    pub(crate) fn sink(&self, session: SessionId) -> EventSink {
        EventSink::new(session, self.events.clone())
    }

    /// Start connecting on behalf of `session`. Does nothing while already connecting or
    /// connected.
    pub fn connect(&self, session: SessionId) {
        if self.is_connecting() || self.is_connected() {
            debug!("Provider already connecting/connected, not connecting again");
            return;
        }
        debug!("Connecting to location provider for session {session}");
        self.provider.connect(self.sink(session));
    }

    pub fn disconnect(&self) {
        debug!("Disconnecting from location provider");
        self.provider.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.provider.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.provider.is_connecting()
    }

    pub fn last_location(&self) -> Option<Fix> {
        self.provider.last_location()
    }

    pub fn request_updates(&self, session: SessionId, request: &UpdateRequest) {
        self.provider.request_updates(request, self.sink(session));
    }

    pub fn remove_updates(&self) {
        self.provider.remove_updates();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::tests::{MockProvider, ProviderCall};

    #[test]
    fn test_connect_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let provider = Arc::new(MockProvider::hanging());
        let connection = ServiceConnection::new(provider.clone(), tx);
        let session = Uuid::new_v4();

        connection.connect(session);
        assert!(connection.is_connecting());
        connection.connect(session);

        assert_eq!(provider.count_calls(|c| matches!(c, ProviderCall::Connect)), 1);
        assert!(rx.try_recv().is_err(), "Hanging provider reported an event");
    }

    #[test]
    fn test_connect_skipped_when_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let provider = Arc::new(MockProvider::connected());
        let connection = ServiceConnection::new(provider.clone(), tx);

        connection.connect(Uuid::new_v4());

        assert_eq!(provider.count_calls(|c| matches!(c, ProviderCall::Connect)), 0);
    }

    #[test]
    fn test_sink_stamps_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let provider = Arc::new(MockProvider::default());
        let connection = ServiceConnection::new(provider, tx);
        let session = Uuid::new_v4();

        connection.connect(session);

        match rx.try_recv() {
            Ok(HelperEvent::Provider(
                id,
                ProviderEvent::Connection(ConnectionEvent::Connected),
            )) => assert_eq!(id, session),
            other => panic!("Unexpected event: {other:?}"),
        }
    }
}
