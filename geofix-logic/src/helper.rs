use std::{collections::VecDeque, sync::Arc};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::LocationStore,
    callbacks::{LocationCallbacks, OneshotCallbacks, SessionResult},
    connection::{
        ConnectionEvent, ConnectionFailure, LocationProvider, ProviderEvent, ServiceConnection,
    },
    error::LocationError,
    fix::Fix,
    host::{Host, ResolutionKind, ResolutionRequest},
    permission::LocationPermissions,
    prelude::*,
    session::{Session, SessionId, SessionState},
    settings::LocationSettings,
    timeout::TimeoutGuard,
    validator::{SettingsStatus, SettingsValidator},
};

/// Everything that can happen to a session after it was started, funneled into the helper loop
#[derive(Debug)]
pub(crate) enum HelperEvent {
    Provider(SessionId, ProviderEvent),
    Settings(SessionId, SettingsStatus),
    Expired(SessionId),
}

pub(crate) type HelperEventTx = mpsc::UnboundedSender<HelperEvent>;
type HelperEventRx = mpsc::UnboundedReceiver<HelperEvent>;

/// Front door for location requests. Cheap to clone and call from anywhere, all the actual
/// work happens in the paired [HelperLoop], which stops once every clone is dropped.
pub struct LocationHelper<A: LocationPermissions, S: LocationStore> {
    permissions: A,
    cache: Arc<S>,
    requests: mpsc::UnboundedSender<Session>,
    timeouts: TimeoutGuard,
    cancel: CancellationToken,
}

impl<A: LocationPermissions + Clone, S: LocationStore> Clone for LocationHelper<A, S> {
    fn clone(&self) -> Self {
        Self {
            permissions: self.permissions.clone(),
            cache: self.cache.clone(),
            requests: self.requests.clone(),
            timeouts: self.timeouts.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<A: LocationPermissions, S: LocationStore + 'static> LocationHelper<A, S> {
    /// Create a helper and the loop that drives it, the loop has to be run with
    /// [HelperLoop::main_loop] for requests to make progress.
    pub fn new<P: LocationProvider>(
        provider: Arc<P>,
        permissions: A,
        cache: Arc<S>,
        host: Host,
        settings: LocationSettings,
    ) -> Result<(Self, HelperLoop<P, S>)> {
        settings.validate().context("Invalid location settings")?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timeouts = TimeoutGuard::new();
        let cancel = CancellationToken::new();

        let main_loop = HelperLoop {
            connection: ServiceConnection::new(provider.clone(), events_tx.clone()),
            validator: SettingsValidator::new(provider, events_tx.clone()),
            timeouts: timeouts.clone(),
            cache: cache.clone(),
            host,
            settings,
            active: None,
            queue: VecDeque::new(),
            accepting: true,
            requests: requests_rx,
            events: events_rx,
            events_tx,
            cancel: cancel.clone(),
        };

        let helper = Self {
            permissions,
            cache,
            requests: requests_tx,
            timeouts,
            cancel,
        };

        Ok((helper, main_loop))
    }

    /// Same as [LocationHelper::new] but spawns the loop on the current tokio runtime
    pub fn spawn<P: LocationProvider>(
        provider: Arc<P>,
        permissions: A,
        cache: Arc<S>,
        host: Host,
        settings: LocationSettings,
    ) -> Result<Self> {
        let (helper, main_loop) = Self::new(provider, permissions, cache, host, settings)?;
        tokio::spawn(main_loop.main_loop());
        Ok(helper)
    }

    /// Warm the cache in the background, nobody hears about the outcome
    pub fn prefetch(&self) {
        self.request(false, false, None);
    }

    /// The most recent fix any request obtained. When there is none yet, a background request
    /// is started so later callers have something.
    pub fn last_location(&self) -> Option<Fix> {
        let cached = self.cache.get();
        if cached.is_none() {
            debug!("No cached location, prefetching");
            self.prefetch();
        }
        cached
    }

    pub fn request_location(&self, callbacks: Option<Arc<dyn LocationCallbacks>>) {
        self.request(false, false, callbacks);
    }

    /// Request a location. `callbacks` hears about exactly one terminal outcome.
    ///
    /// - `resolve_on_error`: let an interactive [Host] try to fix settings or connection
    ///   problems (the request still fails)
    /// - `force_new_location`: don't accept the provider's last known fix, always subscribe
    pub fn request(
        &self,
        resolve_on_error: bool,
        force_new_location: bool,
        callbacks: Option<Arc<dyn LocationCallbacks>>,
    ) {
        if !self.permissions.is_location_authorized() {
            info!("Location permission denied");
            if let Some(callbacks) = callbacks {
                callbacks.on_error(LocationError::PermissionDenied);
            }
            return;
        }

        let mut session = Session::new(resolve_on_error, force_new_location, callbacks);
        session.advance(SessionState::PermissionChecked);

        if let Err(mpsc::error::SendError(mut session)) = self.requests.send(session) {
            warn!("Location helper loop isn't running, failing request");
            session.fail(LocationError::Closed);
        }
    }

    /// [LocationHelper::request] as a single awaitable call
    pub async fn request_fix(
        &self,
        resolve_on_error: bool,
        force_new_location: bool,
    ) -> Result<Fix, LocationError> {
        let (callbacks, rx) = OneshotCallbacks::new();
        self.request(resolve_on_error, force_new_location, Some(Arc::new(callbacks)));
        rx.await.unwrap_or(Err(LocationError::Closed))
    }

    /// Number of request timeouts still armed
    pub fn outstanding_deadlines(&self) -> usize {
        self.timeouts.outstanding()
    }

    /// Stop the helper loop, any unfinished request fails with [LocationError::Closed]
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Serialization point for every request made through a [LocationHelper]. Only one session is
/// active at a time, the rest wait in line.
pub struct HelperLoop<P: LocationProvider, S: LocationStore> {
    connection: ServiceConnection<P>,
    validator: SettingsValidator<P>,
    timeouts: TimeoutGuard,
    cache: Arc<S>,
    host: Host,
    settings: LocationSettings,
    active: Option<Session>,
    queue: VecDeque<Session>,
    /// False once every [LocationHelper] is gone
    accepting: bool,
    requests: mpsc::UnboundedReceiver<Session>,
    events: HelperEventRx,
    events_tx: HelperEventTx,
    cancel: CancellationToken,
}

impl<P: LocationProvider, S: LocationStore> HelperLoop<P, S> {
    pub async fn main_loop(mut self) {
        'helper: loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break 'helper;
                }

                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                }

                request = self.requests.recv(), if self.accepting => {
                    match request {
                        Some(session) => self.enqueue(session),
                        None => {
                            debug!("All location helpers dropped, finishing remaining requests");
                            self.accepting = false;
                        }
                    }
                }
            }

            self.start_next();

            if !self.accepting && self.active.is_none() && self.queue.is_empty() {
                break 'helper;
            }
        }

        self.teardown();
    }

    /// Line up a new session. Requests without callbacks only warm the cache, so they are
    /// folded into whatever acquisition is already pending instead of running their own.
    fn enqueue(&mut self, session: Session) {
        if !session.has_callbacks() {
            if self.active.is_some() || !self.queue.is_empty() {
                debug!("Acquisition already pending, dropping prefetch {}", session.id);
                session.discard();
                return;
            }
        } else if let Some(active) = self.active.as_mut().filter(|a| !a.has_callbacks()) {
            debug!("Session {} joins running prefetch {}", session.id, active.id);
            active.adopt(session);
            return;
        }
        self.queue.push_back(session);
    }

    fn start_next(&mut self) {
        // A session can finish straight away on a cache hit, so keep going until one sticks
        while self.active.is_none() {
            let Some(session) = self.queue.pop_front() else {
                break;
            };
            self.begin(session);
        }
    }

    fn begin(&mut self, mut session: Session) {
        let id = session.id;
        let force = session.force_new_location;
        debug!("Starting location session {id}");

        if self.connection.is_connected() {
            session.advance(SessionState::Connected);
            self.active = Some(session);

            if !force {
                if let Some(fix) = self.connection.last_location() {
                    self.finish(SessionState::CacheHit, Ok(fix));
                    return;
                }
            }
            self.check_settings();
        } else {
            session.advance(SessionState::Connecting);
            self.active = Some(session);
            self.connection.connect(id);
        }
    }

    /// Whether `id` is the active session and is currently in `state`, events that fail this
    /// are stale and get dropped
    fn is_active_in(&self, id: SessionId, state: SessionState) -> bool {
        match &self.active {
            Some(session) if session.id == id && session.state() == state => true,
            Some(session) if session.id == id => {
                debug!(
                    "Session {id} got an event while {:?}, ignoring",
                    session.state()
                );
                false
            }
            _ => {
                debug!("Ignoring event for inactive session {id}");
                false
            }
        }
    }

    fn resolve_on_error(&self) -> bool {
        self.active.as_ref().is_some_and(|s| s.resolve_on_error)
    }

    fn handle_event(&mut self, event: HelperEvent) {
        match event {
            HelperEvent::Provider(id, ProviderEvent::Connection(event)) => match event {
                ConnectionEvent::Connected => self.on_connected(id),
                ConnectionEvent::ConnectionFailed(failure) => {
                    self.on_connection_failed(id, failure)
                }
                ConnectionEvent::Suspended(cause) => {
                    debug!("Provider connection suspended ({cause:?}) during session {id}");
                }
            },
            HelperEvent::Provider(id, ProviderEvent::LocationChanged(fix)) => {
                if self.is_active_in(id, SessionState::Subscribed) {
                    self.finish(SessionState::FixReceived, Ok(fix));
                }
            }
            HelperEvent::Settings(id, status) => self.on_settings_checked(id, status),
            HelperEvent::Expired(id) => {
                if self.is_active_in(id, SessionState::Subscribed) {
                    info!("Location request {id} timed out");
                    self.finish(SessionState::TimedOut, Err(LocationError::Timeout));
                }
            }
        }
    }

    fn on_connected(&mut self, id: SessionId) {
        if !self.is_active_in(id, SessionState::Connecting) {
            return;
        }

        let cached = self.connection.last_location();
        let Some(session) = self.active.as_mut() else {
            return;
        };
        session.advance(SessionState::Connected);
        let force = session.force_new_location;

        match cached {
            Some(fix) if !force => self.finish(SessionState::CacheHit, Ok(fix)),
            Some(fix) => {
                self.cache.set(fix);
                self.check_settings();
            }
            None => self.check_settings(),
        }
    }

    fn on_connection_failed(&mut self, id: SessionId, failure: ConnectionFailure) {
        if !self.is_active_in(id, SessionState::Connecting) {
            return;
        }
        warn!(
            "Location provider connection failed (code {}): {}",
            failure.code, failure.message
        );

        if let (true, Host::Interactive(host)) = (self.resolve_on_error(), &self.host) {
            if let Some(handle) = failure.resolution.clone() {
                let request = ResolutionRequest::new(ResolutionKind::ConnectionError, Some(handle));
                if let Err(why) = host.start_resolution(request) {
                    error!("Failed to start connection resolution: {why:?}");
                }
            } else {
                let request = ResolutionRequest::new(ResolutionKind::ErrorDialog, None);
                host.show_error_dialog(failure.code, request);
            }
        }

        let why = LocationError::ConnectionFailed {
            code: failure.code,
            resolvable: failure.has_resolution(),
        };
        self.finish(SessionState::Failed, Err(why));
    }

    fn check_settings(&mut self) {
        let Some(session) = self.active.as_mut() else {
            return;
        };
        session.advance(SessionState::SettingsCheck);
        self.validator
            .check(session.id, self.settings.update_request());
    }

    fn on_settings_checked(&mut self, id: SessionId, status: SettingsStatus) {
        if !self.is_active_in(id, SessionState::SettingsCheck) {
            return;
        }

        match status {
            SettingsStatus::Satisfied => self.start_updates(),
            SettingsStatus::ResolutionRequired(handle) => {
                if self.resolve_on_error() {
                    if let Some(ui) = self.host.ui() {
                        let request =
                            ResolutionRequest::new(ResolutionKind::LocationSettings, Some(handle));
                        if let Err(why) = ui.start_resolution(request) {
                            warn!("Unable to start location settings resolution: {why:?}");
                        }
                    } else {
                        debug!("No usable interactive host, can't resolve location settings");
                    }
                }
                // The resolution's outcome is never awaited, the caller retries once settings
                // are fixed
                self.finish(
                    SessionState::Failed,
                    Err(LocationError::SettingsResolutionRequired),
                );
            }
            SettingsStatus::ChangeUnavailable => self.finish(
                SessionState::Failed,
                Err(LocationError::SettingsUnsatisfiable),
            ),
        }
    }

    fn start_updates(&mut self) {
        let request = self.settings.update_request();
        let timeout = self.settings.timeout();
        let Some(session) = self.active.as_mut() else {
            return;
        };
        let id = session.id;

        self.connection.request_updates(id, &request);

        let events = self.events_tx.clone();
        let deadline = self.timeouts.arm(timeout, move || {
            events.send(HelperEvent::Expired(id)).ok();
        });
        session.set_deadline(deadline);
        session.advance(SessionState::Subscribed);
        info!("Location updates requested for session {id}, waiting up to {timeout:?}");

        session.notify_requested();
    }

    /// Tear down the active session and deliver its result. The only way a session ends.
    fn finish(&mut self, via: SessionState, res: SessionResult) {
        let Some(mut session) = self.active.take() else {
            return;
        };
        let subscribed = session.state() == SessionState::Subscribed;
        session.advance(via);

        if let Some(deadline) = session.take_deadline() {
            self.timeouts.cancel(&deadline);
        }
        if subscribed && self.connection.is_connected() {
            self.connection.remove_updates();
        }
        if let Ok(fix) = &res {
            self.cache.set(fix.clone());
        }
        self.connection.disconnect();
        session.advance(SessionState::Disconnected);

        debug!("Location session {} finished: {res:?}", session.id);
        session.deliver(res);
    }

    fn teardown(&mut self) {
        if self.active.is_some() {
            self.finish(SessionState::Failed, Err(LocationError::Closed));
        }
        for mut session in self.queue.drain(..) {
            session.fail(LocationError::Closed);
        }
        self.requests.close();
        while let Ok(mut session) = self.requests.try_recv() {
            session.fail(LocationError::Closed);
        }
        self.timeouts.shutdown();
        info!("Location helper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        cache::SharedLocationCache,
        connection::{ConnectionFailure, SuspendCause},
        permission::{AllowAll, LocationPermission},
        tests::{
            CallbackEvent, MockHost, MockProvider, ProviderCall, RecordingCallbacks, test_fix,
        },
        validator::ResolutionHandle,
    };
    use tokio::{
        test,
        time::{Instant, sleep},
    };

    type TestHelper = LocationHelper<AllowAll, SharedLocationCache>;

    struct Harness {
        helper: TestHelper,
        provider: Arc<MockProvider>,
        cache: Arc<SharedLocationCache>,
        host: Arc<MockHost>,
    }

    impl Harness {
        fn new(provider: MockProvider) -> Self {
            Self::with_host(provider, MockHost::default(), false)
        }

        fn with_host(provider: MockProvider, host: MockHost, interactive: bool) -> Self {
            let provider = Arc::new(provider);
            let cache = Arc::new(SharedLocationCache::new());
            let host = Arc::new(host);
            let helper_host = if interactive {
                Host::Interactive(host.clone())
            } else {
                Host::NonInteractive
            };
            let helper = TestHelper::spawn(
                provider.clone(),
                AllowAll,
                cache.clone(),
                helper_host,
                LocationSettings::default(),
            )
            .expect("Failed to start helper");

            Self {
                helper,
                provider,
                cache,
                host,
            }
        }

        fn request(&self, resolve_on_error: bool, force: bool) -> Arc<RecordingCallbacks> {
            let recorder = Arc::new(RecordingCallbacks::default());
            self.helper
                .request(resolve_on_error, force, Some(recorder.clone()));
            recorder
        }

        fn calls(&self, f: impl Fn(&ProviderCall) -> bool) -> usize {
            self.provider.count_calls(f)
        }

        fn assert_released(&self) {
            assert!(
                !self.provider.is_connected(),
                "Provider left connected after session ended"
            );
            assert_eq!(
                self.helper.outstanding_deadlines(),
                0,
                "Timer left armed after session ended"
            );
        }
    }

    /// Let every ready task run without moving the clock in any meaningful way
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[test(start_paused = true)]
    async fn test_cached_fix_on_connect() {
        let f1 = test_fix(1.0);
        let h = Harness::new(MockProvider::default().with_last_location(f1.clone()));

        let recorder = h.request(false, false);
        settle().await;

        assert_eq!(recorder.events(), vec![CallbackEvent::Received(f1.clone())]);
        assert_eq!(h.cache.get(), Some(f1));
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Connect)), 1);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RequestUpdates(_))), 0);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::CheckSettings(_))), 0);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_fresh_fix_before_timeout() {
        let f2 = test_fix(2.0);
        let provider = MockProvider::connected().with_fix_after(Duration::from_secs(2), f2.clone());
        let h = Harness::new(provider);

        let recorder = h.request(false, false);
        settle().await;

        assert_eq!(recorder.events(), vec![CallbackEvent::Requested]);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Connect)), 0);
        assert_eq!(h.helper.outstanding_deadlines(), 1);

        sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Requested, CallbackEvent::Received(f2.clone())]
        );
        assert_eq!(h.cache.get(), Some(f2));
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RemoveUpdates)), 1);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_subscription_uses_settings() {
        let h = Harness::new(MockProvider::connected());

        h.request(false, false);
        settle().await;

        let expected = LocationSettings::default().update_request();
        assert_eq!(
            h.calls(|c| *c == ProviderCall::CheckSettings(expected.clone())),
            1
        );
        assert_eq!(
            h.calls(|c| *c == ProviderCall::RequestUpdates(expected.clone())),
            1
        );
    }

    #[test(start_paused = true)]
    async fn test_timeout_without_fix() {
        let h = Harness::new(MockProvider::connected());

        let recorder = h.request(false, false);
        settle().await;

        sleep(Duration::from_secs(9)).await;
        assert_eq!(recorder.events(), vec![CallbackEvent::Requested]);

        sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![
                CallbackEvent::Requested,
                CallbackEvent::Error(LocationError::Timeout)
            ]
        );
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RemoveUpdates)), 1);
        assert!(h.cache.get().is_none());
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_resolution_required_without_resolve() {
        let provider = MockProvider::connected()
            .with_settings(SettingsStatus::ResolutionRequired(ResolutionHandle::new()));
        let h = Harness::with_host(provider, MockHost::default(), true);

        let recorder = h.request(false, false);
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(
                LocationError::SettingsResolutionRequired
            )]
        );
        assert!(h.host.resolutions().is_empty());
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RequestUpdates(_))), 0);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_resolution_required_emits_signal() {
        let handle = ResolutionHandle::new();
        let provider = MockProvider::connected()
            .with_settings(SettingsStatus::ResolutionRequired(handle.clone()));
        let h = Harness::with_host(provider, MockHost::default(), true);

        let recorder = h.request(true, false);
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(
                LocationError::SettingsResolutionRequired
            )]
        );
        assert_eq!(
            h.host.resolutions(),
            vec![ResolutionRequest::new(
                ResolutionKind::LocationSettings,
                Some(handle)
            )]
        );
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_resolution_skipped_for_finishing_or_headless_host() {
        let status = SettingsStatus::ResolutionRequired(ResolutionHandle::new());

        let h = Harness::with_host(
            MockProvider::connected().with_settings(status.clone()),
            MockHost::finishing(),
            true,
        );
        let recorder = h.request(true, false);
        settle().await;
        assert_eq!(recorder.terminal_count(), 1);
        assert!(h.host.resolutions().is_empty());

        let h = Harness::new(MockProvider::connected().with_settings(status));
        let recorder = h.request(true, false);
        settle().await;
        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(
                LocationError::SettingsResolutionRequired
            )]
        );
        assert!(h.host.resolutions().is_empty());
    }

    #[test(start_paused = true)]
    async fn test_failed_resolution_still_errors() {
        let provider = MockProvider::connected()
            .with_settings(SettingsStatus::ResolutionRequired(ResolutionHandle::new()));
        let h = Harness::with_host(provider, MockHost::failing(), true);

        let recorder = h.request(true, false);
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(
                LocationError::SettingsResolutionRequired
            )]
        );
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_settings_unavailable() {
        let provider = MockProvider::default().with_settings(SettingsStatus::ChangeUnavailable);
        let h = Harness::new(provider);

        let recorder = h.request(true, false);
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(LocationError::SettingsUnsatisfiable)]
        );
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_permission_denied() {
        let provider = Arc::new(MockProvider::default().with_last_location(test_fix(1.0)));
        let deny_fine = |p: LocationPermission| p != LocationPermission::Fine;
        let helper = LocationHelper::spawn(
            provider.clone(),
            deny_fine,
            Arc::new(SharedLocationCache::new()),
            Host::NonInteractive,
            LocationSettings::default(),
        )
        .expect("Failed to start helper");

        let recorder = Arc::new(RecordingCallbacks::default());
        helper.request(false, false, Some(recorder.clone()));

        // Delivered before the loop ever runs
        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(LocationError::PermissionDenied)]
        );

        settle().await;
        assert!(provider.calls().is_empty(), "Provider was touched");
    }

    #[test(start_paused = true)]
    async fn test_connection_failure_dialogs() {
        let unresolvable = ConnectionFailure {
            code: 9,
            message: "Service invalid".to_string(),
            resolution: None,
        };
        let h = Harness::with_host(
            MockProvider::failing(unresolvable),
            MockHost::default(),
            true,
        );
        let recorder = h.request(true, false);
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(LocationError::ConnectionFailed {
                code: 9,
                resolvable: false
            })]
        );
        assert_eq!(h.host.dialogs(), vec![9]);
        assert!(h.host.resolutions().is_empty());
        h.assert_released();

        let handle = ResolutionHandle::new();
        let resolvable = ConnectionFailure {
            code: 2,
            message: "Update required".to_string(),
            resolution: Some(handle.clone()),
        };
        let h = Harness::with_host(MockProvider::failing(resolvable), MockHost::default(), true);
        let recorder = h.request(true, false);
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Error(LocationError::ConnectionFailed {
                code: 2,
                resolvable: true
            })]
        );
        assert_eq!(
            h.host.resolutions(),
            vec![ResolutionRequest::new(
                ResolutionKind::ConnectionError,
                Some(handle)
            )]
        );
        assert!(h.host.dialogs().is_empty());
    }

    #[test(start_paused = true)]
    async fn test_connection_failure_without_resolve() {
        let failure = ConnectionFailure {
            code: 9,
            message: "Service invalid".to_string(),
            resolution: None,
        };
        let h = Harness::with_host(MockProvider::failing(failure), MockHost::default(), true);

        let recorder = h.request(false, false);
        settle().await;

        assert_eq!(recorder.terminal_count(), 1);
        assert!(h.host.dialogs().is_empty());
        assert!(h.host.resolutions().is_empty());
    }

    #[test(start_paused = true)]
    async fn test_fix_racing_timeout_delivers_once() {
        let provider =
            MockProvider::connected().with_fix_after(Duration::from_secs(10), test_fix(3.0));
        let h = Harness::new(provider);

        let recorder = h.request(false, false);
        sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(recorder.terminal_count(), 1);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_late_events_are_noops() {
        let h = Harness::new(MockProvider::connected());

        let recorder = h.request(false, false);
        sleep(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(
            recorder.events().last(),
            Some(&CallbackEvent::Error(LocationError::Timeout))
        );

        // Provider misbehaves and keeps reporting for the finished session
        h.provider.emit(|sink| {
            sink.location_changed(test_fix(4.0));
            sink.connected();
            sink.suspended(SuspendCause::NetworkLost);
        });
        settle().await;

        assert_eq!(recorder.terminal_count(), 1);
        assert!(h.cache.get().is_none());
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_suspension_is_ignored() {
        let h = Harness::new(MockProvider::connected());

        let recorder = h.request(false, false);
        settle().await;
        h.provider
            .emit(|sink| sink.suspended(SuspendCause::ServiceDisconnected));
        settle().await;

        assert_eq!(recorder.events(), vec![CallbackEvent::Requested]);

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(
            recorder.events().last(),
            Some(&CallbackEvent::Error(LocationError::Timeout))
        );
    }

    #[test(start_paused = true)]
    async fn test_force_new_location_skips_cached_fix() {
        let f1 = test_fix(1.0);
        let f2 = test_fix(2.0);
        let provider = MockProvider::connected()
            .with_last_location(f1)
            .with_fix_after(Duration::from_secs(1), f2.clone());
        let h = Harness::new(provider);

        let recorder = h.request(false, true);
        sleep(Duration::from_secs(2)).await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Requested, CallbackEvent::Received(f2.clone())]
        );
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::LastLocation)), 0);
        assert_eq!(h.cache.get(), Some(f2));
    }

    #[test(start_paused = true)]
    async fn test_force_new_location_after_connect() {
        let f1 = test_fix(1.0);
        let f2 = test_fix(2.0);
        let provider = MockProvider::default()
            .with_last_location(f1.clone())
            .with_fix_after(Duration::from_secs(1), f2.clone());
        let h = Harness::new(provider);

        let recorder = h.request(false, true);
        settle().await;

        // Provider's cached fix still warms the store while we wait for a fresh one
        assert_eq!(recorder.events(), vec![CallbackEvent::Requested]);
        assert_eq!(h.cache.get(), Some(f1));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Requested, CallbackEvent::Received(f2.clone())]
        );
        assert_eq!(h.cache.get(), Some(f2));
    }

    #[test(start_paused = true)]
    async fn test_last_location_triggers_then_serves_cache() {
        let f1 = test_fix(1.0);
        let h = Harness::new(MockProvider::default().with_last_location(f1.clone()));

        assert!(h.helper.last_location().is_none());
        settle().await;
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Connect)), 1);

        assert_eq!(h.helper.last_location(), Some(f1.clone()));
        assert_eq!(h.helper.last_location(), Some(f1));
        settle().await;
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Connect)), 1);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_prefetch_warms_cache() {
        let f2 = test_fix(2.0);
        let provider = MockProvider::default().with_fix_after(Duration::from_secs(1), f2.clone());
        let h = Harness::new(provider);

        h.helper.prefetch();
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.cache.get(), Some(f2));
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_concurrent_requests_are_queued() {
        let f1 = test_fix(1.0);
        let provider = MockProvider::default().with_fix_after(Duration::from_secs(1), f1.clone());
        let h = Harness::new(provider);

        let first = h.request(false, false);
        let second = h.request(false, true);
        settle().await;

        assert_eq!(first.events(), vec![CallbackEvent::Requested]);
        assert!(second.events().is_empty(), "Second request started early");

        sleep(Duration::from_secs(3)).await;

        assert_eq!(
            first.events(),
            vec![CallbackEvent::Requested, CallbackEvent::Received(f1.clone())]
        );
        assert_eq!(
            second.events(),
            vec![CallbackEvent::Requested, CallbackEvent::Received(f1)]
        );
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Connect)), 2);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_request_fix() {
        let f1 = test_fix(1.0);
        let h = Harness::new(MockProvider::default().with_last_location(f1.clone()));

        assert_eq!(h.helper.request_fix(false, false).await, Ok(f1));

        let h = Harness::new(MockProvider::connected());
        assert_eq!(
            h.helper.request_fix(false, false).await,
            Err(LocationError::Timeout)
        );
    }

    #[test(start_paused = true)]
    async fn test_shutdown_fails_pending_requests() {
        let h = Harness::new(MockProvider::hanging());

        let active = h.request(false, false);
        let queued = h.request(false, false);
        settle().await;
        assert!(h.provider.is_connecting());

        h.helper.shutdown();
        settle().await;

        assert_eq!(
            active.events(),
            vec![CallbackEvent::Error(LocationError::Closed)]
        );
        assert_eq!(
            queued.events(),
            vec![CallbackEvent::Error(LocationError::Closed)]
        );
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Disconnect)), 1);

        let after = h.request(false, false);
        assert_eq!(
            after.events(),
            vec![CallbackEvent::Error(LocationError::Closed)]
        );
    }

    #[test(start_paused = true)]
    async fn test_dropped_helper_finishes_in_flight_request() {
        let f1 = test_fix(1.0);
        let provider =
            Arc::new(MockProvider::default().with_fix_after(Duration::from_secs(1), f1.clone()));
        let cache = Arc::new(SharedLocationCache::new());
        let (helper, main_loop) = TestHelper::new(
            provider.clone(),
            AllowAll,
            cache.clone(),
            Host::NonInteractive,
            LocationSettings::default(),
        )
        .expect("Failed to create helper");
        let handle = tokio::spawn(main_loop.main_loop());

        let recorder = Arc::new(RecordingCallbacks::default());
        helper.request(false, false, Some(recorder.clone()));
        drop(helper);

        handle.await.expect("Helper loop panicked");

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Requested, CallbackEvent::Received(f1.clone())]
        );
        assert_eq!(cache.get(), Some(f1));
        assert!(!provider.is_connected());
    }

    #[test]
    async fn test_invalid_settings_rejected() {
        let settings = LocationSettings {
            timeout_ms: 0,
            ..Default::default()
        };
        let res = TestHelper::new(
            Arc::new(MockProvider::default()),
            AllowAll,
            Arc::new(SharedLocationCache::new()),
            Host::NonInteractive,
            settings,
        );
        assert!(res.is_err());
    }

    #[test(start_paused = true)]
    async fn test_cached_fix_while_connected() {
        let f1 = test_fix(1.0);
        let h = Harness::new(MockProvider::connected().with_last_location(f1.clone()));

        let recorder = h.request(false, false);
        settle().await;

        assert_eq!(recorder.events(), vec![CallbackEvent::Received(f1.clone())]);
        assert_eq!(h.cache.get(), Some(f1));
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Connect)), 0);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::CheckSettings(_))), 0);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RequestUpdates(_))), 0);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Disconnect)), 1);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_polling_last_location_does_not_delay_callers() {
        let h = Harness::new(MockProvider::connected());

        for _ in 0..5 {
            assert!(h.helper.last_location().is_none());
        }
        let start = Instant::now();
        let recorder = h.request(false, false);

        sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(
            recorder.events(),
            vec![
                CallbackEvent::Requested,
                CallbackEvent::Error(LocationError::Timeout)
            ]
        );
        assert!(start.elapsed() <= Duration::from_secs(12));
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RequestUpdates(_))), 1);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_caller_joins_subscribed_prefetch() {
        let f2 = test_fix(2.0);
        let provider = MockProvider::default().with_fix_after(Duration::from_secs(2), f2.clone());
        let h = Harness::new(provider);

        h.helper.prefetch();
        settle().await;
        assert_eq!(h.helper.outstanding_deadlines(), 1);

        let recorder = h.request(false, true);
        settle().await;
        assert_eq!(recorder.events(), vec![CallbackEvent::Requested]);

        sleep(Duration::from_secs(2)).await;

        assert_eq!(
            recorder.events(),
            vec![CallbackEvent::Requested, CallbackEvent::Received(f2.clone())]
        );
        assert_eq!(h.cache.get(), Some(f2));
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Connect)), 1);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RequestUpdates(_))), 1);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_no_unsubscribe_after_connection_lost() {
        let h = Harness::new(MockProvider::connected());

        let recorder = h.request(false, false);
        settle().await;
        h.provider.lose_connection();

        sleep(Duration::from_secs(11)).await;

        assert_eq!(
            recorder.events().last(),
            Some(&CallbackEvent::Error(LocationError::Timeout))
        );
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::RemoveUpdates)), 0);
        assert_eq!(h.calls(|c| matches!(c, ProviderCall::Disconnect)), 1);
        h.assert_released();
    }

    #[test(start_paused = true)]
    async fn test_cloned_handles_share_one_loop() {
        let f1 = test_fix(1.0);
        let provider = Arc::new(MockProvider::default().with_last_location(f1.clone()));
        let (helper, main_loop) = TestHelper::new(
            provider.clone(),
            AllowAll,
            Arc::new(SharedLocationCache::new()),
            Host::NonInteractive,
            LocationSettings::default(),
        )
        .expect("Failed to create helper");
        let handle = tokio::spawn(main_loop.main_loop());

        let other = helper.clone();
        drop(helper);

        assert_eq!(other.request_fix(false, false).await, Ok(f1));
        assert!(!handle.is_finished());

        drop(other);
        handle.await.expect("Helper loop panicked");
    }
}
