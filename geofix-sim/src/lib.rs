use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use geofix_logic::{
    ConnectionFailure, EventSink, Fix, Host, InteractiveHost, LocationCallbacks, LocationError,
    LocationHelper, LocationPermission, LocationProvider, LocationSettings, LocationStore,
    ResolutionHandle, ResolutionRequest, SettingsStatus, SharedLocationCache, UpdateRequest,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use anyhow::{Context, anyhow, bail};
    pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
}

pub use prelude::*;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    FailResolvable,
    FailUnresolvable,
    /// Never reports back
    Hang,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SettingsOutcome {
    Satisfied,
    ResolutionRequired,
    ChangeUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Script for how the simulated provider and host behave
pub struct SimScenario {
    pub permission_granted: bool,
    /// Provider is connected before the first request
    pub already_connected: bool,
    /// Provider has a last known fix from before the simulation
    pub cached_fix: bool,
    pub connect: ConnectOutcome,
    pub connect_delay_ms: u64,
    pub settings: SettingsOutcome,
    pub settings_delay_ms: u64,
    /// Delay between subscribing and the fix arriving, `None` never produces one
    pub fix_delay_ms: Option<u64>,
    pub base_latitude: f64,
    pub base_longitude: f64,
    pub interactive: bool,
    pub host_finishing: bool,
}

impl Default for SimScenario {
    fn default() -> Self {
        Self {
            permission_granted: true,
            already_connected: false,
            cached_fix: false,
            connect: ConnectOutcome::Succeed,
            connect_delay_ms: 100,
            settings: SettingsOutcome::Satisfied,
            settings_delay_ms: 50,
            fix_delay_ms: Some(2_000),
            base_latitude: 43.0845,
            base_longitude: -77.6749,
            interactive: false,
            host_finishing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SimCall {
    Connect,
    Disconnect,
    LastLocation,
    CheckSettings,
    RequestUpdates,
    RemoveUpdates,
}

/// [LocationProvider] that plays back a [SimScenario] in real (or paused tokio) time
pub struct SimProvider {
    scenario: SimScenario,
    connected: Arc<AtomicBool>,
    connecting: Arc<AtomicBool>,
    last: Arc<Mutex<Option<Fix>>>,
    updates: Mutex<Option<CancellationToken>>,
    calls: Mutex<Vec<SimCall>>,
}

impl SimProvider {
    pub fn new(scenario: SimScenario) -> Self {
        let last = scenario.cached_fix.then(|| {
            let age = rand::random_range(30..600);
            jitter(scenario.base_latitude, scenario.base_longitude, "cached", age)
        });
        Self {
            connected: Arc::new(AtomicBool::new(scenario.already_connected)),
            connecting: Arc::new(AtomicBool::new(false)),
            last: Arc::new(Mutex::new(last)),
            updates: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            scenario,
        }
    }

    fn record(&self, call: SimCall) {
        debug!("Provider call: {call:?}");
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn failure(&self, resolvable: bool) -> ConnectionFailure {
        if resolvable {
            ConnectionFailure {
                code: 2,
                message: "Location service needs an update".to_string(),
                resolution: Some(ResolutionHandle::new()),
            }
        } else {
            ConnectionFailure {
                code: 9,
                message: "Location service is invalid".to_string(),
                resolution: None,
            }
        }
    }
}

/// A fix a few meters off the given coordinates, taken `age_secs` ago
fn jitter(lat: f64, long: f64, provider: &str, age_secs: i64) -> Fix {
    let mut fix = Fix::new(
        lat + rand::random_range(-0.0002..0.0002),
        long + rand::random_range(-0.0002..0.0002),
        rand::random_range(3.0..25.0),
        provider,
    );
    fix.timestamp = Utc::now() - TimeDelta::seconds(age_secs);
    fix.speed = Some(rand::random_range(0.0..1.5));
    fix
}

impl LocationProvider for SimProvider {
    fn connect(&self, events: EventSink) {
        self.record(SimCall::Connect);
        let delay = Duration::from_millis(self.scenario.connect_delay_ms);
        let outcome = self.scenario.connect;
        let connected = self.connected.clone();
        let connecting = self.connecting.clone();
        let failure = match outcome {
            ConnectOutcome::FailResolvable => Some(self.failure(true)),
            ConnectOutcome::FailUnresolvable => Some(self.failure(false)),
            _ => None,
        };

        connecting.store(true, Ordering::SeqCst);
        if outcome == ConnectOutcome::Hang {
            return;
        }

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Disconnected while we were still connecting
            if !connecting.swap(false, Ordering::SeqCst) {
                return;
            }
            if let Some(failure) = failure {
                events.connection_failed(failure);
            } else {
                connected.store(true, Ordering::SeqCst);
                events.connected();
            }
        });
    }

    fn disconnect(&self) {
        self.record(SimCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        self.connecting.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    fn last_location(&self) -> Option<Fix> {
        self.record(SimCall::LastLocation);
        match self.last.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn check_settings(&self, request: &UpdateRequest) -> SettingsStatus {
        self.record(SimCall::CheckSettings);
        debug!(
            "Checking settings for priority {} every {:?}",
            request.priority.code(),
            request.interval
        );
        tokio::time::sleep(Duration::from_millis(self.scenario.settings_delay_ms)).await;
        match self.scenario.settings {
            SettingsOutcome::Satisfied => SettingsStatus::Satisfied,
            SettingsOutcome::ResolutionRequired => {
                SettingsStatus::ResolutionRequired(ResolutionHandle::new())
            }
            SettingsOutcome::ChangeUnavailable => SettingsStatus::ChangeUnavailable,
        }
    }

    fn request_updates(&self, _request: &UpdateRequest, events: EventSink) {
        self.record(SimCall::RequestUpdates);
        let Some(delay) = self.scenario.fix_delay_ms else {
            return;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let last = self.last.clone();
        let (lat, long) = (self.scenario.base_latitude, self.scenario.base_longitude);

        let previous = match self.updates.lock() {
            Ok(mut updates) => updates.replace(token),
            Err(poisoned) => poisoned.into_inner().replace(token),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    let fix = jitter(lat, long, "fused", 0);
                    match last.lock() {
                        Ok(mut last) => *last = Some(fix.clone()),
                        Err(poisoned) => *poisoned.into_inner() = Some(fix.clone()),
                    }
                    events.location_changed(fix);
                }
            }
        });
    }

    fn remove_updates(&self) {
        self.record(SimCall::RemoveUpdates);
        let token = match self.updates.lock() {
            Ok(mut updates) => updates.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionRecord {
    pub request_code: i32,
    pub error_code: Option<i32>,
}

/// Host that "shows" dialogs by logging them
#[derive(Default)]
pub struct SimHost {
    finishing: bool,
    records: Mutex<Vec<ResolutionRecord>>,
}

impl SimHost {
    pub fn new(finishing: bool) -> Self {
        Self {
            finishing,
            records: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, record: ResolutionRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    pub fn records(&self) -> Vec<ResolutionRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl InteractiveHost for SimHost {
    fn is_finishing(&self) -> bool {
        self.finishing
    }

    fn start_resolution(&self, request: ResolutionRequest) -> Result {
        let handle = request
            .handle
            .as_ref()
            .context("Resolution requested without a handle")?;
        info!(
            "Showing resolution {} for {:?} (request code {})",
            handle.id(),
            request.kind,
            request.kind.request_code()
        );
        self.push(ResolutionRecord {
            request_code: request.kind.request_code(),
            error_code: None,
        });
        Ok(())
    }

    fn show_error_dialog(&self, code: i32, request: ResolutionRequest) {
        warn!("Showing error dialog for provider error {code}");
        self.push(ResolutionRecord {
            request_code: request.kind.request_code(),
            error_code: Some(code),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SimEvent {
    Requested,
    Received(Fix),
    Error(String),
}

struct SimCallbacks {
    index: usize,
    events: Mutex<Vec<SimEvent>>,
    done: mpsc::UnboundedSender<usize>,
}

impl SimCallbacks {
    fn push(&self, event: SimEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }

    fn events(&self) -> Vec<SimEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn terminal(&self, event: SimEvent) {
        self.push(event);
        self.done.send(self.index).ok();
    }
}

impl LocationCallbacks for SimCallbacks {
    fn on_location_requested(&self) {
        info!("Request {}: location requested", self.index);
        self.push(SimEvent::Requested);
    }

    fn on_location_received(&self, fix: Fix) {
        info!(
            "Request {}: got {}, {} (±{}m)",
            self.index, fix.latitude, fix.longitude, fix.accuracy
        );
        self.terminal(SimEvent::Received(fix));
    }

    fn on_error(&self, error: LocationError) {
        warn!("Request {}: {error}", self.index);
        self.terminal(SimEvent::Error(error.to_string()));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub requests: usize,
    pub gap: Duration,
    pub resolve_on_error: bool,
    pub force_new_location: bool,
    /// Shut the helper down if requests are still unfinished after this long
    pub give_up: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReport {
    pub index: usize,
    pub events: Vec<SimEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimReport {
    pub requests: Vec<RequestReport>,
    pub provider_calls: Vec<SimCall>,
    pub resolutions: Vec<ResolutionRecord>,
    pub cached: Option<Fix>,
    pub provider_connected: bool,
}

/// Run `options.requests` requests against a provider following `scenario` and collect what
/// every party saw
pub async fn run_scenario(
    scenario: SimScenario,
    settings: LocationSettings,
    options: RunOptions,
) -> Result<SimReport> {
    let granted = scenario.permission_granted;
    let provider = Arc::new(SimProvider::new(scenario.clone()));
    let sim_host = Arc::new(SimHost::new(scenario.host_finishing));
    let host = if scenario.interactive {
        Host::Interactive(sim_host.clone())
    } else {
        Host::NonInteractive
    };
    let cache = Arc::new(SharedLocationCache::new());

    let helper = LocationHelper::spawn(
        provider.clone(),
        move |_: LocationPermission| granted,
        cache.clone(),
        host,
        settings,
    )
    .context("Failed to start location helper")?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut callbacks = Vec::with_capacity(options.requests);

    for index in 0..options.requests {
        let cb = Arc::new(SimCallbacks {
            index,
            events: Mutex::new(Vec::new()),
            done: done_tx.clone(),
        });
        helper.request(
            options.resolve_on_error,
            options.force_new_location,
            Some(cb.clone()),
        );
        callbacks.push(cb);
        if !options.gap.is_zero() {
            tokio::time::sleep(options.gap).await;
        }
    }
    drop(done_tx);

    let give_up = tokio::time::sleep(options.give_up.unwrap_or_default());
    tokio::pin!(give_up);
    let mut gave_up = false;
    let mut finished = 0;

    while finished < options.requests {
        tokio::select! {
            done = done_rx.recv() => {
                if done.is_none() {
                    bail!("Request callbacks dropped without finishing");
                }
                finished += 1;
            }
            _ = &mut give_up, if options.give_up.is_some() && !gave_up => {
                warn!("{} request(s) still pending, shutting down", options.requests - finished);
                gave_up = true;
                helper.shutdown();
            }
        }
    }

    helper.shutdown();

    Ok(SimReport {
        requests: callbacks
            .iter()
            .map(|cb| RequestReport {
                index: cb.index,
                events: cb.events(),
            })
            .collect(),
        provider_calls: provider.calls(),
        resolutions: sim_host.records(),
        cached: cache.get(),
        provider_connected: provider.is_connected(),
    })
}
