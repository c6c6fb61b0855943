use std::sync::Arc;

use crate::{prelude::*, validator::ResolutionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// Ask the user to change location settings
    LocationSettings,
    /// Show a non-actionable error surface for an unresolvable connection failure
    ErrorDialog,
    /// Let the user fix a resolvable connection failure
    ConnectionError,
}

impl ResolutionKind {
    /// Request code the host can use to match the result of the flow
    pub fn request_code(&self) -> i32 {
        match self {
            ResolutionKind::LocationSettings => 10,
            ResolutionKind::ErrorDialog => 11,
            ResolutionKind::ConnectionError => 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Signal asking the host to present something to the user. What happens afterwards is up to
/// the host, the request that emitted it has already failed.
pub struct ResolutionRequest {
    pub kind: ResolutionKind,
    pub handle: Option<ResolutionHandle>,
}

impl ResolutionRequest {
    pub fn new(kind: ResolutionKind, handle: Option<ResolutionHandle>) -> Self {
        Self { kind, handle }
    }
}

/// A host that is able to show UI to the user
pub trait InteractiveHost: Send + Sync {
    /// Whether the UI is going away and shouldn't be used anymore
    fn is_finishing(&self) -> bool {
        false
    }

    /// Start a resolution flow for a resolvable problem
    fn start_resolution(&self, request: ResolutionRequest) -> Result;

    /// Show an error for a problem that can't be resolved, `code` is the provider error code
    fn show_error_dialog(&self, code: i32, request: ResolutionRequest);
}

#[derive(Clone, Default)]
/// What the environment running the helper can present to the user
pub enum Host {
    #[default]
    NonInteractive,
    Interactive(Arc<dyn InteractiveHost>),
}

impl Host {
    pub fn interactive(host: impl InteractiveHost + 'static) -> Self {
        Self::Interactive(Arc::new(host))
    }

    /// The interactive host, if there is one and it can still show UI
    pub fn ui(&self) -> Option<&dyn InteractiveHost> {
        match self {
            Host::NonInteractive => None,
            Host::Interactive(host) if host.is_finishing() => None,
            Host::Interactive(host) => Some(host.as_ref()),
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, Host::Interactive(_))
    }
}
