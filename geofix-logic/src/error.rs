/// Terminal failure of a location request, handed to
/// [crate::LocationCallbacks::on_error]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Failed to connect to location provider (code {code}, resolvable: {resolvable})")]
    ConnectionFailed { code: i32, resolvable: bool },
    #[error("Location settings are inadequate and cannot be changed")]
    SettingsUnsatisfiable,
    #[error("Location settings need to be changed by the user")]
    SettingsResolutionRequired,
    #[error("Timed out waiting for a location fix")]
    Timeout,
    /// The helper's main loop stopped before the request completed
    #[error("Location helper was shut down")]
    Closed,
}
