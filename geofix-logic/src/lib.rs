mod cache;
mod callbacks;
mod connection;
mod error;
mod fix;
mod helper;
mod host;
mod permission;
mod session;
mod settings;
mod timeout;
mod validator;

pub use cache::{LocationStore, SharedLocationCache};
pub use callbacks::{LocationCallbacks, OneshotCallbacks};
pub use connection::{
    ConnectionEvent, ConnectionFailure, EventSink, LocationProvider, ProviderEvent,
    ServiceConnection, SuspendCause,
};
pub use error::LocationError;
pub use fix::{Fix, UtcDT};
pub use helper::{HelperLoop, LocationHelper};
pub use host::{Host, InteractiveHost, ResolutionKind, ResolutionRequest};
pub use permission::{AllowAll, LocationPermission, LocationPermissions};
pub use session::SessionId;
pub use settings::{LocationSettings, Priority, UpdateRequest};
pub use timeout::{DeadlineHandle, TimeoutGuard};
pub use validator::{ResolutionHandle, SettingsStatus, SettingsValidator};

pub mod prelude {
    use anyhow::Error as AnyhowError;
    use std::result::Result as StdResult;
    pub type Result<T = (), E = AnyhowError> = StdResult<T, E>;
    pub use anyhow::Context;
}
