use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How the provider should trade power for accuracy when producing fixes
pub enum Priority {
    /// Most accurate fix available, typically GPS
    HighAccuracy,
    /// Block level accuracy, typically Wi-Fi and cell towers
    BalancedPowerAccuracy,
    /// City level accuracy
    LowPower,
    /// Only passively receive fixes requested by others
    NoPower,
}

impl Priority {
    /// Numeric code the provider understands
    pub fn code(&self) -> u32 {
        match self {
            Priority::HighAccuracy => 100,
            Priority::BalancedPowerAccuracy => 102,
            Priority::LowPower => 104,
            Priority::NoPower => 105,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
/// Tunables for location acquisition, shared by every request made through one
/// [crate::LocationHelper]
pub struct LocationSettings {
    /// Desired interval between updates while subscribed
    pub update_interval_ms: u64,
    /// How long to wait for a fix after subscribing before giving up
    pub timeout_ms: u64,
    /// How long the subscription stays valid on the provider side. Passed through, never
    /// enforced locally.
    pub expiry_ms: u64,
    /// Power/accuracy trade-off requested from the provider
    pub priority: Priority,
    /// Number of updates to ask for per subscription
    pub num_updates: u32,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: 5_000,
            timeout_ms: 10_000,
            expiry_ms: 5 * 60 * 1000,
            priority: Priority::BalancedPowerAccuracy,
            num_updates: 1,
        }
    }
}

impl LocationSettings {
    pub fn validate(&self) -> Result {
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be greater than zero");
        }
        if self.update_interval_ms == 0 {
            bail!("update_interval_ms must be greater than zero");
        }
        if self.num_updates == 0 {
            bail!("num_updates must be at least 1");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Build the update configuration handed to the settings check and the subscription
    pub fn update_request(&self) -> UpdateRequest {
        UpdateRequest {
            interval: Duration::from_millis(self.update_interval_ms),
            priority: self.priority,
            num_updates: self.num_updates,
            expiry: Duration::from_millis(self.expiry_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Update configuration for a single subscription
pub struct UpdateRequest {
    pub interval: Duration,
    pub priority: Priority,
    pub num_updates: u32,
    pub expiry: Duration,
}
