//! Floor control between listening and speaking.
//!
//! - `FloorController`: who holds the speech-output floor and when the
//!   route-dependent grace period lets it go
//! - `AudioSession`: reference-counted activation of the shared audio device

mod controller;
mod session;

pub use controller::{FloorController, FloorReason, FloorSnapshot, FloorState};
pub use session::{AudioLease, AudioSession};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current audio output route. Wireless and assistive routes add output
/// latency, so the floor is held longer after speech ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioRoute {
    #[default]
    BuiltIn,
    Wired,
    Bluetooth,
    Assistive,
}

impl AudioRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuiltIn => "built_in",
            Self::Wired => "wired",
            Self::Bluetooth => "bluetooth",
            Self::Assistive => "assistive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloorSettings {
    pub grace_builtin_ms: u64,
    pub grace_wired_ms: u64,
    pub grace_bluetooth_ms: u64,
    pub grace_assistive_ms: u64,
}

impl Default for FloorSettings {
    fn default() -> Self {
        Self {
            grace_builtin_ms: 1200,
            grace_wired_ms: 1200,
            grace_bluetooth_ms: 1400,
            grace_assistive_ms: 1600,
        }
    }
}

impl FloorSettings {
    pub fn grace(&self, route: AudioRoute) -> Duration {
        let ms = match route {
            AudioRoute::BuiltIn => self.grace_builtin_ms,
            AudioRoute::Wired => self.grace_wired_ms,
            AudioRoute::Bluetooth => self.grace_bluetooth_ms,
            AudioRoute::Assistive => self.grace_assistive_ms,
        };
        Duration::from_millis(ms)
    }
}
