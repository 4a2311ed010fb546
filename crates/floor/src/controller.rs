use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{AudioRoute, FloorSettings};

/// Why the floor is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "phrase_id", rename_all = "snake_case")]
pub enum FloorReason {
    Speaking(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloorState {
    Free,
    Held { reason: FloorReason },
    /// Output finished; held until the grace deadline.
    Releasing { reason: FloorReason, deadline: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FloorSnapshot {
    pub held: bool,
    pub releasing: bool,
    pub reason: Option<FloorReason>,
    pub grace_remaining_ms: Option<u64>,
    pub route: AudioRoute,
}

/// The speech-output floor.
///
/// Owned by the coordinator; every change goes through its methods. While
/// the floor is held, including the grace period, the emit/translate path
/// stays closed. The controller only tracks deadlines: the coordinator owns
/// the single release timer and arms it from `begin_release`.
#[derive(Debug)]
pub struct FloorController {
    settings: FloorSettings,
    route: AudioRoute,
    state: FloorState,
}

impl FloorController {
    pub fn new(settings: FloorSettings) -> Self {
        Self {
            settings,
            route: AudioRoute::default(),
            state: FloorState::Free,
        }
    }

    pub fn state(&self) -> FloorState {
        self.state
    }

    /// Held or in its grace period.
    pub fn is_held(&self) -> bool {
        !matches!(self.state, FloorState::Free)
    }

    pub fn route(&self) -> AudioRoute {
        self.route
    }

    pub fn set_route(&mut self, route: AudioRoute) {
        if self.route != route {
            tracing::debug!(from = self.route.as_str(), to = route.as_str(), "audio route changed");
        }
        self.route = route;
    }

    pub fn grace(&self) -> std::time::Duration {
        self.settings.grace(self.route)
    }

    /// Take the floor for speech output.
    ///
    /// Returns true when the floor was free. Acquiring during the grace
    /// period keeps the floor and abandons the pending release.
    pub fn acquire(&mut self, reason: FloorReason) -> bool {
        let was_free = matches!(self.state, FloorState::Free);
        if let FloorState::Releasing { .. } = self.state {
            tracing::trace!("floor re-acquired during grace");
        }
        self.state = FloorState::Held { reason };
        was_free
    }

    /// Output finished: start the grace period and return its deadline.
    pub fn begin_release(&mut self, now: Instant) -> Option<Instant> {
        let reason = match self.state {
            FloorState::Held { reason } | FloorState::Releasing { reason, .. } => reason,
            FloorState::Free => return None,
        };
        let deadline = now + self.grace();
        self.state = FloorState::Releasing { reason, deadline };
        Some(deadline)
    }

    /// Grace elapsed. Returns true when this call freed the floor.
    pub fn complete_release(&mut self, now: Instant) -> bool {
        match self.state {
            FloorState::Releasing { deadline, .. } if now >= deadline => {
                self.state = FloorState::Free;
                true
            }
            _ => false,
        }
    }

    /// Drop the floor immediately, e.g. on interruption.
    pub fn force_release(&mut self) -> bool {
        let was_held = self.is_held();
        self.state = FloorState::Free;
        was_held
    }

    pub fn snapshot(&self, now: Instant) -> FloorSnapshot {
        let (reason, remaining) = match self.state {
            FloorState::Free => (None, None),
            FloorState::Held { reason } => (Some(reason), None),
            FloorState::Releasing { reason, deadline } => (
                Some(reason),
                Some(deadline.saturating_duration_since(now).as_millis() as u64),
            ),
        };
        FloorSnapshot {
            held: self.is_held(),
            releasing: matches!(self.state, FloorState::Releasing { .. }),
            reason,
            grace_remaining_ms: remaining,
            route: self.route,
        }
    }
}
