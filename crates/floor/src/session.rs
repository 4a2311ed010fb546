use std::sync::Arc;

use parking_lot::Mutex;
use parley_engine::{AudioDevice, AudioSessionError};

struct Inner {
    device: Arc<dyn AudioDevice>,
    users: Mutex<Vec<&'static str>>,
}

impl Inner {
    fn release(&self, user: &'static str) {
        let mut users = self.users.lock();
        if let Some(pos) = users.iter().position(|u| *u == user) {
            users.remove(pos);
        }
        if !users.is_empty() {
            tracing::trace!(user, remaining = users.len(), "audio session released");
            return;
        }
        match self.device.deactivate() {
            Ok(()) => tracing::debug!(user, "audio session deactivated"),
            Err(AudioSessionError::Busy) => {
                tracing::debug!(user, "audio session busy on deactivate, ignoring")
            }
            Err(e) => tracing::warn!(user, error = %e, "audio session deactivate failed"),
        }
    }
}

/// The audio device shared by capture and speech output.
///
/// Activated on the first lease and deactivated when the last lease drops.
#[derive(Clone)]
pub struct AudioSession {
    inner: Arc<Inner>,
}

impl AudioSession {
    pub fn new(device: Arc<dyn AudioDevice>) -> Self {
        Self {
            inner: Arc::new(Inner {
                device,
                users: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn acquire(&self, user: &'static str) -> Result<AudioLease, AudioSessionError> {
        let mut users = self.inner.users.lock();
        if users.is_empty() {
            self.inner.device.activate()?;
            tracing::debug!(user, "audio session activated");
        }
        users.push(user);
        Ok(AudioLease {
            inner: Arc::clone(&self.inner),
            user,
        })
    }

    pub fn users(&self) -> usize {
        self.inner.users.lock().len()
    }
}

/// Keeps the audio session active while alive.
pub struct AudioLease {
    inner: Arc<Inner>,
    user: &'static str,
}

impl std::fmt::Debug for AudioLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioLease").field("user", &self.user).finish()
    }
}

impl Drop for AudioLease {
    fn drop(&mut self) {
        self.inner.release(self.user);
    }
}
