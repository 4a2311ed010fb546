//! Post-translation purity check and bounded repair.
//!
//! - `score`: tag words by language, compute purity, find and splice spans
//! - `PurityGuard`: one selective pass plus one full retry, under a latency budget

mod guard;
pub mod score;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use guard::{Guarded, PurityGuard, RepairOutcome, RepairReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PuritySettings {
    /// Minimum share of target-language tokens before repair kicks in.
    pub min_purity: f32,
    /// Commit-to-speech budget the repair may not push past.
    pub latency_budget_ms: u64,
}

impl Default for PuritySettings {
    fn default() -> Self {
        Self {
            min_purity: 0.75,
            latency_budget_ms: 450,
        }
    }
}

impl PuritySettings {
    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }
}
