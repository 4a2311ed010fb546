//! JSON wire format shared with other implementations.
//!
//! Field names and types are fixed:
//! `{"id", "seq", "text", "sourceLang", "isFinal", "timestamp"}`.

use chrono::Utc;
use parley_lang::Language;
use serde::{Deserialize, Serialize};

use crate::{Result, WireError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Opaque, globally unique.
    pub id: String,
    /// Per sending session, starting at 0.
    pub seq: u64,
    pub text: String,
    pub source_lang: Language,
    pub is_final: bool,
    /// Epoch seconds.
    pub timestamp: f64,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| WireError::Malformed(e.to_string()))?;
        if let serde_json::Value::Object(map) = &value {
            if !map.contains_key("seq") && map.contains_key("turnId") {
                return Err(WireError::Superseded);
            }
        }
        serde_json::from_value(value).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

/// Wall clock time as epoch seconds with microsecond resolution.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
