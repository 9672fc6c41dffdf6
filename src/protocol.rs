//! Messages exchanged with the breath analysis service.
//!
//! Outbound control messages are JSON text keyed by `action`; audio goes out as
//! bare binary messages (see [`crate::audio::WireFrame`]). Inbound messages are
//! JSON text keyed by `type`.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Outbound control message.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Handshake sent right after the transport opens.
    Start {
        session_id: String,
        user_id: String,
        target_breath_duration: f64,
    },
    Stop,
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreathPhase {
    #[default]
    Idle,
    Inhaling,
    Exhaling,
    Holding,
}

/// One classification result from the analyzer. Values are passed through as
/// received; nothing here is recomputed locally.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BreathEvent {
    pub phase: BreathPhase,
    pub rms: f64,
    pub spectral_centroid: f64,
    pub confidence: f64,
    /// Server-assigned ISO-8601 timestamp.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breath_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_consistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation_from_target: Option<f64>,
}

/// Inbound message, discriminated by `type`. Types this client does not know
/// decode as `Unknown` and are ignored.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    BreathEvent { data: BreathEvent },
    Error { message: String },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
