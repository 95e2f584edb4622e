//! System event types
//!
//! Everything that can be broadcast through the event bus. Events serialize
//! to `{"topic": ..., "payload": ...}` which is exactly the wire format of
//! the `/ws/events` endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System event enumeration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum SystemEvent {
    /// Per-camera ingest state change
    Camera {
        camera_id: String,
        status: String,
        has_signal: bool,
        actual_resolution: Option<String>,
        restart_count: u64,
        error: Option<String>,
    },
    /// Recording session lifecycle
    Session {
        session_id: String,
        status: String,
        annotations: Vec<String>,
    },
    /// Mixer output / scene change
    Mixer {
        output_state: String,
        current_scene: Option<String>,
        transition: Option<String>,
    },
    /// Mode arbiter transition
    Mode {
        mode: Option<String>,
        switching: bool,
    },
    /// Disk watchdog sample
    Disk {
        free_gb: f64,
        low: bool,
    },
}

impl SystemEvent {
    /// Topic name, matches the serialized `topic` field
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Camera { .. } => "camera",
            Self::Session { .. } => "session",
            Self::Mixer { .. } => "mixer",
            Self::Mode { .. } => "mode",
            Self::Disk { .. } => "disk",
        }
    }
}

/// Last error of a component, kept for the aggregate status endpoint.
/// Cleared on the next successful state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentError {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ComponentError {
    pub fn now(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}
