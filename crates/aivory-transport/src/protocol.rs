//! Wire envelopes and inbound command model.
//!
//! Every frame is `{"type": ..., "payload": ..., "timestamp": ...}` with
//! an epoch-millis timestamp. Inbound frames deserialize into
//! [`ServerCommand`]; unrecognized types fall into `Unknown` and are
//! ignored, malformed frames fail deserialization and are dropped by the
//! dispatcher.

use chrono::Utc;
use serde::Deserialize;

/// Version reported in `register` payloads.
pub const AGENT_VERSION: &str = "1.0.0";

/// Runtime tag reported in `register` and `exception` payloads.
pub const RUNTIME: &str = "java";

/// Serializes one outbound envelope.
pub fn envelope(kind: &str, payload: serde_json::Value) -> String {
    serde_json::json!({
        "type": kind,
        "payload": payload,
        "timestamp": Utc::now().timestamp_millis(),
    })
    .to_string()
}

/// Commands the backend may push over the session.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerCommand {
    Registered,
    Error {
        #[serde(default)]
        payload: ErrorPayload,
    },
    SetBreakpoint {
        payload: SetBreakpointPayload,
    },
    RemoveBreakpoint {
        payload: RemoveBreakpointPayload,
    },
    Configure,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    #[serde(default = "unknown_code")]
    pub code: String,
    #[serde(default = "unknown_message")]
    pub message: String,
}

impl ErrorPayload {
    /// Auth-class errors are terminal: the agent must not reconnect.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.code.as_str(), "auth_error" | "invalid_api_key")
    }
}

impl Default for ErrorPayload {
    fn default() -> Self {
        Self {
            code: unknown_code(),
            message: unknown_message(),
        }
    }
}

fn unknown_code() -> String {
    "unknown".to_string()
}

fn unknown_message() -> String {
    "Unknown error".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SetBreakpointPayload {
    pub id: String,
    pub class_name: String,
    pub line_number: u32,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RemoveBreakpointPayload {
    pub id: String,
}
