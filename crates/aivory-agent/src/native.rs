//! Native subagent callback path.
//!
//! The native collaborator walks stack frames inside the runtime and hands
//! over a JSON object of captured variables: top-level names plus
//! `frame_<i>_<class>.<method>` groups carrying per-frame locals. The
//! agent treats the tree as opaque, lifts frame groups onto the matching
//! stack frames, and ships a pre-formed `exception` payload.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use aivory_capture::exception::digest16;
use aivory_capture::{ThrowableSnapshot, MAX_STACK_FRAMES};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::Agent;

/// Repeat sightings of the same throwable within this window are dropped.
const DEDUP_WINDOW: Duration = Duration::from_millis(100);

/// The dedup map is pruned lazily once it grows past this.
const DEDUP_PRUNE_SIZE: usize = 1000;

/// Identity-keyed sighting window shared by all native callbacks.
pub(crate) struct DedupWindow {
    recent: Mutex<HashMap<u64, Instant>>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self {
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Records a sighting; `true` when the identity was already seen
    /// within the window.
    pub fn is_duplicate(&self, identity: u64) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap();

        if let Some(last_seen) = recent.get(&identity) {
            if now.duration_since(*last_seen) < DEDUP_WINDOW {
                return true;
            }
        }
        recent.insert(identity, now);

        if recent.len() > DEDUP_PRUNE_SIZE {
            recent.retain(|_, seen| now.duration_since(*seen) <= DEDUP_WINDOW * 10);
        }
        false
    }
}

pub(crate) fn handle_native_exception(
    agent: &Agent,
    location: &str,
    variables_json: &str,
    exception: &ThrowableSnapshot,
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        process(agent, location, variables_json, exception);
    }));
    if result.is_err() {
        debug!("error in native exception callback");
    }
}

fn process(agent: &Agent, location: &str, variables_json: &str, exception: &ThrowableSnapshot) {
    if agent.native_dedup().is_duplicate(exception.identity) {
        return;
    }
    if !agent.config().should_sample() {
        return;
    }

    if agent.config().debug {
        info!(
            "native capture: {} at {location} ({} bytes of variables)",
            exception.exception_type,
            variables_json.len()
        );
    }

    let locals = parse_variables_json(variables_json);
    let config = agent.config();

    let mut frames = Vec::new();
    for (index, frame) in exception.frames.iter().take(MAX_STACK_FRAMES).enumerate() {
        let mut entry = json!({
            "class_name": frame.class_name,
            "method_name": frame.method_name,
            "file_name": frame.file_name,
            "line_number": frame.line_number,
            "native_method": frame.is_native,
        });
        let group_key = format!("frame_{index}_{}.{}", frame.class_name, frame.method_name);
        if let Some(frame_locals) = locals.get(&group_key) {
            entry["locals"] = frame_locals.clone();
        }
        frames.push(entry);
    }

    let mut payload = json!({
        "exception_type": exception.exception_type,
        "message": exception.message.clone().unwrap_or_default(),
        "captured_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "agent_id": config.agent_id,
        "environment": config.environment,
        "runtime": "java",
        "runtime_version": config.runtime_version,
        "jvmti_capture": true,
        "fingerprint": native_fingerprint(exception, location),
        "local_variables": locals,
        "stack_trace": frames,
    });

    if let Some(first) = exception.frames.first() {
        payload["file_name"] = json!(first.file_name);
        payload["line_number"] = json!(first.line_number);
        payload["method_name"] = json!(first.method_name);
        payload["class_name"] = json!(first.class_name);
    }

    agent.connection().send_raw("exception", payload);
}

fn parse_variables_json(variables_json: &str) -> serde_json::Map<String, serde_json::Value> {
    if variables_json.is_empty() || variables_json == "{}" {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(variables_json) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            debug!("failed to parse native variables JSON");
            serde_json::Map::new()
        }
    }
}

fn native_fingerprint(exception: &ThrowableSnapshot, location: &str) -> String {
    let mut text = format!("{}:{location}:", exception.exception_type);
    for frame in exception.frames.iter().take(5) {
        text.push_str(&format!(
            "{}.{}:{}:",
            frame.class_name, frame.method_name, frame.line_number
        ));
    }
    digest16(&text)
}
