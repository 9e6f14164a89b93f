//! Exception capture builder: stack trace, method arguments, receiver
//! fields, and the grouping fingerprint.

use std::collections::BTreeMap;

use aivory_config::AgentConfig;
use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::heap::{HeapSnapshot, ObjectRef, RuntimeValue};
use crate::model::{ArgumentMap, ExceptionCapture, StackFrame};
use crate::serializer::ValueSerializer;
use crate::{MethodDescriptor, ThrowableSnapshot, MAX_STACK_FRAMES};

/// Number of leading frames mixed into the fingerprint.
const FINGERPRINT_FRAMES: usize = 5;

/// Builds an [`ExceptionCapture`] from a propagating throwable.
pub fn capture_exception(
    config: &AgentConfig,
    heap: &HeapSnapshot,
    thrown: &ThrowableSnapshot,
    receiver: Option<&ObjectRef>,
    method: &MethodDescriptor,
    args: &[RuntimeValue],
) -> ExceptionCapture {
    let serializer = ValueSerializer::new(config, heap);

    let stack_trace: Vec<StackFrame> = thrown
        .frames
        .iter()
        .take(MAX_STACK_FRAMES)
        .map(StackFrame::from_raw)
        .collect();

    let mut method_arguments = ArgumentMap::new();
    for (index, arg) in args.iter().enumerate().take(method.param_names.len()) {
        let name = match method.param_names[index].as_deref() {
            Some(name) => name.to_string(),
            None => format!("arg{index}"),
        };
        let captured = serializer.capture(&name, arg, 0);
        method_arguments.insert(name, captured);
    }

    let mut local_variables = BTreeMap::new();
    if let Some(receiver) = receiver {
        serializer.capture_receiver_fields(receiver, &mut local_variables);
    }

    ExceptionCapture {
        id: Uuid::new_v4().to_string(),
        exception_type: thrown.exception_type.clone(),
        message: thrown.message.clone().unwrap_or_default(),
        fingerprint: fingerprint(thrown, method),
        captured_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        stack_trace,
        local_variables,
        method_arguments,
    }
}

/// 16 lowercase-hex chars identifying the exception shape: type, throwing
/// method, and the top frames of the attached trace.
pub fn fingerprint(thrown: &ThrowableSnapshot, method: &MethodDescriptor) -> String {
    let mut text = format!(
        "{}:{}.{}",
        thrown.exception_type, method.declaring_class, method.name
    );
    for frame in thrown.frames.iter().take(FINGERPRINT_FRAMES) {
        text.push_str(&format!(
            ":{}.{}:{}",
            frame.class_name, frame.method_name, frame.line_number
        ));
    }
    digest16(&text)
}

/// First 16 lowercase-hex chars of the SHA-256 of `text`.
pub fn digest16(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    hash.iter().take(8).map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ObjectField, ObjectShape};
    use crate::RawFrame;
    use pretty_assertions::assert_eq;

    fn throwable(frames: Vec<RawFrame>) -> ThrowableSnapshot {
        ThrowableSnapshot {
            identity: 0x51,
            exception_type: "java.lang.IllegalStateException".to_string(),
            message: Some("boom".to_string()),
            frames,
        }
    }

    #[test]
    fn captures_type_message_and_trace() {
        let config = AgentConfig::default();
        let heap = HeapSnapshot::new();
        let thrown = throwable(vec![
            RawFrame::new("com.example.Api", "handle").at("Api.java", 31),
            RawFrame::new("com.example.Main", "run").at("Main.java", 12),
        ]);
        let method = MethodDescriptor::new("com.example.Api", "handle");

        let capture = capture_exception(&config, &heap, &thrown, None, &method, &[]);

        assert_eq!(capture.exception_type, "java.lang.IllegalStateException");
        assert_eq!(capture.message, "boom");
        assert_eq!(capture.stack_trace.len(), 2);
        assert_eq!(capture.stack_trace[0].class_name, "com.example.Api");
        assert!(capture.stack_trace[0].source_available);
        assert!(!capture.id.is_empty());
        assert!(capture.captured_at.ends_with('Z'));
    }

    #[test]
    fn trace_clipped_to_fifty_frames() {
        let config = AgentConfig::default();
        let heap = HeapSnapshot::new();
        let frames = (0..80)
            .map(|i| RawFrame::new("com.example.Deep", format!("level{i}")).at("Deep.java", i))
            .collect();
        let thrown = throwable(frames);
        let method = MethodDescriptor::new("com.example.Deep", "level0");

        let capture = capture_exception(&config, &heap, &thrown, None, &method, &[]);
        assert_eq!(capture.stack_trace.len(), MAX_STACK_FRAMES);
    }

    #[test]
    fn native_frame_has_no_source() {
        let config = AgentConfig::default();
        let heap = HeapSnapshot::new();
        let thrown = throwable(vec![RawFrame::new("java.lang.Object", "wait").native()]);
        let method = MethodDescriptor::new("com.example.Api", "handle");

        let capture = capture_exception(&config, &heap, &thrown, None, &method, &[]);
        assert!(capture.stack_trace[0].is_native);
        assert!(!capture.stack_trace[0].source_available);
    }

    #[test]
    fn arguments_use_declared_names_with_index_fallback() {
        let config = AgentConfig::default();
        let heap = HeapSnapshot::new();
        let thrown = throwable(vec![]);
        let method = MethodDescriptor::new("com.example.Api", "handle")
            .with_params(vec![Some("userId".to_string()), None]);

        let capture = capture_exception(
            &config,
            &heap,
            &thrown,
            None,
            &method,
            &[RuntimeValue::Long(7), RuntimeValue::Boolean(false)],
        );

        assert_eq!(capture.method_arguments.len(), 2);
        assert_eq!(capture.method_arguments["userId"].value, "7");
        assert_eq!(capture.method_arguments["arg1"].value, "false");
    }

    #[test]
    fn arguments_keep_declaration_order() {
        let config = AgentConfig::default();
        let heap = HeapSnapshot::new();
        let thrown = throwable(vec![]);
        let method = MethodDescriptor::new("com.example.Api", "handle").with_params(vec![
            Some("zeta".to_string()),
            Some("alpha".to_string()),
            Some("mid".to_string()),
        ]);

        let capture = capture_exception(
            &config,
            &heap,
            &thrown,
            None,
            &method,
            &[
                RuntimeValue::Int(1),
                RuntimeValue::Int(2),
                RuntimeValue::Int(3),
            ],
        );

        let names: Vec<&str> = capture.method_arguments.keys().collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);

        // Declaration order survives serialization, not alphabetical order.
        let serialized = serde_json::to_string(&capture.method_arguments).unwrap();
        let zeta = serialized.find("\"zeta\"").unwrap();
        let alpha = serialized.find("\"alpha\"").unwrap();
        let mid = serialized.find("\"mid\"").unwrap();
        assert!(zeta < alpha && alpha < mid);
    }

    #[test]
    fn extra_arguments_beyond_parameters_dropped() {
        let config = AgentConfig::default();
        let heap = HeapSnapshot::new();
        let thrown = throwable(vec![]);
        let method = MethodDescriptor::new("com.example.Api", "handle")
            .with_params(vec![Some("first".to_string())]);

        let capture = capture_exception(
            &config,
            &heap,
            &thrown,
            None,
            &method,
            &[RuntimeValue::Int(1), RuntimeValue::Int(2)],
        );
        assert_eq!(capture.method_arguments.len(), 1);
    }

    #[test]
    fn receiver_fields_land_in_local_variables() {
        let config = AgentConfig::default();
        let mut heap = HeapSnapshot::new();
        let label = heap.insert_string(2, "TestAppInstance");
        heap.insert(
            1,
            ObjectShape::Fields(vec![
                ObjectField::new("instanceName", label.into()),
                ObjectField::new("instanceCounter", RuntimeValue::Int(42)),
            ]),
        );
        let receiver = ObjectRef::new(1, "com.example.App");
        let thrown = throwable(vec![]);
        let method = MethodDescriptor::new("com.example.App", "process");

        let capture = capture_exception(&config, &heap, &thrown, Some(&receiver), &method, &[]);

        assert_eq!(capture.local_variables["this.instanceName"].value, "TestAppInstance");
        assert_eq!(capture.local_variables["this.instanceCounter"].value, "42");
    }

    // Identical type, throwing method, and top frames share a fingerprint.
    #[test]
    fn fingerprint_stable_for_same_shape() {
        let frames = vec![
            RawFrame::new("com.example.Api", "handle").at("Api.java", 31),
            RawFrame::new("com.example.Main", "run").at("Main.java", 12),
        ];
        let method = MethodDescriptor::new("com.example.Api", "handle");
        let a = fingerprint(&throwable(frames.clone()), &method);
        let b = fingerprint(&throwable(frames), &method);

        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_differs_when_line_moves() {
        let method = MethodDescriptor::new("com.example.Api", "handle");
        let a = fingerprint(
            &throwable(vec![RawFrame::new("com.example.Api", "handle").at("Api.java", 31)]),
            &method,
        );
        let b = fingerprint(
            &throwable(vec![RawFrame::new("com.example.Api", "handle").at("Api.java", 32)]),
            &method,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_ignores_frames_past_the_fifth() {
        let method = MethodDescriptor::new("com.example.Api", "handle");
        let mut frames: Vec<RawFrame> = (0..5)
            .map(|i| RawFrame::new("com.example.Api", format!("m{i}")).at("Api.java", i))
            .collect();
        let a = fingerprint(&throwable(frames.clone()), &method);
        frames.push(RawFrame::new("com.example.Tail", "extra").at("Tail.java", 99));
        let b = fingerprint(&throwable(frames), &method);
        assert_eq!(a, b);
    }

    #[test]
    fn missing_message_becomes_empty() {
        let config = AgentConfig::default();
        let heap = HeapSnapshot::new();
        let mut thrown = throwable(vec![]);
        thrown.message = None;
        let method = MethodDescriptor::new("com.example.Api", "handle");
        let capture = capture_exception(&config, &heap, &thrown, None, &method, &[]);
        assert_eq!(capture.message, "");
    }
}
