//! Breakpoint capture builder: local context at a probe location.

use std::collections::BTreeMap;

use aivory_config::AgentConfig;
use chrono::{SecondsFormat, Utc};

use crate::heap::{HeapSnapshot, ObjectRef, RuntimeValue};
use crate::model::{BreakpointCapture, StackFrame};
use crate::serializer::ValueSerializer;
use crate::{RawFrame, MAX_STACK_FRAMES};

/// Leading frames under these prefixes are agent or runtime scaffolding
/// and are stripped from breakpoint traces.
const SCAFFOLD_PREFIXES: &[&str] = &["com.aivory.monitor.agent", "java.lang.Thread"];

/// Builds a [`BreakpointCapture`] for a probe hit. `current_stack` is the
/// hitting thread's stack, innermost first; `args` carry no parameter
/// names at this call site and are recorded as `arg<i>`.
#[allow(clippy::too_many_arguments)]
pub fn capture_breakpoint(
    config: &AgentConfig,
    heap: &HeapSnapshot,
    breakpoint_id: &str,
    class_name: &str,
    line_number: u32,
    current_stack: &[RawFrame],
    receiver: Option<&ObjectRef>,
    args: &[RuntimeValue],
) -> BreakpointCapture {
    let serializer = ValueSerializer::new(config, heap);

    let stack_trace: Vec<StackFrame> = current_stack
        .iter()
        .skip_while(|frame| is_scaffold_frame(frame))
        .take(MAX_STACK_FRAMES)
        .map(StackFrame::from_raw)
        .collect();

    let mut local_variables = BTreeMap::new();
    if let Some(receiver) = receiver {
        serializer.capture_receiver_fields(receiver, &mut local_variables);
    }
    for (index, arg) in args.iter().enumerate() {
        let name = format!("arg{index}");
        local_variables.insert(name.clone(), serializer.capture(&name, arg, 0));
    }

    BreakpointCapture {
        breakpoint_id: breakpoint_id.to_string(),
        class_name: class_name.to_string(),
        line_number,
        captured_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        stack_trace,
        local_variables,
    }
}

fn is_scaffold_frame(frame: &RawFrame) -> bool {
    SCAFFOLD_PREFIXES
        .iter()
        .any(|prefix| frame.class_name.starts_with(prefix))
}
