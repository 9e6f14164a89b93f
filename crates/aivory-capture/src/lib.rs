//! Capture pipeline: bounded reflective serialization of in-memory object
//! graphs into the transport model.
//!
//! The host instrumentation delivers program state as a [`HeapSnapshot`] —
//! a table of object shapes keyed by identity — plus [`RuntimeValue`]
//! roots (receiver, arguments, throwable). The [`ValueSerializer`] walks
//! that graph into a [`CapturedValue`] tree under the configured depth,
//! breadth, and string limits; the builders in [`exception`] and
//! [`breakpoint`] compose full captures around it.
//!
//! Everything here is pure with respect to the snapshot: no I/O, no
//! locking, bounded output for arbitrary (including cyclic) input.

mod breakpoint;
mod heap;
mod model;
mod serializer;

pub mod exception;

pub use breakpoint::capture_breakpoint;
pub use exception::capture_exception;
pub use heap::{HeapSnapshot, ObjectField, ObjectId, ObjectRef, ObjectShape, RuntimeValue};
pub use model::{ArgumentMap, BreakpointCapture, CapturedValue, ExceptionCapture, StackFrame};
pub use serializer::ValueSerializer;

/// Hard cap on fields captured per opaque object, independent of depth.
pub const MAX_OBJECT_FIELDS: usize = 20;

/// Hard cap on captured stack trace length.
pub const MAX_STACK_FRAMES: usize = 50;

/// A throwable as observed by the instrumentation: identity for
/// per-instance deduplication, runtime type, message, and the attached
/// stack trace.
#[derive(Clone, Debug, PartialEq)]
pub struct ThrowableSnapshot {
    pub identity: u64,
    pub exception_type: String,
    pub message: Option<String>,
    pub frames: Vec<RawFrame>,
}

/// One raw stack trace element delivered by the host runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub class_name: String,
    pub method_name: String,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub line_number: i32,
    pub is_native: bool,
}

impl RawFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: None,
            file_path: None,
            line_number: -1,
            is_native: false,
        }
    }

    pub fn at(mut self, file_name: impl Into<String>, line_number: i32) -> Self {
        self.file_name = Some(file_name.into());
        self.line_number = line_number;
        self
    }

    pub fn native(mut self) -> Self {
        self.is_native = true;
        self
    }
}

/// Descriptor of the method a throwable escaped from. A `None` parameter
/// name means the runtime erased it and `arg<i>` is used instead.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodDescriptor {
    pub declaring_class: String,
    pub name: String,
    pub param_names: Vec<Option<String>>,
}

impl MethodDescriptor {
    pub fn new(declaring_class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            declaring_class: declaring_class.into(),
            name: name.into(),
            param_names: Vec::new(),
        }
    }

    pub fn with_params(mut self, names: Vec<Option<String>>) -> Self {
        self.param_names = names;
        self
    }
}
