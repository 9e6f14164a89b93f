//! Snapshot model of the monitored runtime's heap.
//!
//! The instrumentation layer has reflective access to the host process; we
//! do not. What it hands the capture pipeline is a value graph: scalar
//! leaves inline, objects as identity references into a shape table.
//! References between shapes may form cycles.

use std::collections::HashMap;

/// Identity of an object in the monitored runtime. Doubles as the identity
/// hash; rendered in lowercase hex for `@<hex>` tags.
pub type ObjectId = u64;

/// A value observed in the monitored runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeValue {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Object(ObjectRef),
}

impl From<ObjectRef> for RuntimeValue {
    fn from(reference: ObjectRef) -> Self {
        RuntimeValue::Object(reference)
    }
}

/// Reference to a heap object: identity plus fully-qualified runtime type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub runtime_type: String,
}

impl ObjectRef {
    pub fn new(id: ObjectId, runtime_type: impl Into<String>) -> Self {
        Self {
            id,
            runtime_type: runtime_type.into(),
        }
    }
}

/// Shape of one heap object.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectShape {
    /// A string; captured by value.
    String(String),
    /// An array with its declared length. `elements` normally holds all
    /// `length` values; the serializer clips to the collection limit.
    Array {
        length: usize,
        elements: Vec<RuntimeValue>,
    },
    /// A linear collection (list, set, queue) enumerated in iteration
    /// order.
    Sequence { elements: Vec<RuntimeValue> },
    /// A key/value mapping enumerated in iteration order.
    Mapping { entries: Vec<(RuntimeValue, RuntimeValue)> },
    /// An opaque object with declared instance fields.
    Fields(Vec<ObjectField>),
}

/// One declared field of an opaque object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectField {
    pub name: String,
    /// `None` when the reflective read failed; such fields are omitted
    /// from output and mark the parent truncated.
    pub value: Option<RuntimeValue>,
    pub is_static: bool,
    pub is_synthetic: bool,
}

impl ObjectField {
    pub fn new(name: impl Into<String>, value: RuntimeValue) -> Self {
        Self {
            name: name.into(),
            value: Some(value),
            is_static: false,
            is_synthetic: false,
        }
    }

    pub fn unreadable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            is_static: false,
            is_synthetic: false,
        }
    }

    pub fn static_field(name: impl Into<String>, value: RuntimeValue) -> Self {
        Self {
            is_static: true,
            ..Self::new(name, value)
        }
    }

    pub fn synthetic(name: impl Into<String>, value: RuntimeValue) -> Self {
        Self {
            is_synthetic: true,
            ..Self::new(name, value)
        }
    }
}

/// Object table for one capture event.
#[derive(Clone, Debug, Default)]
pub struct HeapSnapshot {
    objects: HashMap<ObjectId, ObjectShape>,
}

impl HeapSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ObjectId, shape: ObjectShape) {
        self.objects.insert(id, shape);
    }

    /// Convenience: insert a string object and return a reference to it.
    pub fn insert_string(&mut self, id: ObjectId, value: impl Into<String>) -> ObjectRef {
        self.insert(id, ObjectShape::String(value.into()));
        ObjectRef::new(id, "java.lang.String")
    }

    pub fn shape(&self, id: ObjectId) -> Option<&ObjectShape> {
        self.objects.get(&id)
    }
}
