//! Recursive descent over a heap snapshot, bounded by the configured
//! depth, breadth, and string limits.

use std::collections::BTreeMap;

use aivory_config::AgentConfig;

use crate::heap::{HeapSnapshot, ObjectField, ObjectRef, ObjectShape, RuntimeValue};
use crate::model::CapturedValue;
use crate::MAX_OBJECT_FIELDS;

/// Map keys longer than this are clipped to 47 chars plus `...`.
const MAX_MAP_KEY_LEN: usize = 50;

/// Serializes [`RuntimeValue`] graphs into bounded [`CapturedValue`]
/// trees. Pure with respect to `(value, limits)`; the depth fence doubles
/// as the cycle guard.
pub struct ValueSerializer<'a> {
    config: &'a AgentConfig,
    heap: &'a HeapSnapshot,
}

impl<'a> ValueSerializer<'a> {
    pub fn new(config: &'a AgentConfig, heap: &'a HeapSnapshot) -> Self {
        Self { config, heap }
    }

    pub fn capture(&self, name: &str, value: &RuntimeValue, depth: usize) -> CapturedValue {
        let mut node = CapturedValue {
            name: name.to_string(),
            ..CapturedValue::default()
        };

        if let RuntimeValue::Null = value {
            node.type_name = "null".to_string();
            node.value = "null".to_string();
            node.is_null = true;
            return node;
        }

        if let Some((type_name, text)) = scalar_text(value) {
            node.type_name = type_name.to_string();
            self.set_string_value(&mut node, text);
            return node;
        }

        let RuntimeValue::Object(reference) = value else {
            unreachable!("scalars and null handled above");
        };
        node.type_name = reference.runtime_type.clone();

        // Strings are scalar-like: captured by value, never depth-fenced.
        if let Some(ObjectShape::String(text)) = self.heap.shape(reference.id) {
            self.set_string_value(&mut node, text.clone());
            return node;
        }

        if depth >= self.config.max_capture_depth {
            node.value = opaque_tag(reference);
            node.is_truncated = true;
            return node;
        }

        match self.heap.shape(reference.id) {
            Some(ObjectShape::Array { length, elements }) => {
                self.capture_array(&mut node, reference, *length, elements, depth);
            }
            Some(ObjectShape::Sequence { elements }) => {
                self.capture_sequence(&mut node, reference, elements, depth);
            }
            Some(ObjectShape::Mapping { entries }) => {
                self.capture_mapping(&mut node, reference, entries, depth);
            }
            Some(ObjectShape::Fields(fields)) => {
                self.capture_object(&mut node, reference, fields, depth);
            }
            Some(ObjectShape::String(_)) => unreachable!("strings handled above"),
            // Reference outside the snapshot: opaque object, no fields.
            None => self.capture_object(&mut node, reference, &[], depth),
        }

        node
    }

    /// Captures a receiver's instance fields into `into`, keyed
    /// `this.<field>`. Same field discipline as opaque objects, but there
    /// is no parent node to mark truncated.
    pub fn capture_receiver_fields(
        &self,
        receiver: &ObjectRef,
        into: &mut BTreeMap<String, CapturedValue>,
    ) {
        let Some(ObjectShape::Fields(fields)) = self.heap.shape(receiver.id) else {
            return;
        };

        let mut captured = 0;
        for field in fields {
            if captured >= MAX_OBJECT_FIELDS {
                break;
            }
            if field.is_static || field.is_synthetic {
                continue;
            }
            let Some(value) = &field.value else {
                continue;
            };
            into.insert(
                format!("this.{}", field.name),
                self.capture(&field.name, value, 0),
            );
            captured += 1;
        }
    }

    fn set_string_value(&self, node: &mut CapturedValue, text: String) {
        let limit = self.config.max_string_length;
        if text.chars().count() > limit {
            node.value = text.chars().take(limit).collect();
            node.is_truncated = true;
        } else {
            node.value = text;
        }
    }

    fn capture_array(
        &self,
        node: &mut CapturedValue,
        reference: &ObjectRef,
        length: usize,
        elements: &[RuntimeValue],
        depth: usize,
    ) {
        node.array_length = length;

        let limit = length.min(self.config.max_collection_size);
        for (index, element) in elements.iter().take(limit).enumerate() {
            node.array_elements
                .push(self.capture(&format!("[{index}]"), element, depth + 1));
        }

        if length > node.array_elements.len() {
            node.is_truncated = true;
        }
        node.value = reference.runtime_type.replace("[]", &format!("[{length}]"));
    }

    fn capture_sequence(
        &self,
        node: &mut CapturedValue,
        reference: &ObjectRef,
        elements: &[RuntimeValue],
        depth: usize,
    ) {
        let size = elements.len();
        node.array_length = size;

        for (index, element) in elements.iter().take(self.config.max_collection_size).enumerate() {
            node.array_elements
                .push(self.capture(&format!("[{index}]"), element, depth + 1));
        }

        if size > node.array_elements.len() {
            node.is_truncated = true;
        }
        node.value = format!(
            "{}<{size} items>",
            simple_type_name(&reference.runtime_type)
        );
    }

    fn capture_mapping(
        &self,
        node: &mut CapturedValue,
        reference: &ObjectRef,
        entries: &[(RuntimeValue, RuntimeValue)],
        depth: usize,
    ) {
        let size = entries.len();

        for (key, value) in entries.iter().take(self.config.max_collection_size) {
            let key = clip_map_key(self.render_key(key));
            let child = self.capture(&key, value, depth + 1);
            node.children.insert(key, child);
        }

        if size > self.config.max_collection_size {
            node.is_truncated = true;
        }
        node.value = format!(
            "{}<{size} entries>",
            simple_type_name(&reference.runtime_type)
        );
    }

    fn capture_object(
        &self,
        node: &mut CapturedValue,
        reference: &ObjectRef,
        fields: &[ObjectField],
        depth: usize,
    ) {
        let mut captured = 0;
        for field in fields {
            if field.is_static || field.is_synthetic {
                continue;
            }
            let Some(value) = &field.value else {
                // Unreadable field: omitted, but the clipping is recorded.
                node.is_truncated = true;
                continue;
            };
            if captured >= MAX_OBJECT_FIELDS {
                node.is_truncated = true;
                break;
            }
            node.children
                .insert(field.name.clone(), self.capture(&field.name, value, depth + 1));
            captured += 1;
        }

        node.value = opaque_tag(reference);
        node.hash_code = format!("{:x}", reference.id);
    }

    /// Stringifies a map key the way the host runtime would.
    fn render_key(&self, key: &RuntimeValue) -> String {
        match key {
            RuntimeValue::Null => "null".to_string(),
            RuntimeValue::Object(reference) => match self.heap.shape(reference.id) {
                Some(ObjectShape::String(text)) => text.clone(),
                _ => format!("{}@{:x}", reference.runtime_type, reference.id),
            },
            scalar => scalar_text(scalar).map(|(_, text)| text).unwrap_or_default(),
        }
    }
}

fn scalar_text(value: &RuntimeValue) -> Option<(&'static str, String)> {
    match value {
        RuntimeValue::Boolean(v) => Some(("java.lang.Boolean", v.to_string())),
        RuntimeValue::Byte(v) => Some(("java.lang.Byte", v.to_string())),
        RuntimeValue::Short(v) => Some(("java.lang.Short", v.to_string())),
        RuntimeValue::Int(v) => Some(("java.lang.Integer", v.to_string())),
        RuntimeValue::Long(v) => Some(("java.lang.Long", v.to_string())),
        RuntimeValue::Float(v) => Some(("java.lang.Float", v.to_string())),
        RuntimeValue::Double(v) => Some(("java.lang.Double", v.to_string())),
        RuntimeValue::Char(v) => Some(("java.lang.Character", v.to_string())),
        RuntimeValue::Null | RuntimeValue::Object(_) => None,
    }
}

fn opaque_tag(reference: &ObjectRef) -> String {
    format!(
        "{}@{:x}",
        simple_type_name(&reference.runtime_type),
        reference.id
    )
}

fn clip_map_key(key: String) -> String {
    if key.chars().count() > MAX_MAP_KEY_LEN {
        let clipped: String = key.chars().take(MAX_MAP_KEY_LEN - 3).collect();
        format!("{clipped}...")
    } else {
        key
    }
}

fn simple_type_name(full: &str) -> &str {
    let tail = full.rsplit('.').next().unwrap_or(full);
    tail.rsplit('$').next().unwrap_or(tail)
}
