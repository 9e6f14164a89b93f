//! Transport-facing capture records.

use std::collections::BTreeMap;
use std::ops::Index;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::RawFrame;

/// One node of a bounded capture tree.
///
/// Exactly one of `children` / `array_elements` is used for non-scalar,
/// non-null values: `children` for object fields and map entries,
/// `array_elements` for arrays and linear collections. Empty branches are
/// omitted from the wire form.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CapturedValue {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: String,
    pub is_null: bool,
    pub is_truncated: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, CapturedValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub array_elements: Vec<CapturedValue>,
    pub array_length: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash_code: String,
}

/// One captured stack frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub line_number: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_number: Option<i32>,
    pub is_native: bool,
    pub source_available: bool,
    /// Per-frame locals; only populated on the native-subagent path, where
    /// the decoded variable tree is opaque to the agent.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub local_variables: BTreeMap<String, serde_json::Value>,
}

impl StackFrame {
    pub(crate) fn from_raw(raw: &RawFrame) -> Self {
        Self {
            class_name: raw.class_name.clone(),
            method_name: raw.method_name.clone(),
            file_name: raw.file_name.clone(),
            file_path: raw.file_path.clone(),
            line_number: raw.line_number,
            column_number: None,
            is_native: raw.is_native,
            source_available: raw.file_name.is_some() && !raw.is_native,
            local_variables: BTreeMap::new(),
        }
    }
}

/// Method arguments keyed by parameter name. Unlike the other variable
/// maps, iteration and serialization follow declaration order, so the
/// wire payload lists arguments the way the method signature does.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArgumentMap {
    entries: Vec<(String, CapturedValue)>,
}

impl ArgumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces; a replaced name keeps its original position.
    pub fn insert(&mut self, name: String, value: CapturedValue) {
        match self.entries.iter_mut().find(|(key, _)| key.as_str() == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CapturedValue> {
        self.entries
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CapturedValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl Index<&str> for ArgumentMap {
    type Output = CapturedValue;

    fn index(&self, name: &str) -> &CapturedValue {
        self.get(name)
            .unwrap_or_else(|| panic!("no argument named {name}"))
    }
}

impl Serialize for ArgumentMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Snapshot of an exception in flight. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExceptionCapture {
    pub id: String,
    pub exception_type: String,
    pub message: String,
    pub fingerprint: String,
    pub captured_at: String,
    pub stack_trace: Vec<StackFrame>,
    /// Receiver fields, keyed `this.<field>`.
    pub local_variables: BTreeMap<String, CapturedValue>,
    /// Arguments in declaration order, named by parameter or `arg<i>`
    /// when names were erased.
    pub method_arguments: ArgumentMap,
}

/// Snapshot taken when a non-breaking breakpoint location is hit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakpointCapture {
    pub breakpoint_id: String,
    pub class_name: String,
    pub line_number: u32,
    pub captured_at: String,
    pub stack_trace: Vec<StackFrame>,
    pub local_variables: BTreeMap<String, CapturedValue>,
}
