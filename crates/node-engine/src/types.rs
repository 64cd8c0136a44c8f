//! Core value types shared by interfaces, graphs and the scheduler

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node within its owning graph
pub type NodeId = String;

/// Name of an input or output port
pub type PortId = String;

/// Values flowing in or out of a step, keyed by port name
pub type PortValues = HashMap<PortId, serde_json::Value>;

/// The data type of a port
///
/// File-like types (`File`, `Image`, `Mask`, `Transform`) travel between
/// steps as path strings; the distinction only exists so that edges cannot
/// wire, say, a transform into an image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDataType {
    /// Accepts any type
    Any,
    /// Text string
    String,
    /// Floating point or integer number
    Number,
    /// Integer number
    Integer,
    /// Boolean value
    Boolean,
    /// Path to an arbitrary file
    File,
    /// Path to a NIfTI image
    Image,
    /// Path to a binary mask image
    Mask,
    /// Path to a spatial transform file
    Transform,
    /// Arbitrary JSON (objects, arrays, metric bundles)
    Json,
}

impl PortDataType {
    /// Check if an output of this type can feed an input of `other`
    pub fn is_compatible_with(&self, other: &PortDataType) -> bool {
        if matches!(self, PortDataType::Any) || matches!(other, PortDataType::Any) {
            return true;
        }
        self == other
    }

    /// Whether values of this type are file paths
    pub fn is_file_like(&self) -> bool {
        matches!(
            self,
            PortDataType::File | PortDataType::Image | PortDataType::Mask | PortDataType::Transform
        )
    }

    /// Check whether a literal JSON value is acceptable for this type
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            PortDataType::Any | PortDataType::Json => true,
            PortDataType::String
            | PortDataType::File
            | PortDataType::Image
            | PortDataType::Mask
            | PortDataType::Transform => value.is_string(),
            PortDataType::Number => value.is_number(),
            PortDataType::Integer => value.is_i64() || value.is_u64(),
            PortDataType::Boolean => matches!(value, Value::Bool(_)),
        }
    }
}

impl std::fmt::Display for PortDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PortDataType::Any => "any",
            PortDataType::String => "string",
            PortDataType::Number => "number",
            PortDataType::Integer => "integer",
            PortDataType::Boolean => "boolean",
            PortDataType::File => "file",
            PortDataType::Image => "image",
            PortDataType::Mask => "mask",
            PortDataType::Transform => "transform",
            PortDataType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Short description of a JSON value's kind, for error messages
pub fn describe_value(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(n) if n.is_f64() => "number".to_string(),
        Value::Number(_) => "integer".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// How a single node input receives its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    /// A literal value, type-checked when the node is added
    Value { value: serde_json::Value },
    /// Declared edge-bound; satisfied later by `connect`
    Deferred,
    /// Bound to another node's output
    Edge { node: NodeId, output: PortId },
}

/// Input bindings for one node, ordered by input name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bindings(BTreeMap<PortId, Binding>);

impl Bindings {
    /// Create an empty set of bindings
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a literal value
    pub fn value(mut self, port: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.insert(port.into(), Binding::Value { value });
        self
    }

    /// Declare an input that will be fed by an edge
    pub fn deferred(mut self, port: impl Into<String>) -> Self {
        self.0.insert(port.into(), Binding::Deferred);
        self
    }

    /// Insert or replace a binding
    pub fn insert(&mut self, port: impl Into<String>, binding: Binding) {
        self.0.insert(port.into(), binding);
    }

    /// Get the binding for a port
    pub fn get(&self, port: &str) -> Option<&Binding> {
        self.0.get(port)
    }

    /// Whether a port has any binding
    pub fn contains(&self, port: &str) -> bool {
        self.0.contains_key(port)
    }

    /// Iterate over bindings in port-name order
    pub fn iter(&self) -> impl Iterator<Item = (&PortId, &Binding)> {
        self.0.iter()
    }

    /// Literal values only
    pub fn literals(&self) -> impl Iterator<Item = (&PortId, &serde_json::Value)> {
        self.0.iter().filter_map(|(port, binding)| match binding {
            Binding::Value { value } => Some((port, value)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, serde_json::Value)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(port, value)| (port, Binding::Value { value }))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_port_data_type_compatibility() {
        assert!(PortDataType::Any.is_compatible_with(&PortDataType::Image));
        assert!(PortDataType::Image.is_compatible_with(&PortDataType::Any));
        assert!(PortDataType::Image.is_compatible_with(&PortDataType::Image));
        assert!(!PortDataType::Transform.is_compatible_with(&PortDataType::Image));
        assert!(!PortDataType::Number.is_compatible_with(&PortDataType::String));
    }

    #[test]
    fn test_accepts_literals() {
        assert!(PortDataType::Image.accepts(&json!("/data/sub-01_T1w.nii.gz")));
        assert!(!PortDataType::Image.accepts(&json!(3)));
        assert!(PortDataType::Number.accepts(&json!(0.5)));
        assert!(PortDataType::Number.accepts(&json!(3)));
        assert!(PortDataType::Integer.accepts(&json!(3)));
        assert!(!PortDataType::Integer.accepts(&json!(3.5)));
        assert!(PortDataType::Json.accepts(&json!({"fd": [0.1, 0.2]})));
        assert!(!PortDataType::Boolean.accepts(&json!("true")));
    }

    #[test]
    fn test_bindings_builder() {
        let bindings = Bindings::new()
            .value("dimension", json!(3))
            .deferred("moving_image");

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.get("moving_image"), Some(&Binding::Deferred));
        let literals: Vec<_> = bindings.literals().collect();
        assert_eq!(literals.len(), 1);
        assert_eq!(literals[0].0, "dimension");
    }

    #[test]
    fn test_describe_value() {
        assert_eq!(describe_value(&json!(1)), "integer");
        assert_eq!(describe_value(&json!(1.5)), "number");
        assert_eq!(describe_value(&json!([1])), "array");
    }
}
