//! Interface contracts
//!
//! An [`Interface`] is the typed input/output contract of one processing
//! step (skull stripping, registration, applying a transform, ...). It is
//! pure data: the registry pairs it with a step binding, and graphs check
//! node bindings and edges against it.

use serde::{Deserialize, Serialize};

use crate::types::{describe_value, Binding, Bindings, PortDataType};

/// Declaration of a single input or output port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PortSpec {
    /// Port name, unique within its direction
    pub name: String,
    /// Data type of the port
    #[serde(rename = "type")]
    pub data_type: PortDataType,
    /// Whether an input must be bound, or an output must be produced
    #[serde(default)]
    pub required: bool,
    /// Default value used when an optional input is left unbound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl PortSpec {
    /// Create a required port
    pub fn required(name: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    /// Create an optional port
    pub fn optional(name: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            required: false,
            ..Self::required(name, data_type)
        }
    }

    /// Set a default value for this port
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Typed contract of one processing step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Interface {
    /// Unique interface name (e.g. "ants-registration")
    pub name: String,
    /// Description of what the step does
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Input ports, in declaration order
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    /// Output ports, in declaration order
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
}

impl Interface {
    /// Create an interface with no ports
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append an input port
    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    /// Append an output port
    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    /// Find an input port by name
    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Find an output port by name
    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Stable fingerprint of the whole contract
    ///
    /// Part of every cache key, so editing a port list invalidates entries
    /// produced under the old contract.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.name.as_bytes());
        for (tag, ports) in [("in", &self.inputs), ("out", &self.outputs)] {
            for port in ports {
                hasher.update(tag.as_bytes());
                hasher.update(&[0]);
                hasher.update(port.name.as_bytes());
                hasher.update(&[0]);
                hasher.update(port.data_type.to_string().as_bytes());
                hasher.update(&[u8::from(port.required)]);
                if let Some(default) = &port.default {
                    hasher.update(default.to_string().as_bytes());
                }
                hasher.update(&[0]);
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// A binding that does not satisfy an interface
#[derive(Debug, Clone, PartialEq)]
pub enum BindingError {
    /// The interface has no input with this name
    UnknownInput(String),
    /// A literal has the wrong type
    TypeMismatch {
        port: String,
        expected: PortDataType,
        found: String,
    },
    /// A required input is neither bound nor defaulted
    MissingRequired(String),
}

/// Check node bindings against an interface
///
/// Literal values are type-checked; `Deferred` and `Edge` bindings count as
/// satisfying a required input here, and are checked again once the graph is
/// frozen.
pub fn validate_bindings(interface: &Interface, bindings: &Bindings) -> Result<(), BindingError> {
    for (port, binding) in bindings.iter() {
        let spec = interface
            .input(port)
            .ok_or_else(|| BindingError::UnknownInput(port.clone()))?;
        if let Binding::Value { value } = binding {
            if !spec.data_type.accepts(value) {
                return Err(BindingError::TypeMismatch {
                    port: port.clone(),
                    expected: spec.data_type,
                    found: describe_value(value),
                });
            }
        }
    }

    for spec in &interface.inputs {
        if spec.required && spec.default.is_none() && !bindings.contains(&spec.name) {
            return Err(BindingError::MissingRequired(spec.name.clone()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bet() -> Interface {
        Interface::new("bet")
            .with_description("Brain extraction")
            .with_input(PortSpec::required("in_file", PortDataType::Image))
            .with_input(PortSpec::optional("frac", PortDataType::Number).with_default(json!(0.5)))
            .with_output(PortSpec::required("out_file", PortDataType::Image))
            .with_output(PortSpec::optional("mask_file", PortDataType::Mask))
    }

    #[test]
    fn test_port_lookup() {
        let iface = bet();
        assert_eq!(iface.input("frac").unwrap().default, Some(json!(0.5)));
        assert!(iface.output("mask_file").is_some());
        assert!(iface.input("mask_file").is_none());
    }

    #[test]
    fn test_validate_literal_ok() {
        let bindings = Bindings::new().value("in_file", json!("T1w.nii.gz"));
        assert_eq!(validate_bindings(&bet(), &bindings), Ok(()));
    }

    #[test]
    fn test_validate_deferred_satisfies_required() {
        let bindings = Bindings::new().deferred("in_file");
        assert_eq!(validate_bindings(&bet(), &bindings), Ok(()));
    }

    #[test]
    fn test_validate_type_mismatch() {
        let bindings = Bindings::new()
            .value("in_file", json!("T1w.nii.gz"))
            .value("frac", json!("high"));
        assert_eq!(
            validate_bindings(&bet(), &bindings),
            Err(BindingError::TypeMismatch {
                port: "frac".into(),
                expected: PortDataType::Number,
                found: "string".into(),
            })
        );
    }

    #[test]
    fn test_validate_missing_required() {
        assert_eq!(
            validate_bindings(&bet(), &Bindings::new()),
            Err(BindingError::MissingRequired("in_file".into()))
        );
    }

    #[test]
    fn test_validate_unknown_input() {
        let bindings = Bindings::new()
            .deferred("in_file")
            .value("robust", json!(true));
        assert_eq!(
            validate_bindings(&bet(), &bindings),
            Err(BindingError::UnknownInput("robust".into()))
        );
    }

    #[test]
    fn test_fingerprint_tracks_contract() {
        let a = bet();
        let b = bet();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = bet().with_output(PortSpec::optional("skull", PortDataType::Image));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_interface_serialization() {
        let json = serde_json::to_value(bet()).unwrap();
        assert_eq!(json["inputs"][0]["type"], "image");
        let restored: Interface = serde_json::from_value(json).unwrap();
        assert_eq!(restored, bet());
    }
}
