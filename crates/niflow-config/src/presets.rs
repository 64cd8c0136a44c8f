//! Registration presets
//!
//! A preset is a named parameter set (e.g. `t1-mni_registration`) applied to
//! a node when it is constructed. Presets are loaded once into an immutable
//! [`PresetLibrary`] and passed explicitly to graph construction.
//!
//! Two layouts are accepted:
//!
//! - a single document `{presets: {<name>: {<param>: <value>}}}`
//! - a directory with one document per preset, `<name>.json|yaml|yml`,
//!   each holding the parameter mapping directly
//!
//! Flavored variants (`t1-mni_registration_precise`, `_testing`) are ordinary
//! presets; [`PresetLibrary::resolve_flavored`] picks the variant when present
//! and falls back to the base preset otherwise.

use std::collections::BTreeMap;
use std::path::Path;

use node_engine::{types::describe_value, Bindings, Interface};
use serde_json::{Map, Value};

use crate::error::{ConfigError, Result};
use crate::format::{read_document, ConfigFormat};

/// Parameter name -> value
pub type Parameters = Map<String, Value>;

/// Immutable set of named presets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresetLibrary {
    presets: BTreeMap<String, Parameters>,
}

impl PresetLibrary {
    /// Create an empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single-document library from JSON
    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_document(ConfigFormat::Json.parse(text, "presets")?)
    }

    /// Parse a single-document library from YAML
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Self::from_document(ConfigFormat::Yaml.parse(text, "presets")?)
    }

    /// Load from a single document or a directory of per-preset documents
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let library = if path.is_dir() {
            Self::from_dir(path)?
        } else {
            Self::from_document(read_document(path)?)?
        };
        log::info!("Loaded {} presets from {:?}", library.len(), path);
        Ok(library)
    }

    /// Load one preset per document file in `dir`
    ///
    /// The file stem is the preset name. Files with other extensions are
    /// ignored.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| ConfigError::io(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && ConfigFormat::is_document(p))
            .collect();
        files.sort();

        let mut library = Self::new();
        for file in files {
            let Some(name) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let params: Value = read_document(&file)?;
            library.insert(name, params)?;
        }
        Ok(library)
    }

    /// Build from an already parsed `{presets: {...}}` document
    pub fn from_document(doc: Value) -> Result<Self> {
        let Value::Object(top) = doc else {
            return Err(ConfigError::malformed("", "expected a mapping with a 'presets' key"));
        };
        if let Some(key) = top.keys().find(|k| k.as_str() != "presets") {
            return Err(ConfigError::malformed(key.clone(), "unknown top-level key"));
        }
        match top.get("presets") {
            Some(Value::Object(presets)) => Self::from_mapping(presets.clone()),
            Some(other) => Err(ConfigError::malformed(
                "presets",
                format!("expected a mapping, found {}", describe_value(other)),
            )),
            None => Err(ConfigError::malformed("presets", "missing key")),
        }
    }

    /// Build from a `{<name>: {<param>: <value>}}` mapping
    pub fn from_mapping(presets: Map<String, Value>) -> Result<Self> {
        let mut library = Self::new();
        for (name, params) in presets {
            library.insert(&name, params)?;
        }
        Ok(library)
    }

    fn insert(&mut self, name: &str, params: Value) -> Result<()> {
        let path = format!("presets.{}", name);
        if self.presets.contains_key(name) {
            return Err(ConfigError::malformed(path, "preset defined twice"));
        }
        let Value::Object(params) = params else {
            return Err(ConfigError::malformed(
                path,
                format!(
                    "expected a mapping of parameter names to values, found {}",
                    describe_value(&params)
                ),
            ));
        };
        if let Some((key, _)) = params.iter().find(|(_, v)| v.is_null()) {
            return Err(ConfigError::InvalidValue {
                path: format!("{}.{}", path, key),
                reason: "null is not a parameter value".to_string(),
            });
        }
        self.presets.insert(name.to_string(), params);
        Ok(())
    }

    /// Get a preset by exact name
    pub fn get(&self, name: &str) -> Option<&Parameters> {
        self.presets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.presets.contains_key(name)
    }

    /// Preset names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Pick `<base>_<flavor>` if it exists, else `<base>`
    ///
    /// Returns the name actually chosen together with its parameters.
    pub fn resolve_flavored(&self, base: &str, flavor: Option<&str>) -> Result<(&str, &Parameters)> {
        if let Some(flavor) = flavor {
            let flavored = format!("{}_{}", base, flavor);
            if let Some((name, params)) = self.presets.get_key_value(&flavored) {
                return Ok((name.as_str(), params));
            }
            log::debug!("No '{}' preset, falling back to '{}'", flavored, base);
        }
        self.presets
            .get_key_value(base)
            .map(|(name, params)| (name.as_str(), params))
            .ok_or_else(|| ConfigError::UnknownPreset(base.to_string()))
    }

    /// Turn a preset into literal bindings for an interface
    ///
    /// Every parameter must name an input of the interface and have an
    /// acceptable type; errors name the key as `presets.<name>.<param>`.
    pub fn bindings_for(&self, name: &str, interface: &Interface) -> Result<Bindings> {
        let params = self
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))?;
        preset_bindings(name, params, interface)
    }
}

/// Validate preset parameters against an interface
pub(crate) fn preset_bindings(
    name: &str,
    params: &Parameters,
    interface: &Interface,
) -> Result<Bindings> {
    let mut bindings = Bindings::new();
    for (key, value) in params {
        let path = format!("presets.{}.{}", name, key);
        let spec = interface
            .input(key)
            .ok_or_else(|| ConfigError::UnknownParameter { path: path.clone() })?;
        if !spec.data_type.accepts(value) {
            return Err(ConfigError::InvalidValue {
                path,
                reason: format!(
                    "expected {}, found {}",
                    spec.data_type,
                    describe_value(value)
                ),
            });
        }
        bindings = bindings.value(key.clone(), value.clone());
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::{Binding, PortDataType, PortSpec};
    use serde_json::json;

    fn data_dir() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("data").join("presets")
    }

    /// Contract of `antsRegistration` as far as the presets touch it
    fn ants_registration() -> Interface {
        let mut iface = Interface::new("ants-registration")
            .with_input(PortSpec::required("fixed_image", PortDataType::Image))
            .with_input(PortSpec::required("moving_image", PortDataType::Image))
            .with_input(PortSpec::optional("dimension", PortDataType::Integer))
            .with_input(PortSpec::optional("float", PortDataType::Boolean))
            .with_input(PortSpec::optional("collapse_output_transforms", PortDataType::Boolean))
            .with_input(PortSpec::optional("write_composite_transform", PortDataType::Boolean))
            .with_input(PortSpec::optional("initial_moving_transform_com", PortDataType::Integer))
            .with_input(PortSpec::optional("winsorize_lower_quantile", PortDataType::Number))
            .with_input(PortSpec::optional("winsorize_upper_quantile", PortDataType::Number));
        for key in [
            "transforms",
            "transform_parameters",
            "metric",
            "metric_weight",
            "radius_or_number_of_bins",
            "sampling_strategy",
            "sampling_percentage",
            "number_of_iterations",
            "convergence_threshold",
            "convergence_window_size",
            "shrink_factors",
            "smoothing_sigmas",
            "sigma_units",
            "use_histogram_matching",
        ] {
            iface = iface.with_input(PortSpec::optional(key, PortDataType::Json));
        }
        iface.with_output(PortSpec::required("composite_transform", PortDataType::Transform))
    }

    #[test]
    fn test_from_json_document() {
        let library = PresetLibrary::from_json_str(
            r#"{"presets": {"t1-mni_registration": {"dimension": 3, "float": true}}}"#,
        )
        .unwrap();
        assert_eq!(library.len(), 1);
        assert_eq!(library.get("t1-mni_registration").unwrap()["dimension"], json!(3));
    }

    #[test]
    fn test_from_yaml_document() {
        let library = PresetLibrary::from_yaml_str(
            "presets:\n  fast:\n    dimension: 3\n    transforms: [Rigid]\n",
        )
        .unwrap();
        assert_eq!(library.get("fast").unwrap()["transforms"], json!(["Rigid"]));
    }

    #[test]
    fn test_non_mapping_preset_names_key() {
        let err = PresetLibrary::from_json_str(r#"{"presets": {"broken": [1, 2]}}"#).unwrap_err();
        match err {
            ConfigError::Malformed { path, .. } => assert_eq!(path, "presets.broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_top_level_key() {
        let err = PresetLibrary::from_json_str(r#"{"presets": {}, "preset": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { ref path, .. } if path == "preset"));
    }

    #[test]
    fn test_null_value_rejected() {
        let err = PresetLibrary::from_yaml_str("presets:\n  a:\n    dimension: ~\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref path, .. } if path == "presets.a.dimension"));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = PresetLibrary::from_json_str(r#"{"presets": {"a": {"dimension": 3,}}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_shipped_presets_load_and_bind() {
        let library = PresetLibrary::from_dir(data_dir()).unwrap();
        assert_eq!(
            library.names().collect::<Vec<_>>(),
            vec![
                "t1-mni_registration",
                "t1-mni_registration_precise",
                "t1-mni_registration_testing"
            ]
        );

        let iface = ants_registration();
        for name in library.names() {
            let bindings = library.bindings_for(name, &iface).unwrap();
            assert_eq!(
                bindings.get("dimension"),
                Some(&Binding::Value { value: json!(3) })
            );
        }
    }

    #[test]
    fn test_resolve_flavored_with_fallback() {
        let library = PresetLibrary::from_dir(data_dir()).unwrap();

        let (name, params) = library
            .resolve_flavored("t1-mni_registration", Some("precise"))
            .unwrap();
        assert_eq!(name, "t1-mni_registration_precise");
        assert_eq!(params["float"], json!(false));

        let (name, _) = library
            .resolve_flavored("t1-mni_registration", Some("fast"))
            .unwrap();
        assert_eq!(name, "t1-mni_registration");

        assert!(matches!(
            library.resolve_flavored("bold-mni_registration", None),
            Err(ConfigError::UnknownPreset(_))
        ));
    }

    #[test]
    fn test_unknown_parameter_names_key() {
        let library = PresetLibrary::from_json_str(
            r#"{"presets": {"t1-mni_registration": {"dimensions": 3}}}"#,
        )
        .unwrap();
        let err = library
            .bindings_for("t1-mni_registration", &ants_registration())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown parameter 'presets.t1-mni_registration.dimensions'"
        );
    }

    #[test]
    fn test_wrong_type_names_key() {
        let library =
            PresetLibrary::from_json_str(r#"{"presets": {"reg": {"dimension": "3d"}}}"#).unwrap();
        let err = library.bindings_for("reg", &ants_registration()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value at 'presets.reg.dimension': expected integer, found string"
        );
    }

    #[test]
    fn test_from_path_single_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("presets.yaml");
        std::fs::write(&path, "presets:\n  a:\n    dimension: 2\n").unwrap();
        let library = PresetLibrary::from_path(&path).unwrap();
        assert!(library.contains("a"));
    }
}
