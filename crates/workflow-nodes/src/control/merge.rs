//! Merge Metrics
//!
//! Combines JSON metric objects from parallel branches into a single object,
//! typically to feed quality-control values into a report.

use node_engine::{Interface, PortDataType, PortSpec, PortValues, StepContext, StepError};
use serde_json::{Map, Value};

/// Merges up to four JSON objects; later inputs override earlier keys
pub struct MergeMetrics;

impl MergeMetrics {
    pub const NAME: &'static str = "merge-metrics";

    // Input ports
    pub const INPUTS: [&'static str; 4] = ["in1", "in2", "in3", "in4"];
    pub const PORT_PREFIX: &'static str = "prefix";

    // Output ports
    pub const PORT_METRICS: &'static str = "metrics";
    pub const PORT_COUNT: &'static str = "count";

    pub fn interface() -> Interface {
        let mut interface = Interface::new(Self::NAME)
            .with_description("Merge JSON metric objects into one")
            .with_input(
                PortSpec::optional(Self::PORT_PREFIX, PortDataType::String)
                    .with_description("Prepended to every merged key"),
            );
        for port in Self::INPUTS {
            interface = interface.with_input(PortSpec::optional(port, PortDataType::Json));
        }
        interface
            .with_output(PortSpec::required(Self::PORT_METRICS, PortDataType::Json))
            .with_output(PortSpec::required(Self::PORT_COUNT, PortDataType::Integer))
    }

    pub fn run(_ctx: &StepContext, inputs: PortValues) -> Result<PortValues, StepError> {
        let prefix = inputs
            .get(Self::PORT_PREFIX)
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let mut merged = Map::new();
        let mut count = 0;
        for port in Self::INPUTS {
            match inputs.get(port) {
                None | Some(Value::Null) => {}
                Some(Value::Object(map)) => {
                    count += 1;
                    for (k, v) in map {
                        merged.insert(format!("{}{}", prefix, k), v.clone());
                    }
                }
                Some(other) => {
                    return Err(StepError::failed(format!(
                        "input '{}' must be a JSON object, got {}",
                        port,
                        node_engine::types::describe_value(other)
                    )))
                }
            }
        }

        let mut outputs = PortValues::new();
        outputs.insert(Self::PORT_METRICS.to_string(), Value::Object(merged));
        outputs.insert(Self::PORT_COUNT.to_string(), Value::from(count));
        Ok(outputs)
    }
}
