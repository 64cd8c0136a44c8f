//! Identity
//!
//! Passes a value through unchanged. Useful as the entry point of a
//! sub-workflow (one input fanned out to several internal nodes) and to
//! re-export an upstream output under a stable node id.

use node_engine::{Interface, PortDataType, PortSpec, PortValues, StepContext, StepError};

pub struct Identity;

impl Identity {
    pub const NAME: &'static str = "identity";
    pub const PORT_VALUE: &'static str = "value";

    pub fn interface() -> Interface {
        Interface::new(Self::NAME)
            .with_description("Pass a value through unchanged")
            .with_input(PortSpec::required(Self::PORT_VALUE, PortDataType::Any))
            .with_output(PortSpec::required(Self::PORT_VALUE, PortDataType::Any))
    }

    pub fn run(_ctx: &StepContext, mut inputs: PortValues) -> Result<PortValues, StepError> {
        let value = inputs
            .remove(Self::PORT_VALUE)
            .ok_or_else(|| StepError::failed("missing input 'value'"))?;
        Ok(PortValues::from([(Self::PORT_VALUE.to_string(), value)]))
    }
}
