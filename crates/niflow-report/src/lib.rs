//! niflow reports
//!
//! Turns the artifacts and metrics of a run into a static HTML quality-control
//! report laid out by a [`ReportTemplate`].
//!
//! ```ignore
//! let template = ReportTemplate::from_path("report.yaml")?;
//! let inputs = ReportInputs::from_run_report(&run, &plan);
//! assemble(&template, &inputs)?.write("sub-01.html")?;
//! ```

pub mod assembler;
pub mod error;
pub mod template;

pub use assembler::{assemble, Report, ReportInputs};
pub use error::{ReportError, Result};
pub use template::{ReportTemplate, SectionSpec};
