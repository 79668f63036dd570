pub mod artifact;
pub mod cancel;
pub mod config;
pub mod definition;
pub mod deploy;
pub mod error;
pub mod gate;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod presets;
pub mod process;
pub mod report;
pub mod run;
pub mod scheduler;
pub mod secrets;
pub mod stages;
pub mod store;
pub mod trigger;
pub mod validation;

pub use definition::{PipelineDefinition, StageKind, StageTemplate};
pub use error::{PipelineError, StageError};
pub use orchestrator::Orchestrator;
pub use run::{PipelineRun, RunOptions, RunStatus};
