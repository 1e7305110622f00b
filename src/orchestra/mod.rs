mod metrics;
mod orchestrator;
mod pipeline;

pub use metrics::{MetricsLog, StepMetrics};
pub use orchestrator::{Orchestrator, StepReport};
pub use pipeline::PipelineHandle;
