//! Scheduler Layer
//!
//! - [`JobTracker`]: when a metric last ran and when it is due again
//! - [`Orchestrator`]: the tick loop tying catalog, connections and sinks together

mod job;
mod orchestrator;

pub use job::{JobTracker, interval_duration};
pub use orchestrator::{
    MetricError, Orchestrator, OrchestratorOptions, TickReport, VALUE_FIELD, build_point,
};
