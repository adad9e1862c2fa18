//! Runs a repository's run/test/build/lint workflow inside a resource-limited,
//! capability-stripped container built from a per-language runner image.

pub mod classify;
pub mod config;
pub mod error;
pub mod logs;
pub mod models;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod provision;
pub mod runners;
pub mod sync;

pub use config::RunnerConfig;
pub use error::{RunnerError, RunnerResult};
pub use logs::{LogLine, LogSink, LogSource, LogStream};
pub use models::{ProjectType, RunResult, Service, Workflow, WorkflowRequest};
pub use orchestrator::WorkflowOrchestrator;
