//! Container execution: engine client, invocation value object, log
//! fan-out, progress extraction, and the stage runner.

mod client;
mod invocation;
mod logs;
mod progress;
mod runner;

pub use client::DockerClient;
pub use invocation::{ContainerInvocation, Mount};
pub use logs::{strip_ansi, LogLine, LogSink, LOG_TAP_CAPACITY};
pub use progress::{extract_progress, ProgressTracker};
pub use runner::{ContainerRunner, DockerRunner, RunOutcome, StopSignal};
