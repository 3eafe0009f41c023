//! Pipeline orchestration: stage planning, sequential execution, resume.

mod meta;
mod orchestrator;

pub use meta::{RunMeta, RunStatus, StageMeta, StageState};
pub use orchestrator::Pipeline;
