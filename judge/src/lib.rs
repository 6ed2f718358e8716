//! Sandboxed judge engine
//!
//! Compiles submissions, runs them against test cases inside Linux
//! namespaces with a seccomp filter and cgroup v2 limits, and aggregates a
//! verdict. `JudgeManager` schedules submissions on a fixed worker pool.

pub mod compiler;
pub mod config;
pub mod error;
pub mod judger;
pub mod languages;
pub mod manager;
pub mod model;
pub mod runner;
pub mod sandbox;

pub use config::JudgeConfig;
pub use error::{JudgeError, SandboxError};
pub use judger::{JudgeContext, JudgeTask, Judger};
pub use manager::{JudgeCallback, JudgeManager};
