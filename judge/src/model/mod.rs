//! Data model shared by the sandbox, the judger and the manager

pub mod problem;
pub mod result;
pub mod verdict;

pub use problem::{ResourceLimits, Submission, TestCase, MAX_LIMIT_KB, MAX_LIMIT_SECONDS};
pub use result::{ExecutionResult, JudgeResult, TestResult};
pub use verdict::{aggregate, SubmissionStatus, TestStatus};
