use serde::Serialize;
use std::fmt;
use tracing::warn;

use super::verdict::{aggregate, SubmissionStatus, TestStatus};

/// Outcome of one test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    /// CPU time from cgroup accounting, in microseconds
    pub duration_us: u64,
    /// Peak memory in KB
    pub memory_kb: u64,
    pub exit_code: i32,
    pub signal: i32,
    pub status: TestStatus,
}

impl TestResult {
    pub fn with_status(status: TestStatus) -> Self {
        Self {
            duration_us: 0,
            memory_kb: 0,
            exit_code: 0,
            signal: 0,
            status,
        }
    }
}

impl Default for TestResult {
    fn default() -> Self {
        Self::with_status(TestStatus::Unknown)
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (time={}us, memory={}KB, exit_code={}, signal={})",
            self.status, self.duration_us, self.memory_kb, self.exit_code, self.signal
        )
    }
}

/// Raw result of one sandboxed run
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub result: TestResult,
}

/// Result of judging a whole submission
#[derive(Debug, Clone, Serialize)]
pub struct JudgeResult {
    problem_title: String,
    sub_id: i64,
    language_id: String,
    compile_msg: String,
    results: Vec<TestResult>,
    status: SubmissionStatus,
}

impl JudgeResult {
    pub fn new(
        problem_title: impl Into<String>,
        sub_id: i64,
        language_id: impl Into<String>,
    ) -> Self {
        Self {
            problem_title: problem_title.into(),
            sub_id,
            language_id: language_id.into(),
            compile_msg: String::new(),
            results: Vec::new(),
            status: SubmissionStatus::Pending,
        }
    }

    pub fn set_compile_msg(&mut self, msg: impl Into<String>) {
        self.compile_msg = msg.into();
    }

    /// Append the result of the next test. Rejected once the status is final.
    pub fn record(&mut self, result: TestResult) -> bool {
        if self.status != SubmissionStatus::Pending {
            warn!(
                "Ignoring test result for finalized submission {}",
                self.sub_id
            );
            return false;
        }
        self.results.push(result);
        true
    }

    /// Compute the overall status. Only the first call has an effect.
    pub fn finalize(&mut self) -> SubmissionStatus {
        if self.status == SubmissionStatus::Pending {
            self.status = aggregate(self.results.iter().map(|r| &r.status));
        }
        self.status
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    pub fn problem_title(&self) -> &str {
        &self.problem_title
    }

    pub fn sub_id(&self) -> i64 {
        self.sub_id
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn compile_msg(&self) -> &str {
        &self.compile_msg
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Largest CPU time over all tests, in microseconds
    pub fn max_duration_us(&self) -> u64 {
        self.results.iter().map(|r| r.duration_us).max().unwrap_or(0)
    }

    /// Largest peak memory over all tests, in KB
    pub fn max_memory_kb(&self) -> u64 {
        self.results.iter().map(|r| r.memory_kb).max().unwrap_or(0)
    }
}

impl fmt::Display for JudgeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "submission {} [{}] {}: {}",
            self.sub_id, self.language_id, self.problem_title, self.status
        )?;
        if !self.compile_msg.is_empty() {
            writeln!(f, "compile message:\n{}", self.compile_msg)?;
        }
        for (idx, result) in self.results.iter().enumerate() {
            writeln!(f, "  #{}: {}", idx + 1, result)?;
        }
        Ok(())
    }
}
