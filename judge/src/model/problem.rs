use serde::{Deserialize, Serialize};

use crate::error::JudgeError;

/// Largest accepted time limit, in seconds (one week)
pub const MAX_LIMIT_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

/// Largest accepted memory or stack limit, in KB (1 TiB)
pub const MAX_LIMIT_KB: u64 = 1 << 30;

/// Resource limits resolved per problem and language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in seconds
    pub time_limit_s: f64,
    /// Grace CPU time in seconds on top of `time_limit_s`
    #[serde(default)]
    pub extra_time_s: f64,
    /// Wall clock limit in seconds
    pub wall_time_s: f64,
    /// Memory limit in KB
    pub memory_limit_kb: u64,
    /// Stack limit in KB (0 = no stack rlimit)
    #[serde(default)]
    pub stack_limit_kb: u64,
}

impl ResourceLimits {
    /// Reject negative, non-finite and out-of-range limits
    pub fn validate(&self) -> Result<(), JudgeError> {
        let seconds = [
            ("time_limit_s", self.time_limit_s),
            ("extra_time_s", self.extra_time_s),
            ("wall_time_s", self.wall_time_s),
        ];
        for (name, value) in seconds {
            if !(0.0..=MAX_LIMIT_SECONDS).contains(&value) {
                return Err(JudgeError::InvalidLimits(format!(
                    "{} must be between 0 and {} seconds, got {}",
                    name, MAX_LIMIT_SECONDS, value
                )));
            }
        }

        let kilobytes = [
            ("memory_limit_kb", self.memory_limit_kb),
            ("stack_limit_kb", self.stack_limit_kb),
        ];
        for (name, value) in kilobytes {
            if value > MAX_LIMIT_KB {
                return Err(JudgeError::InvalidLimits(format!(
                    "{} must be at most {} KB, got {}",
                    name, MAX_LIMIT_KB, value
                )));
            }
        }
        Ok(())
    }

    /// CPU budget in microseconds (time limit plus grace time)
    pub fn cpu_budget_us(&self) -> u64 {
        ((self.time_limit_s + self.extra_time_s) * 1_000_000.0).round() as u64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit_s: 1.0,
            extra_time_s: 0.5,
            wall_time_s: 3.0,
            memory_limit_kb: 256 * 1024,
            stack_limit_kb: 64 * 1024,
        }
    }
}

/// One test case of a problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub stdin: String,
    pub expected_output: String,
    /// 1-based position in the problem's test order
    pub sequence: u32,
    #[serde(default)]
    pub is_hidden: bool,
}

/// Submission handed to the engine by the surrounding application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: i64,
    pub problem_title: String,
    pub language_id: String,
    pub source_code: String,
    #[serde(default)]
    pub compile_options: Vec<String>,
}
