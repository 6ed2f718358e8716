//! Sandboxed runner implementation
//!
//! Executes untrusted user code in a sandbox session and classifies the raw
//! outcome into a `TestResult`.

use std::sync::Arc;
use tracing::debug;

use super::{CommandSpec, Runner};
use crate::error::SandboxError;
use crate::model::{ExecutionResult, ResourceLimits, TestResult, TestStatus};
use crate::sandbox::cgroup::CgroupUsage;
use crate::sandbox::monitor::ChildExit;
use crate::sandbox::{Sandbox, SandboxConfig, SandboxOutcome, SandboxPolicy};

/// Runner that executes code in a sandbox session
pub struct SandboxedRunner {
    sandbox: Sandbox,
}

impl SandboxedRunner {
    pub fn new(policy: Arc<SandboxPolicy>, config: SandboxConfig) -> Self {
        Self {
            sandbox: Sandbox::new(policy, config),
        }
    }

    /// Run a command in the sandbox
    pub fn execute(
        &self,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
    ) -> Result<ExecutionResult, SandboxError> {
        let program = cmd.resolve()?;
        let SandboxOutcome {
            stdout,
            stderr,
            exit,
            usage,
        } = self.sandbox.run(&program, cmd, limits, stdin)?;

        let result = classify(&exit, usage.as_ref(), limits);
        debug!("{:?} -> {}", program, result);

        Ok(ExecutionResult {
            stdout,
            stderr,
            result,
        })
    }
}

impl Runner for SandboxedRunner {
    fn run(
        &self,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
    ) -> Result<ExecutionResult, SandboxError> {
        self.execute(cmd, limits, stdin)
    }
}

/// Turn a raw outcome into a test result.
///
/// Priority: missing accounting, time, memory, crash. A clean exit stays
/// `Unknown` until the output is compared.
pub fn classify(
    exit: &ChildExit,
    usage: Option<&CgroupUsage>,
    limits: &ResourceLimits,
) -> TestResult {
    let mut result = TestResult {
        exit_code: exit.exit_code,
        signal: exit.signal,
        ..Default::default()
    };

    let Some(usage) = usage else {
        result.status = TestStatus::InternalError;
        return result;
    };
    result.duration_us = usage.cpu_usage_us;
    result.memory_kb = usage.memory_peak_kb();

    result.status = if exit.timed_out || usage.cpu_usage_us > limits.cpu_budget_us() {
        TestStatus::TimeLimitExceeded
    } else if result.memory_kb >= limits.memory_limit_kb {
        TestStatus::MemoryLimitExceeded
    } else if exit.signal != 0 || exit.exit_code != 0 {
        TestStatus::RuntimeError
    } else {
        TestStatus::Unknown
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            time_limit_s: 1.0,
            extra_time_s: 0.5,
            wall_time_s: 3.0,
            memory_limit_kb: 1024,
            stack_limit_kb: 0,
        }
    }

    fn usage(cpu_us: u64, memory_kb: u64) -> CgroupUsage {
        CgroupUsage {
            memory_peak_bytes: memory_kb * 1024,
            cpu_usage_us: cpu_us,
        }
    }

    fn exited(code: i32) -> ChildExit {
        ChildExit {
            exit_code: code,
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_exit_is_unknown() {
        let result = classify(&exited(0), Some(&usage(1000, 512)), &limits());
        assert_eq!(result.status, TestStatus::Unknown);
        assert_eq!(result.duration_us, 1000);
        assert_eq!(result.memory_kb, 512);
    }

    #[test]
    fn test_missing_accounting_is_internal_error() {
        let exit = ChildExit {
            timed_out: true,
            signal: 9,
            ..Default::default()
        };
        let result = classify(&exit, None, &limits());
        assert_eq!(result.status, TestStatus::InternalError);
        assert_eq!(result.signal, 9);
    }

    #[test]
    fn test_timeout_beats_memory_and_signal() {
        let exit = ChildExit {
            timed_out: true,
            signal: 9,
            ..Default::default()
        };
        let result = classify(&exit, Some(&usage(10, 4096)), &limits());
        assert_eq!(result.status, TestStatus::TimeLimitExceeded);
    }

    #[test]
    fn test_cpu_over_budget_is_time_limit() {
        let result = classify(&exited(0), Some(&usage(1_500_001, 10)), &limits());
        assert_eq!(result.status, TestStatus::TimeLimitExceeded);

        let result = classify(&exited(0), Some(&usage(1_500_000, 10)), &limits());
        assert_eq!(result.status, TestStatus::Unknown);
    }

    #[test]
    fn test_memory_at_limit_regardless_of_exit() {
        let result = classify(&exited(0), Some(&usage(10, 1024)), &limits());
        assert_eq!(result.status, TestStatus::MemoryLimitExceeded);

        let killed = ChildExit {
            signal: 9,
            ..Default::default()
        };
        let result = classify(&killed, Some(&usage(10, 2048)), &limits());
        assert_eq!(result.status, TestStatus::MemoryLimitExceeded);
    }

    #[test]
    fn test_crash_is_runtime_error() {
        let result = classify(&exited(1), Some(&usage(10, 10)), &limits());
        assert_eq!(result.status, TestStatus::RuntimeError);

        let segv = ChildExit {
            signal: 11,
            ..Default::default()
        };
        let result = classify(&segv, Some(&usage(10, 10)), &limits());
        assert_eq!(result.status, TestStatus::RuntimeError);
    }
}
