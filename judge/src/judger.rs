//! Judger module for processing one submission
//!
//! A `Judger` owns a private workspace, compiles the source once and runs
//! every test case through a `Runner`, comparing stdout with the expected
//! answer.

use nix::unistd::{chown, Gid, Uid};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, error, info};

use crate::compiler::Compiler;
use crate::error::JudgeError;
use crate::languages::{LanguageConfig, LanguageRegistry};
use crate::model::{JudgeResult, ResourceLimits, Submission, TestCase, TestResult, TestStatus};
use crate::runner::{CommandSpec, Runner};

/// Name of the compiled artifact inside the workspace
pub const BINARY_NAME: &str = "main";

/// Submission plus everything needed to judge it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeTask {
    pub submission: Submission,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub ignore_time_limit_bonus: bool,
    #[serde(default)]
    pub ignore_memory_limit_bonus: bool,
}

/// Shared collaborators of every judger
#[derive(Clone)]
pub struct JudgeContext {
    pub runner: Arc<dyn Runner>,
    pub languages: Arc<LanguageRegistry>,
    /// Directory under which per-submission workspaces are created
    pub work_root: PathBuf,
    pub compile_timeout: Duration,
    /// uid/gid the compiler runs as; the workspace is handed to this user
    /// for the duration of the compile
    pub compile_user: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgerState {
    Created,
    Compiling,
    Ready,
    CompileFailed,
    /// Running the test at this index (sequence order)
    Judging(usize),
    Done,
}

pub struct Judger {
    state: JudgerState,
    language: LanguageConfig,
    limits: ResourceLimits,
    test_cases: Vec<TestCase>,
    runner: Arc<dyn Runner>,
    workspace: TempDir,
    result: JudgeResult,
}

impl Judger {
    /// Prepare the workspace and compile. A compile failure is not an error:
    /// the judger ends up in `CompileFailed` and `run` reports CE.
    pub fn new(task: JudgeTask, ctx: &JudgeContext) -> Result<Self, JudgeError> {
        let JudgeTask {
            submission,
            limits,
            mut test_cases,
            ignore_time_limit_bonus,
            ignore_memory_limit_bonus,
        } = task;

        let language = ctx
            .languages
            .get(&submission.language_id)
            .cloned()
            .ok_or_else(|| JudgeError::UnsupportedLanguage(submission.language_id.clone()))?;
        limits.validate()?;

        let limits = adjust_limits(
            &language,
            &limits,
            ignore_time_limit_bonus,
            ignore_memory_limit_bonus,
        );
        limits.validate()?;
        test_cases.sort_by_key(|tc| tc.sequence);

        let workspace = create_workspace(&ctx.work_root).map_err(JudgeError::Workspace)?;
        let source_path = workspace.path().join(&language.source_file);
        write_readable(&source_path, &submission.source_code).map_err(JudgeError::Workspace)?;

        let result = JudgeResult::new(
            submission.problem_title.as_str(),
            submission.submission_id,
            submission.language_id.as_str(),
        );
        let mut judger = Self {
            state: JudgerState::Created,
            language,
            limits,
            test_cases,
            runner: Arc::clone(&ctx.runner),
            workspace,
            result,
        };

        judger
            .compile(
                &source_path,
                &submission.compile_options,
                ctx.compile_timeout,
                ctx.compile_user,
            )
            .map_err(JudgeError::Workspace)?;
        Ok(judger)
    }

    pub fn state(&self) -> JudgerState {
        self.state
    }

    /// Effective limits after the language adjustment
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    fn compile(
        &mut self,
        source: &Path,
        flags: &[String],
        timeout: Duration,
        user: Option<(u32, u32)>,
    ) -> std::io::Result<()> {
        let Some(command) = self.language.compile_command.clone() else {
            self.state = JudgerState::Ready;
            return Ok(());
        };

        self.state = JudgerState::Compiling;
        let output = self.workspace.path().join(BINARY_NAME);
        let mut compiler = Compiler::new(command, timeout);
        if let Some((uid, gid)) = user {
            chown(
                self.workspace.path(),
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
            )?;
            compiler = compiler.with_user(uid, gid);
        }
        let success = compiler.compile(source, &output, flags);
        if user.is_some() {
            chown(
                self.workspace.path(),
                Some(Uid::effective()),
                Some(Gid::effective()),
            )?;
        }
        self.result.set_compile_msg(compiler.compile_message());

        if success {
            debug!("Submission {} compiled", self.result.sub_id());
            self.state = JudgerState::Ready;
        } else {
            info!("Submission {} failed to compile", self.result.sub_id());
            self.state = JudgerState::CompileFailed;
        }
        Ok(())
    }

    /// Judge every test case and return the finalized result
    pub fn run(mut self) -> JudgeResult {
        if self.state == JudgerState::Ready {
            let test_cases = std::mem::take(&mut self.test_cases);
            for (idx, test_case) in test_cases.iter().enumerate() {
                self.state = JudgerState::Judging(idx);
                let result = self.judge_test(test_case);
                debug!(
                    "Submission {} test #{}: {}",
                    self.result.sub_id(),
                    test_case.sequence,
                    result
                );
                self.result.record(result);
            }
        }

        let status = self.result.finalize();
        self.state = JudgerState::Done;
        info!(
            "Submission {} judged: {} ({} tests)",
            self.result.sub_id(),
            status,
            self.result.results().len()
        );
        debug_assert!(status.is_terminal());
        self.result
    }

    fn judge_test(&self, test_case: &TestCase) -> TestResult {
        let cmd = CommandSpec {
            share_network: self.language.share_network,
            ..CommandSpec::from_vec(&self.language.run_command)
                .with_env(self.language.env.iter().cloned())
                .with_work_dir(self.workspace.path())
        };

        match self
            .runner
            .run(&cmd, &self.limits, test_case.stdin.as_bytes())
        {
            Ok(execution) => {
                let mut result = execution.result;
                if result.status == TestStatus::Unknown {
                    result.status = if compare_output(&execution.stdout, &test_case.expected_output)
                    {
                        TestStatus::Accepted
                    } else {
                        TestStatus::WrongAnswer
                    };
                }
                result
            }
            Err(e) => {
                error!(
                    "Sandbox failure on submission {} test #{}: {}",
                    self.result.sub_id(),
                    test_case.sequence,
                    e
                );
                TestResult::with_status(TestStatus::InternalError)
            }
        }
    }
}

/// Language bonus unless the task opts out
fn adjust_limits(
    language: &LanguageConfig,
    limits: &ResourceLimits,
    ignore_time_bonus: bool,
    ignore_memory_bonus: bool,
) -> ResourceLimits {
    let adjusted = language.resolve_limits(limits);
    ResourceLimits {
        time_limit_s: if ignore_time_bonus {
            limits.time_limit_s
        } else {
            adjusted.time_limit_s
        },
        wall_time_s: if ignore_time_bonus {
            limits.wall_time_s
        } else {
            adjusted.wall_time_s
        },
        memory_limit_kb: if ignore_memory_bonus {
            limits.memory_limit_kb
        } else {
            adjusted.memory_limit_kb
        },
        ..limits.clone()
    }
}

/// Byte comparison, ignoring one trailing newline on each side
pub fn compare_output(actual: &[u8], expected: &str) -> bool {
    strip_newline(actual) == strip_newline(expected.as_bytes())
}

fn strip_newline(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\n").unwrap_or(bytes)
}

/// Private workspace the unprivileged sandbox user can read and traverse
fn create_workspace(root: &Path) -> std::io::Result<TempDir> {
    fs::create_dir_all(root)?;
    let workspace = tempfile::Builder::new()
        .prefix("submission-")
        .tempdir_in(root)?;
    fs::set_permissions(workspace.path(), fs::Permissions::from_mode(0o755))?;
    Ok(workspace)
}

fn write_readable(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}
