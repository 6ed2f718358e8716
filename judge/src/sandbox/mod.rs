//! Sandbox module - Low-level process isolation
//!
//! This module runs one command inside a fresh sandbox session:
//! - Fork with pre-built arguments, confine the child (namespaces, private
//!   /proc, seccomp, rlimits, unprivileged credentials) and exec
//! - Per-session cgroup v2 with CPU and memory limits and usage readback
//! - Non-blocking stdin/stdout/stderr plumbing and the wall deadline
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the runner's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod cgroup;
pub mod child;
pub mod config;
pub mod monitor;
pub mod pipes;
pub mod policy;

use nix::unistd::{fork, ForkResult};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::SandboxError;
use crate::model::ResourceLimits;
use crate::runner::CommandSpec;
use cgroup::{CgroupLimits, CgroupSession, CgroupUsage};
use child::{ChildPlan, ChildProcess, REPORT_LEN};
use monitor::{ChildExit, Monitor};

// Re-exports for convenience
pub use cgroup::ensure_available;
pub use config::SandboxConfig;
pub use policy::SandboxPolicy;

/// Raw outcome of one sandbox session, before any verdict
#[derive(Debug, Default)]
pub struct SandboxOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: ChildExit,
    /// `None` when cgroup accounting could not be read
    pub usage: Option<CgroupUsage>,
}

/// Launches sandbox sessions with a shared policy and configuration
pub struct Sandbox {
    policy: Arc<SandboxPolicy>,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(policy: Arc<SandboxPolicy>, config: SandboxConfig) -> Self {
        Self { policy, config }
    }

    /// Run `program` once with the given limits and stdin.
    ///
    /// Blocks the calling thread until the child is gone and the session
    /// cgroup is removed.
    pub fn run(
        &self,
        program: &Path,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
    ) -> Result<SandboxOutcome, SandboxError> {
        let wall_limit = Duration::try_from_secs_f64(limits.wall_time_s)
            .map_err(|e| SandboxError::InvalidLimits(format!("wall_time_s: {}", e)))?;
        let plan = ChildPlan::new(program, cmd, limits, &self.config)?;
        let (mut parent, child_ends) = pipes::session_pipes()?;

        // SAFETY: the child only runs async-signal-safe code until execve or _exit
        let pid = match unsafe { fork() }.map_err(SandboxError::Fork)? {
            ForkResult::Child => child::run(&plan, &child_ends, self.policy.program()),
            ForkResult::Parent { child } => child,
        };
        drop(child_ends);
        let mut child = ChildProcess::new(pid);
        debug!("Forked sandbox child {} for {:?}", pid, program);

        let session = CgroupSession::create(
            &self.config.cgroup_root,
            pid.as_raw(),
            self.config.cleanup_attempts,
            self.config.cleanup_backoff(),
        )?;
        session.apply_limits(&CgroupLimits::new(limits, self.config.memory_slack_kb))?;
        session.attach(pid.as_raw())?;

        // the child counts from here on
        let started = Instant::now();
        release_child(&mut parent.go, pid.as_raw())?;
        drop(parent.go);

        let deadline = deadline_after(started, wall_limit);
        let mut monitor = Monitor::new(
            parent.stdin,
            parent.stdout,
            parent.stderr,
            stdin,
            self.config.output_limit_bytes,
        );
        let exit = monitor.wait_child(&mut child, deadline)?;
        debug!(
            "Child {} finished after {:?}: {:?}",
            pid,
            started.elapsed(),
            exit
        );

        session.kill_all();
        monitor.drain(self.config.drain_grace());
        let (stdout, stderr) = monitor.into_output();

        read_failure_report(&mut parent.report, pid.as_raw());

        let usage = match session.read_usage() {
            Ok(usage) => Some(usage),
            Err(e) => {
                error!("Failed to read accounting for child {}: {}", pid, e);
                None
            }
        };

        if let Err(e) = session.remove() {
            error!("Failed to clean up cgroup of child {}: {}", pid, e);
        }

        Ok(SandboxOutcome {
            stdout,
            stderr,
            exit,
            usage,
        })
    }
}

/// Send the go byte. A child that already died before the barrier is reaped
/// by the monitor like any other exit.
fn release_child(go: &mut impl Write, pid: i32) -> Result<(), SandboxError> {
    match go.write_all(&[1]) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("Sandbox child {} exited before the go signal", pid);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Wall deadline, saturating at a far future instant
fn deadline_after(started: Instant, wall_limit: Duration) -> Instant {
    started
        .checked_add(wall_limit)
        .unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64))
}

/// Log the child's confinement failure, if it sent one
fn read_failure_report(report: &mut std::fs::File, pid: i32) {
    let mut buf = [0u8; REPORT_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match report.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if filled == 0 {
        return;
    }
    match child::parse_report(&buf[..filled]) {
        Some((stage, errno)) => warn!(
            "Sandbox child {} failed during {}: {}",
            pid,
            stage,
            errno.desc()
        ),
        None => warn!("Sandbox child {} sent a malformed failure report", pid),
    }
}
