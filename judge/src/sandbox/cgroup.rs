//! Cgroup v2 session management
//!
//! Every sandbox session gets its own cgroup named after the judge pid and the
//! child pid. The `CgroupSession` guard removes the directory when dropped.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::SandboxError;
use crate::model::ResourceLimits;

/// CPU accounting period written to `cpu.max`, in microseconds
pub const CPU_PERIOD_US: u64 = 1_000_000;

/// Smallest quota the kernel accepts in `cpu.max`
const MIN_CPU_QUOTA_US: u64 = 1_000;

const REQUIRED_CONTROLLERS: [&str; 2] = ["cpu", "memory"];

/// Values written to the session's control files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLimits {
    pub cpu_quota_us: u64,
    pub memory_max_bytes: u64,
}

impl CgroupLimits {
    pub fn new(limits: &ResourceLimits, memory_slack_kb: u64) -> Self {
        Self {
            cpu_quota_us: limits.cpu_budget_us().max(MIN_CPU_QUOTA_US),
            memory_max_bytes: limits
                .memory_limit_kb
                .saturating_add(memory_slack_kb)
                .saturating_mul(1024),
        }
    }

    /// Content of `cpu.max`: "<quota> <period>"
    pub fn cpu_max(&self) -> String {
        format!("{} {}", self.cpu_quota_us, CPU_PERIOD_US)
    }

    /// Content of `memory.max`
    pub fn memory_max(&self) -> String {
        self.memory_max_bytes.to_string()
    }
}

/// Usage read back after the child is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupUsage {
    pub memory_peak_bytes: u64,
    pub cpu_usage_us: u64,
}

impl CgroupUsage {
    pub fn memory_peak_kb(&self) -> u64 {
        self.memory_peak_bytes / 1024
    }
}

/// Session cgroup name: unique per judge process and child process
pub fn session_name(judge_pid: u32, child_pid: i32) -> String {
    format!("judge-{}-{}", judge_pid, child_pid)
}

/// Check that cgroup v2 with the cpu and memory controllers is mounted at
/// `root`, and enable both controllers for the root's children.
pub fn ensure_available(root: &Path) -> Result<(), SandboxError> {
    let controllers_path = root.join("cgroup.controllers");
    let controllers = fs::read_to_string(&controllers_path).map_err(|e| {
        SandboxError::CgroupUnavailable {
            path: root.to_path_buf(),
            reason: format!("cannot read cgroup.controllers: {}", e),
        }
    })?;

    let available: Vec<&str> = controllers.split_whitespace().collect();
    for controller in REQUIRED_CONTROLLERS {
        if !available.contains(&controller) {
            return Err(SandboxError::CgroupUnavailable {
                path: root.to_path_buf(),
                reason: format!("controller \"{}\" is not available", controller),
            });
        }
    }

    let subtree_path = root.join("cgroup.subtree_control");
    let enabled = fs::read_to_string(&subtree_path).unwrap_or_default();
    for controller in REQUIRED_CONTROLLERS {
        if enabled.split_whitespace().any(|c| c == controller) {
            continue;
        }
        fs::write(&subtree_path, format!("+{}", controller))
            .map_err(|e| SandboxError::cgroup(&subtree_path, e))?;
        info!("Enabled {} controller in {:?}", controller, subtree_path);
    }

    Ok(())
}

/// Parse `memory.peak` (a single byte count)
pub fn parse_memory_peak(content: &str) -> Option<u64> {
    content.trim().parse().ok()
}

/// Extract `usage_usec` from `cpu.stat`
pub fn parse_cpu_usage_usec(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}

/// Remove a cgroup directory, children first.
///
/// A missing directory counts as removed. EBUSY and ENOTEMPTY are retried up
/// to `attempts` times since the kernel frees a cgroup only after its last
/// task is gone.
pub fn remove_cgroup(path: &Path, attempts: u32, backoff: Duration) -> Result<(), SandboxError> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SandboxError::cgroup(path, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| SandboxError::cgroup(path, e))?;
        let is_dir = entry
            .file_type()
            .map(|t| t.is_dir())
            .map_err(|e| SandboxError::cgroup(entry.path(), e))?;
        if is_dir {
            remove_cgroup(&entry.path(), attempts, backoff)?;
        }
    }

    for attempt in 1..=attempts {
        match fs::remove_dir(path) {
            Ok(()) => {
                debug!("Removed cgroup {:?}", path);
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if is_transient(&e) => {
                debug!(
                    "Cgroup {:?} busy (attempt {}/{}): {}",
                    path, attempt, attempts, e
                );
                thread::sleep(backoff);
            }
            Err(e) => return Err(SandboxError::cgroup(path, e)),
        }
    }

    Err(SandboxError::CgroupBusy {
        path: path.to_path_buf(),
        attempts,
    })
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBUSY) | Some(libc::ENOTEMPTY) | Some(libc::EAGAIN)
    )
}

/// A cgroup owned by one sandbox session
pub struct CgroupSession {
    path: PathBuf,
    attempts: u32,
    backoff: Duration,
    removed: bool,
}

impl CgroupSession {
    /// Create the session directory `<root>/judge-<judge pid>-<child pid>`
    pub fn create(
        root: &Path,
        child_pid: i32,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self, SandboxError> {
        let path = root.join(session_name(std::process::id(), child_pid));
        fs::create_dir(&path).map_err(|e| SandboxError::cgroup(&path, e))?;
        debug!("Created cgroup {:?}", path);

        Ok(Self {
            path,
            attempts,
            backoff,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the CPU quota, memory ceiling, swap and OOM-group controls
    pub fn apply_limits(&self, limits: &CgroupLimits) -> Result<(), SandboxError> {
        self.write("cpu.max", &limits.cpu_max())?;
        self.write("memory.max", &limits.memory_max())?;
        self.write("memory.swap.max", "0")?;
        self.write("memory.oom.group", "1")?;
        Ok(())
    }

    /// Move `pid` into this cgroup
    pub fn attach(&self, pid: i32) -> Result<(), SandboxError> {
        self.write("cgroup.procs", &format!("{}\n", pid))
    }

    /// Kill every process left in the cgroup. Needs kernel 5.14+, so a
    /// failure is only logged.
    pub fn kill_all(&self) {
        let kill_path = self.path.join("cgroup.kill");
        if let Err(e) = fs::write(&kill_path, "1") {
            debug!("Could not write {:?}: {}", kill_path, e);
        }
    }

    /// Read peak memory and cumulative CPU time
    pub fn read_usage(&self) -> Result<CgroupUsage, SandboxError> {
        let peak = self.read("memory.peak")?;
        let memory_peak_bytes = parse_memory_peak(&peak).ok_or_else(|| {
            SandboxError::cgroup(
                self.path.join("memory.peak"),
                std::io::Error::new(ErrorKind::InvalidData, format!("bad value {:?}", peak)),
            )
        })?;

        let stat = self.read("cpu.stat")?;
        let cpu_usage_us = parse_cpu_usage_usec(&stat).ok_or_else(|| {
            SandboxError::cgroup(
                self.path.join("cpu.stat"),
                std::io::Error::new(ErrorKind::InvalidData, "usage_usec line missing"),
            )
        })?;

        Ok(CgroupUsage {
            memory_peak_bytes,
            cpu_usage_us,
        })
    }

    /// Remove the cgroup now and report the outcome
    pub fn remove(mut self) -> Result<(), SandboxError> {
        self.removed = true;
        remove_cgroup(&self.path, self.attempts, self.backoff)
    }

    fn write(&self, file: &str, value: &str) -> Result<(), SandboxError> {
        let path = self.path.join(file);
        fs::write(&path, value).map_err(|e| SandboxError::cgroup(&path, e))
    }

    fn read(&self, file: &str) -> Result<String, SandboxError> {
        let path = self.path.join(file);
        fs::read_to_string(&path).map_err(|e| SandboxError::cgroup(&path, e))
    }
}

impl Drop for CgroupSession {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.kill_all();
        if let Err(e) = remove_cgroup(&self.path, self.attempts, self.backoff) {
            error!("Failed to remove cgroup {:?}: {}", self.path, e);
        } else {
            warn!("Cgroup {:?} removed on early exit", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(time: f64, extra: f64, memory_kb: u64) -> ResourceLimits {
        ResourceLimits {
            time_limit_s: time,
            extra_time_s: extra,
            memory_limit_kb: memory_kb,
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_max_format() {
        let cg = CgroupLimits::new(&limits(2.0, 1.0, 1024), 0);
        assert_eq!(cg.cpu_max(), "3000000 1000000");
    }

    #[test]
    fn test_cpu_quota_clamped_to_kernel_minimum() {
        let cg = CgroupLimits::new(&limits(0.0, 0.0, 1024), 0);
        assert_eq!(cg.cpu_max(), "1000 1000000");
    }

    #[test]
    fn test_memory_max_includes_slack() {
        let cg = CgroupLimits::new(&limits(1.0, 0.0, 1024), 8192);
        assert_eq!(cg.memory_max(), ((1024 + 8192) * 1024).to_string());

        let cg = CgroupLimits::new(&limits(1.0, 0.0, u64::MAX / 1024), 8192);
        assert_eq!(cg.memory_max_bytes, u64::MAX);
    }

    #[test]
    fn test_session_name() {
        assert_eq!(session_name(100, 4242), "judge-100-4242");
    }

    #[test]
    fn test_parse_cpu_stat() {
        let stat = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_cpu_usage_usec(stat), Some(123456));
        assert_eq!(parse_cpu_usage_usec("user_usec 1\n"), None);
    }

    #[test]
    fn test_parse_memory_peak() {
        assert_eq!(parse_memory_peak("10485760\n"), Some(10485760));
        assert_eq!(parse_memory_peak("max\n"), None);
    }

    #[test]
    fn test_remove_missing_cgroup_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("judge-1-2");
        assert!(remove_cgroup(&path, 3, Duration::ZERO).is_ok());
        assert!(remove_cgroup(&path, 3, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_remove_nested_cgroups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("judge-1-2");
        fs::create_dir_all(path.join("inner").join("leaf")).unwrap();
        fs::create_dir_all(path.join("other")).unwrap();

        remove_cgroup(&path, 3, Duration::ZERO).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_gives_up_after_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("judge-1-2");
        fs::create_dir(&path).unwrap();
        // a regular file keeps the directory non-empty on a normal filesystem
        fs::write(path.join("memory.max"), "1").unwrap();

        let err = remove_cgroup(&path, 2, Duration::ZERO).unwrap_err();
        assert!(matches!(err, SandboxError::CgroupBusy { attempts: 2, .. }));
    }

    #[test]
    fn test_session_writes_control_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = CgroupSession::create(dir.path(), 4242, 1, Duration::ZERO).unwrap();
        let path = session.path().to_path_buf();
        assert!(path.ends_with(session_name(std::process::id(), 4242)));

        session
            .apply_limits(&CgroupLimits::new(&limits(1.0, 0.5, 2048), 1024))
            .unwrap();
        session.attach(4242).unwrap();

        let read = |name: &str| fs::read_to_string(path.join(name)).unwrap();
        assert_eq!(read("cpu.max"), "1500000 1000000");
        assert_eq!(read("memory.max"), (3072 * 1024).to_string());
        assert_eq!(read("memory.swap.max"), "0");
        assert_eq!(read("memory.oom.group"), "1");
        assert_eq!(read("cgroup.procs"), "4242\n");

        fs::write(path.join("memory.peak"), "2097152\n").unwrap();
        fs::write(path.join("cpu.stat"), "usage_usec 5000\nuser_usec 4000\n").unwrap();
        let usage = session.read_usage().unwrap();
        assert_eq!(usage.memory_peak_kb(), 2048);
        assert_eq!(usage.cpu_usage_us, 5000);

        for entry in fs::read_dir(&path).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        session.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_accounting_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = CgroupSession::create(dir.path(), 1, 1, Duration::ZERO).unwrap();
        assert!(session.read_usage().is_err());
        session.remove().unwrap();
    }

    #[test]
    fn test_ensure_available_requires_controllers() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_available(dir.path()).is_err());

        fs::write(dir.path().join("cgroup.controllers"), "cpuset io pids\n").unwrap();
        assert!(ensure_available(dir.path()).is_err());

        fs::write(dir.path().join("cgroup.controllers"), "cpu io memory pids\n").unwrap();
        fs::write(dir.path().join("cgroup.subtree_control"), "cpu memory\n").unwrap();
        assert!(ensure_available(dir.path()).is_ok());
    }
}
