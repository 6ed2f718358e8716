//! Child side of a sandbox session
//!
//! Everything the child needs is prepared by [`ChildPlan::new`] before fork.
//! After fork the child only makes raw syscalls: no allocation, no locks, no
//! logging. A failing step is reported to the judge through the report pipe
//! as one stage byte followed by the errno, and the child exits with
//! [`CHILD_SETUP_FAILED`].

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2, setgroups, setresgid, setresuid, Gid, Pid, Uid};
use seccompiler::BpfProgramRef;
use std::convert::Infallible;
use std::ffi::CString;
use std::fmt;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::warn;

use super::config::SandboxConfig;
use super::pipes::ChildEnds;
use crate::error::SandboxError;
use crate::model::ResourceLimits;
use crate::runner::CommandSpec;

/// Exit status of a child that could not confine itself
pub const CHILD_SETUP_FAILED: i32 = 125;

/// Size of a failure report: one stage byte plus a native-endian errno
pub const REPORT_LEN: usize = 1 + std::mem::size_of::<i32>();

/// Confinement step that failed in the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    DeathSignal = 1,
    Redirect,
    CloseFds,
    Rlimit,
    Signals,
    AwaitGo,
    Unshare,
    MountPrivate,
    MountProc,
    Chdir,
    Seccomp,
    Credentials,
    Exec,
}

impl Stage {
    const ALL: [Stage; 13] = [
        Stage::DeathSignal,
        Stage::Redirect,
        Stage::CloseFds,
        Stage::Rlimit,
        Stage::Signals,
        Stage::AwaitGo,
        Stage::Unshare,
        Stage::MountPrivate,
        Stage::MountProc,
        Stage::Chdir,
        Stage::Seccomp,
        Stage::Credentials,
        Stage::Exec,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| *s as u8 == value)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::DeathSignal => "parent death signal",
            Stage::Redirect => "stdio redirection",
            Stage::CloseFds => "closing inherited descriptors",
            Stage::Rlimit => "resource limits",
            Stage::Signals => "signal dispositions",
            Stage::AwaitGo => "waiting for cgroup attachment",
            Stage::Unshare => "namespace creation",
            Stage::MountPrivate => "private mount propagation",
            Stage::MountProc => "mounting /proc",
            Stage::Chdir => "entering work directory",
            Stage::Seccomp => "installing seccomp filter",
            Stage::Credentials => "dropping privileges",
            Stage::Exec => "execve",
        };
        f.write_str(name)
    }
}

/// Decode a failure report written by the child
pub fn parse_report(buf: &[u8]) -> Option<(Stage, Errno)> {
    if buf.len() < REPORT_LEN {
        return None;
    }
    let stage = Stage::from_u8(buf[0])?;
    let mut errno = [0u8; 4];
    errno.copy_from_slice(&buf[1..REPORT_LEN]);
    Some((stage, Errno::from_raw(i32::from_ne_bytes(errno))))
}

fn encode_report(stage: Stage, errno: Errno) -> [u8; REPORT_LEN] {
    let mut buf = [0u8; REPORT_LEN];
    buf[0] = stage as u8;
    buf[1..].copy_from_slice(&(errno as i32).to_ne_bytes());
    buf
}

fn to_cstring(value: impl Into<Vec<u8>>, what: &str) -> Result<CString, SandboxError> {
    CString::new(value)
        .map_err(|_| SandboxError::InvalidCommand(format!("{} contains a NUL byte", what)))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Pre-built arguments for the child
pub struct ChildPlan {
    path: CString,
    // pointer arrays borrow from these
    _args: Vec<CString>,
    _env: Vec<CString>,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
    work_dir: CString,
    stack_limit_bytes: Option<u64>,
    namespaces: CloneFlags,
    uid: Uid,
    gid: Gid,
}

impl ChildPlan {
    pub fn new(
        program: &Path,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let path = to_cstring(program.as_os_str().as_bytes(), "program path")?;

        let mut args = vec![to_cstring(cmd.program.as_str(), "program name")?];
        for arg in &cmd.args {
            args.push(to_cstring(arg.as_str(), "argument")?);
        }
        let env = cmd
            .env
            .iter()
            .map(|e| to_cstring(e.as_str(), "environment entry"))
            .collect::<Result<Vec<_>, _>>()?;

        let work_dir = match &cmd.work_dir {
            Some(dir) => to_cstring(dir.as_os_str().as_bytes(), "work directory")?,
            None => to_cstring("/", "work directory")?,
        };

        let mut namespaces = CloneFlags::CLONE_NEWNS;
        if !cmd.share_network {
            namespaces |= CloneFlags::CLONE_NEWNET;
        }

        let argv = null_terminated(&args);
        let envp = null_terminated(&env);

        Ok(Self {
            path,
            _args: args,
            _env: env,
            argv,
            envp,
            work_dir,
            stack_limit_bytes: match limits.stack_limit_kb {
                0 => None,
                kb => Some(kb.saturating_mul(1024)),
            },
            namespaces,
            uid: Uid::from_raw(config.uid),
            gid: Gid::from_raw(config.gid),
        })
    }
}

/// Entry point of the forked child. Never returns.
pub fn run(plan: &ChildPlan, ends: &ChildEnds, filter: BpfProgramRef<'_>) -> ! {
    let (stage, errno) = match confine_and_exec(plan, ends, filter) {
        Ok(never) => match never {},
        Err(failure) => failure,
    };

    let report = encode_report(stage, errno);
    // SAFETY: plain write + _exit on descriptors owned by this process
    unsafe {
        libc::write(
            ends.report(),
            report.as_ptr() as *const libc::c_void,
            report.len(),
        );
        libc::_exit(CHILD_SETUP_FAILED)
    }
}

fn step<T>(stage: Stage, result: nix::Result<T>) -> Result<T, (Stage, Errno)> {
    result.map_err(|e| (stage, e))
}

fn confine_and_exec(
    plan: &ChildPlan,
    ends: &ChildEnds,
    filter: BpfProgramRef<'_>,
) -> Result<Infallible, (Stage, Errno)> {
    step(Stage::DeathSignal, prctl::set_pdeathsig(Signal::SIGKILL))?;

    step(Stage::Redirect, dup2(ends.stdin(), libc::STDIN_FILENO))?;
    step(Stage::Redirect, dup2(ends.stdout(), libc::STDOUT_FILENO))?;
    step(Stage::Redirect, dup2(ends.stderr(), libc::STDERR_FILENO))?;

    step(Stage::CloseFds, close_fds_except(ends.go(), ends.report()))?;

    let stack = plan.stack_limit_bytes.unwrap_or(libc::RLIM_INFINITY);
    step(Stage::Rlimit, setrlimit(Resource::RLIMIT_STACK, stack, stack))?;
    step(Stage::Rlimit, setrlimit(Resource::RLIMIT_CORE, 0, 0))?;

    // SAFETY: no handler code runs, only the disposition changes
    step(Stage::Signals, unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
    })?;

    await_go(ends.go())?;

    step(Stage::Unshare, unshare(plan.namespaces))?;
    step(
        Stage::MountPrivate,
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        ),
    )?;
    step(
        Stage::MountProc,
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some("hidepid=2"),
        ),
    )?;

    step(Stage::Chdir, chdir(plan.work_dir.as_c_str()))?;

    if seccompiler::apply_filter(filter).is_err() {
        return Err((Stage::Seccomp, Errno::last()));
    }

    step(Stage::Credentials, setgroups(&[]))?;
    step(Stage::Credentials, setresgid(plan.gid, plan.gid, plan.gid))?;
    step(Stage::Credentials, setresuid(plan.uid, plan.uid, plan.uid))?;

    // SAFETY: argv and envp are null-terminated and point into CStrings owned by `plan`
    unsafe {
        libc::execve(plan.path.as_ptr(), plan.argv.as_ptr(), plan.envp.as_ptr());
    }
    Err((Stage::Exec, Errno::last()))
}

/// Block until the judge writes the go byte. EOF means the judge gave up.
fn await_go(fd: i32) -> Result<(), (Stage, Errno)> {
    let mut buf = [0u8; 1];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(1) => return Ok(()),
            Ok(_) => return Err((Stage::AwaitGo, Errno::EPIPE)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err((Stage::AwaitGo, e)),
        }
    }
}

/// Close every descriptor above stderr except the two sync pipe ends
fn close_fds_except(a: i32, b: i32) -> nix::Result<()> {
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    let ranges = [
        (3, low - 1),
        (low + 1, high - 1),
        (high + 1, i32::MAX),
    ];

    for (first, last) in ranges {
        if first > last {
            continue;
        }
        // SAFETY: close_range only closes descriptors
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                last as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if rc == 0 {
            continue;
        }
        if Errno::last() != Errno::ENOSYS {
            return Err(Errno::last());
        }

        // kernels before 5.9
        // SAFETY: sysconf has no preconditions
        let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let max = if max > 0 { max.min(i32::MAX as libc::c_long) as i32 } else { 1024 };
        for fd in first..=last.min(max) {
            // SAFETY: closing an fd we do not otherwise use; EBADF is expected
            unsafe {
                libc::close(fd);
            }
        }
    }
    Ok(())
}

/// Forked child owned by the judge. Killed and reaped on drop unless already
/// reaped by the monitor.
pub struct ChildProcess {
    pid: Pid,
    reaped: bool,
}

impl ChildProcess {
    pub fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    pub fn kill(&self) {
        if self.reaped {
            return;
        }
        if let Err(e) = kill(self.pid, Signal::SIGKILL) {
            if e != Errno::ESRCH {
                warn!("Failed to kill sandbox child {}: {}", self.pid, e);
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.kill();
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Ok(_) | Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_report_roundtrip_and_rejects_short_buffer() {
        let buf = encode_report(Stage::MountProc, Errno::EPERM);
        assert_eq!(parse_report(&buf), Some((Stage::MountProc, Errno::EPERM)));
        assert_eq!(parse_report(&buf[..2]), None);
        assert_eq!(parse_report(&[0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn test_stage_codes_are_distinct() {
        for (idx, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(*stage as u8, idx as u8 + 1);
            assert_eq!(Stage::from_u8(*stage as u8), Some(*stage));
        }
        assert_eq!(Stage::from_u8(200), None);
    }

    #[test]
    fn test_plan_builds_null_terminated_vectors() {
        let cmd = CommandSpec::new("python3")
            .with_args(["main.py"])
            .with_env(["PATH=/usr/bin"])
            .with_work_dir("/tmp");
        let plan = ChildPlan::new(
            &PathBuf::from("/usr/bin/python3"),
            &cmd,
            &ResourceLimits::default(),
            &SandboxConfig::default(),
        )
        .unwrap();

        assert_eq!(plan.argv.len(), 3);
        assert!(plan.argv[2].is_null());
        assert_eq!(plan.envp.len(), 2);
        assert!(plan.envp[1].is_null());
        assert!(plan.namespaces.contains(CloneFlags::CLONE_NEWNET));
        assert_eq!(plan.stack_limit_bytes, Some(64 * 1024 * 1024));
    }

    #[test]
    fn test_plan_shared_network_and_unlimited_stack() {
        let mut cmd = CommandSpec::new("/bin/true");
        cmd.share_network = true;
        let limits = ResourceLimits {
            stack_limit_kb: 0,
            ..Default::default()
        };
        let plan = ChildPlan::new(
            &PathBuf::from("/bin/true"),
            &cmd,
            &limits,
            &SandboxConfig::default(),
        )
        .unwrap();
        assert!(!plan.namespaces.contains(CloneFlags::CLONE_NEWNET));
        assert_eq!(plan.stack_limit_bytes, None);
    }

    #[test]
    fn test_plan_rejects_nul_bytes() {
        let cmd = CommandSpec::new("/bin/echo").with_args(["a\0b"]);
        let result = ChildPlan::new(
            &PathBuf::from("/bin/echo"),
            &cmd,
            &ResourceLimits::default(),
            &SandboxConfig::default(),
        );
        assert!(matches!(result, Err(SandboxError::InvalidCommand(_))));
    }
}
