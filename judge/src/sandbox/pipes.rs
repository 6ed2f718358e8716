//! Pipes between the judge and a sandbox child
//!
//! All pipes are created with CLOEXEC. The child's ends are moved onto
//! fds 0/1/2 (which clears the flag); the sync pipes keep it, so the report
//! pipe reaches EOF as soon as `execve` succeeds.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::SandboxError;

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

fn cloexec_pipe() -> Result<Pipe, SandboxError> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(SandboxError::Pipe)?;
    Ok(Pipe { read, write })
}

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking(fd: &impl AsRawFd) -> Result<(), SandboxError> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(SandboxError::Pipe)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(SandboxError::Pipe)?;
    Ok(())
}

/// Ends kept by the judge
pub struct ParentEnds {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
    /// Writing one byte here lets the child continue past its setup barrier
    pub go: File,
    /// Receives a `(stage, errno)` report if the child fails to confine itself
    pub report: File,
}

/// Ends handed to the child. Only raw fds are used after fork.
pub struct ChildEnds {
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
    go: OwnedFd,
    report: OwnedFd,
}

impl ChildEnds {
    pub fn stdin(&self) -> RawFd {
        self.stdin.as_raw_fd()
    }

    pub fn stdout(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    pub fn stderr(&self) -> RawFd {
        self.stderr.as_raw_fd()
    }

    pub fn go(&self) -> RawFd {
        self.go.as_raw_fd()
    }

    pub fn report(&self) -> RawFd {
        self.report.as_raw_fd()
    }
}

/// Create the five pipes of a session and split them by owner
pub fn session_pipes() -> Result<(ParentEnds, ChildEnds), SandboxError> {
    let stdin = cloexec_pipe()?;
    let stdout = cloexec_pipe()?;
    let stderr = cloexec_pipe()?;
    let go = cloexec_pipe()?;
    let report = cloexec_pipe()?;

    for fd in [&stdin.write, &stdout.read, &stderr.read, &report.read] {
        set_nonblocking(fd)?;
    }

    let parent = ParentEnds {
        stdin: File::from(stdin.write),
        stdout: File::from(stdout.read),
        stderr: File::from(stderr.read),
        go: File::from(go.write),
        report: File::from(report.read),
    };
    let child = ChildEnds {
        stdin: stdin.read,
        stdout: stdout.write,
        stderr: stderr.write,
        go: go.read,
        report: report.write,
    };
    Ok((parent, child))
}
