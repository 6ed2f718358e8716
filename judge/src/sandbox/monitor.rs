//! Parent side of a sandbox session: feeds stdin, collects output, enforces
//! the wall deadline and reaps the child.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::child::ChildProcess;
use crate::error::SandboxError;

const MIN_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 64 * 1024;

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChildExit {
    pub exit_code: i32,
    pub signal: i32,
    /// Killed by the judge at the wall deadline
    pub timed_out: bool,
}

/// Poll wait for the next iteration, clamped to [10ms, 100ms]
pub fn poll_wait(remaining: Duration) -> Duration {
    remaining.clamp(MIN_POLL, MAX_POLL)
}

/// Reads one output stream into memory, keeping at most `cap` bytes
struct Collector {
    file: Option<File>,
    buf: Vec<u8>,
    cap: usize,
    discarded: usize,
}

impl Collector {
    fn new(file: File, cap: usize) -> Self {
        Self {
            file: Some(file),
            buf: Vec::new(),
            cap,
            discarded: 0,
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Read everything currently available. EOF and errors close the stream.
    fn read_available(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => {
                    self.file = None;
                    return;
                }
                Ok(n) => {
                    let room = self.cap.saturating_sub(self.buf.len());
                    let keep = n.min(room);
                    self.buf.extend_from_slice(&chunk[..keep]);
                    self.discarded += n - keep;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Closing output stream after read error: {}", e);
                    self.file = None;
                    return;
                }
            }
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        if self.discarded > 0 {
            debug!("Discarded {} bytes of output over the cap", self.discarded);
        }
        self.buf
    }
}

/// Writes the test input to the child's stdin without blocking
struct Feeder<'a> {
    file: Option<File>,
    data: &'a [u8],
    offset: usize,
}

impl<'a> Feeder<'a> {
    fn new(file: File, data: &'a [u8]) -> Self {
        let mut feeder = Self {
            file: Some(file),
            data,
            offset: 0,
        };
        if data.is_empty() {
            feeder.file = None;
        }
        feeder
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Write as much as the pipe accepts. The pipe is closed once all input
    /// is written or the child closed its end; other errors are returned.
    fn write_available(&mut self) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        while self.offset < self.data.len() {
            match file.write(&self.data[self.offset..]) {
                Ok(n) => self.offset += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!(
                        "Child closed stdin after {}/{} bytes",
                        self.offset,
                        self.data.len()
                    );
                    self.file = None;
                    return Ok(());
                }
                Err(e) => {
                    self.file = None;
                    return Err(e);
                }
            }
        }
        self.file = None;
        Ok(())
    }
}

/// Drives one running child until it is reaped
pub struct Monitor<'a> {
    stdin: Feeder<'a>,
    stdout: Collector,
    stderr: Collector,
}

impl<'a> Monitor<'a> {
    pub fn new(stdin: File, stdout: File, stderr: File, input: &'a [u8], cap: usize) -> Self {
        Self {
            stdin: Feeder::new(stdin, input),
            stdout: Collector::new(stdout, cap),
            stderr: Collector::new(stderr, cap),
        }
    }

    /// Run until the child is reaped. The child is SIGKILLed at `deadline`.
    pub fn wait_child(
        &mut self,
        child: &mut ChildProcess,
        deadline: Instant,
    ) -> Result<ChildExit, SandboxError> {
        let mut timed_out = false;

        loop {
            let now = Instant::now();
            if !timed_out && now >= deadline {
                debug!("Wall deadline reached, killing child {}", child.pid());
                child.kill();
                timed_out = true;
            }

            let wait = poll_wait(deadline.saturating_duration_since(now));
            self.poll_streams(wait);

            self.stdout.read_available();
            self.stderr.read_available();
            if let Err(e) = self.stdin.write_available() {
                warn!("Failed to feed stdin of child {}: {}", child.pid(), e);
                child.kill();
            }

            match waitpid(child.pid(), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    child.mark_reaped();
                    return Ok(ChildExit {
                        exit_code: code,
                        signal: 0,
                        timed_out,
                    });
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    child.mark_reaped();
                    return Ok(ChildExit {
                        exit_code: 0,
                        signal: sig as i32,
                        timed_out,
                    });
                }
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    warn!("Lost track of child {}", child.pid());
                    child.mark_reaped();
                    return Ok(ChildExit {
                        exit_code: -1,
                        signal: if timed_out { Signal::SIGKILL as i32 } else { 0 },
                        timed_out,
                    });
                }
                Err(e) => return Err(SandboxError::Wait(e)),
            }
        }
    }

    /// Read whatever descendants left in the pipes, until EOF on both
    /// streams or until `grace` runs out.
    pub fn drain(&mut self, grace: Duration) {
        self.stdin.file = None;
        let give_up = Instant::now() + grace;

        while self.stdout.is_open() || self.stderr.is_open() {
            self.stdout.read_available();
            self.stderr.read_available();
            let now = Instant::now();
            if now >= give_up {
                warn!("Output streams still open after {:?} grace", grace);
                break;
            }
            self.poll_streams(MIN_POLL.min(give_up - now));
        }
    }

    pub fn into_output(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout.into_bytes(), self.stderr.into_bytes())
    }

    fn poll_streams(&self, wait: Duration) {
        let mut fds = Vec::with_capacity(3);
        for collector in [&self.stdout, &self.stderr] {
            if let Some(file) = collector.file.as_ref() {
                fds.push(PollFd::new(file.as_fd(), PollFlags::POLLIN));
            }
        }
        if let Some(file) = self.stdin.file.as_ref() {
            fds.push(PollFd::new(file.as_fd(), PollFlags::POLLOUT));
        }

        if fds.is_empty() {
            thread::sleep(wait);
            return;
        }

        let timeout = PollTimeout::from(wait.as_millis().min(u16::MAX as u128) as u16);
        match poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                debug!("poll failed: {}", e);
                thread::sleep(wait);
            }
        }
    }
}
