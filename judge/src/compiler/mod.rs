//! Compiler module - Source code compilation
//!
//! Runs the language toolchain directly (never through a shell) with stdout
//! and stderr sharing one pipe, so diagnostics keep their original order.
//! The toolchain runs as the unprivileged sandbox user when one is set, and
//! user-supplied flags that load files from outside the workspace are
//! refused before anything is spawned.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe, Pid};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::runner::resolve_program;

const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Flag prefixes that make the toolchain read or run arbitrary files
const DENIED_FLAG_PREFIXES: &[&str] = &[
    "@",
    "-B",
    "-fplugin",
    "-specs",
    "--specs",
    "-wrapper",
    "--sysroot",
    "-isysroot",
    "-include",
    "-imacros",
    "-o",
];

/// Returns the first flag that may not be passed to the toolchain. Flags
/// must start with '-' so they cannot name extra input files.
pub fn find_denied_flag(flags: &[String]) -> Option<&str> {
    flags
        .iter()
        .map(String::as_str)
        .find(|flag| {
            !flag.starts_with('-')
                || DENIED_FLAG_PREFIXES
                    .iter()
                    .any(|prefix| flag.starts_with(prefix))
        })
}

/// Compiles one source file with a fixed toolchain command
#[derive(Debug)]
pub struct Compiler {
    /// Compiler followed by its default flags
    command: Vec<String>,
    timeout: Duration,
    /// uid and gid the toolchain runs as
    user: Option<(u32, u32)>,
    message: String,
}

impl Compiler {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            user: None,
            message: String::new(),
        }
    }

    /// Run the toolchain as `uid`/`gid` with no supplementary groups
    pub fn with_user(mut self, uid: u32, gid: u32) -> Self {
        self.user = Some((uid, gid));
        self
    }

    /// Diagnostics of the last `compile` call
    pub fn compile_message(&self) -> &str {
        &self.message
    }

    /// Compile `source` into `output`. Extra `flags` go after the default
    /// flags. Returns true iff the compiler exited with status 0.
    pub fn compile(&mut self, source: &Path, output: &Path, flags: &[String]) -> bool {
        self.message.clear();

        if let Some(flag) = find_denied_flag(flags) {
            self.message = format!("Compile option not allowed: {}", flag);
            info!("{}", self.message);
            return false;
        }

        let Some((program, default_flags)) = self.command.split_first() else {
            self.message = "No compiler configured".to_string();
            return false;
        };
        let Some(program_path) = resolve_program(program) else {
            self.message = format!("Compiler not found: {}", program);
            warn!("{}", self.message);
            return false;
        };

        let mut args: Vec<String> = default_flags.to_vec();
        args.extend(flags.iter().cloned());
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args.push(source.display().to_string());
        debug!("Compiling with {:?} {:?}", program_path, args);

        match self.run(&program_path, &args, source.parent()) {
            Ok(success) => success,
            Err(e) => {
                self.message = format!("Failed to run compiler: {}", e);
                warn!("{}", self.message);
                false
            }
        }
    }

    fn run(&mut self, program: &Path, args: &[String], dir: Option<&Path>) -> std::io::Result<bool> {
        let (read, write) = pipe()?;
        let started = Instant::now();

        let mut child = {
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(write.try_clone()?))
                .stderr(Stdio::from(write))
                .process_group(0);
            if let Some(dir) = dir {
                command.current_dir(dir);
            }
            // std clears supplementary groups when dropping from root
            if let Some((uid, gid)) = self.user {
                command.uid(uid).gid(gid);
            }
            // the command (and its copies of the write end) is dropped here
            command.spawn()?
        };

        let reader = thread::spawn(move || {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(File::from(read));
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => lines.push(String::from_utf8_lossy(&line).trim_end().to_string()),
                }
            }
            lines
        });

        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                timed_out = true;
                if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
                    debug!("killpg failed: {}", e);
                    let _ = child.kill();
                }
                break child.wait()?;
            }
            thread::sleep(WAIT_INTERVAL);
        };

        let lines = reader.join().unwrap_or_default();
        if timed_out {
            self.message = "Compilation timed out".to_string();
            info!("Compilation timed out after {:?}", self.timeout);
            return Ok(false);
        }

        self.message = lines.join("\n");
        debug!(
            "Compiler exited with {} after {:?}",
            status,
            started.elapsed()
        );
        Ok(status.success())
    }
}
