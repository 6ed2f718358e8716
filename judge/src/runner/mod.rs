//! Runner module - Execution abstraction layer
//!
//! `Runner` is the seam between the judger and the sandbox: the judger hands
//! over a command, limits and stdin, and gets back captured output plus a
//! classified `TestResult`.
//!
//! The runner module does NOT:
//! - Compare outputs against expected answers
//! - Compile anything
//! - Know about problems or submissions

pub mod sandboxed;

use std::collections::HashMap;
use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::error::SandboxError;
use crate::model::{ExecutionResult, ResourceLimits};

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment variables (key=value)
    pub env: Vec<String>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
    /// Keep the host network namespace
    pub share_network: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
            share_network: false,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Absolute path of the program: relative paths ("./main") are taken
    /// from the work directory, bare names are looked up in `PATH`.
    pub fn resolve(&self) -> Result<PathBuf, SandboxError> {
        if self.program.is_empty() {
            return Err(SandboxError::InvalidCommand("empty program".into()));
        }
        let path = Path::new(&self.program);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if self.program.contains('/') {
            let base = self.work_dir.as_deref().unwrap_or(Path::new("/"));
            return Ok(base.join(path));
        }
        resolve_program(&self.program).ok_or_else(|| {
            SandboxError::InvalidCommand(format!("{} not found in PATH", self.program))
        })
    }
}

/// Runner trait for executing programs
pub trait Runner: Send + Sync {
    /// Run a command once with the given limits and stdin
    fn run(
        &self,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
    ) -> Result<ExecutionResult, SandboxError>;
}

/// Resolved program paths, looked up once per process
static PROGRAM_PATHS: OnceLock<Mutex<HashMap<String, PathBuf>>> = OnceLock::new();

/// Find an executable in `PATH`. Hits are cached for the process lifetime.
pub fn resolve_program(name: &str) -> Option<PathBuf> {
    let cache = PROGRAM_PATHS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Some(path) = cache.lock().ok()?.get(name) {
        return Some(path.clone());
    }

    let found = env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))?;

    cache.lock().ok()?.insert(name.to_string(), found.clone());
    Some(found)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// Re-exports
pub use sandboxed::SandboxedRunner;
