//! Seccomp policy shared by all sandbox sessions
//!
//! The policy source is a seccompiler JSON document. It is compiled to a BPF
//! program once at start-up; every session installs the same program.

use seccompiler::{BpfProgram, BpfProgramRef, TargetArch};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::SandboxError;

/// Policy used when no policy file is configured
pub const DEFAULT_POLICY: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/seccomp.json"));

/// Name of the filter inside the policy document
pub const FILTER_NAME: &str = "sandbox";

/// Compiled seccomp program plus the source it came from
#[derive(Debug)]
pub struct SandboxPolicy {
    source: String,
    program: BpfProgram,
}

impl SandboxPolicy {
    /// Load the policy from `path`, or the built-in default, and compile it
    pub fn load(path: Option<&Path>) -> Result<Arc<Self>, SandboxError> {
        let source = match path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                SandboxError::Policy(format!("Failed to read {:?}: {}", path, e))
            })?,
            None => DEFAULT_POLICY.to_string(),
        };

        let policy = Self::compile(source)?;
        info!(
            "Compiled seccomp policy from {}: {} BPF instructions",
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in default".into()),
            policy.program.len()
        );
        Ok(Arc::new(policy))
    }

    /// Compile a policy document for the host architecture
    pub fn compile(source: String) -> Result<Self, SandboxError> {
        let arch = TargetArch::try_from(std::env::consts::ARCH)
            .map_err(|e| SandboxError::Policy(format!("Unsupported architecture: {}", e)))?;

        let mut filters = seccompiler::compile_from_json(source.as_bytes(), arch)
            .map_err(|e| SandboxError::Policy(e.to_string()))?;

        let program = filters.remove(FILTER_NAME).ok_or_else(|| {
            SandboxError::Policy(format!("Policy has no \"{}\" filter", FILTER_NAME))
        })?;
        if program.is_empty() {
            return Err(SandboxError::Policy("Compiled filter is empty".into()));
        }

        Ok(Self { source, program })
    }

    /// BPF instructions to install in the child
    pub fn program(&self) -> BpfProgramRef<'_> {
        &self.program
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}
