//! Sandbox configuration
//!
//! Process-wide settings for every sandbox session, filled in at start-up.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Sandbox configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Cgroup v2 directory under which session cgroups are created
    pub cgroup_root: PathBuf,
    /// Unprivileged uid the child runs as (default: nobody)
    pub uid: u32,
    /// Unprivileged gid the child runs as (default: nogroup)
    pub gid: u32,
    /// Extra memory on top of the limit before the kernel OOM-kills, in KB
    pub memory_slack_kb: u64,
    /// Captured bytes kept per stream
    pub output_limit_bytes: usize,
    /// How long to keep draining output after the child is gone, in ms
    pub drain_grace_ms: u64,
    /// Cgroup removal attempts before giving up
    pub cleanup_attempts: u32,
    /// Delay between cgroup removal attempts, in ms
    pub cleanup_backoff_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            uid: 65534,
            gid: 65534,
            memory_slack_kb: 8 * 1024,
            output_limit_bytes: 64 * 1024 * 1024,
            drain_grace_ms: 1000,
            cleanup_attempts: 5,
            cleanup_backoff_ms: 20,
        }
    }
}

impl SandboxConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn cleanup_backoff(&self) -> Duration {
        Duration::from_millis(self.cleanup_backoff_ms)
    }

    /// Refuse to run untrusted code as root
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.uid == 0 || self.gid == 0 {
            anyhow::bail!(
                "Sandbox uid/gid must be unprivileged, got uid={} gid={}",
                self.uid,
                self.gid
            );
        }
        if self.cleanup_attempts == 0 {
            anyhow::bail!("cleanup_attempts must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SandboxConfig::default().validate().is_ok());
    }

    #[test]
    fn test_root_uid_rejected() {
        let config = SandboxConfig {
            uid: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
