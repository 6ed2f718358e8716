//! Judge configuration
//!
//! Loaded once at start-up: defaults, then the optional TOML file named by
//! `JUDGE_CONFIG`, then environment overrides.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::sandbox::SandboxConfig;

/// Judge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Number of judge workers (default: number of CPUs)
    pub workers: usize,
    /// Submissions waiting for a worker before `submit` blocks
    pub queue_capacity: usize,
    /// Seccomp policy file (None: built-in policy)
    pub seccomp_policy: Option<PathBuf>,
    /// Languages file (None: built-in table)
    pub languages: Option<PathBuf>,
    /// Directory for per-submission workspaces
    pub work_root: PathBuf,
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_timeout_ms: u64,
    pub sandbox: SandboxConfig,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: 64,
            seccomp_policy: None,
            languages: None,
            work_root: PathBuf::from("/tmp/judge"),
            compile_timeout_ms: 30_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl JudgeConfig {
    /// Load from `JUDGE_CONFIG` (if set) and apply environment overrides
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os("JUDGE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {:?}", path))
    }

    /// Override fields from variables looked up through `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        fn parse<T: FromStr>(key: &str, value: String) -> anyhow::Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, value, e))
        }

        if let Some(v) = var("JUDGE_WORKERS") {
            self.workers = parse("JUDGE_WORKERS", v)?;
        }
        if let Some(v) = var("JUDGE_QUEUE_CAPACITY") {
            self.queue_capacity = parse("JUDGE_QUEUE_CAPACITY", v)?;
        }
        if let Some(v) = var("SECCOMP_POLICY") {
            self.seccomp_policy = Some(PathBuf::from(v));
        }
        if let Some(v) = var("LANGUAGES_CONFIG") {
            self.languages = Some(PathBuf::from(v));
        }
        if let Some(v) = var("JUDGE_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Some(v) = var("COMPILE_TIMEOUT_MS") {
            self.compile_timeout_ms = parse("COMPILE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = var("CGROUP_ROOT") {
            self.sandbox.cgroup_root = PathBuf::from(v);
        }
        if let Some(v) = var("SANDBOX_UID") {
            self.sandbox.uid = parse("SANDBOX_UID", v)?;
        }
        if let Some(v) = var("SANDBOX_GID") {
            self.sandbox.gid = parse("SANDBOX_GID", v)?;
        }
        if let Some(v) = var("OUTPUT_LIMIT_BYTES") {
            self.sandbox.output_limit_bytes = parse("OUTPUT_LIMIT_BYTES", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        self.sandbox.validate()
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = JudgeConfig::default();
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
        assert_eq!(config.compile_timeout(), Duration::from_secs(30));
        assert_eq!(config.sandbox.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
    }

    #[test]
    fn test_from_file_keeps_unset_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
workers = 2
work_root = "/srv/judge"

[sandbox]
uid = 1500
gid = 1500
"#
        )
        .unwrap();

        let config = JudgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.work_root, PathBuf::from("/srv/judge"));
        assert_eq!(config.sandbox.uid, 1500);
        assert_eq!(config.sandbox.memory_slack_kb, 8 * 1024);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("JUDGE_WORKERS", "3"),
            ("CGROUP_ROOT", "/tmp/cg"),
            ("LANGUAGES_CONFIG", "/etc/judge/languages.toml"),
        ]
        .into_iter()
        .collect();

        let mut config = JudgeConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.sandbox.cgroup_root, PathBuf::from("/tmp/cg"));
        assert_eq!(
            config.languages,
            Some(PathBuf::from("/etc/judge/languages.toml"))
        );
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = JudgeConfig::default();
        let err = config
            .apply_env(|key| (key == "SANDBOX_UID").then(|| "nobody".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SANDBOX_UID"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = JudgeConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
