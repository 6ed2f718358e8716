//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::ResourceLimits;

/// Built-in language table
pub const DEFAULT_LANGUAGES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Supported languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Python,
}

impl Language {
    /// Canonical language id, also the table name in `languages.toml`
    pub fn id(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Python => "python",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_lowercase().as_str() {
            "c" => Some(Language::C),
            "cpp" => Some(Language::Cpp),
            "python" => Some(Language::Python),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub language: Language,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compiler and its default flags (None if not needed)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Environment of the sandboxed program (key=value)
    pub env: Vec<String>,
    /// Keep the host network namespace when running
    pub share_network: bool,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
}

impl LanguageConfig {
    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Calculate actual time in seconds from a base time in seconds
    pub fn calculate_time_limit(&self, base_s: f64) -> f64 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_s * multiplier as f64 + bonus_seconds as f64,
            None => base_s,
        }
    }

    /// Calculate actual memory in KB from a base memory in KB
    pub fn calculate_memory_limit(&self, base_kb: u64) -> u64 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_kb
                .saturating_mul(multiplier as u64)
                .saturating_add(bonus_mb as u64 * 1024),
            None => base_kb,
        }
    }

    /// Problem limits adjusted for this language. The wall limit gets the
    /// same adjustment as the CPU limit.
    pub fn resolve_limits(&self, base: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            time_limit_s: self.calculate_time_limit(base.time_limit_s),
            wall_time_s: self.calculate_time_limit(base.wall_time_s),
            memory_limit_kb: self.calculate_memory_limit(base.memory_limit_kb),
            ..base.clone()
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    share_network: bool,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Language table keyed by language id and alias
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    configs: HashMap<Language, LanguageConfig>,
    aliases: HashMap<String, Language>,
}

impl LanguageRegistry {
    /// Load from `path`, or the built-in table
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let registry = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read languages file {:?}", path))?;
                Self::from_toml(&content)?
            }
            None => Self::from_toml(DEFAULT_LANGUAGES)?,
        };
        info!("Loaded languages: {:?}", registry.supported());
        Ok(registry)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut configs = HashMap::new();
        let mut aliases = HashMap::new();

        for (name, raw) in raw_configs {
            let language = Language::from_id(&name)
                .with_context(|| format!("Unknown language table [{}]", name))?;

            let parse_limit =
                |raw_limit: Vec<String>, kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                    if raw_limit.is_empty() {
                        return Ok(None);
                    }
                    if raw_limit.len() != 2 {
                        anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit);
                    }
                    let multiplier = raw_limit[0].parse::<u32>().with_context(|| {
                        format!("Invalid {} multiplier for {}: {}", kind, name, raw_limit[0])
                    })?;
                    let offset = raw_limit[1].parse::<u32>().with_context(|| {
                        format!("Invalid {} offset for {}: {}", kind, name, raw_limit[1])
                    })?;
                    Ok(Some((multiplier, offset)))
                };

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for {}", name);
            }

            let config = LanguageConfig {
                language,
                source_file: raw.source_file,
                compile_command: raw
                    .compile_command
                    .map(|cmd| into_command(&cmd))
                    .filter(|cmd| !cmd.is_empty()),
                run_command,
                env: raw.env,
                share_network: raw.share_network,
                time_limit: parse_limit(raw.time_limit, "time")?,
                memory_limit: parse_limit(raw.memory_limit, "memory")?,
            };

            aliases.insert(language.id().to_string(), language);
            for alias in raw.aliases {
                aliases.insert(alias.to_lowercase(), language);
            }
            configs.insert(language, config);
        }

        Ok(Self { configs, aliases })
    }

    /// Get language configuration by language id or alias
    pub fn get(&self, language_id: &str) -> Option<&LanguageConfig> {
        let language = self.aliases.get(&language_id.to_lowercase())?;
        self.configs.get(language)
    }

    /// Get all accepted language ids and aliases
    pub fn supported(&self) -> Vec<String> {
        let mut names: Vec<String> = self.aliases.keys().cloned().collect();
        names.sort();
        names
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[c]
source_file = "main.c"
compile_command = "gcc -O2"
run_command = "./main"

[python]
source_file = "main.py"
run_command = "python3 main.py"
time_limit = ["3", "2"]
memory_limit = ["2", "32"]
aliases = ["py", "Python3"]
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_load_languages() {
        let config_file = create_test_config();
        let registry = LanguageRegistry::load(Some(config_file.path())).unwrap();

        let c = registry.get("C").unwrap();
        assert_eq!(c.language, Language::C);
        assert_eq!(c.compile_command.as_deref(), Some(&["gcc".to_string(), "-O2".to_string()][..]));
        assert!(c.is_compiled());

        let py = registry.get("python3").unwrap();
        assert_eq!(py.language, Language::Python);
        assert!(!py.is_compiled());
        assert_eq!(py.run_command, vec!["python3", "main.py"]);

        assert!(registry.get("cpp").is_none());
        assert_eq!(registry.supported(), vec!["c", "py", "python", "python3"]);
    }

    #[test]
    fn test_builtin_languages() {
        let registry = LanguageRegistry::load(None).unwrap();
        for id in ["c", "cpp", "c++", "python", "py"] {
            assert!(registry.get(id).is_some(), "missing {}", id);
        }
        assert!(registry.get("java").is_none());

        // isolated mode: no site-packages, no PYTHON* environment, no .pyc files
        let python = registry.get("python").unwrap();
        assert_eq!(python.run_command, vec!["python3", "-I", "-S", "-B", "main.py"]);
    }

    #[test]
    fn test_memory_bonus_saturates() {
        let registry = LanguageRegistry::load(None).unwrap();
        let python = registry.get("python").unwrap();
        assert_eq!(python.calculate_memory_limit(u64::MAX / 2), u64::MAX);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let content = "[rust]\nsource_file = \"main.rs\"\nrun_command = \"./main\"\n";
        assert!(LanguageRegistry::from_toml(content).is_err());
    }

    #[test]
    fn test_invalid_bonus_rejected() {
        let content = "[c]\nsource_file = \"main.c\"\nrun_command = \"./main\"\ntime_limit = [\"x\", \"1\"]\n";
        assert!(LanguageRegistry::from_toml(content).is_err());
    }

    #[test]
    fn test_resolve_limits_applies_bonus() {
        let config_file = create_test_config();
        let registry = LanguageRegistry::load(Some(config_file.path())).unwrap();
        let base = ResourceLimits {
            time_limit_s: 1.0,
            extra_time_s: 0.5,
            wall_time_s: 2.0,
            memory_limit_kb: 1024,
            stack_limit_kb: 0,
        };

        let py = registry.get("py").unwrap().resolve_limits(&base);
        assert_eq!(py.time_limit_s, 5.0);
        assert_eq!(py.wall_time_s, 8.0);
        assert_eq!(py.memory_limit_kb, 2048 + 32 * 1024);
        assert_eq!(py.extra_time_s, 0.5);

        let c = registry.get("c").unwrap().resolve_limits(&base);
        assert_eq!(c, base);
    }
}
