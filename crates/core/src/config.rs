//! TOML-based configuration for a working copy.
//!
//! The file lives at `.wc/config.toml`. Every section is optional; a missing
//! file yields [`WcConfig::default`] through [`WcConfig::load_or_default`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Name of the metadata directory at the root of every working copy.
pub const META_DIR_NAME: &str = ".wc";

/// Merge tools implemented in-process.
pub const BUILTIN_TOOLS: &[&str] = &[":diffy", ":baseline", ":other", ":fail"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level working-copy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WcConfig {
    #[serde(default)]
    pub working_copy: WorkingCopyConfig,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub locks: LocksConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Working copy
// ---------------------------------------------------------------------------

/// Directory-level naming rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingCopyConfig {
    /// Entry names that can never be controlled. Always includes `.wc`.
    #[serde(default = "default_reserved_names")]
    pub reserved_names: Vec<String>,

    /// Treat names differing only by case as colliding.
    #[serde(default)]
    pub case_insensitive_collisions: bool,

    /// Reuse recorded hashes for files whose mtime and size are unchanged.
    #[serde(default = "default_true")]
    pub timestamp_cache: bool,
}

fn default_reserved_names() -> Vec<String> {
    vec![META_DIR_NAME.to_string()]
}
fn default_true() -> bool {
    true
}

impl Default for WorkingCopyConfig {
    fn default() -> Self {
        Self {
            reserved_names: default_reserved_names(),
            case_insensitive_collisions: false,
            timestamp_cache: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Status / user / locks
// ---------------------------------------------------------------------------

/// Ignore patterns applied to uncontrolled items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Glob patterns matched against repo-relative paths (forward slashes).
    #[serde(default)]
    pub ignores: Vec<String>,
}

/// Identity of the local user, compared against lock owners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_user_name")]
    pub name: String,
}

fn default_user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".into())
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: default_user_name(),
        }
    }
}

/// Branch whose file locks are reported by status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default = "default_lock_branch")]
    pub branch: String,
}

fn default_lock_branch() -> String {
    "master".into()
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            branch: default_lock_branch(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge tools
// ---------------------------------------------------------------------------

/// Merge-tool selection rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Tool used for text files that match no class.
    #[serde(default = "default_tool")]
    pub default_tool: String,

    /// Tool used for files whose content sniffs as binary.
    #[serde(default = "default_binary_tool")]
    pub binary_tool: String,

    /// File classes, checked in order; the first match wins.
    #[serde(default)]
    pub classes: Vec<MergeClass>,

    /// External tools by name.
    #[serde(default)]
    pub tools: BTreeMap<String, ExternalTool>,
}

fn default_tool() -> String {
    ":diffy".into()
}
fn default_binary_tool() -> String {
    ":fail".into()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            default_tool: default_tool(),
            binary_tool: default_binary_tool(),
            classes: Vec::new(),
            tools: BTreeMap::new(),
        }
    }
}

/// A named set of entry-name patterns mapped to a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeClass {
    pub name: String,
    pub patterns: Vec<String>,
    pub tool: String,
}

/// An external merge command.
///
/// Arguments may contain `@ANCESTOR@`, `@BASELINE@`, `@OTHER@` and
/// `@RESULT@`, which are replaced with file paths before launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTool {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exit codes meaning "ran, but left conflicts". Zero is always clean.
    #[serde(default)]
    pub conflict_exit_codes: Vec<i32>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl WcConfig {
    /// Load a [`WcConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: WcConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.normalize();

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            debug!(path = %path.display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Serialize for writing back to disk.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// The metadata directory is reserved regardless of what the file says.
    fn normalize(&mut self) {
        let reserved = &mut self.working_copy.reserved_names;
        if !reserved.iter().any(|n| n == META_DIR_NAME) {
            reserved.insert(0, META_DIR_NAME.to_string());
        }
    }

    /// Validate that names, tools and levels are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in &self.working_copy.reserved_names {
            if name.is_empty() || name.contains('/') {
                return Err(ConfigError::InvalidValue {
                    field: "working_copy.reserved_names".into(),
                    detail: format!("'{name}' must be a non-empty name without '/'"),
                });
            }
        }

        self.check_tool("merge.default_tool", &self.merge.default_tool)?;
        self.check_tool("merge.binary_tool", &self.merge.binary_tool)?;
        for class in &self.merge.classes {
            if class.patterns.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("merge.classes.{}", class.name),
                    detail: "class must list at least one pattern".into(),
                });
            }
            self.check_tool(&format!("merge.classes.{}", class.name), &class.tool)?;
        }
        for (name, tool) in &self.merge.tools {
            if name.starts_with(':') {
                return Err(ConfigError::InvalidValue {
                    field: format!("merge.tools.{name}"),
                    detail: "names starting with ':' are reserved for builtin tools".into(),
                });
            }
            if tool.command.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("merge.tools.{name}.command"),
                    detail: "command must not be empty".into(),
                });
            }
        }

        let levels = ["trace", "debug", "info", "warn", "error"];
        if !levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".into(),
                detail: format!("'{}' is not one of {}", self.logging.level, levels.join(", ")),
            });
        }

        Ok(())
    }

    fn check_tool(&self, field: &str, tool: &str) -> Result<(), ConfigError> {
        if BUILTIN_TOOLS.contains(&tool) || self.merge.tools.contains_key(tool) {
            Ok(())
        } else {
            Err(ConfigError::InvalidValue {
                field: field.into(),
                detail: format!("unknown merge tool '{tool}'"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[working_copy]
reserved_names = [".wc", ".hg"]
case_insensitive_collisions = true

[status]
ignores = ["*.o", "target/**"]

[user]
name = "alice"

[locks]
branch = "main"

[merge]
default_tool = ":diffy"
binary_tool = ":fail"

[[merge.classes]]
name = "text"
patterns = ["*.txt", "*.rs"]
tool = "meld"

[merge.tools.meld]
command = "meld"
args = ["@BASELINE@", "@ANCESTOR@", "@OTHER@", "-o", "@RESULT@"]
conflict_exit_codes = [1]

[logging]
level = "debug"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: WcConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert!(config.working_copy.case_insensitive_collisions);
        assert_eq!(config.status.ignores.len(), 2);
        assert_eq!(config.user.name, "alice");
        assert_eq!(config.locks.branch, "main");
        assert_eq!(config.merge.classes[0].tool, "meld");
        assert_eq!(config.merge.tools["meld"].conflict_exit_codes, vec![1]);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: WcConfig = toml::from_str("").unwrap();
        assert_eq!(config.working_copy.reserved_names, vec![".wc"]);
        assert!(config.working_copy.timestamp_cache);
        assert_eq!(config.merge.default_tool, ":diffy");
        assert_eq!(config.merge.binary_tool, ":fail");
        assert_eq!(config.locks.branch, "master");
        assert_eq!(config.logging.level, "warn");
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file_keeps_meta_dir_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"[working_copy]\nreserved_names = [\"build\"]\n").unwrap();

        let config = WcConfig::load_from_file(&path).unwrap();
        assert_eq!(config.working_copy.reserved_names, vec![".wc", "build"]);
    }

    #[test]
    fn test_file_not_found() {
        let result = WcConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
        let config = WcConfig::load_or_default("/nonexistent/config.toml").unwrap();
        assert_eq!(config.merge.default_tool, ":diffy");
    }

    #[test]
    fn test_validate_rejects_unknown_tool() {
        let mut config: WcConfig = toml::from_str(sample_toml()).unwrap();
        config.merge.classes[0].tool = "kdiff3".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "merge.classes.text"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_level_and_names() {
        let mut config = WcConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = WcConfig::default();
        config.working_copy.reserved_names.push("a/b".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "working_copy.reserved_names"
        ));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config: WcConfig = toml::from_str(sample_toml()).unwrap();
        let text = config.to_toml_string().unwrap();
        let again: WcConfig = toml::from_str(&text).unwrap();
        assert_eq!(again.merge.tools["meld"].args.len(), 5);
        assert_eq!(again.status.ignores, config.status.ignores);
    }
}
