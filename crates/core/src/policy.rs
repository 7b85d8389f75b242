//! Naming and ignore predicates.
//!
//! [`NamePolicy`] decides which entry names are reserved, whether a name is
//! legal, and when two names occupy the same directory slot.
//! [`IgnoreRules`] splits uncontrolled items into found and ignored.

use tracing::debug;

use crate::config::WcConfig;
use crate::errors::WcError;

// ---------------------------------------------------------------------------
// NamePolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NamePolicy {
    reserved: Vec<String>,
    case_insensitive: bool,
}

impl NamePolicy {
    pub fn new(reserved: Vec<String>, case_insensitive: bool) -> Self {
        Self {
            reserved,
            case_insensitive,
        }
    }

    pub fn from_config(config: &WcConfig) -> Self {
        Self::new(
            config.working_copy.reserved_names.clone(),
            config.working_copy.case_insensitive_collisions,
        )
    }

    /// Whether an entry with this name can never be controlled.
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved
            .iter()
            .any(|r| self.collision_key(r) == self.collision_key(name))
    }

    /// Key under which two names collide.
    pub fn collision_key(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    /// Reject names no directory entry can have, plus reserved names.
    pub fn validate_entryname(&self, name: &str) -> Result<(), WcError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(WcError::InvalidName(name.to_string()));
        }
        if self.is_reserved(name) {
            return Err(WcError::Reserved(name.to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IgnoreRules
// ---------------------------------------------------------------------------

/// Ignore patterns for uncontrolled items.
///
/// A pattern without `/` matches the entry name at any depth (`*.o`);
/// a pattern with `/` matches the whole repo-relative path (`target/**`).
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<String>,
}

impl IgnoreRules {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn from_config(config: &WcConfig) -> Self {
        Self::new(config.status.ignores.clone())
    }

    /// `rel_path` is forward-slash separated, relative to the root.
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let path = rel_path.replace('\\', "/");
        let name = path.rsplit('/').next().unwrap_or(&path);
        for pattern in &self.patterns {
            let hit = if pattern.contains('/') {
                glob_match::glob_match(pattern, &path)
            } else {
                glob_match::glob_match(pattern, name)
            };
            if hit {
                debug!(path = %path, pattern = %pattern, "path matches ignore pattern");
                return true;
            }
        }
        false
    }
}
