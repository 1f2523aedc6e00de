//! Workspace identifiers.
//!
//! A workspace identifier names a directory under the storage root and a
//! key in the instance cache, so it is validated once at the edge and then
//! carried around as a [`WorkspaceId`] that cannot be invalid.

use std::fmt;

use crate::error::{KbError, Result};

pub const MAX_WORKSPACE_LEN: usize = 255;

const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// A validated workspace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Validate a non-empty identifier. Surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();

        if name.is_empty() {
            return Err(KbError::invalid_workspace(raw, "must not be empty"));
        }
        if name.len() > MAX_WORKSPACE_LEN {
            return Err(KbError::invalid_workspace(
                &format!("{}...", name.chars().take(32).collect::<String>()),
                format!("longer than {} characters", MAX_WORKSPACE_LEN),
            ));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(KbError::invalid_workspace(
                name,
                format!("character {:?} is not allowed (use letters, digits, '_', '.', '-')", bad),
            ));
        }
        if name.contains("..") {
            return Err(KbError::invalid_workspace(name, "must not contain '..'"));
        }
        if name.starts_with('.') || name.ends_with('.') {
            return Err(KbError::invalid_workspace(
                name,
                "must not start or end with '.'",
            ));
        }
        if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
            return Err(KbError::invalid_workspace(name, "is a reserved name"));
        }

        Ok(Self(name.to_string()))
    }

    /// Absent or blank input resolves to `default`; anything else must
    /// validate.
    pub fn resolve(raw: Option<&str>, default: &WorkspaceId) -> Result<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(default.clone()),
            Some(name) => Self::parse(name),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkspaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(raw: &str) -> String {
        match WorkspaceId::parse(raw).unwrap_err() {
            KbError::InvalidWorkspaceName { reason, .. } => reason,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_accepts_allowed_characters() {
        for name in ["default", "team_a", "Team-B.v2", "x", "a.b-c_d", "COM10"] {
            assert_eq!(WorkspaceId::parse(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_trims_whitespace() {
        assert_eq!(WorkspaceId::parse("  alpha \n").unwrap().as_str(), "alpha");
    }

    #[test]
    fn test_rejects_path_tricks() {
        assert!(reason("a/b").contains("not allowed"));
        assert!(reason("a\\b").contains("not allowed"));
        assert!(reason("..").contains(".."));
        assert!(reason("a..b").contains(".."));
        assert!(reason(".hidden").contains("start or end"));
        assert!(reason("trailing.").contains("start or end"));
        assert!(reason("with space").contains("not allowed"));
        assert!(reason("ünï").contains("not allowed"));
    }

    #[test]
    fn test_rejects_reserved_names_case_insensitive() {
        for name in ["con", "PRN", "Aux", "nul", "com1", "LPT9"] {
            assert!(reason(name).contains("reserved"), "{name}");
        }
    }

    #[test]
    fn test_length_limit() {
        assert!(WorkspaceId::parse(&"a".repeat(MAX_WORKSPACE_LEN)).is_ok());
        assert!(reason(&"a".repeat(MAX_WORKSPACE_LEN + 1)).contains("longer than"));
    }

    #[test]
    fn test_resolve_defaults_blank_input() {
        let default = WorkspaceId::parse("main").unwrap();
        assert_eq!(WorkspaceId::resolve(None, &default).unwrap(), default);
        assert_eq!(WorkspaceId::resolve(Some("   "), &default).unwrap(), default);
        assert_eq!(
            WorkspaceId::resolve(Some("other"), &default).unwrap().as_str(),
            "other"
        );
        assert!(WorkspaceId::resolve(Some("../main"), &default).is_err());
    }
}
