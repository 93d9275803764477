//! Run identifiers and validated names.

use std::fmt;

/// A validated container, command or volume name.
///
/// Names must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character or an underscore
///
/// Names end up as directory names on the host, so the leading-dot form is
/// reserved for berth's own scratch entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    /// Maximum length of a name.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns the rejected string if the format is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(name)
        }
    }

    /// Check a name without allocating.
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return false;
        }
        let mut chars = name.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        first_ok && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a single run, used for scratch directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Generate a new random run ID.
    ///
    /// The ID is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the run ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_names() {
        assert!(Name::new("postgres").is_ok());
        assert!(Name::new("_init_db").is_ok());
        assert!(Name::new("py3.11-dev").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(Name::new("").is_err());
        assert!(Name::new(".tmp").is_err());
        assert!(Name::new("a/b").is_err());
        assert!(Name::new("a b").is_err());
        assert!(Name::new("x".repeat(65)).is_err());
    }

    #[test]
    fn generated_run_ids_are_distinct() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn valid_names_never_contain_separators(s in "[a-zA-Z0-9_][a-zA-Z0-9._-]{0,40}") {
            let name = Name::new(s).unwrap();
            prop_assert!(!name.as_str().contains('/'));
            prop_assert!(!name.as_str().starts_with('.'));
        }
    }
}
