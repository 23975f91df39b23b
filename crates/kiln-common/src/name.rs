//! Instance name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{KilnError, KilnResult};

/// A validated instance name.
///
/// Instance names become directory names under the workspace, so they
/// must not contain path separators or whitespace, and must not be empty
/// or a dot-name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceName(String);

impl InstanceName {
    /// Create a new instance name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not usable as a directory name.
    pub fn new(name: impl Into<String>) -> KilnResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> KilnResult<()> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(KilnError::InvalidInstanceName {
                name: name.to_string(),
            });
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace())
        {
            return Err(KilnError::InvalidInstanceName {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceName {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for InstanceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(InstanceName::new("amd64").is_ok());
        assert!(InstanceName::new("stable-build").is_ok());
        assert!(InstanceName::new("loongarch64_main").is_ok());
        assert!(InstanceName::new(".hidden").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(InstanceName::new("").is_err());
        assert!(InstanceName::new(".").is_err());
        assert!(InstanceName::new("..").is_err());
        assert!(InstanceName::new("a/b").is_err());
        assert!(InstanceName::new("a\\b").is_err());
        assert!(InstanceName::new("a b").is_err());
        assert!(InstanceName::new("a\tb").is_err());
    }

    #[test]
    fn parse_roundtrip() {
        let name: InstanceName = "main".parse().unwrap();
        assert_eq!(name.to_string(), "main");
        assert_eq!(name.as_ref(), "main");
    }
}
