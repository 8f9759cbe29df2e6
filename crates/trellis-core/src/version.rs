use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum VersionParseError {
    #[error("version string is empty")]
    Empty,
    #[error("version `{input}` has more than three numeric components")]
    TooManyComponents { input: String },
    #[error("version `{input}` has a non-numeric component `{component}`")]
    InvalidComponent { input: String, component: String },
    #[error("version `{input}` has an empty qualifier")]
    EmptyQualifier { input: String },
}

/// A module version: `major.minor.patch` with an optional `-qualifier`.
///
/// Numeric components compare first. With equal numbers, a qualified version
/// (`1.0-beta`) sorts before the plain release (`1.0`) and qualifiers compare
/// lexicographically among themselves.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub qualifier: Option<String>,
}

impl Version {
    #[must_use]
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch, qualifier: None }
    }

    #[must_use]
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Parse `M`, `M.m` or `M.m.p`, each optionally followed by `-qualifier`.
    ///
    /// # Errors
    /// Returns [`VersionParseError`] when the input is empty, has more than three
    /// numeric components, a non-numeric component, or an empty qualifier.
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionParseError::Empty);
        }

        let (numbers, qualifier) = match trimmed.split_once('-') {
            Some((numbers, qualifier)) => {
                if qualifier.trim().is_empty() {
                    return Err(VersionParseError::EmptyQualifier { input: trimmed.to_string() });
                }
                (numbers, Some(qualifier.to_string()))
            }
            None => (trimmed, None),
        };

        let mut components = [0_u32; 3];
        let mut count = 0_usize;
        for component in numbers.split('.') {
            if count == components.len() {
                return Err(VersionParseError::TooManyComponents { input: trimmed.to_string() });
            }
            components[count] = component.parse::<u32>().map_err(|_| {
                VersionParseError::InvalidComponent {
                    input: trimmed.to_string(),
                    component: component.to_string(),
                }
            })?;
            count += 1;
        }

        Ok(Self {
            major: components[0],
            minor: components[1],
            patch: components[2],
            qualifier,
        })
    }

    /// The numeric part of the version, ignoring any qualifier.
    #[must_use]
    pub fn release(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// `true` when both versions name the same numeric release.
    #[must_use]
    pub fn same_release(&self, other: &Self) -> bool {
        self.release() == other.release()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release().cmp(&other.release()).then_with(|| {
            match (&self.qualifier, &other.qualifier) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(lhs), Some(rhs)) => lhs.cmp(rhs),
            }
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(qualifier) = &self.qualifier {
            write!(f, "-{qualifier}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Compare two installed versions where `None` means "nothing installed".
///
/// `None` is strictly less than every concrete version.
#[must_use]
pub fn compare_installed(lhs: Option<&Version>, rhs: Option<&Version>) -> Ordering {
    lhs.cmp(&rhs)
}
