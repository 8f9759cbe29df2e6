use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PathError {
    #[error("path `{0}` is not absolute")]
    NotAbsolute(String),
    #[error("path `{path}` has an invalid segment `{segment}`")]
    InvalidSegment { path: String, segment: String },
    #[error("`{0}` is not a valid node name")]
    InvalidName(String),
}

/// Absolute, `/`-separated node path. The root is `/`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodePath(String);

impl NodePath {
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// # Errors
    /// Returns [`PathError`] when the path is relative or contains an empty, `.` or `..`
    /// segment. A single trailing slash is tolerated.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Err(PathError::NotAbsolute(raw.to_string()));
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.is_empty() {
            return Ok(Self::root());
        }
        for segment in rest.split('/') {
            if !is_valid_name(segment) {
                return Err(PathError::InvalidSegment {
                    path: raw.to_string(),
                    segment: segment.to_string(),
                });
            }
        }
        Ok(Self(format!("/{rest}")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Last segment, or `None` for the root.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(index) => Some(Self(self.0[..index].to_string())),
        }
    }

    /// # Errors
    /// Returns [`PathError::InvalidName`] when `name` is not a single valid segment.
    pub fn child(&self, name: &str) -> Result<Self, PathError> {
        if !is_valid_name(name) {
            return Err(PathError::InvalidName(name.to_string()));
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Join a relative, possibly multi-segment path below this one.
    ///
    /// # Errors
    /// Returns [`PathError`] when any segment of `relative` is invalid.
    pub fn join(&self, relative: &str) -> Result<Self, PathError> {
        let mut path = self.clone();
        for segment in relative.split('/').filter(|segment| !segment.is_empty()) {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        self.0.split('/').filter(|segment| !segment.is_empty()).collect()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments().len()
    }

    /// `true` when `self` equals `other` or lies below it.
    #[must_use]
    pub fn is_within(&self, other: &Self) -> bool {
        if other.is_root() || self == other {
            return true;
        }
        self.0.len() > other.0.len()
            && self.0.starts_with(other.as_str())
            && self.0.as_bytes()[other.0.len()] == b'/'
    }

    /// Proper ancestors, nearest first, ending with the root.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            out.push(path);
        }
        out
    }

    /// Rewrite `self` from below `from` to below `to`. Returns `None` if `self` is not within
    /// `from`.
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if !self.is_within(from) {
            return None;
        }
        let suffix = &self.0[from.0.len()..];
        if suffix.is_empty() {
            return Some(to.clone());
        }
        if from.is_root() {
            return to.join(suffix).ok();
        }
        if to.is_root() {
            return Some(Self(suffix.to_string()));
        }
        Some(Self(format!("{}{suffix}", to.0)))
    }
}

fn is_valid_name(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".." && !segment.contains('/')
}

impl Display for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodePath {
    type Err = PathError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for NodePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
