use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::path::NodePath;

pub const WORKSPACE_CONFIG: &str = "config";
pub const WORKSPACE_WEBSITE: &str = "website";
pub const WORKSPACE_USERROLES: &str = "userroles";
pub const WORKSPACE_USERGROUPS: &str = "usergroups";
pub const WORKSPACE_USERS: &str = "users";
pub const WORKSPACE_DAM: &str = "dam";

pub const ROOT_NODE_TYPE: &str = "rep:root";
pub const CONTENT_NODE_TYPE: &str = "mgnl:contentNode";
pub const PAGE_NODE_TYPE: &str = "mgnl:page";

/// Prefix of properties maintained by the platform rather than by content.
pub const SYSTEM_PROPERTY_PREFIX: &str = "mgnl:";
pub const ACTIVATION_STATUS: &str = "mgnl:activationStatus";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    NotActivated,
    Modified,
    Activated,
}

impl ActivationStatus {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::NotActivated => 0,
            Self::Modified => 1,
            Self::Activated => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::NotActivated),
            1 => Some(Self::Modified),
            2 => Some(Self::Activated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Boolean(bool),
}

impl PropertyValue {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Long(_) => "long",
            Self::Boolean(_) => "boolean",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            Self::String(value) => value.parse().ok(),
            Self::Long(_) => None,
        }
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Long(value) => write!(f, "{value}"),
            Self::Boolean(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("node {workspace}:{path} not found")]
    NodeNotFound { workspace: String, path: String },
    #[error("node {workspace}:{path} already exists")]
    NodeExists { workspace: String, path: String },
    #[error("save conflict: {0}")]
    Conflict(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn not_found(workspace: &str, path: &NodePath) -> Self {
        Self::NodeNotFound { workspace: workspace.to_string(), path: path.to_string() }
    }

    #[must_use]
    pub fn exists(workspace: &str, path: &NodePath) -> Self {
        Self::NodeExists { workspace: workspace.to_string(), path: path.to_string() }
    }
}

impl From<crate::path::PathError> for StoreError {
    fn from(err: crate::path::PathError) -> Self {
        Self::InvalidPath(err.to_string())
    }
}

/// A read/write session over a multi-workspace node tree.
///
/// Mutations are visible to later reads on the same session immediately and become durable
/// on [`StoreSession::save`]. Every workspace has an implicit root node.
pub trait StoreSession {
    /// # Errors
    /// Backend failures only; a missing node is `Ok(false)`.
    fn node_exists(&self, workspace: &str, path: &NodePath) -> Result<bool, StoreError>;

    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn node_type(&self, workspace: &str, path: &NodePath) -> Result<String, StoreError>;

    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn mixins(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError>;

    /// Child names in sibling order.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn children(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError>;

    /// Create a node as the last child of its parent.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] for a missing parent, [`StoreError::NodeExists`] when the
    /// path is taken.
    fn add_node(
        &mut self,
        workspace: &str,
        path: &NodePath,
        primary_type: &str,
    ) -> Result<(), StoreError>;

    /// Remove a node and its whole subtree.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn remove_node(&mut self, workspace: &str, path: &NodePath) -> Result<(), StoreError>;

    /// Move a subtree; the node becomes the last child of the target's parent.
    ///
    /// # Errors
    /// Missing source or target parent, or an occupied target.
    fn move_node(&mut self, workspace: &str, from: &NodePath, to: &NodePath)
        -> Result<(), StoreError>;

    /// Reorder `path` before its sibling `before`, or to the end when `before` is `None`.
    ///
    /// # Errors
    /// Missing node or sibling.
    fn order_before(
        &mut self,
        workspace: &str,
        path: &NodePath,
        before: Option<&str>,
    ) -> Result<(), StoreError>;

    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing; a missing property is `Ok(None)`.
    fn property(
        &self,
        workspace: &str,
        path: &NodePath,
        name: &str,
    ) -> Result<Option<PropertyValue>, StoreError>;

    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn property_names(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError>;

    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn set_property(
        &mut self,
        workspace: &str,
        path: &NodePath,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError>;

    /// Returns whether the property existed.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn remove_property(
        &mut self,
        workspace: &str,
        path: &NodePath,
        name: &str,
    ) -> Result<bool, StoreError>;

    /// Returns `false` when the mixin was already present.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn add_mixin(&mut self, workspace: &str, path: &NodePath, mixin: &str)
        -> Result<bool, StoreError>;

    /// Persist everything changed since the last save.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] or [`StoreError::Constraint`] when the backend refuses.
    fn save(&mut self) -> Result<(), StoreError>;

    /// Create `path` and any missing ancestors. Created intermediates get
    /// `intermediate_type`, the leaf gets `leaf_type`. Returns whether the leaf was created.
    ///
    /// # Errors
    /// Propagates backend failures.
    fn ensure_path(
        &mut self,
        workspace: &str,
        path: &NodePath,
        leaf_type: &str,
        intermediate_type: &str,
    ) -> Result<bool, StoreError> {
        if self.node_exists(workspace, path)? {
            return Ok(false);
        }
        let mut missing = vec![path.clone()];
        for ancestor in path.ancestors() {
            if ancestor.is_root() || self.node_exists(workspace, &ancestor)? {
                break;
            }
            missing.push(ancestor);
        }
        while let Some(next) = missing.pop() {
            let node_type = if &next == path { leaf_type } else { intermediate_type };
            self.add_node(workspace, &next, node_type)?;
        }
        Ok(true)
    }

    /// `true` when the node has children or any non-system property.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn has_content(&self, workspace: &str, path: &NodePath) -> Result<bool, StoreError> {
        if !self.children(workspace, path)?.is_empty() {
            return Ok(true);
        }
        Ok(self
            .property_names(workspace, path)?
            .iter()
            .any(|name| !name.starts_with(SYSTEM_PROPERTY_PREFIX)))
    }

    /// Every node strictly below `path`, depth first in sibling order.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the node is missing.
    fn descendants(&self, workspace: &str, path: &NodePath) -> Result<Vec<NodePath>, StoreError> {
        let mut out = Vec::new();
        let mut stack = vec![path.clone()];
        while let Some(current) = stack.pop() {
            let children = self.children(workspace, &current)?;
            for name in children.iter().rev() {
                stack.push(current.child(name)?);
            }
            if &current != path {
                out.push(current);
            }
        }
        Ok(out)
    }

    /// Read a string property, treating a missing node like a missing property.
    ///
    /// # Errors
    /// Backend failures only.
    fn string_property(
        &self,
        workspace: &str,
        path: &NodePath,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        if !self.node_exists(workspace, path)? {
            return Ok(None);
        }
        Ok(self.property(workspace, path, name)?.map(|value| value.to_string()))
    }
}
