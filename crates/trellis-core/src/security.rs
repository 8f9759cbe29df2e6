//! Role-based access rules stored as nodes.
//!
//! Two shapes live in the tree. Voter-based permission subtrees hang below a protected
//! config resource and decide who may use it. ACL entries hang below a role node in the
//! `userroles` workspace and grant that role a level of access to paths of another workspace.

use serde::{Deserialize, Serialize};

use crate::path::NodePath;
use crate::store::{
    ActivationStatus, PropertyValue, StoreError, StoreSession, ACTIVATION_STATUS,
    CONTENT_NODE_TYPE, WORKSPACE_USERROLES,
};

pub const PERMISSIONS_NODE: &str = "permissions";
pub const VOTERS_NODE: &str = "voters";
pub const ROLES_NODE: &str = "roles";
pub const ALLOWED_VOTER_NODE: &str = "allowedRoles";
pub const DENIED_VOTER_NODE: &str = "deniedRoles";
pub const VOTER_BASED_KIND: &str = "voter-based";
pub const ROLE_VOTER_KIND: &str = "role-voter";
pub const ROLE_NODE_TYPE: &str = "mgnl:role";

const KIND_PROPERTY: &str = "kind";
const NOT_PROPERTY: &str = "not";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Voter {
    Allow,
    Deny,
}

impl Voter {
    #[must_use]
    pub fn node_name(self) -> &'static str {
        match self {
            Self::Allow => ALLOWED_VOTER_NODE,
            Self::Deny => DENIED_VOTER_NODE,
        }
    }
}

/// One (resource, role, voter) triple. `resource` is a path in the `config` workspace.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct AccessRule {
    pub resource: NodePath,
    pub role: String,
    pub voter: Voter,
}

impl AccessRule {
    #[must_use]
    pub fn allow(resource: NodePath, role: impl Into<String>) -> Self {
        Self { resource, role: role.into(), voter: Voter::Allow }
    }

    #[must_use]
    pub fn deny(resource: NodePath, role: impl Into<String>) -> Self {
        Self { resource, role: role.into(), voter: Voter::Deny }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoterEntry {
    pub name: String,
    pub voter: Voter,
    pub roles: Vec<String>,
}

/// The voters found below one resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccessDefinition {
    pub voters: Vec<VoterEntry>,
}

impl AccessDefinition {
    /// Read the voter subtree of `resource`. A resource without permissions yields an empty
    /// definition.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn load(
        session: &dyn StoreSession,
        workspace: &str,
        resource: &NodePath,
    ) -> Result<Self, StoreError> {
        let voters_path = resource.join(PERMISSIONS_NODE)?.child(VOTERS_NODE)?;
        if !session.node_exists(workspace, &voters_path)? {
            return Ok(Self::default());
        }
        let mut voters = Vec::new();
        for name in session.children(workspace, &voters_path)? {
            let voter_path = voters_path.child(&name)?;
            let denies = session
                .property(workspace, &voter_path, NOT_PROPERTY)?
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            let roles_path = voter_path.child(ROLES_NODE)?;
            let roles = if session.node_exists(workspace, &roles_path)? {
                let mut roles = Vec::new();
                for key in session.property_names(workspace, &roles_path)? {
                    if let Some(value) = session.property(workspace, &roles_path, &key)? {
                        roles.push(value.to_string());
                    }
                }
                roles
            } else {
                Vec::new()
            };
            voters.push(VoterEntry {
                name,
                voter: if denies { Voter::Deny } else { Voter::Allow },
                roles,
            });
        }
        Ok(Self { voters })
    }

    /// Deny wins over allow. With no allow voters the resource is open.
    #[must_use]
    pub fn is_granted<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        let lists_subject =
            |entry: &VoterEntry| entry.roles.iter().any(|r| roles.iter().any(|s| s.as_ref() == r));

        if self.voters.iter().filter(|entry| entry.voter == Voter::Deny).any(lists_subject) {
            return false;
        }
        let mut allow = self.voters.iter().filter(|entry| entry.voter == Voter::Allow).peekable();
        if allow.peek().is_none() {
            return true;
        }
        allow.any(lists_subject)
    }

    #[must_use]
    pub fn lists(&self, role: &str, voter: Voter) -> bool {
        self.voters
            .iter()
            .any(|entry| entry.voter == voter && entry.roles.iter().any(|r| r == role))
    }
}

/// Ensure `rule` is materialized below its resource. Returns whether anything changed.
///
/// # Errors
/// [`StoreError::NodeNotFound`] when the resource node is missing; other store failures.
pub fn ensure_access_rule(
    session: &mut dyn StoreSession,
    workspace: &str,
    rule: &AccessRule,
) -> Result<bool, StoreError> {
    if !session.node_exists(workspace, &rule.resource)? {
        return Err(StoreError::not_found(workspace, &rule.resource));
    }
    let permissions = rule.resource.child(PERMISSIONS_NODE)?;
    let voter = permissions.child(VOTERS_NODE)?.child(rule.voter.node_name())?;
    let roles = voter.child(ROLES_NODE)?;

    let mut changed = false;
    changed |= session.ensure_path(workspace, &roles, CONTENT_NODE_TYPE, CONTENT_NODE_TYPE)?;
    changed |= set_if_different(
        session,
        workspace,
        &permissions,
        KIND_PROPERTY,
        VOTER_BASED_KIND.into(),
    )?;
    changed |= set_if_different(session, workspace, &voter, KIND_PROPERTY, ROLE_VOTER_KIND.into())?;
    if rule.voter == Voter::Deny {
        changed |= set_if_different(session, workspace, &voter, NOT_PROPERTY, true.into())?;
    }
    changed |= set_if_different(session, workspace, &roles, &rule.role, rule.role.as_str().into())?;
    Ok(changed)
}

fn set_if_different(
    session: &mut dyn StoreSession,
    workspace: &str,
    path: &NodePath,
    name: &str,
    value: PropertyValue,
) -> Result<bool, StoreError> {
    if session.property(workspace, path, name)?.as_ref() == Some(&value) {
        return Ok(false);
    }
    session.set_property(workspace, path, name, value)?;
    Ok(true)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Read,
    All,
}

impl AccessLevel {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Read => 8,
            Self::All => 63,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            8 => Some(Self::Read),
            63 => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct AclEntry {
    pub path: String,
    pub permissions: AccessLevel,
}

impl AclEntry {
    #[must_use]
    pub fn new(path: impl Into<String>, permissions: AccessLevel) -> Self {
        Self { path: path.into(), permissions }
    }
}

/// Named roles owning ACL entries. Implementations write through the session they are given.
pub trait RoleRegistry: Send + Sync {
    /// Returns `false` when the role already existed.
    ///
    /// # Errors
    /// Propagates store failures.
    fn create_role(&self, session: &mut dyn StoreSession, role: &str) -> Result<bool, StoreError>;

    /// # Errors
    /// Propagates store failures.
    fn role_exists(&self, session: &dyn StoreSession, role: &str) -> Result<bool, StoreError>;

    /// Attach `entry` for `target_workspace`. Returns `false` when an equal entry exists.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the role is missing.
    fn grant(
        &self,
        session: &mut dyn StoreSession,
        role: &str,
        target_workspace: &str,
        entry: &AclEntry,
    ) -> Result<bool, StoreError>;

    /// Detach every entry equal to `entry`. Returns whether one was removed.
    ///
    /// # Errors
    /// [`StoreError::NodeNotFound`] when the role is missing.
    fn revoke(
        &self,
        session: &mut dyn StoreSession,
        role: &str,
        target_workspace: &str,
        entry: &AclEntry,
    ) -> Result<bool, StoreError>;

    /// # Errors
    /// [`StoreError::NodeNotFound`] when the role is missing.
    fn entries(
        &self,
        session: &dyn StoreSession,
        role: &str,
        target_workspace: &str,
    ) -> Result<Vec<AclEntry>, StoreError>;
}

/// Roles as `mgnl:role` nodes at the top of the `userroles` workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeRoleRegistry;

impl NodeRoleRegistry {
    fn role_path(role: &str) -> Result<NodePath, StoreError> {
        Ok(NodePath::root().child(role)?)
    }

    fn acl_path(role: &str, target_workspace: &str) -> Result<NodePath, StoreError> {
        Ok(Self::role_path(role)?.child(&format!("acl_{target_workspace}"))?)
    }

    fn read_entries(
        session: &dyn StoreSession,
        acl: &NodePath,
    ) -> Result<Vec<(String, AclEntry)>, StoreError> {
        if !session.node_exists(WORKSPACE_USERROLES, acl)? {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for name in session.children(WORKSPACE_USERROLES, acl)? {
            let node = acl.child(&name)?;
            let path = session.property(WORKSPACE_USERROLES, &node, "path")?;
            let code = session
                .property(WORKSPACE_USERROLES, &node, "permissions")?
                .and_then(|value| value.as_long().or_else(|| value.to_string().parse().ok()));
            match (path, code.and_then(AccessLevel::from_code)) {
                (Some(path), Some(permissions)) => {
                    out.push((name, AclEntry { path: path.to_string(), permissions }));
                }
                _ => tracing::warn!(acl = %node, "skipping malformed ACL entry"),
            }
        }
        Ok(out)
    }
}

impl RoleRegistry for NodeRoleRegistry {
    fn create_role(&self, session: &mut dyn StoreSession, role: &str) -> Result<bool, StoreError> {
        let path = Self::role_path(role)?;
        if session.node_exists(WORKSPACE_USERROLES, &path)? {
            return Ok(false);
        }
        session.add_node(WORKSPACE_USERROLES, &path, ROLE_NODE_TYPE)?;
        session.set_property(
            WORKSPACE_USERROLES,
            &path,
            ACTIVATION_STATUS,
            ActivationStatus::Activated.code().into(),
        )?;
        Ok(true)
    }

    fn role_exists(&self, session: &dyn StoreSession, role: &str) -> Result<bool, StoreError> {
        let path = Self::role_path(role)?;
        Ok(session.node_exists(WORKSPACE_USERROLES, &path)?
            && session.node_type(WORKSPACE_USERROLES, &path)? == ROLE_NODE_TYPE)
    }

    fn grant(
        &self,
        session: &mut dyn StoreSession,
        role: &str,
        target_workspace: &str,
        entry: &AclEntry,
    ) -> Result<bool, StoreError> {
        let role_path = Self::role_path(role)?;
        if !session.node_exists(WORKSPACE_USERROLES, &role_path)? {
            return Err(StoreError::not_found(WORKSPACE_USERROLES, &role_path));
        }
        let acl = Self::acl_path(role, target_workspace)?;
        let existing = Self::read_entries(&*session, &acl)?;
        if existing.iter().any(|(_, current)| current == entry) {
            return Ok(false);
        }
        session.ensure_path(WORKSPACE_USERROLES, &acl, CONTENT_NODE_TYPE, CONTENT_NODE_TYPE)?;

        let next = existing
            .iter()
            .filter_map(|(name, _)| name.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1);
        let mut node = acl.child(&next.to_string())?;
        let mut suffix = next;
        while session.node_exists(WORKSPACE_USERROLES, &node)? {
            suffix += 1;
            node = acl.child(&suffix.to_string())?;
        }
        session.add_node(WORKSPACE_USERROLES, &node, CONTENT_NODE_TYPE)?;
        session.set_property(WORKSPACE_USERROLES, &node, "path", entry.path.as_str().into())?;
        session.set_property(
            WORKSPACE_USERROLES,
            &node,
            "permissions",
            entry.permissions.code().into(),
        )?;
        Ok(true)
    }

    fn revoke(
        &self,
        session: &mut dyn StoreSession,
        role: &str,
        target_workspace: &str,
        entry: &AclEntry,
    ) -> Result<bool, StoreError> {
        let role_path = Self::role_path(role)?;
        if !session.node_exists(WORKSPACE_USERROLES, &role_path)? {
            return Err(StoreError::not_found(WORKSPACE_USERROLES, &role_path));
        }
        let acl = Self::acl_path(role, target_workspace)?;
        let mut removed = false;
        for (name, current) in Self::read_entries(&*session, &acl)? {
            if &current == entry {
                session.remove_node(WORKSPACE_USERROLES, &acl.child(&name)?)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    fn entries(
        &self,
        session: &dyn StoreSession,
        role: &str,
        target_workspace: &str,
    ) -> Result<Vec<AclEntry>, StoreError> {
        let role_path = Self::role_path(role)?;
        if !session.node_exists(WORKSPACE_USERROLES, &role_path)? {
            return Err(StoreError::not_found(WORKSPACE_USERROLES, &role_path));
        }
        let acl = Self::acl_path(role, target_workspace)?;
        Ok(Self::read_entries(session, &acl)?.into_iter().map(|(_, entry)| entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::WORKSPACE_CONFIG;

    fn p(raw: &str) -> NodePath {
        match NodePath::parse(raw) {
            Ok(path) => path,
            Err(err) => panic!("invalid fixture path {raw}: {err}"),
        }
    }

    fn store_with_app(path: &str) -> anyhow::Result<MemoryStore> {
        let mut store = MemoryStore::new();
        store.ensure_path(WORKSPACE_CONFIG, &p(path), CONTENT_NODE_TYPE, "mgnl:content")?;
        Ok(store)
    }

    #[test]
    fn ensure_access_rule_builds_voter_subtree_once() -> anyhow::Result<()> {
        let mut store = store_with_app(
            "/modules/ui-admincentral/config/appLauncherLayout/groups/target",
        )?;
        let resource = p("/modules/ui-admincentral/config/appLauncherLayout/groups/target");
        let rule = AccessRule::allow(resource.clone(), "editor");

        assert!(ensure_access_rule(&mut store, WORKSPACE_CONFIG, &rule)?);
        assert!(!ensure_access_rule(&mut store, WORKSPACE_CONFIG, &rule)?);

        let roles = resource.join("permissions/voters/allowedRoles/roles")?;
        assert_eq!(store.property_names(WORKSPACE_CONFIG, &roles)?, vec!["editor"]);
        assert_eq!(
            store.property(WORKSPACE_CONFIG, &resource.join("permissions")?, "kind")?,
            Some(PropertyValue::from(VOTER_BASED_KIND))
        );

        let definition = AccessDefinition::load(&store, WORKSPACE_CONFIG, &resource)?;
        assert!(definition.lists("editor", Voter::Allow));
        assert!(definition.is_granted(&["editor"]));
        assert!(!definition.is_granted(&["guest"]));
        Ok(())
    }

    #[test]
    fn deny_voter_wins_over_allow() -> anyhow::Result<()> {
        let mut store = store_with_app("/modules/contacts")?;
        let resource = p("/modules/contacts");
        ensure_access_rule(
            &mut store,
            WORKSPACE_CONFIG,
            &AccessRule::allow(resource.clone(), "editor"),
        )?;
        ensure_access_rule(
            &mut store,
            WORKSPACE_CONFIG,
            &AccessRule::deny(resource.clone(), "admin"),
        )?;

        let voter = resource.join("permissions/voters/deniedRoles")?;
        assert_eq!(
            store.property(WORKSPACE_CONFIG, &voter, "not")?,
            Some(PropertyValue::Boolean(true)),
        );

        let definition = AccessDefinition::load(&store, WORKSPACE_CONFIG, &resource)?;
        assert!(!definition.is_granted(&["editor", "admin"]));
        assert!(definition.is_granted(&["editor"]));
        Ok(())
    }

    #[test]
    fn resource_without_voters_is_open() -> anyhow::Result<()> {
        let store = store_with_app("/modules/pages")?;
        let definition = AccessDefinition::load(&store, WORKSPACE_CONFIG, &p("/modules/pages"))?;
        assert!(definition.voters.is_empty());
        assert!(definition.is_granted(&["anyone"]));
        Ok(())
    }

    #[test]
    fn missing_resource_is_reported() {
        let mut store = MemoryStore::new();
        let rule = AccessRule::allow(p("/modules/absent"), "editor");
        assert!(matches!(
            ensure_access_rule(&mut store, WORKSPACE_CONFIG, &rule),
            Err(StoreError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn registry_grants_without_duplicates_and_revokes() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        let registry = NodeRoleRegistry;
        assert!(registry.create_role(&mut store, "travel-demo-admincentral")?);
        assert!(!registry.create_role(&mut store, "travel-demo-admincentral")?);
        assert!(registry.role_exists(&store, "travel-demo-admincentral")?);
        assert_eq!(
            store.property(
                WORKSPACE_USERROLES,
                &p("/travel-demo-admincentral"),
                ACTIVATION_STATUS,
            )?,
            Some(PropertyValue::Long(2))
        );

        let entry = AclEntry::new("/*", AccessLevel::All);
        assert!(registry.grant(&mut store, "travel-demo-admincentral", "personas", &entry)?);
        assert!(!registry.grant(&mut store, "travel-demo-admincentral", "personas", &entry)?);
        let read = AclEntry::new("/travel", AccessLevel::Read);
        assert!(registry.grant(&mut store, "travel-demo-admincentral", "personas", &read)?);

        assert_eq!(
            store.children(WORKSPACE_USERROLES, &p("/travel-demo-admincentral/acl_personas"))?,
            vec!["0", "1"]
        );
        assert_eq!(
            registry.entries(&store, "travel-demo-admincentral", "personas")?,
            vec![entry.clone(), read.clone()]
        );

        assert!(registry.revoke(&mut store, "travel-demo-admincentral", "personas", &entry)?);
        assert_eq!(registry.entries(&store, "travel-demo-admincentral", "personas")?, vec![read]);
        Ok(())
    }

    #[test]
    fn grant_to_missing_role_fails() {
        let mut store = MemoryStore::new();
        let result =
            NodeRoleRegistry.grant(
                &mut store,
                "ghost",
                "website",
                &AclEntry::new("/", AccessLevel::Read),
            );
        assert!(matches!(result, Err(StoreError::NodeNotFound { .. })));
    }
}
