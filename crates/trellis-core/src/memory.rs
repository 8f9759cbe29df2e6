use std::collections::BTreeMap;

use crate::path::NodePath;
use crate::store::{
    PropertyValue, StoreError, StoreSession, ROOT_NODE_TYPE, WORKSPACE_CONFIG, WORKSPACE_DAM,
    WORKSPACE_USERGROUPS, WORKSPACE_USERROLES, WORKSPACE_USERS, WORKSPACE_WEBSITE,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryNode {
    pub primary_type: String,
    pub mixins: Vec<String>,
    pub properties: Vec<(String, PropertyValue)>,
    pub children: Vec<String>,
}

impl MemoryNode {
    fn new(primary_type: &str) -> Self {
        Self {
            primary_type: primary_type.to_string(),
            mixins: Vec::new(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }
}

type Tree = BTreeMap<NodePath, MemoryNode>;

/// In-memory node store with a single working session.
///
/// Changes land in a pending copy and are published to the committed copy on `save`.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    committed: BTreeMap<String, Tree>,
    pending: BTreeMap<String, Tree>,
    empty_root: MemoryNode,
    fail_next_save: Option<StoreError>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store with the standard workspaces, each holding only its root.
    #[must_use]
    pub fn new() -> Self {
        let mut committed = BTreeMap::new();
        for workspace in [
            WORKSPACE_CONFIG,
            WORKSPACE_WEBSITE,
            WORKSPACE_USERROLES,
            WORKSPACE_USERGROUPS,
            WORKSPACE_USERS,
            WORKSPACE_DAM,
        ] {
            committed.insert(workspace.to_string(), new_tree());
        }
        Self {
            pending: committed.clone(),
            committed,
            empty_root: MemoryNode::new(ROOT_NODE_TYPE),
            fail_next_save: None,
        }
    }

    /// Make the next `save` fail with `err` and leave the committed state untouched.
    pub fn fail_next_save(&mut self, err: StoreError) {
        self.fail_next_save = Some(err);
    }

    /// Drop unsaved changes.
    pub fn discard(&mut self) {
        self.pending = self.committed.clone();
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.pending != self.committed
    }

    /// Committed nodes of one workspace, keyed by path.
    #[must_use]
    pub fn committed_workspace(&self, workspace: &str) -> Option<&BTreeMap<NodePath, MemoryNode>> {
        self.committed.get(workspace)
    }

    /// Committed state of every workspace, for whole-store comparisons.
    #[must_use]
    pub fn committed_snapshot(&self) -> BTreeMap<String, BTreeMap<NodePath, MemoryNode>> {
        self.committed.clone()
    }

    fn node(&self, workspace: &str, path: &NodePath) -> Option<&MemoryNode> {
        match self.pending.get(workspace) {
            Some(tree) => tree.get(path),
            None if path.is_root() => Some(&self.empty_root),
            None => None,
        }
    }

    fn require(&self, workspace: &str, path: &NodePath) -> Result<&MemoryNode, StoreError> {
        self.node(workspace, path).ok_or_else(|| StoreError::not_found(workspace, path))
    }

    fn tree_mut(&mut self, workspace: &str) -> &mut Tree {
        self.pending.entry(workspace.to_string()).or_insert_with(new_tree)
    }

    fn require_mut(
        &mut self,
        workspace: &str,
        path: &NodePath,
    ) -> Result<&mut MemoryNode, StoreError> {
        self.tree_mut(workspace)
            .get_mut(path)
            .ok_or_else(|| StoreError::not_found(workspace, path))
    }

    fn detach(
        &mut self,
        workspace: &str,
        path: &NodePath,
    ) -> Result<Vec<(NodePath, MemoryNode)>, StoreError> {
        let parent = path.parent().ok_or_else(|| {
            StoreError::Constraint(format!("cannot detach the root of {workspace}"))
        })?;
        let name = path.name().unwrap_or_default().to_string();
        let tree = self.tree_mut(workspace);
        let keys: Vec<NodePath> = tree
            .range(path.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.as_str().starts_with(path.as_str()))
            .filter(|key| key.is_within(path))
            .cloned()
            .collect();
        let mut detached = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(node) = tree.remove(&key) {
                detached.push((key, node));
            }
        }
        if let Some(parent_node) = tree.get_mut(&parent) {
            parent_node.children.retain(|child| child != &name);
        }
        Ok(detached)
    }
}

fn new_tree() -> Tree {
    let mut tree = Tree::new();
    tree.insert(NodePath::root(), MemoryNode::new(ROOT_NODE_TYPE));
    tree
}

impl StoreSession for MemoryStore {
    fn node_exists(&self, workspace: &str, path: &NodePath) -> Result<bool, StoreError> {
        Ok(self.node(workspace, path).is_some())
    }

    fn node_type(&self, workspace: &str, path: &NodePath) -> Result<String, StoreError> {
        Ok(self.require(workspace, path)?.primary_type.clone())
    }

    fn mixins(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError> {
        Ok(self.require(workspace, path)?.mixins.clone())
    }

    fn children(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError> {
        Ok(self.require(workspace, path)?.children.clone())
    }

    fn add_node(
        &mut self,
        workspace: &str,
        path: &NodePath,
        primary_type: &str,
    ) -> Result<(), StoreError> {
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Err(StoreError::exists(workspace, path));
        };
        let name = name.to_string();
        let tree = self.tree_mut(workspace);
        if tree.contains_key(path) {
            return Err(StoreError::exists(workspace, path));
        }
        let parent_node =
            tree.get_mut(&parent).ok_or_else(|| StoreError::not_found(workspace, &parent))?;
        parent_node.children.push(name);
        tree.insert(path.clone(), MemoryNode::new(primary_type));
        Ok(())
    }

    fn remove_node(&mut self, workspace: &str, path: &NodePath) -> Result<(), StoreError> {
        self.require(workspace, path)?;
        self.detach(workspace, path)?;
        Ok(())
    }

    fn move_node(
        &mut self,
        workspace: &str,
        from: &NodePath,
        to: &NodePath,
    ) -> Result<(), StoreError> {
        self.require(workspace, from)?;
        if self.node(workspace, to).is_some() {
            return Err(StoreError::exists(workspace, to));
        }
        if to.is_within(from) {
            return Err(StoreError::Constraint(format!("cannot move {from} below itself")));
        }
        let (Some(target_parent), Some(target_name)) = (to.parent(), to.name()) else {
            return Err(StoreError::exists(workspace, to));
        };
        self.require(workspace, &target_parent)?;
        let target_name = target_name.to_string();

        let detached = self.detach(workspace, from)?;
        let tree = self.tree_mut(workspace);
        for (key, node) in detached {
            if let Some(rebased) = key.rebase(from, to) {
                tree.insert(rebased, node);
            }
        }
        if let Some(parent_node) = tree.get_mut(&target_parent) {
            parent_node.children.push(target_name);
        }
        Ok(())
    }

    fn order_before(
        &mut self,
        workspace: &str,
        path: &NodePath,
        before: Option<&str>,
    ) -> Result<(), StoreError> {
        self.require(workspace, path)?;
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Err(StoreError::Constraint("cannot reorder the root".to_string()));
        };
        let name = name.to_string();
        let parent_node = self.require_mut(workspace, &parent)?;
        if let Some(sibling) = before {
            if !parent_node.children.iter().any(|child| child == sibling) {
                return Err(StoreError::not_found(workspace, &parent.child(sibling)?));
            }
        }
        parent_node.children.retain(|child| child != &name);
        let index = before
            .and_then(|sibling| parent_node.children.iter().position(|child| child == sibling))
            .unwrap_or(parent_node.children.len());
        parent_node.children.insert(index, name);
        Ok(())
    }

    fn property(
        &self,
        workspace: &str,
        path: &NodePath,
        name: &str,
    ) -> Result<Option<PropertyValue>, StoreError> {
        Ok(self
            .require(workspace, path)?
            .properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone()))
    }

    fn property_names(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError> {
        Ok(self.require(workspace, path)?.properties.iter().map(|(key, _)| key.clone()).collect())
    }

    fn set_property(
        &mut self,
        workspace: &str,
        path: &NodePath,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError> {
        let node = self.require_mut(workspace, path)?;
        match node.properties.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => node.properties.push((name.to_string(), value)),
        }
        Ok(())
    }

    fn remove_property(
        &mut self,
        workspace: &str,
        path: &NodePath,
        name: &str,
    ) -> Result<bool, StoreError> {
        let node = self.require_mut(workspace, path)?;
        let before = node.properties.len();
        node.properties.retain(|(key, _)| key != name);
        Ok(node.properties.len() != before)
    }

    fn add_mixin(
        &mut self,
        workspace: &str,
        path: &NodePath,
        mixin: &str,
    ) -> Result<bool, StoreError> {
        let node = self.require_mut(workspace, path)?;
        if node.mixins.iter().any(|existing| existing == mixin) {
            return Ok(false);
        }
        node.mixins.push(mixin.to_string());
        Ok(true)
    }

    fn save(&mut self) -> Result<(), StoreError> {
        if let Some(err) = self.fail_next_save.take() {
            return Err(err);
        }
        self.committed = self.pending.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> NodePath {
        match NodePath::parse(raw) {
            Ok(path) => path,
            Err(err) => panic!("invalid fixture path {raw}: {err}"),
        }
    }

    #[test]
    fn add_node_requires_parent_and_rejects_duplicates() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        store.add_node("website", &p("/travel"), "mgnl:page")?;
        assert!(matches!(
            store.add_node("website", &p("/travel"), "mgnl:page"),
            Err(StoreError::NodeExists { .. })
        ));
        assert!(matches!(
            store.add_node("website", &p("/missing/child"), "mgnl:page"),
            Err(StoreError::NodeNotFound { .. })
        ));
        assert_eq!(store.node_type("website", &p("/travel"))?, "mgnl:page");
        Ok(())
    }

    #[test]
    fn unsaved_changes_stay_out_of_committed_state() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        store.add_node("config", &p("/modules"), "mgnl:content")?;
        assert!(store.has_pending_changes());
        assert!(!store
            .committed_workspace("config")
            .is_some_and(|tree| tree.contains_key(&p("/modules"))));

        store.save()?;
        assert!(!store.has_pending_changes());

        store.remove_node("config", &p("/modules"))?;
        store.discard();
        assert!(store.node_exists("config", &p("/modules"))?);
        Ok(())
    }

    #[test]
    fn failed_save_keeps_pending_state() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        store.add_node("config", &p("/modules"), "mgnl:content")?;
        store.fail_next_save(StoreError::Conflict("concurrent writer".to_string()));
        assert!(matches!(store.save(), Err(StoreError::Conflict(_))));
        assert!(store.node_exists("config", &p("/modules"))?);
        store.save()?;
        assert!(!store.has_pending_changes());
        Ok(())
    }

    #[test]
    fn remove_and_move_carry_whole_subtrees() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        store.ensure_path("website", &p("/travel/about/team"), "mgnl:page", "mgnl:page")?;
        store.add_node("website", &p("/travel-demo"), "mgnl:page")?;
        store.set_property("website", &p("/travel/about/team"), "title", "Team".into())?;

        store.move_node("website", &p("/travel/about"), &p("/travel/company"))?;
        assert!(!store.node_exists("website", &p("/travel/about/team"))?);
        assert_eq!(
            store.property("website", &p("/travel/company/team"), "title")?,
            Some(PropertyValue::from("Team"))
        );
        assert_eq!(store.children("website", &p("/travel"))?, vec!["company"]);

        store.remove_node("website", &p("/travel"))?;
        assert!(!store.node_exists("website", &p("/travel/company/team"))?);
        assert!(store.node_exists("website", &p("/travel-demo"))?);
        assert_eq!(store.children("website", &p("/"))?, vec!["travel-demo"]);
        Ok(())
    }

    #[test]
    fn order_before_reorders_siblings() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        for name in ["a", "b", "c"] {
            store.add_node("website", &p("/").child(name)?, "mgnl:page")?;
        }
        store.order_before("website", &p("/c"), Some("a"))?;
        assert_eq!(store.children("website", &p("/"))?, vec!["c", "a", "b"]);
        store.order_before("website", &p("/c"), None)?;
        assert_eq!(store.children("website", &p("/"))?, vec!["a", "b", "c"]);
        assert!(store.order_before("website", &p("/a"), Some("zzz")).is_err());
        Ok(())
    }

    #[test]
    fn has_content_ignores_system_properties() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        let site = p("/modules/site/config/site");
        store.ensure_path("config", &site, "mgnl:contentNode", "mgnl:content")?;
        store.set_property("config", &site, "mgnl:created", "2020-01-01".into())?;
        assert!(!store.has_content("config", &site)?);
        store.set_property("config", &site, "extends", "/x".into())?;
        assert!(store.has_content("config", &site)?);
        Ok(())
    }

    #[test]
    fn unknown_workspace_has_only_a_root() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        assert!(store.node_exists("personas", &p("/"))?);
        assert!(store.children("personas", &p("/"))?.is_empty());
        store.add_node("personas", &p("/anna"), "mgnl:persona")?;
        assert_eq!(store.descendants("personas", &p("/"))?, vec![p("/anna")]);
        Ok(())
    }

    #[test]
    fn mixins_are_not_duplicated() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        store.add_node("website", &p("/travel"), "mgnl:page")?;
        assert!(store.add_mixin("website", &p("/travel"), "mgnl:hasVariants")?);
        assert!(!store.add_mixin("website", &p("/travel"), "mgnl:hasVariants")?);
        assert_eq!(store.mixins("website", &p("/travel"))?, vec!["mgnl:hasVariants"]);
        Ok(())
    }
}
