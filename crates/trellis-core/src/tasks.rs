//! Reusable idempotent tasks. Each one checks the store before touching it, so running it a
//! second time is a no-op.

use crate::path::NodePath;
use crate::security::{ensure_access_rule, AccessRule, AclEntry};
use crate::store::{
    ActivationStatus, PropertyValue, StoreSession, ACTIVATION_STATUS, CONTENT_NODE_TYPE,
    WORKSPACE_CONFIG,
};
use crate::task::{InstallContext, Task, TaskError, TaskOutcome};

#[derive(Debug, Clone)]
struct TaskInfo {
    name: String,
    description: String,
}

impl TaskInfo {
    fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into() }
    }
}

macro_rules! task_info {
    () => {
        fn name(&self) -> &str {
            &self.info.name
        }

        fn description(&self) -> &str {
            &self.info.description
        }
    };
}

fn parse(raw: &str) -> Result<NodePath, TaskError> {
    Ok(NodePath::parse(raw)?)
}

fn applied_if(changed: bool, reason: &str) -> TaskOutcome {
    if changed {
        TaskOutcome::Applied
    } else {
        TaskOutcome::skipped(reason)
    }
}

/// Ensure a node exists, creating missing ancestors.
#[derive(Debug, Clone)]
pub struct EnsureNode {
    info: TaskInfo,
    workspace: String,
    path: String,
    node_type: String,
    intermediate_type: String,
}

impl EnsureNode {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        path: &str,
        node_type: &str,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            path: path.to_string(),
            node_type: node_type.to_string(),
            intermediate_type: node_type.to_string(),
        }
    }

    #[must_use]
    pub fn with_intermediate_type(mut self, node_type: &str) -> Self {
        self.intermediate_type = node_type.to_string();
        self
    }
}

impl Task for EnsureNode {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let path = parse(&self.path)?;
        let created = ctx.session().ensure_path(
            &self.workspace,
            &path,
            &self.node_type,
            &self.intermediate_type,
        )?;
        Ok(applied_if(created, "node already exists"))
    }
}

/// Set a property on a node that has no content yet.
///
/// Skipped when the node is missing, already carries the property, or has any other
/// content. System (`mgnl:`) properties do not count as content.
#[derive(Debug, Clone)]
pub struct SetPropertyIfEmpty {
    info: TaskInfo,
    workspace: String,
    path: String,
    property: String,
    value: PropertyValue,
}

impl SetPropertyIfEmpty {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        path: &str,
        property: &str,
        value: impl Into<PropertyValue>,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            path: path.to_string(),
            property: property.to_string(),
            value: value.into(),
        }
    }
}

impl Task for SetPropertyIfEmpty {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let path = parse(&self.path)?;
        let session = ctx.session();
        if !session.node_exists(&self.workspace, &path)? {
            return Ok(TaskOutcome::skipped(format!("{path} does not exist")));
        }
        if session.property(&self.workspace, &path, &self.property)?.is_some() {
            return Ok(TaskOutcome::skipped(format!("{path} already has {}", self.property)));
        }
        if session.has_content(&self.workspace, &path)? {
            return Ok(TaskOutcome::skipped(format!("{path} is not empty")));
        }
        session.set_property(&self.workspace, &path, &self.property, self.value.clone())?;
        Ok(TaskOutcome::Applied)
    }
}

/// Set a property unless it already holds the value. Optionally creates the node.
#[derive(Debug, Clone)]
pub struct SetProperty {
    info: TaskInfo,
    workspace: String,
    path: String,
    property: String,
    value: PropertyValue,
    create_with: Option<String>,
}

impl SetProperty {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        path: &str,
        property: &str,
        value: impl Into<PropertyValue>,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            path: path.to_string(),
            property: property.to_string(),
            value: value.into(),
            create_with: None,
        }
    }

    /// Create the node, and missing ancestors, with `node_type` when it is absent.
    #[must_use]
    pub fn creating(mut self, node_type: &str) -> Self {
        self.create_with = Some(node_type.to_string());
        self
    }
}

impl Task for SetProperty {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let path = parse(&self.path)?;
        let session = ctx.session();
        let mut changed = false;
        if !session.node_exists(&self.workspace, &path)? {
            let Some(node_type) = &self.create_with else {
                return Err(TaskError::PreconditionViolated(format!(
                    "{}:{path} does not exist",
                    self.workspace
                )));
            };
            changed |= session.ensure_path(&self.workspace, &path, node_type, node_type)?;
        }
        if session.property(&self.workspace, &path, &self.property)?.as_ref() != Some(&self.value) {
            session.set_property(&self.workspace, &path, &self.property, self.value.clone())?;
            changed = true;
        }
        Ok(applied_if(changed, "property already set"))
    }
}

/// Remove a subtree if and only if it exists.
#[derive(Debug, Clone)]
pub struct RemoveNode {
    info: TaskInfo,
    workspace: String,
    path: String,
}

impl RemoveNode {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        path: &str,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            path: path.to_string(),
        }
    }
}

impl Task for RemoveNode {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let path = parse(&self.path)?;
        let session = ctx.session();
        if !session.node_exists(&self.workspace, &path)? {
            return Ok(TaskOutcome::skipped(format!("{path} already absent")));
        }
        session.remove_node(&self.workspace, &path)?;
        Ok(TaskOutcome::Applied)
    }
}

/// Move or rename a node when the source exists and the target does not.
#[derive(Debug, Clone)]
pub struct MoveNode {
    info: TaskInfo,
    workspace: String,
    from: String,
    to: String,
}

impl MoveNode {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        from: &str,
        to: &str,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl Task for MoveNode {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let from = parse(&self.from)?;
        let to = parse(&self.to)?;
        let session = ctx.session();
        let source = session.node_exists(&self.workspace, &from)?;
        let target = session.node_exists(&self.workspace, &to)?;
        match (source, target) {
            (true, false) => {
                if let Some(parent) = to.parent() {
                    if !session.node_exists(&self.workspace, &parent)? {
                        return Err(TaskError::PreconditionViolated(format!(
                            "target parent {parent} does not exist"
                        )));
                    }
                }
                session.move_node(&self.workspace, &from, &to)?;
                Ok(TaskOutcome::Applied)
            }
            (true, true) => Err(TaskError::PreconditionViolated(format!(
                "both {from} and {to} exist"
            ))),
            (false, true) => Ok(TaskOutcome::skipped(format!("{from} already moved to {to}"))),
            (false, false) => Ok(TaskOutcome::skipped(format!("{from} does not exist"))),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Position {
    First,
    Before(String),
    Last,
}

/// Place a node at a position among its siblings.
#[derive(Debug, Clone)]
pub struct OrderNode {
    info: TaskInfo,
    workspace: String,
    path: String,
    position: Position,
}

impl OrderNode {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        path: &str,
        position: Position,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            path: path.to_string(),
            position,
        }
    }
}

impl Task for OrderNode {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let path = parse(&self.path)?;
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Ok(TaskOutcome::skipped("the root has no siblings"));
        };
        let session = ctx.session();
        if !session.node_exists(&self.workspace, &path)? {
            return Ok(TaskOutcome::skipped(format!("{path} does not exist")));
        }
        let siblings = session.children(&self.workspace, &parent)?;
        let index = siblings.iter().position(|sibling| sibling == name);

        let before = match &self.position {
            Position::First => {
                if index == Some(0) {
                    return Ok(TaskOutcome::skipped("already first"));
                }
                siblings.first().cloned()
            }
            Position::Last => {
                if index.is_some_and(|index| index + 1 == siblings.len()) {
                    return Ok(TaskOutcome::skipped("already last"));
                }
                None
            }
            Position::Before(sibling) => {
                let Some(target) = siblings.iter().position(|candidate| candidate == sibling) else {
                    return Err(TaskError::PreconditionViolated(format!(
                        "sibling {sibling} of {path} does not exist"
                    )));
                };
                if index.is_some_and(|index| index + 1 == target) {
                    return Ok(TaskOutcome::skipped(format!("already before {sibling}")));
                }
                Some(sibling.clone())
            }
        };
        session.order_before(&self.workspace, &path, before.as_deref())?;
        Ok(TaskOutcome::Applied)
    }
}

/// Add a mixin type to a node unless it is already present.
#[derive(Debug, Clone)]
pub struct AddMixin {
    info: TaskInfo,
    workspace: String,
    path: String,
    mixin: String,
}

impl AddMixin {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        path: &str,
        mixin: &str,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            path: path.to_string(),
            mixin: mixin.to_string(),
        }
    }
}

impl Task for AddMixin {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let path = parse(&self.path)?;
        let session = ctx.session();
        if !session.node_exists(&self.workspace, &path)? {
            return Err(TaskError::PreconditionViolated(format!(
                "{}:{path} does not exist",
                self.workspace
            )));
        }
        let added = session.add_mixin(&self.workspace, &path, &self.mixin)?;
        Ok(applied_if(added, "mixin already present"))
    }
}

fn activate(
    session: &mut dyn StoreSession,
    workspace: &str,
    path: &NodePath,
) -> Result<bool, TaskError> {
    let activated = PropertyValue::Long(ActivationStatus::Activated.code());
    if session.property(workspace, path, ACTIVATION_STATUS)?.as_ref() == Some(&activated) {
        return Ok(false);
    }
    session.set_property(workspace, path, ACTIVATION_STATUS, activated)?;
    Ok(true)
}

/// Mark nodes and their ancestors as activated.
#[derive(Debug, Clone)]
pub struct ActivateNodes {
    info: TaskInfo,
    workspace: String,
    paths: Vec<String>,
}

impl ActivateNodes {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        paths: &[&str],
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            paths: paths.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Task for ActivateNodes {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let mut changed = false;
        for raw in &self.paths {
            let path = parse(raw)?;
            if !ctx.session().node_exists(&self.workspace, &path)? {
                ctx.precondition_violated(format!("{}:{path} does not exist", self.workspace));
                continue;
            }
            let mut chain = vec![path.clone()];
            chain.extend(path.ancestors().into_iter().filter(|ancestor| !ancestor.is_root()));
            for node in chain.iter().rev() {
                changed |= activate(ctx.session(), &self.workspace, node)?;
            }
        }
        Ok(applied_if(changed, "already activated"))
    }
}

/// Activate every node of a type below a root.
#[derive(Debug, Clone)]
pub struct ActivateTree {
    info: TaskInfo,
    workspace: String,
    root: String,
    node_type: Option<String>,
}

impl ActivateTree {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        root: &str,
        node_type: Option<&str>,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: workspace.to_string(),
            root: root.to_string(),
            node_type: node_type.map(ToString::to_string),
        }
    }
}

impl Task for ActivateTree {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let root = parse(&self.root)?;
        let session = ctx.session();
        if !session.node_exists(&self.workspace, &root)? {
            return Ok(TaskOutcome::skipped(format!("{root} does not exist")));
        }
        let mut nodes = session.descendants(&self.workspace, &root)?;
        if !root.is_root() {
            nodes.insert(0, root);
        }
        let mut changed = false;
        for node in nodes {
            if let Some(node_type) = &self.node_type {
                if &session.node_type(&self.workspace, &node)? != node_type {
                    continue;
                }
            }
            changed |= activate(session, &self.workspace, &node)?;
        }
        Ok(applied_if(changed, "already activated"))
    }
}

/// Materialize voter-based access rules on `config` resources.
///
/// A rule whose resource is missing is recorded as a violated precondition and the
/// remaining rules still apply.
#[derive(Debug, Clone)]
pub struct ProvisionAccess {
    info: TaskInfo,
    workspace: String,
    rules: Vec<AccessRule>,
}

impl ProvisionAccess {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        rules: Vec<AccessRule>,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            workspace: WORKSPACE_CONFIG.to_string(),
            rules,
        }
    }
}

impl Task for ProvisionAccess {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let mut changed = false;
        for rule in &self.rules {
            if !ctx.session().node_exists(&self.workspace, &rule.resource)? {
                ctx.precondition_violated(format!(
                    "cannot grant {} access on missing {}",
                    rule.role, rule.resource
                ));
                continue;
            }
            changed |= ensure_access_rule(ctx.session(), &self.workspace, rule)?;
        }
        Ok(applied_if(changed, "access rules already present"))
    }
}

/// Add roles to an app's `permissions/roles` list. Skipped when the app is absent.
#[derive(Debug, Clone)]
pub struct AddRolesToPermissions {
    info: TaskInfo,
    app: String,
    roles: Vec<String>,
}

impl AddRolesToPermissions {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        app: &str,
        roles: &[&str],
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            app: app.to_string(),
            roles: roles.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Task for AddRolesToPermissions {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let app = parse(&self.app)?;
        let session = ctx.session();
        if !session.node_exists(WORKSPACE_CONFIG, &app)? {
            return Ok(TaskOutcome::skipped(format!("{app} is not installed")));
        }
        let roles = app.join("permissions/roles")?;
        let mut changed =
            session.ensure_path(WORKSPACE_CONFIG, &roles, CONTENT_NODE_TYPE, CONTENT_NODE_TYPE)?;
        for role in &self.roles {
            let value = PropertyValue::from(role.as_str());
            if session.property(WORKSPACE_CONFIG, &roles, role)?.as_ref() != Some(&value) {
                session.set_property(WORKSPACE_CONFIG, &roles, role, value)?;
                changed = true;
            }
        }
        Ok(applied_if(changed, "roles already listed"))
    }
}

/// Create an activated role if missing.
#[derive(Debug, Clone)]
pub struct CreateRole {
    info: TaskInfo,
    role: String,
}

impl CreateRole {
    pub fn new(name: impl Into<String>, description: impl Into<String>, role: &str) -> Self {
        Self { info: TaskInfo::new(name, description), role: role.to_string() }
    }
}

impl Task for CreateRole {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let created = ctx.create_role(&self.role)?;
        Ok(applied_if(created, "role already exists"))
    }
}

/// Grant ACL entries to an existing role.
#[derive(Debug, Clone)]
pub struct GrantPermission {
    info: TaskInfo,
    role: String,
    target_workspace: String,
    entries: Vec<AclEntry>,
}

impl GrantPermission {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        role: &str,
        target_workspace: &str,
        entries: Vec<AclEntry>,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            role: role.to_string(),
            target_workspace: target_workspace.to_string(),
            entries,
        }
    }
}

impl Task for GrantPermission {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        if !ctx.role_exists(&self.role)? {
            return Err(TaskError::PreconditionViolated(format!(
                "role {} does not exist",
                self.role
            )));
        }
        let mut changed = false;
        for entry in &self.entries {
            changed |= ctx.grant(&self.role, &self.target_workspace, entry)?;
        }
        Ok(applied_if(changed, "entries already granted"))
    }
}

/// A content node to install.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeSpec {
    pub path: String,
    pub node_type: String,
    pub properties: Vec<(String, PropertyValue)>,
    pub activation: Option<ActivationStatus>,
}

impl NodeSpec {
    pub fn new(path: &str, node_type: &str) -> Self {
        Self {
            path: path.to_string(),
            node_type: node_type.to_string(),
            properties: Vec::new(),
            activation: None,
        }
    }

    #[must_use]
    pub fn property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.push((name.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn activated(mut self) -> Self {
        self.activation = Some(ActivationStatus::Activated);
        self
    }
}

/// Install a set of content nodes. Pieces that already exist are left alone, so a partial
/// earlier installation is completed rather than duplicated.
#[derive(Debug, Clone)]
pub struct InstallNodes {
    info: TaskInfo,
    workspace: String,
    nodes: Vec<NodeSpec>,
}

impl InstallNodes {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        workspace: &str,
        nodes: Vec<NodeSpec>,
    ) -> Self {
        Self { info: TaskInfo::new(name, description), workspace: workspace.to_string(), nodes }
    }
}

impl Task for InstallNodes {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        let session = ctx.session();
        let mut changed = false;
        for spec in &self.nodes {
            let path = parse(&spec.path)?;
            changed |=
                session.ensure_path(&self.workspace, &path, &spec.node_type, &spec.node_type)?;
            for (name, value) in &spec.properties {
                if session.property(&self.workspace, &path, name)?.is_none() {
                    session.set_property(&self.workspace, &path, name, value.clone())?;
                    changed = true;
                }
            }
            if let Some(status) = spec.activation {
                if session.property(&self.workspace, &path, ACTIVATION_STATUS)?.is_none() {
                    session.set_property(
                        &self.workspace,
                        &path,
                        ACTIVATION_STATUS,
                        status.code().into(),
                    )?;
                    changed = true;
                }
            }
        }
        Ok(applied_if(changed, "content already installed"))
    }
}

/// A predicate over the store, evaluated when a [`Conditional`] runs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Condition {
    NodeExists { workspace: String, path: String },
    PropertyEquals { workspace: String, path: String, property: String, value: PropertyValue },
    ModuleInstalled(String),
    /// `config:/server` has `admin = true`.
    AuthorInstance,
    CleanInstall,
    Not(Box<Condition>),
    All(Vec<Condition>),
}

impl Condition {
    #[must_use]
    pub fn node_exists(workspace: &str, path: &str) -> Self {
        Self::NodeExists { workspace: workspace.to_string(), path: path.to_string() }
    }

    #[must_use]
    pub fn module_installed(module: &str) -> Self {
        Self::ModuleInstalled(module.to_string())
    }

    #[must_use]
    pub fn not(condition: Self) -> Self {
        Self::Not(Box::new(condition))
    }

    /// # Errors
    /// Propagates store failures and invalid paths.
    pub fn evaluate(&self, ctx: &InstallContext<'_>) -> Result<bool, TaskError> {
        let session = ctx.read_session();
        match self {
            Self::NodeExists { workspace, path } => {
                Ok(session.node_exists(workspace, &parse(path)?)?)
            }
            Self::PropertyEquals { workspace, path, property, value } => {
                let path = parse(path)?;
                if !session.node_exists(workspace, &path)? {
                    return Ok(false);
                }
                Ok(session.property(workspace, &path, property)?.as_ref() == Some(value))
            }
            Self::ModuleInstalled(module) => Ok(ctx.module_installed(module)?),
            Self::AuthorInstance => {
                let server = NodePath::root().child("server")?;
                if !session.node_exists(WORKSPACE_CONFIG, &server)? {
                    return Ok(false);
                }
                Ok(session
                    .property(WORKSPACE_CONFIG, &server, "admin")?
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false))
            }
            Self::CleanInstall => Ok(ctx.is_clean_install()),
            Self::Not(inner) => Ok(!inner.evaluate(ctx)?),
            Self::All(conditions) => {
                for condition in conditions {
                    if !condition.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

fn run_nested(
    tasks: &[Box<dyn Task>],
    ctx: &mut InstallContext<'_>,
) -> Result<TaskOutcome, TaskError> {
    let mut outcome = TaskOutcome::skipped("nothing to do");
    for task in tasks {
        let next = match task.execute(ctx) {
            Ok(next) => next,
            Err(TaskError::PreconditionViolated(detail)) => {
                ctx.precondition_violated(format!("{}: {detail}", task.name()));
                continue;
            }
            Err(err) => return Err(TaskError::Failed(format!("{}: {err}", task.name()))),
        };
        if let TaskOutcome::Warning { message } = &next {
            ctx.warn(format!("{}: {message}", task.name()));
            outcome = outcome.merge(TaskOutcome::Applied);
            continue;
        }
        outcome = outcome.merge(next);
    }
    Ok(outcome)
}

/// Run nested tasks only when a condition holds.
pub struct Conditional {
    info: TaskInfo,
    condition: Condition,
    tasks: Vec<Box<dyn Task>>,
    otherwise: Vec<Box<dyn Task>>,
}

impl Conditional {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        condition: Condition,
    ) -> Self {
        Self {
            info: TaskInfo::new(name, description),
            condition,
            tasks: Vec::new(),
            otherwise: Vec::new(),
        }
    }

    #[must_use]
    pub fn then(mut self, task: impl Task + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    #[must_use]
    pub fn otherwise(mut self, task: impl Task + 'static) -> Self {
        self.otherwise.push(Box::new(task));
        self
    }
}

impl Task for Conditional {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        if self.condition.evaluate(ctx)? {
            run_nested(&self.tasks, ctx)
        } else if self.otherwise.is_empty() {
            Ok(TaskOutcome::skipped("condition not met"))
        } else {
            run_nested(&self.otherwise, ctx)
        }
    }
}

/// Several tasks that form one catalog entry.
pub struct TaskGroup {
    info: TaskInfo,
    tasks: Vec<Box<dyn Task>>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { info: TaskInfo::new(name, description), tasks: Vec::new() }
    }

    #[must_use]
    pub fn with(mut self, task: impl Task + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }
}

impl Task for TaskGroup {
    task_info!();

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        run_nested(&self.tasks, ctx)
    }
}
