use std::collections::{BTreeSet, HashSet};
use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::engine::DescriptorLocation;
use crate::path::PathError;
use crate::security::{AclEntry, RoleRegistry};
use crate::store::{StoreError, StoreSession};
use crate::version::{Version, VersionParseError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Applied,
    Skipped { reason: String },
    Warning { message: String },
}

impl TaskOutcome {
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped { reason: reason.into() }
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning { message: message.into() }
    }

    /// Fold a nested outcome into this one. `Applied` beats `Skipped`; a warning is kept.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (warning @ Self::Warning { .. }, _) | (_, warning @ Self::Warning { .. }) => warning,
            (Self::Applied, _) | (_, Self::Applied) => Self::Applied,
            (skipped @ Self::Skipped { .. }, Self::Skipped { .. }) => skipped,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TaskError {
    /// Non-fatal: the engine records a warning and continues.
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("{0}")]
    Failed(String),
}

/// One idempotent unit of upgrade work.
pub trait Task: Send + Sync {
    /// Identifier, unique within a catalog.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// # Errors
    /// [`TaskError::PreconditionViolated`] is recorded as a warning; any other error halts
    /// the run.
    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError>;
}

type TaskFn = dyn Fn(&mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> + Send + Sync;

/// A task backed by a closure.
pub struct FnTask {
    name: String,
    description: String,
    run: Box<TaskFn>,
}

impl FnTask {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> + Send + Sync + 'static,
    {
        Self { name: name.into(), description: description.into(), run: Box::new(run) }
    }
}

impl Debug for FnTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&self, ctx: &mut InstallContext<'_>) -> Result<TaskOutcome, TaskError> {
        (self.run)(ctx)
    }
}

/// A non-fatal condition recorded while a task runs.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskWarning {
    Notice(String),
    PreconditionViolated(String),
}

/// What a task sees while it runs.
pub struct InstallContext<'a> {
    session: &'a mut dyn StoreSession,
    roles: &'a dyn RoleRegistry,
    descriptor: &'a DescriptorLocation,
    module: &'a str,
    current: Option<&'a Version>,
    target: &'a Version,
    warnings: Vec<TaskWarning>,
}

impl<'a> InstallContext<'a> {
    pub fn new(
        session: &'a mut dyn StoreSession,
        roles: &'a dyn RoleRegistry,
        descriptor: &'a DescriptorLocation,
        module: &'a str,
        current: Option<&'a Version>,
        target: &'a Version,
    ) -> Self {
        Self { session, roles, descriptor, module, current, target, warnings: Vec::new() }
    }

    pub fn session(&mut self) -> &mut dyn StoreSession {
        &mut *self.session
    }

    #[must_use]
    pub fn read_session(&self) -> &dyn StoreSession {
        &*self.session
    }

    #[must_use]
    pub fn module(&self) -> &str {
        self.module
    }

    #[must_use]
    pub fn current_version(&self) -> Option<&Version> {
        self.current
    }

    #[must_use]
    pub fn target_version(&self) -> &Version {
        self.target
    }

    #[must_use]
    pub fn is_clean_install(&self) -> bool {
        self.current.is_none()
    }

    #[must_use]
    pub fn descriptor(&self) -> &DescriptorLocation {
        self.descriptor
    }

    /// Record a non-fatal message; the task keeps running.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(TaskWarning::Notice(message.into()));
    }

    /// Record that part of the task could not apply because the store lacks what it needs.
    pub fn precondition_violated(&mut self, detail: impl Into<String>) {
        self.warnings.push(TaskWarning::PreconditionViolated(detail.into()));
    }

    /// Warnings recorded so far, oldest first.
    #[must_use]
    pub fn warnings(&self) -> &[TaskWarning] {
        &self.warnings
    }

    pub(crate) fn take_warnings(&mut self) -> Vec<TaskWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// # Errors
    /// Propagates store failures.
    pub fn create_role(&mut self, role: &str) -> Result<bool, StoreError> {
        let roles = self.roles;
        roles.create_role(&mut *self.session, role)
    }

    /// # Errors
    /// Propagates store failures.
    pub fn role_exists(&self, role: &str) -> Result<bool, StoreError> {
        self.roles.role_exists(&*self.session, role)
    }

    /// # Errors
    /// [`StoreError::NodeNotFound`] when the role is missing.
    pub fn grant(
        &mut self,
        role: &str,
        target_workspace: &str,
        entry: &AclEntry,
    ) -> Result<bool, StoreError> {
        let roles = self.roles;
        roles.grant(&mut *self.session, role, target_workspace, entry)
    }

    /// `true` when a descriptor node exists for `module`.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn module_installed(&self, module: &str) -> Result<bool, StoreError> {
        let path = self.descriptor.descriptor_path(module)?;
        self.session.node_exists(&self.descriptor.workspace, &path)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CatalogError {
    #[error("module name must not be blank")]
    BlankModule,
    #[error("invalid version: {0}")]
    InvalidVersion(#[from] VersionParseError),
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("task `{task}` targets {version}, beyond latest version {latest}")]
    BeyondLatest { task: String, version: Version, latest: Version },
    #[error("release {version} is beyond latest version {latest}")]
    ReleaseBeyondLatest { version: Version, latest: Version },
    #[error("task name `{0}` is registered twice")]
    DuplicateTask(String),
}

pub struct CatalogEntry {
    pub version: Version,
    pub task: Box<dyn Task>,
}

impl Debug for CatalogEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("version", &self.version)
            .field("task", &self.task.name())
            .finish()
    }
}

/// Planned step, as reported before or instead of executing.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlannedTask {
    pub task: String,
    pub description: String,
    pub version: Version,
}

/// The version-tagged tasks of one module, ordered by version then declaration.
#[derive(Debug)]
pub struct TaskCatalog {
    module: String,
    latest: Version,
    releases: BTreeSet<Version>,
    entries: Vec<CatalogEntry>,
}

impl TaskCatalog {
    #[must_use]
    pub fn builder(module: impl Into<String>, latest: &str) -> CatalogBuilder {
        CatalogBuilder {
            module: module.into(),
            latest: latest.to_string(),
            releases: Vec::new(),
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    #[must_use]
    pub fn latest(&self) -> &Version {
        &self.latest
    }

    pub fn releases(&self) -> impl Iterator<Item = &Version> {
        self.releases.iter()
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// A version is recognized when its numbers match a known release no newer than latest.
    #[must_use]
    pub fn is_recognized(&self, version: &Version) -> bool {
        version.release() <= self.latest.release()
            && self.releases.iter().any(|release| release.same_release(version))
    }

    /// Entries that must run when upgrading from `current`. `None` selects everything.
    ///
    /// # Errors
    /// Returns the offending version when it is not recognized.
    pub fn select(&self, current: Option<&Version>) -> Result<Vec<&CatalogEntry>, Version> {
        match current {
            None => Ok(self.entries.iter().collect()),
            Some(version) if !self.is_recognized(version) => Err(version.clone()),
            Some(version) => {
                Ok(self.entries.iter().filter(|entry| entry.version > *version).collect())
            }
        }
    }

    /// # Errors
    /// Returns the offending version when it is not recognized.
    pub fn plan(&self, current: Option<&Version>) -> Result<Vec<PlannedTask>, Version> {
        Ok(self
            .select(current)?
            .into_iter()
            .map(|entry| PlannedTask {
                task: entry.task.name().to_string(),
                description: entry.task.description().to_string(),
                version: entry.version.clone(),
            })
            .collect())
    }
}

pub struct CatalogBuilder {
    module: String,
    latest: String,
    releases: Vec<String>,
    tasks: Vec<(String, Box<dyn Task>)>,
}

impl CatalogBuilder {
    /// Declare a release that has no tasks of its own.
    #[must_use]
    pub fn release(mut self, version: &str) -> Self {
        self.releases.push(version.to_string());
        self
    }

    #[must_use]
    pub fn task(mut self, version: &str, task: impl Task + 'static) -> Self {
        self.tasks.push((version.to_string(), Box::new(task)));
        self
    }

    #[must_use]
    pub fn boxed_task(mut self, version: &str, task: Box<dyn Task>) -> Self {
        self.tasks.push((version.to_string(), task));
        self
    }

    /// # Errors
    /// See [`CatalogError`].
    pub fn build(self) -> Result<TaskCatalog, CatalogError> {
        if self.module.trim().is_empty() {
            return Err(CatalogError::BlankModule);
        }
        let latest = Version::parse(&self.latest)?;

        let mut releases = BTreeSet::new();
        releases.insert(latest.clone());
        for raw in &self.releases {
            let version = Version::parse(raw)?;
            if version > latest {
                return Err(CatalogError::ReleaseBeyondLatest { version, latest });
            }
            releases.insert(version);
        }

        let mut names = HashSet::new();
        let mut entries = Vec::with_capacity(self.tasks.len());
        for (raw, task) in self.tasks {
            let version = Version::parse(&raw)?;
            if version > latest {
                return Err(CatalogError::BeyondLatest {
                    task: task.name().to_string(),
                    version,
                    latest,
                });
            }
            if !names.insert(task.name().to_string()) {
                return Err(CatalogError::DuplicateTask(task.name().to_string()));
            }
            releases.insert(version.clone());
            entries.push(CatalogEntry { version, task });
        }
        entries.sort_by(|lhs, rhs| lhs.version.cmp(&rhs.version));

        Ok(TaskCatalog { module: self.module, latest, releases, entries })
    }
}
