use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::path::{NodePath, PathError};
use crate::security::RoleRegistry;
use crate::store::{PropertyValue, StoreError, StoreSession, CONTENT_NODE_TYPE, WORKSPACE_CONFIG};
use crate::task::{
    CatalogEntry, InstallContext, PlannedTask, TaskCatalog, TaskError, TaskOutcome, TaskWarning,
};
use crate::version::Version;

const MODULE_NODE_TYPE: &str = "mgnl:content";

/// Where a module's installed version is stamped.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DescriptorLocation {
    pub workspace: String,
    pub modules_root: NodePath,
    pub version_property: String,
}

impl Default for DescriptorLocation {
    fn default() -> Self {
        Self {
            workspace: WORKSPACE_CONFIG.to_string(),
            modules_root: NodePath::root().child("modules").unwrap_or_else(|_| NodePath::root()),
            version_property: "version".to_string(),
        }
    }
}

impl DescriptorLocation {
    /// # Errors
    /// [`PathError::InvalidName`] when `module` is not a valid node name.
    pub fn descriptor_path(&self, module: &str) -> Result<NodePath, PathError> {
        self.modules_root.child(module)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    DetectingVersion,
    SelectingTasks,
    ExecutingTasks,
    Committing,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationError {
    #[error("installed version {version} is not a recognized release: {detail}")]
    VersionUnrecognized { version: String, detail: String },
    #[error("task `{task}` precondition violated: {detail}")]
    PreconditionViolated { task: String, detail: String },
    #[error("task `{task}` failed: {detail}")]
    TaskExecution { task: String, detail: String },
    #[error("commit conflict: {detail}")]
    CommitConflict { detail: String },
    #[error("store error: {detail}")]
    Store { detail: String },
}

impl MigrationError {
    /// Fatal errors end the run; only precondition violations are recorded and skipped.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::PreconditionViolated { .. })
    }

    /// A retry from the same starting version may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommitConflict { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationMessage {
    pub level: MessageLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MigrationError>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Applied,
    Skipped,
    Warning,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskReport {
    pub task: String,
    pub description: String,
    pub version: Version,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything a finished run reports. Nothing escapes a run except through this value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationResult {
    pub run_id: Ulid,
    pub module: String,
    pub status: RunStatus,
    pub from_version: Option<Version>,
    pub target_version: Version,
    /// The stamp left in the store: `target_version` on commit, `from_version` otherwise.
    pub installed_version: Option<Version>,
    pub executed: Vec<TaskReport>,
    pub messages: Vec<MigrationMessage>,
    pub error: Option<MigrationError>,
    pub states: Vec<RunState>,
}

impl MigrationResult {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.status == RunStatus::Committed
    }

    pub fn warnings(&self) -> impl Iterator<Item = &MigrationMessage> {
        self.messages.iter().filter(|message| message.level == MessageLevel::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &MigrationMessage> {
        self.messages.iter().filter(|message| message.level == MessageLevel::Error)
    }

    /// Reports of tasks that changed the store.
    pub fn applied(&self) -> impl Iterator<Item = &TaskReport> {
        self.executed.iter().filter(|report| report.status == TaskStatus::Applied)
    }
}

/// Runs one module catalog against a store session.
#[derive(Debug)]
pub struct MigrationEngine<'c> {
    catalog: &'c TaskCatalog,
    descriptor: DescriptorLocation,
}

impl<'c> MigrationEngine<'c> {
    #[must_use]
    pub fn new(catalog: &'c TaskCatalog) -> Self {
        Self { catalog, descriptor: DescriptorLocation::default() }
    }

    #[must_use]
    pub fn with_descriptor(mut self, descriptor: DescriptorLocation) -> Self {
        self.descriptor = descriptor;
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &TaskCatalog {
        self.catalog
    }

    /// Read the installed version stamp. A missing descriptor or property means no
    /// installation.
    ///
    /// # Errors
    /// [`MigrationError::VersionUnrecognized`] for an unparsable stamp,
    /// [`MigrationError::Store`] when the store cannot be read.
    pub fn detect(&self, session: &dyn StoreSession) -> Result<Option<Version>, MigrationError> {
        let store_err = |err: StoreError| MigrationError::Store { detail: err.to_string() };
        let path = self
            .descriptor
            .descriptor_path(self.catalog.module())
            .map_err(|err| MigrationError::Store { detail: err.to_string() })?;
        let Some(raw) = session
            .string_property(&self.descriptor.workspace, &path, &self.descriptor.version_property)
            .map_err(store_err)?
        else {
            return Ok(None);
        };
        Version::parse(&raw).map(Some).map_err(|err| MigrationError::VersionUnrecognized {
            version: raw.clone(),
            detail: err.to_string(),
        })
    }

    /// The ordered tasks a run from `current` would execute.
    ///
    /// # Errors
    /// [`MigrationError::VersionUnrecognized`] when `current` is not a known release.
    pub fn plan(&self, current: Option<&Version>) -> Result<Vec<PlannedTask>, MigrationError> {
        self.catalog.plan(current).map_err(|version| unrecognized(self.catalog, &version))
    }

    /// Detect the installed version, then migrate.
    pub fn run(
        &self,
        session: &mut dyn StoreSession,
        roles: &dyn RoleRegistry,
    ) -> MigrationResult {
        let mut run = Run::new(self.catalog);
        run.enter(RunState::DetectingVersion);
        match self.detect(&*session) {
            Ok(current) => self.execute(run, current, session, roles),
            Err(err) => run.fail(err, None),
        }
    }

    /// Migrate from an explicitly given version; `None` is a clean install.
    pub fn run_from(
        &self,
        current: Option<Version>,
        session: &mut dyn StoreSession,
        roles: &dyn RoleRegistry,
    ) -> MigrationResult {
        self.execute(Run::new(self.catalog), current, session, roles)
    }

    fn execute(
        &self,
        mut run: Run,
        current: Option<Version>,
        session: &mut dyn StoreSession,
        roles: &dyn RoleRegistry,
    ) -> MigrationResult {
        let catalog = self.catalog;
        let from = current.as_ref().map_or_else(|| "none".to_string(), ToString::to_string);
        tracing::info!(
            run_id = %run.run_id,
            module = catalog.module(),
            from = %from,
            to = %catalog.latest(),
            "migration run started"
        );

        run.enter(RunState::SelectingTasks);
        let plan = match catalog.select(current.as_ref()) {
            Ok(plan) => plan,
            Err(version) => return run.fail(unrecognized(catalog, &version), current),
        };
        tracing::debug!(run_id = %run.run_id, tasks = plan.len(), "tasks selected");

        if !plan.is_empty() {
            run.enter(RunState::ExecutingTasks);
        }
        for entry in plan {
            if let Err(err) = self.execute_task(&mut run, entry, current.as_ref(), session, roles) {
                if let Err(save_err) = session.save() {
                    run.message(
                        MessageLevel::Error,
                        None,
                        format!("saving partial progress failed: {save_err}"),
                        None,
                    );
                }
                return run.fail(err, current);
            }
        }

        run.enter(RunState::Committing);
        match self.commit(session, catalog.latest()) {
            Ok(()) => run.commit(current),
            Err(err) => run.fail(err, current),
        }
    }

    fn execute_task(
        &self,
        run: &mut Run,
        entry: &CatalogEntry,
        current: Option<&Version>,
        session: &mut dyn StoreSession,
        roles: &dyn RoleRegistry,
    ) -> Result<(), MigrationError> {
        let name = entry.task.name().to_string();
        let mut ctx = InstallContext::new(
            session,
            roles,
            &self.descriptor,
            self.catalog.module(),
            current,
            self.catalog.latest(),
        );
        let result = catch_unwind(AssertUnwindSafe(|| entry.task.execute(&mut ctx)));
        let warnings = ctx.take_warnings();
        drop(ctx);

        for warning in warnings {
            run.task_warning(&name, warning);
        }

        let (status, detail) = match result {
            Ok(Ok(TaskOutcome::Applied)) => {
                tracing::info!(run_id = %run.run_id, task = %name, "task applied");
                (TaskStatus::Applied, None)
            }
            Ok(Ok(TaskOutcome::Skipped { reason })) => {
                tracing::debug!(run_id = %run.run_id, task = %name, %reason, "task skipped");
                (TaskStatus::Skipped, Some(reason))
            }
            Ok(Ok(TaskOutcome::Warning { message })) => {
                run.task_warning(&name, TaskWarning::Notice(message.clone()));
                (TaskStatus::Warning, Some(message))
            }
            Ok(Err(TaskError::PreconditionViolated(detail))) => {
                run.task_warning(&name, TaskWarning::PreconditionViolated(detail.clone()));
                (TaskStatus::Warning, Some(detail))
            }
            Ok(Err(err)) => {
                return Err(run.task_failed(entry, err.to_string()));
            }
            Err(payload) => {
                return Err(
                    run.task_failed(entry, format!("panicked: {}", panic_message(&*payload))),
                );
            }
        };
        run.executed.push(TaskReport {
            task: name,
            description: entry.task.description().to_string(),
            version: entry.version.clone(),
            status,
            detail,
        });
        Ok(())
    }

    fn commit(
        &self,
        session: &mut dyn StoreSession,
        target: &Version,
    ) -> Result<(), MigrationError> {
        let workspace = self.descriptor.workspace.as_str();
        let property = self.descriptor.version_property.as_str();
        let store_err = |err: StoreError| MigrationError::Store { detail: err.to_string() };
        let path = self
            .descriptor
            .descriptor_path(self.catalog.module())
            .map_err(|err| MigrationError::Store { detail: err.to_string() })?;

        let previous = session.string_property(workspace, &path, property).map_err(store_err)?;
        session
            .ensure_path(workspace, &path, MODULE_NODE_TYPE, CONTENT_NODE_TYPE)
            .map_err(store_err)?;
        session
            .set_property(workspace, &path, property, PropertyValue::String(target.to_string()))
            .map_err(store_err)?;

        if let Err(err) = session.save() {
            let restored = match previous {
                Some(value) => session.set_property(workspace, &path, property, value.into()),
                None => session.remove_property(workspace, &path, property).map(|_| ()),
            };
            if let Err(restore_err) = restored {
                tracing::error!(error = %restore_err, "restoring the version stamp failed");
            }
            return Err(MigrationError::CommitConflict { detail: err.to_string() });
        }
        Ok(())
    }
}

/// Run `catalog` from `current` against `session`. `None` is a clean install.
pub fn run_migration(
    current: Option<Version>,
    catalog: &TaskCatalog,
    session: &mut dyn StoreSession,
    roles: &dyn RoleRegistry,
) -> MigrationResult {
    MigrationEngine::new(catalog).run_from(current, session, roles)
}

fn unrecognized(catalog: &TaskCatalog, version: &Version) -> MigrationError {
    let detail = if version.release() > catalog.latest().release() {
        format!("newer than latest version {}", catalog.latest())
    } else {
        format!("not a release of {}", catalog.module())
    };
    MigrationError::VersionUnrecognized { version: version.to_string(), detail }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Run {
    run_id: Ulid,
    module: String,
    target: Version,
    executed: Vec<TaskReport>,
    messages: Vec<MigrationMessage>,
    states: Vec<RunState>,
}

impl Run {
    fn new(catalog: &TaskCatalog) -> Self {
        Self {
            run_id: Ulid::new(),
            module: catalog.module().to_string(),
            target: catalog.latest().clone(),
            executed: Vec::new(),
            messages: Vec::new(),
            states: vec![RunState::Idle],
        }
    }

    fn enter(&mut self, state: RunState) {
        tracing::debug!(run_id = %self.run_id, module = %self.module, ?state, "run state");
        self.states.push(state);
    }

    fn message(
        &mut self,
        level: MessageLevel,
        task: Option<&str>,
        text: String,
        error: Option<MigrationError>,
    ) {
        self.messages.push(
            MigrationMessage { level, task: task.map(ToString::to_string), text, error },
        );
    }

    fn task_warning(&mut self, task: &str, warning: TaskWarning) {
        let (text, error) = match warning {
            TaskWarning::Notice(text) => (text, None),
            TaskWarning::PreconditionViolated(detail) => (
                format!("precondition violated: {detail}"),
                Some(MigrationError::PreconditionViolated { task: task.to_string(), detail }),
            ),
        };
        tracing::warn!(run_id = %self.run_id, module = %self.module, task, "{text}");
        self.message(MessageLevel::Warning, Some(task), text, error);
    }

    fn task_failed(&mut self, entry: &CatalogEntry, detail: String) -> MigrationError {
        let task = entry.task.name();
        self.executed.push(TaskReport {
            task: task.to_string(),
            description: entry.task.description().to_string(),
            version: entry.version.clone(),
            status: TaskStatus::Failed,
            detail: Some(detail.clone()),
        });
        MigrationError::TaskExecution { task: task.to_string(), detail }
    }

    fn fail(mut self, error: MigrationError, current: Option<Version>) -> MigrationResult {
        tracing::error!(
            run_id = %self.run_id,
            module = %self.module,
            error = %error,
            "migration run failed"
        );
        let task = match &error {
            MigrationError::TaskExecution { task, .. } => Some(task.clone()),
            _ => None,
        };
        self.message(MessageLevel::Error, task.as_deref(), error.to_string(), Some(error.clone()));
        self.enter(RunState::Failed);
        self.finish(RunStatus::Failed, current.clone(), current, Some(error))
    }

    fn commit(mut self, current: Option<Version>) -> MigrationResult {
        let applied =
            self.executed.iter().filter(|report| report.status == TaskStatus::Applied).count();
        tracing::info!(
            run_id = %self.run_id,
            module = %self.module,
            version = %self.target,
            applied,
            "migration committed"
        );
        self.message(
            MessageLevel::Info,
            None,
            format!("{} stamped at version {}", self.module, self.target),
            None,
        );
        self.enter(RunState::Committed);
        let installed = Some(self.target.clone());
        self.finish(RunStatus::Committed, current, installed, None)
    }

    fn finish(
        self,
        status: RunStatus,
        from_version: Option<Version>,
        installed_version: Option<Version>,
        error: Option<MigrationError>,
    ) -> MigrationResult {
        MigrationResult {
            run_id: self.run_id,
            module: self.module,
            status,
            from_version,
            target_version: self.target,
            installed_version,
            executed: self.executed,
            messages: self.messages,
            error,
            states: self.states,
        }
    }
}
