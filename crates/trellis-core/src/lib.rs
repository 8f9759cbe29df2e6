//! Versioned, idempotent migrations over a multi-workspace node tree.
//!
//! A module ships a [`TaskCatalog`] of version-tagged [`Task`]s. The [`MigrationEngine`]
//! reads the module's installed version from the store, runs every task whose version is
//! newer, and stamps the latest version once the session saves.

pub mod engine;
pub mod memory;
pub mod path;
pub mod security;
pub mod store;
pub mod task;
pub mod tasks;
pub mod version;

pub use engine::{
    run_migration, DescriptorLocation, MessageLevel, MigrationEngine, MigrationError,
    MigrationMessage, MigrationResult, RunState, RunStatus, TaskReport, TaskStatus,
};
pub use memory::{MemoryNode, MemoryStore};
pub use path::{NodePath, PathError};
pub use security::{
    ensure_access_rule, AccessDefinition, AccessLevel, AccessRule, AclEntry, NodeRoleRegistry,
    RoleRegistry, Voter,
};
pub use store::{ActivationStatus, PropertyValue, StoreError, StoreSession};
pub use task::{
    CatalogBuilder, CatalogEntry, CatalogError, FnTask, InstallContext, PlannedTask, Task,
    TaskCatalog, TaskError, TaskOutcome, TaskWarning,
};
pub use version::{Version, VersionParseError};
