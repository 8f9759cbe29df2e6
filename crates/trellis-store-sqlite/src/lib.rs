use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, DatabaseName, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use trellis_core::store::ROOT_NODE_TYPE;
use trellis_core::{MigrationResult, NodePath, PropertyValue, StoreError, StoreSession};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nodes (
  node_id INTEGER PRIMARY KEY AUTOINCREMENT,
  workspace TEXT NOT NULL,
  path TEXT NOT NULL,
  parent_path TEXT,
  name TEXT NOT NULL,
  primary_type TEXT NOT NULL,
  position INTEGER NOT NULL DEFAULT 0,
  UNIQUE(workspace, path),
  CHECK (substr(path, 1, 1) = '/'),
  CHECK ((path = '/') = (parent_path IS NULL))
);

CREATE TABLE IF NOT EXISTS node_properties (
  node_id INTEGER NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('string', 'long', 'boolean')),
  value NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (node_id, name)
);

CREATE TABLE IF NOT EXISTS node_mixins (
  node_id INTEGER NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
  mixin TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (node_id, mixin)
);

CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(workspace, parent_path, position);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS migration_runs (
  run_id TEXT PRIMARY KEY,
  module TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('committed', 'failed')),
  from_version TEXT,
  target_version TEXT NOT NULL,
  installed_version TEXT,
  tasks_applied INTEGER NOT NULL CHECK (tasks_applied >= 0),
  warnings INTEGER NOT NULL CHECK (warnings >= 0),
  error_kind TEXT,
  recorded_at TEXT NOT NULL,
  result_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_migration_runs_module ON migration_runs(module, recorded_at);
";

const NODES_FILE: &str = "nodes.ndjson";
const RUNS_FILE: &str = "migration_runs.ndjson";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_nodes: usize,
    pub skipped_existing_nodes: usize,
    pub imported_runs: usize,
    pub skipped_existing_runs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// `workspace:path` of nodes whose parent row is missing.
    pub orphan_nodes: Vec<String>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropertySnapshot {
    pub name: String,
    pub value: PropertyValue,
}

/// One node as exported, without its children. Snapshots are written parents first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub workspace: String,
    pub path: NodePath,
    pub primary_type: String,
    pub mixins: Vec<String>,
    pub properties: Vec<PropertySnapshot>,
}

/// A journaled migration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub module: String,
    pub status: String,
    pub from_version: Option<String>,
    pub target_version: String,
    pub installed_version: Option<String>,
    pub tasks_applied: i64,
    pub warnings: i64,
    pub error_kind: Option<String>,
    pub recorded_at: String,
    pub result: serde_json::Value,
}

impl SqliteStore {
    /// Open a SQLite-backed node store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Override how long a writer waits for a competing session before giving up.
    ///
    /// # Errors
    /// Returns an error when the timeout cannot be applied.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout).context("failed to set sqlite busy timeout")
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        ensure_schema_migrations_table(&self.conn)?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        ensure_schema_migrations_table(&self.conn)?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "nodes")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "nodes", "workspace")? {
            return Err(anyhow!("database schema is invalid: nodes has no workspace column"));
        }

        // Tables exist without migration records; adopt them at the shape they have.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "migration_runs")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration 2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create migration_runs table")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration 2")?;
        tracing::debug!(version = 2, "applied store schema migration");
        Ok(())
    }

    /// Open a write session. The write lock is held from the first write until the next
    /// save; only saved changes survive.
    ///
    /// # Errors
    /// Returns an error when another writer holds the database past the busy timeout.
    pub fn session(&mut self) -> Result<SqliteSession<'_>> {
        SqliteSession::begin(&self.conn, SessionMode::Write)
    }

    /// Open a read-only session over a deferred transaction. It does not block writers.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn read_session(&mut self) -> Result<SqliteSession<'_>> {
        SqliteSession::begin(&self.conn, SessionMode::Read)
    }

    /// Read one node without opening a write session.
    ///
    /// # Errors
    /// Returns an error when the node rows cannot be read.
    pub fn read_node(&self, workspace: &str, path: &NodePath) -> Result<Option<NodeSnapshot>> {
        let snapshot = if path.is_root() {
            Some(read_root(&self.conn, workspace)?)
        } else {
            read_snapshot(&self.conn, workspace, path)?
        };
        Ok(snapshot)
    }

    /// Child names of a node in sibling order.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read.
    pub fn list_children(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>> {
        child_names(&self.conn, workspace, path.as_str())
            .with_context(|| format!("failed to list children of {workspace}:{path}"))
    }

    /// Journal a finished migration run.
    ///
    /// # Errors
    /// Returns an error when the result cannot be serialized or inserted.
    pub fn record_run(&mut self, result: &MigrationResult) -> Result<RunRecord> {
        let record = RunRecord {
            run_id: result.run_id.to_string(),
            module: result.module.clone(),
            status: result.status.as_str().to_string(),
            from_version: result.from_version.as_ref().map(ToString::to_string),
            target_version: result.target_version.to_string(),
            installed_version: result.installed_version.as_ref().map(ToString::to_string),
            tasks_applied: i64::try_from(result.applied().count())
                .context("applied task count overflows i64")?,
            warnings: i64::try_from(result.warnings().count())
                .context("warning count overflows i64")?,
            error_kind: result
                .error
                .as_ref()
                .map(|err| serde_json::to_value(err).map(|value| value["kind"].clone()))
                .transpose()
                .context("failed to serialize run error")?
                .and_then(|kind| kind.as_str().map(ToString::to_string)),
            recorded_at: now_rfc3339()?,
            result: serde_json::to_value(result).context("failed to serialize migration result")?,
        };
        insert_run(&self.conn, &record)?;
        tracing::debug!(
            run_id = %record.run_id,
            module = %record.module,
            "journaled migration run"
        );
        Ok(record)
    }

    /// Journaled runs, oldest first, optionally for one module.
    ///
    /// # Errors
    /// Returns an error when journal rows cannot be read or decoded.
    pub fn list_runs(&self, module: Option<&str>) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, module, status, from_version, target_version, installed_version,
                        tasks_applied, warnings, error_kind, recorded_at, result_json
                 FROM migration_runs
                 WHERE ?1 IS NULL OR module = ?1
                 ORDER BY recorded_at ASC, run_id ASC",
            )
            .context("failed to prepare list_runs query")?;
        let rows = stmt.query_map(params![module], |row| {
            Ok((
                RunRecord {
                    run_id: row.get(0)?,
                    module: row.get(1)?,
                    status: row.get(2)?,
                    from_version: row.get(3)?,
                    target_version: row.get(4)?,
                    installed_version: row.get(5)?,
                    tasks_applied: row.get(6)?,
                    warnings: row.get(7)?,
                    error_kind: row.get(8)?,
                    recorded_at: row.get(9)?,
                    result: serde_json::Value::Null,
                },
                row.get::<_, String>(10)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (mut record, raw) = row?;
            record.result = serde_json::from_str(&raw)
                .with_context(|| format!("invalid result_json for run {}", record.run_id))?;
            out.push(record);
        }
        Ok(out)
    }

    /// Export every node and journaled run to NDJSON files plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let nodes = self.list_snapshots()?;
        let runs = self.list_runs(None)?;

        let nodes_digest = write_ndjson_file(&out_dir.join(NODES_FILE), &nodes)?;
        let runs_digest = write_ndjson_file(&out_dir.join(RUNS_FILE), &runs)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: NODES_FILE.to_string(),
                    sha256: nodes_digest.0,
                    records: nodes_digest.1,
                },
                ExportFileDigest {
                    path: RUNS_FILE.to_string(),
                    sha256: runs_digest.0,
                    records: runs_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database in one transaction.
    ///
    /// # Errors
    /// Returns an error when migration, parsing, duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let nodes = read_ndjson_file::<NodeSnapshot>(&in_dir.join(NODES_FILE))?;
        let runs = read_ndjson_file::<RunRecord>(&in_dir.join(RUNS_FILE))?;
        let mut summary = ImportSummary::default();

        let mut session = self.session()?;
        for node in nodes {
            if !node.path.is_root() && session.node_exists(&node.workspace, &node.path)? {
                if skip_existing {
                    summary.skipped_existing_nodes += 1;
                    continue;
                }
                return Err(anyhow!("node already exists: {}:{}", node.workspace, node.path));
            }
            if !node.path.is_root() {
                session
                    .add_node(&node.workspace, &node.path, &node.primary_type)
                    .with_context(|| format!("failed to import {}:{}", node.workspace, node.path))?;
            }
            for property in node.properties {
                if session.property(&node.workspace, &node.path, &property.name)?.is_none() {
                    session.set_property(
                        &node.workspace,
                        &node.path,
                        &property.name,
                        property.value,
                    )?;
                }
            }
            for mixin in &node.mixins {
                session.add_mixin(&node.workspace, &node.path, mixin)?;
            }
            summary.imported_nodes += 1;
        }

        for run in &runs {
            if run_exists(session.conn, &run.run_id)? {
                if skip_existing {
                    summary.skipped_existing_runs += 1;
                    continue;
                }
                return Err(anyhow!("migration run already exists: {}", run.run_id));
            }
            insert_run(session.conn, run)?;
            summary.imported_runs += 1;
        }
        session.save()?;

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, tree-shape, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut orphan_nodes = Vec::new();
        if table_exists(&self.conn, "nodes")? {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT n.workspace, n.path FROM nodes n
                     WHERE n.parent_path IS NOT NULL AND n.parent_path <> '/'
                       AND NOT EXISTS (
                         SELECT 1 FROM nodes p
                         WHERE p.workspace = n.workspace AND p.path = n.parent_path
                       )
                     ORDER BY n.workspace, n.path",
                )
                .context("failed to prepare orphan node query")?;
            let rows = stmt.query_map([], |row| {
                Ok(format!("{}:{}", row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                orphan_nodes.push(row?);
            }
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            orphan_nodes,
            schema_status,
        })
    }

    fn list_snapshots(&self) -> Result<Vec<NodeSnapshot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT workspace FROM nodes ORDER BY workspace")
            .context("failed to list workspaces")?;
        let workspaces = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::new();
        for workspace in workspaces {
            let root = read_root(&self.conn, &workspace)?;
            if !root.properties.is_empty() || !root.mixins.is_empty() {
                out.push(root);
            }
            let mut stack = vec![NodePath::root()];
            while let Some(parent) = stack.pop() {
                let children = child_names(&self.conn, &workspace, parent.as_str())?;
                for name in children.iter().rev() {
                    stack.push(parent.child(name)?);
                }
                if parent.is_root() {
                    continue;
                }
                if let Some(snapshot) = read_snapshot(&self.conn, &workspace, &parent)? {
                    out.push(snapshot);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionMode {
    Write,
    Read,
}

/// A session over one connection.
///
/// Write sessions start with an immediate transaction. `save` commits it, and the next write
/// opens a new one, so the write lock is not held between saves. Dropping the session rolls
/// back anything unsaved. Read sessions use a deferred transaction and refuse writes.
pub struct SqliteSession<'s> {
    conn: &'s Connection,
    mode: SessionMode,
}

impl<'s> SqliteSession<'s> {
    fn begin(conn: &'s Connection, mode: SessionMode) -> Result<Self> {
        let sql = match mode {
            SessionMode::Write => "BEGIN IMMEDIATE",
            SessionMode::Read => "BEGIN DEFERRED",
        };
        conn.execute_batch(sql).context("failed to begin session")?;
        Ok(Self { conn, mode })
    }

    fn writable(&self) -> Result<(), StoreError> {
        if self.mode == SessionMode::Read {
            return Err(StoreError::Constraint("session is read-only".to_string()));
        }
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_err)?;
        }
        Ok(())
    }

    fn node_id(&self, workspace: &str, path: &NodePath) -> Result<Option<i64>, StoreError> {
        node_id(self.conn, workspace, path.as_str()).map_err(sql_err)
    }

    fn require_id(&self, workspace: &str, path: &NodePath) -> Result<i64, StoreError> {
        if path.is_root() {
            return ensure_root_row(self.conn, workspace).map_err(sql_err);
        }
        self.node_id(workspace, path)?.ok_or_else(|| StoreError::not_found(workspace, path))
    }

    fn require_exists(&self, workspace: &str, path: &NodePath) -> Result<(), StoreError> {
        if self.node_exists(workspace, path)? {
            Ok(())
        } else {
            Err(StoreError::not_found(workspace, path))
        }
    }

    fn next_child_position(&self, workspace: &str, parent: &NodePath) -> Result<i64, StoreError> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM nodes
                 WHERE workspace = ?1 AND parent_path = ?2",
                params![workspace, parent.as_str()],
                |row| row.get(0),
            )
            .map_err(sql_err)
    }
}

impl Drop for SqliteSession<'_> {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %err, "failed to roll back unsaved session changes");
            }
        }
    }
}

impl StoreSession for SqliteSession<'_> {
    fn node_exists(&self, workspace: &str, path: &NodePath) -> Result<bool, StoreError> {
        if path.is_root() {
            return Ok(true);
        }
        Ok(self.node_id(workspace, path)?.is_some())
    }

    fn node_type(&self, workspace: &str, path: &NodePath) -> Result<String, StoreError> {
        if path.is_root() {
            return Ok(ROOT_NODE_TYPE.to_string());
        }
        self.conn
            .query_row(
                "SELECT primary_type FROM nodes WHERE workspace = ?1 AND path = ?2",
                params![workspace, path.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StoreError::not_found(workspace, path))
    }

    fn mixins(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError> {
        self.require_exists(workspace, path)?;
        match self.node_id(workspace, path)? {
            Some(id) => read_mixins(self.conn, id).map_err(sql_err),
            None => Ok(Vec::new()),
        }
    }

    fn children(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError> {
        self.require_exists(workspace, path)?;
        child_names(self.conn, workspace, path.as_str()).map_err(sql_err)
    }

    fn add_node(
        &mut self,
        workspace: &str,
        path: &NodePath,
        primary_type: &str,
    ) -> Result<(), StoreError> {
        self.writable()?;
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Err(StoreError::exists(workspace, path));
        };
        if self.node_exists(workspace, path)? {
            return Err(StoreError::exists(workspace, path));
        }
        self.require_exists(workspace, &parent)?;
        let position = self.next_child_position(workspace, &parent)?;
        self.conn
            .execute(
                "INSERT INTO nodes(workspace, path, parent_path, name, primary_type, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![workspace, path.as_str(), parent.as_str(), name, primary_type, position],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn remove_node(&mut self, workspace: &str, path: &NodePath) -> Result<(), StoreError> {
        self.writable()?;
        if path.is_root() {
            return Err(StoreError::Constraint(format!("cannot remove the root of {workspace}")));
        }
        self.require_exists(workspace, path)?;
        self.conn
            .execute(
                "DELETE FROM nodes
                 WHERE workspace = ?1
                   AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')",
                params![workspace, path.as_str()],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn move_node(
        &mut self,
        workspace: &str,
        from: &NodePath,
        to: &NodePath,
    ) -> Result<(), StoreError> {
        self.writable()?;
        if from.is_root() {
            return Err(StoreError::Constraint(format!("cannot move the root of {workspace}")));
        }
        self.require_exists(workspace, from)?;
        if self.node_exists(workspace, to)? {
            return Err(StoreError::exists(workspace, to));
        }
        if to.is_within(from) {
            return Err(StoreError::Constraint(format!("cannot move {from} below itself")));
        }
        let (Some(target_parent), Some(target_name)) = (to.parent(), to.name()) else {
            return Err(StoreError::exists(workspace, to));
        };
        self.require_exists(workspace, &target_parent)?;
        let position = self.next_child_position(workspace, &target_parent)?;

        self.conn
            .execute(
                "UPDATE nodes
                 SET path = ?3 || substr(path, length(?2) + 1),
                     parent_path = CASE
                       WHEN path = ?2 THEN ?4
                       ELSE ?3 || substr(parent_path, length(?2) + 1)
                     END
                 WHERE workspace = ?1
                   AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')",
                params![workspace, from.as_str(), to.as_str(), target_parent.as_str()],
            )
            .map_err(sql_err)?;
        self.conn
            .execute(
                "UPDATE nodes SET name = ?3, position = ?4 WHERE workspace = ?1 AND path = ?2",
                params![workspace, to.as_str(), target_name, position],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn order_before(
        &mut self,
        workspace: &str,
        path: &NodePath,
        before: Option<&str>,
    ) -> Result<(), StoreError> {
        self.writable()?;
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Err(StoreError::Constraint("cannot reorder the root".to_string()));
        };
        self.require_exists(workspace, path)?;
        let mut siblings = child_names(self.conn, workspace, parent.as_str()).map_err(sql_err)?;
        if let Some(sibling) = before {
            if !siblings.iter().any(|candidate| candidate == sibling) {
                return Err(StoreError::not_found(workspace, &parent.child(sibling)?));
            }
        }
        siblings.retain(|candidate| candidate != name);
        let index = before
            .and_then(|sibling| siblings.iter().position(|candidate| candidate == sibling))
            .unwrap_or(siblings.len());
        siblings.insert(index, name.to_string());

        let mut stmt = self
            .conn
            .prepare_cached(
                "UPDATE nodes SET position = ?3
                 WHERE workspace = ?1 AND parent_path = ?2 AND name = ?4",
            )
            .map_err(sql_err)?;
        for (position, sibling) in siblings.iter().enumerate() {
            let position = i64::try_from(position)
                .map_err(|_| StoreError::Backend("sibling position overflows i64".to_string()))?;
            stmt.execute(params![workspace, parent.as_str(), position, sibling]).map_err(sql_err)?;
        }
        Ok(())
    }

    fn property(
        &self,
        workspace: &str,
        path: &NodePath,
        name: &str,
    ) -> Result<Option<PropertyValue>, StoreError> {
        self.require_exists(workspace, path)?;
        let Some(id) = self.node_id(workspace, path)? else {
            return Ok(None);
        };
        self.conn
            .query_row(
                "SELECT kind, value FROM node_properties WHERE node_id = ?1 AND name = ?2",
                params![id, name],
                |row| decode_value(&row.get::<_, String>(0)?, row.get::<_, SqlValue>(1)?),
            )
            .optional()
            .map_err(sql_err)
    }

    fn property_names(&self, workspace: &str, path: &NodePath) -> Result<Vec<String>, StoreError> {
        self.require_exists(workspace, path)?;
        let Some(id) = self.node_id(workspace, path)? else {
            return Ok(Vec::new());
        };
        Ok(read_properties(self.conn, id)
            .map_err(sql_err)?
            .into_iter()
            .map(|property| property.name)
            .collect())
    }

    fn set_property(
        &mut self,
        workspace: &str,
        path: &NodePath,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError> {
        self.writable()?;
        let id = self.require_id(workspace, path)?;
        let (kind, value) = encode_value(&value);
        self.conn
            .execute(
                "INSERT INTO node_properties(node_id, name, kind, value, position)
                 VALUES (
                   ?1, ?2, ?3, ?4,
                   (SELECT COALESCE(MAX(position), -1) + 1 FROM node_properties WHERE node_id = ?1)
                 )
                 ON CONFLICT(node_id, name)
                 DO UPDATE SET kind = excluded.kind, value = excluded.value",
                params![id, name, kind, value],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn remove_property(
        &mut self,
        workspace: &str,
        path: &NodePath,
        name: &str,
    ) -> Result<bool, StoreError> {
        self.writable()?;
        self.require_exists(workspace, path)?;
        let Some(id) = self.node_id(workspace, path)? else {
            return Ok(false);
        };
        let removed = self
            .conn
            .execute(
                "DELETE FROM node_properties WHERE node_id = ?1 AND name = ?2",
                params![id, name],
            )
            .map_err(sql_err)?;
        Ok(removed > 0)
    }

    fn add_mixin(
        &mut self,
        workspace: &str,
        path: &NodePath,
        mixin: &str,
    ) -> Result<bool, StoreError> {
        self.writable()?;
        let id = self.require_id(workspace, path)?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO node_mixins(node_id, mixin, position)
                 VALUES (
                   ?1, ?2,
                   (SELECT COALESCE(MAX(position), -1) + 1 FROM node_mixins WHERE node_id = ?1)
                 )",
                params![id, mixin],
            )
            .map_err(sql_err)?;
        Ok(inserted > 0)
    }

    fn save(&mut self) -> Result<(), StoreError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        // SQLite keeps the transaction open when COMMIT fails on busy or deferred constraints.
        self.conn.execute_batch("COMMIT").map_err(sql_err)
    }
}

/// Leaves an up-to-date database untouched.
fn ensure_schema_migrations_table(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "schema_migrations")? {
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
    }
    Ok(())
}

fn sql_err(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StoreError::Conflict(err.to_string())
        }
        Some(ErrorCode::ConstraintViolation) => StoreError::Constraint(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn encode_value(value: &PropertyValue) -> (&'static str, SqlValue) {
    match value {
        PropertyValue::String(text) => ("string", SqlValue::Text(text.clone())),
        PropertyValue::Long(number) => ("long", SqlValue::Integer(*number)),
        PropertyValue::Boolean(flag) => ("boolean", SqlValue::Integer(i64::from(*flag))),
    }
}

fn decode_value(kind: &str, value: SqlValue) -> rusqlite::Result<PropertyValue> {
    match (kind, value) {
        ("string", SqlValue::Text(text)) => Ok(PropertyValue::String(text)),
        ("long", SqlValue::Integer(number)) => Ok(PropertyValue::Long(number)),
        ("boolean", SqlValue::Integer(flag)) => Ok(PropertyValue::Boolean(flag != 0)),
        (kind, other) => Err(rusqlite::Error::FromSqlConversionFailure(
            1,
            other.data_type(),
            format!("property kind {kind} does not match stored {:?}", other.data_type()).into(),
        )),
    }
}

fn node_id(conn: &Connection, workspace: &str, path: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT node_id FROM nodes WHERE workspace = ?1 AND path = ?2",
        params![workspace, path],
        |row| row.get(0),
    )
    .optional()
}

fn ensure_root_row(conn: &Connection, workspace: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO nodes(workspace, path, parent_path, name, primary_type, position)
         VALUES (?1, '/', NULL, '', ?2, 0)",
        params![workspace, ROOT_NODE_TYPE],
    )?;
    conn.query_row(
        "SELECT node_id FROM nodes WHERE workspace = ?1 AND path = '/'",
        params![workspace],
        |row| row.get(0),
    )
}

fn child_names(conn: &Connection, workspace: &str, parent: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name FROM nodes
         WHERE workspace = ?1 AND parent_path = ?2
         ORDER BY position, node_id",
    )?;
    let rows = stmt.query_map(params![workspace, parent], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn read_properties(conn: &Connection, id: i64) -> rusqlite::Result<Vec<PropertySnapshot>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, kind, value FROM node_properties WHERE node_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok(PropertySnapshot {
            name: row.get(0)?,
            value: decode_value(&row.get::<_, String>(1)?, row.get::<_, SqlValue>(2)?)?,
        })
    })?;
    rows.collect()
}

fn read_mixins(conn: &Connection, id: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT mixin FROM node_mixins WHERE node_id = ?1 ORDER BY position")?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn read_snapshot(
    conn: &Connection,
    workspace: &str,
    path: &NodePath,
) -> Result<Option<NodeSnapshot>> {
    let row = conn
        .query_row(
            "SELECT node_id, primary_type FROM nodes WHERE workspace = ?1 AND path = ?2",
            params![workspace, path.as_str()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to read node {workspace}:{path}"))?;
    let Some((id, primary_type)) = row else {
        return Ok(None);
    };
    Ok(Some(NodeSnapshot {
        workspace: workspace.to_string(),
        path: path.clone(),
        primary_type,
        mixins: read_mixins(conn, id)?,
        properties: read_properties(conn, id)?,
    }))
}

fn read_root(conn: &Connection, workspace: &str) -> Result<NodeSnapshot> {
    let root = NodePath::root();
    Ok(read_snapshot(conn, workspace, &root)?.unwrap_or(NodeSnapshot {
        workspace: workspace.to_string(),
        path: root,
        primary_type: ROOT_NODE_TYPE.to_string(),
        mixins: Vec::new(),
        properties: Vec::new(),
    }))
}

fn insert_run(conn: &Connection, record: &RunRecord) -> Result<()> {
    let result_json =
        serde_json::to_string(&record.result).context("failed to serialize run result")?;
    conn.execute(
        "INSERT INTO migration_runs(
            run_id, module, status, from_version, target_version, installed_version,
            tasks_applied, warnings, error_kind, recorded_at, result_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.run_id,
            record.module,
            record.status,
            record.from_version,
            record.target_version,
            record.installed_version,
            record.tasks_applied,
            record.warnings,
            record.error_kind,
            record.recorded_at,
            result_json,
        ],
    )
    .with_context(|| format!("failed to journal migration run {}", record.run_id))?;
    Ok(())
}

fn run_exists(conn: &Connection, run_id: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM migration_runs WHERE run_id = ?1)",
            params![run_id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if run exists: {run_id}"))?;
    Ok(exists == 1)
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
    record_schema_version(conn, 1)?;
    tracing::debug!(version = 1, "applied store schema migration");
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "nodes")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "nodes", "workspace")? {
        return Err(anyhow!("database schema is invalid: nodes has no workspace column"));
    }

    if table_exists(conn, "migration_runs")? {
        return Ok((2, true));
    }
    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut values = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [NODES_FILE, RUNS_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use trellis_core::store::{ACTIVATION_STATUS, PAGE_NODE_TYPE};
    use trellis_core::tasks::{EnsureNode, ProvisionAccess};
    use trellis_core::{
        run_migration, AccessDefinition, AccessRule, FnTask, MigrationEngine, MigrationError,
        NodeRoleRegistry, RunStatus, TaskCatalog, TaskError, Version, Voter,
    };
    use ulid::Ulid;

    use super::*;

    fn p(raw: &str) -> NodePath {
        match NodePath::parse(raw) {
            Ok(path) => path,
            Err(err) => panic!("invalid fixture path {raw}: {err}"),
        }
    }

    fn migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn temp_path(prefix: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("trellis-{prefix}-{}", Ulid::new()))
    }

    fn cleanup_db(path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let file = std::path::PathBuf::from(format!("{}{suffix}", path.display()));
            if file.exists() {
                fs::remove_file(&file)
                    .with_context(|| format!("failed to cleanup sqlite file {}", file.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn sqlite_constraints_reject_bad_rows() -> Result<()> {
        let store = migrated()?;
        let relative = store.conn.execute(
            "INSERT INTO nodes(workspace, path, parent_path, name, primary_type)
             VALUES ('website', 'travel', '/', 'travel', 'mgnl:page')",
            [],
        );
        assert!(relative.is_err());

        store.conn.execute(
            "INSERT INTO nodes(workspace, path, parent_path, name, primary_type)
             VALUES ('website', '/travel', '/', 'travel', 'mgnl:page')",
            [],
        )?;
        let bad_kind = store.conn.execute(
            "INSERT INTO node_properties(node_id, name, kind, value, position)
             VALUES (1, 'title', 'date', 'x', 0)",
            [],
        );
        assert!(bad_kind.is_err());
        let dangling = store.conn.execute(
            "INSERT INTO node_mixins(node_id, mixin, position) VALUES (999, 'mgnl:hasVariants', 0)",
            [],
        );
        assert!(dangling.is_err());
        Ok(())
    }

    #[test]
    fn session_reads_writes_and_reorders() -> Result<()> {
        let mut store = migrated()?;
        let mut session = store.session()?;
        session.ensure_path("website", &p("/travel/about"), PAGE_NODE_TYPE, PAGE_NODE_TYPE)?;
        session.add_node("website", &p("/travel/contact"), PAGE_NODE_TYPE)?;
        session.add_node("website", &p("/travel/tours"), PAGE_NODE_TYPE)?;
        session.set_property("website", &p("/travel"), "title", "Travel".into())?;
        session.set_property("website", &p("/travel"), ACTIVATION_STATUS, 2_i64.into())?;
        session.set_property("website", &p("/travel"), "hideInNav", false.into())?;
        session.set_property("website", &p("/travel"), "title", "Travel Demo".into())?;

        assert_eq!(
            session.property_names("website", &p("/travel"))?,
            vec!["title", "mgnl:activationStatus", "hideInNav"]
        );
        assert_eq!(
            session.property("website", &p("/travel"), "title")?,
            Some(PropertyValue::from("Travel Demo"))
        );
        assert_eq!(
            session.property("website", &p("/travel"), "hideInNav")?,
            Some(PropertyValue::Boolean(false))
        );
        assert_eq!(
            session.property("website", &p("/travel"), ACTIVATION_STATUS)?,
            Some(PropertyValue::Long(2))
        );

        session.order_before("website", &p("/travel/tours"), Some("about"))?;
        assert_eq!(session.children("website", &p("/travel"))?, vec!["tours", "about", "contact"]);

        assert!(session.add_mixin("website", &p("/travel/contact"), "mgnl:hasVariants")?);
        assert!(!session.add_mixin("website", &p("/travel/contact"), "mgnl:hasVariants")?);
        assert!(matches!(
            session.add_node("website", &p("/travel/contact"), PAGE_NODE_TYPE),
            Err(StoreError::NodeExists { .. })
        ));
        assert!(matches!(
            session.add_node("website", &p("/nowhere/page"), PAGE_NODE_TYPE),
            Err(StoreError::NodeNotFound { .. })
        ));
        session.save()?;
        drop(session);

        let Some(contact) = store.read_node("website", &p("/travel/contact"))? else {
            return Err(anyhow!("contact page missing after save"));
        };
        assert_eq!(contact.mixins, vec!["mgnl:hasVariants"]);
        Ok(())
    }

    #[test]
    fn move_and_remove_carry_subtrees() -> Result<()> {
        let mut store = migrated()?;
        let mut session = store.session()?;
        session.ensure_path("website", &p("/travel/old/team"), PAGE_NODE_TYPE, PAGE_NODE_TYPE)?;
        session.add_node("website", &p("/travel-demo"), PAGE_NODE_TYPE)?;
        session.set_property("website", &p("/travel/old/team"), "title", "Team".into())?;

        session.move_node("website", &p("/travel/old"), &p("/company"))?;
        assert!(!session.node_exists("website", &p("/travel/old"))?);
        assert_eq!(
            session.property("website", &p("/company/team"), "title")?,
            Some(PropertyValue::from("Team"))
        );
        assert_eq!(session.children("website", &p("/"))?, vec!["travel", "travel-demo", "company"]);

        session.remove_node("website", &p("/travel"))?;
        assert!(session.node_exists("website", &p("/travel-demo"))?);
        assert!(session.node_exists("website", &p("/company/team"))?);
        session.save()?;
        drop(session);

        let report = store.integrity_check()?;
        assert!(report.orphan_nodes.is_empty());
        assert!(report.foreign_key_violations.is_empty());
        Ok(())
    }

    #[test]
    fn dropping_a_session_discards_unsaved_changes() -> Result<()> {
        let mut store = migrated()?;
        {
            let mut session = store.session()?;
            session.add_node("website", &p("/kept"), PAGE_NODE_TYPE)?;
            session.save()?;
            session.add_node("website", &p("/discarded"), PAGE_NODE_TYPE)?;
        }
        assert!(store.read_node("website", &p("/kept"))?.is_some());
        assert!(store.read_node("website", &p("/discarded"))?.is_none());
        Ok(())
    }

    #[test]
    fn competing_writer_is_refused() -> Result<()> {
        let db_path = temp_path("conflict").with_extension("sqlite3");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }
        let mut first = SqliteStore::open(&db_path)?;
        let mut second = SqliteStore::open(&db_path)?;
        second.set_busy_timeout(Duration::from_millis(50))?;

        let held = first.session()?;
        assert!(second.session().is_err());
        drop(held);
        assert!(second.session().is_ok());

        drop(first);
        drop(second);
        cleanup_db(&db_path)
    }

    #[test]
    fn save_releases_the_write_lock_until_the_next_write() -> Result<()> {
        let db_path = temp_path("save-lock").with_extension("sqlite3");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }
        let mut first = SqliteStore::open(&db_path)?;
        let mut second = SqliteStore::open(&db_path)?;
        first.set_busy_timeout(Duration::from_millis(50))?;
        second.set_busy_timeout(Duration::from_millis(50))?;

        {
            let mut session = first.session()?;
            session.add_node("website", &p("/saved"), PAGE_NODE_TYPE)?;
            session.save()?;
            assert!(session.conn.is_autocommit());

            let mut other = second.session()?;
            other.add_node("website", &p("/other"), PAGE_NODE_TYPE)?;
            let blocked = session.add_node("website", &p("/blocked"), PAGE_NODE_TYPE);
            assert!(matches!(blocked, Err(StoreError::Conflict(_))), "{blocked:?}");
            assert!(session.conn.is_autocommit());
            other.save()?;
            drop(other);

            session.add_node("website", &p("/unsaved"), PAGE_NODE_TYPE)?;
            assert!(!session.conn.is_autocommit());
        }

        assert!(first.read_node("website", &p("/saved"))?.is_some());
        assert!(first.read_node("website", &p("/other"))?.is_some());
        assert!(first.read_node("website", &p("/blocked"))?.is_none());
        assert!(first.read_node("website", &p("/unsaved"))?.is_none());

        drop(first);
        drop(second);
        cleanup_db(&db_path)
    }

    #[test]
    fn read_session_refuses_writes_and_leaves_writers_free() -> Result<()> {
        let db_path = temp_path("read-session").with_extension("sqlite3");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }
        let mut reader = SqliteStore::open(&db_path)?;
        let mut writer = SqliteStore::open(&db_path)?;
        writer.set_busy_timeout(Duration::from_millis(50))?;

        let mut read = reader.read_session()?;
        assert!(read.node_exists("website", &p("/"))?);
        let refused = read.add_node("website", &p("/travel"), PAGE_NODE_TYPE);
        assert!(matches!(refused, Err(StoreError::Constraint(_))), "{refused:?}");

        let mut session = writer.session()?;
        session.add_node("website", &p("/travel"), PAGE_NODE_TYPE)?;
        session.save()?;
        drop(session);
        drop(read);

        assert!(reader.read_node("website", &p("/travel"))?.is_some());
        drop(reader);
        drop(writer);
        cleanup_db(&db_path)
    }

    #[test]
    fn failed_task_keeps_earlier_effects_over_sqlite() -> Result<()> {
        let catalog = TaskCatalog::builder("demo", "1.0")
            .task(
                "0.5",
                EnsureNode::new("a", "create a", "config", "/modules/a", "mgnl:contentNode"),
            )
            .task(
                "0.6",
                FnTask::new("boom", "always fails", |_| {
                    Err(TaskError::Failed("disk on fire".to_string()))
                }),
            )
            .task(
                "1.0",
                EnsureNode::new("c", "create c", "config", "/modules/c", "mgnl:contentNode"),
            )
            .build()?;
        let mut store = migrated()?;

        let result = {
            let mut session = store.session()?;
            run_migration(None, &catalog, &mut session, &NodeRoleRegistry)
        };

        assert_eq!(result.status, RunStatus::Failed);
        assert!(
            matches!(
                &result.error,
                Some(MigrationError::TaskExecution { task, .. }) if task == "boom",
            ),
            "{result:?}"
        );
        assert_eq!(result.installed_version, None);
        assert!(store.read_node("config", &p("/modules/a"))?.is_some());
        assert!(store.read_node("config", &p("/modules/c"))?.is_none());
        assert!(store.read_node("config", &p("/modules/demo"))?.is_none());
        Ok(())
    }

    #[test]
    fn failed_commit_leaves_the_stamp_unwritten() -> Result<()> {
        let catalog = TaskCatalog::builder("demo", "1.0")
            .task(
                "1.0",
                EnsureNode::new("a", "create a", "config", "/modules/a", "mgnl:contentNode"),
            )
            .build()?;
        let store = migrated()?;
        let mut session = SqliteSession::begin(&store.conn, SessionMode::Write)?;
        // A dangling row under deferred foreign keys makes COMMIT fail.
        store.conn.execute_batch(
            "PRAGMA defer_foreign_keys = ON;
             INSERT INTO node_mixins(node_id, mixin, position) VALUES (999, 'mgnl:dangling', 0);",
        )?;

        let result = run_migration(None, &catalog, &mut session, &NodeRoleRegistry);

        assert_eq!(result.status, RunStatus::Failed);
        assert!(
            matches!(result.error, Some(MigrationError::CommitConflict { .. })),
            "{result:?}"
        );
        assert_eq!(result.installed_version, None);
        assert!(!session.conn.is_autocommit());
        assert_eq!(session.property("config", &p("/modules/demo"), "version")?, None);
        assert!(session.node_exists("config", &p("/modules/a"))?);
        drop(session);

        assert!(store.conn.is_autocommit());
        assert!(store.read_node("config", &p("/modules/a"))?.is_none());
        assert!(store.read_node("config", &p("/modules/demo"))?.is_none());
        Ok(())
    }

    #[test]
    fn engine_runs_over_sqlite_session() -> Result<()> {
        let catalog = TaskCatalog::builder("demo", "1.0")
            .task(
                "0.5",
                EnsureNode::new(
                    "group",
                    "create app group",
                    "config",
                    "/modules/ui/groups/target",
                    "mgnl:contentNode",
                ),
            )
            .task(
                "1.0",
                ProvisionAccess::new(
                    "access",
                    "allow editors",
                    vec![AccessRule::allow(p("/modules/ui/groups/target"), "editor")],
                ),
            )
            .build()?;
        let mut store = migrated()?;

        let result = {
            let mut session = store.session()?;
            run_migration(None, &catalog, &mut session, &NodeRoleRegistry)
        };
        assert_eq!(result.status, RunStatus::Committed, "{result:?}");
        store.record_run(&result)?;

        let again = {
            let mut session = store.session()?;
            MigrationEngine::new(&catalog).run(&mut session, &NodeRoleRegistry)
        };
        assert_eq!(again.from_version, Some(Version::new(1, 0, 0)));
        assert!(again.executed.is_empty());
        store.record_run(&again)?;

        let session = store.session()?;
        let definition =
            AccessDefinition::load(&session, "config", &p("/modules/ui/groups/target"))?;
        assert!(definition.lists("editor", Voter::Allow));
        drop(session);

        let runs = store.list_runs(Some("demo"))?;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, "committed");
        assert_eq!(runs[0].tasks_applied, 2);
        assert_eq!(runs[1].from_version.as_deref(), Some("1.0.0"));
        assert_eq!(runs[0].result["module"], "demo");
        assert!(store.list_runs(Some("other"))?.is_empty());
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn migrate_adopts_unrecorded_v1_tables() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(current_schema_version(&store.conn)?, 2);
        assert!(table_exists(&store.conn, "migration_runs")?);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn migrate_rejects_invalid_legacy_schema() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch("CREATE TABLE nodes(id INTEGER PRIMARY KEY, path TEXT);")?;

        let err = match store.migrate() {
            Ok(()) => return Err(anyhow!("expected migration to fail on invalid legacy schema")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("nodes has no workspace column"));
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let mut source = migrated()?;
        {
            let mut session = source.session()?;
            session.ensure_path("website", &p("/travel/contact"), PAGE_NODE_TYPE, PAGE_NODE_TYPE)?;
            session.add_node("website", &p("/travel/about"), PAGE_NODE_TYPE)?;
            session.order_before("website", &p("/travel/about"), Some("contact"))?;
            session.set_property("website", &p("/travel"), ACTIVATION_STATUS, 2_i64.into())?;
            session.add_mixin("website", &p("/travel/contact"), "mgnl:hasVariants")?;
            session.add_node("config", &p("/server"), "mgnl:content")?;
            session.set_property("config", &p("/server"), "admin", true.into())?;
            session.save()?;
        }

        let out_dir = temp_path("export");
        let manifest = source.export_snapshot(&out_dir)?;
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].records, 4);

        let mut target = migrated()?;
        let summary = target.import_snapshot(&out_dir, false)?;
        assert_eq!(summary.imported_nodes, 4);

        assert_eq!(target.list_children("website", &p("/travel"))?, vec!["about", "contact"]);
        let Some(server) = target.read_node("config", &p("/server"))? else {
            return Err(anyhow!("imported server node missing"));
        };
        assert_eq!(server.properties[0].value, PropertyValue::Boolean(true));

        let again = target.import_snapshot(&out_dir, true)?;
        assert_eq!(again.imported_nodes, 0);
        assert_eq!(again.skipped_existing_nodes, 4);
        assert!(target.import_snapshot(&out_dir, false).is_err());

        fs::remove_dir_all(&out_dir)
            .with_context(|| format!("failed to cleanup export dir {}", out_dir.display()))?;
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        let mut source = migrated()?;
        {
            let mut session = source.session()?;
            session.add_node("website", &p("/travel"), PAGE_NODE_TYPE)?;
            session.save()?;
        }
        let out_dir = temp_path("tamper");
        source.export_snapshot(&out_dir)?;
        fs::write(
            out_dir.join(NODES_FILE),
            concat!(
                r#"{"workspace":"website","path":"/evil","primary_type":"mgnl:page","#,
                r#""mixins":[],"properties":[]}"#,
                "\n"
            ),
        )?;

        let mut target = migrated()?;
        let err = match target.import_snapshot(&out_dir, false) {
            Ok(_) => return Err(anyhow!("expected tampered import to fail")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("digest mismatch"));
        assert!(target.read_node("website", &p("/evil"))?.is_none());

        fs::remove_dir_all(&out_dir)
            .with_context(|| format!("failed to cleanup export dir {}", out_dir.display()))?;
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let mut source = migrated()?;
        {
            let mut session = source.session()?;
            session.add_node("website", &p("/travel"), PAGE_NODE_TYPE)?;
            session.save()?;
        }

        let backup_file = temp_path("backup").with_extension("sqlite3");
        source.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert!(target.read_node("website", &p("/travel"))?.is_some());
        assert_eq!(target.schema_status()?.current_version, LATEST_SCHEMA_VERSION);

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn integrity_check_reports_orphans() -> Result<()> {
        let store = migrated()?;
        let clean = store.integrity_check()?;
        assert!(clean.quick_check_ok);
        assert!(clean.orphan_nodes.is_empty());
        assert_eq!(clean.schema_status.current_version, 2);

        store.conn.execute(
            "INSERT INTO nodes(workspace, path, parent_path, name, primary_type)
             VALUES ('website', '/lost/child', '/lost', 'child', 'mgnl:page')",
            [],
        )?;
        let report = store.integrity_check()?;
        assert_eq!(report.orphan_nodes, vec!["website:/lost/child"]);
        Ok(())
    }
}
