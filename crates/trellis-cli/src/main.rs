use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};
use trellis_core::store::WORKSPACE_CONFIG;
use trellis_core::{
    AccessDefinition, MigrationEngine, MigrationError, MigrationResult, NodePath, NodeRoleRegistry,
    TaskCatalog, Version,
};
use trellis_store_sqlite::SqliteStore;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis module migration CLI")]
struct Cli {
    #[arg(long, default_value = "./trellis.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Module {
        #[command(subcommand)]
        command: Box<ModuleCommand>,
    },
    Node {
        #[command(subcommand)]
        command: Box<NodeCommand>,
    },
    Access {
        #[command(subcommand)]
        command: Box<AccessCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ModuleCommand {
    List,
    Status(ModuleArgs),
    Migrate(ModuleMigrateArgs),
    History(ModuleHistoryArgs),
}

#[derive(Debug, Args)]
struct ModuleArgs {
    #[arg(long)]
    module: String,
}

#[derive(Debug, Args)]
struct ModuleMigrateArgs {
    #[arg(long)]
    module: String,
    /// Treat the module as installed at this version instead of reading the stamp.
    #[arg(long, conflicts_with = "clean")]
    from: Option<String>,
    /// Run every task, as for a fresh install.
    #[arg(long, default_value_t = false)]
    clean: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ModuleHistoryArgs {
    #[arg(long)]
    module: Option<String>,
}

#[derive(Debug, Subcommand)]
enum NodeCommand {
    Show(NodeShowArgs),
}

#[derive(Debug, Args)]
struct NodeShowArgs {
    #[arg(long, default_value = WORKSPACE_CONFIG)]
    workspace: String,
    #[arg(long)]
    path: String,
}

#[derive(Debug, Subcommand)]
enum AccessCommand {
    Check(AccessCheckArgs),
}

#[derive(Debug, Args)]
struct AccessCheckArgs {
    #[arg(long, default_value = WORKSPACE_CONFIG)]
    workspace: String,
    #[arg(long)]
    path: String,
    #[arg(long = "role")]
    roles: Vec<String>,
}

/// Where a migration starts from.
#[derive(Debug, Clone)]
enum StartingPoint {
    Detect,
    Clean,
    From(Version),
}

impl StartingPoint {
    fn from_args(args: &ModuleMigrateArgs) -> Result<Self> {
        if args.clean {
            return Ok(Self::Clean);
        }
        match args.from.as_deref() {
            Some(raw) => Ok(Self::From(
                Version::parse(raw).with_context(|| format!("invalid --from version `{raw}`"))?,
            )),
            None => Ok(Self::Detect),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    install_tracing_subscriber();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    tracing::debug!(db = %cli.db.display(), "opened store");
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Module { command } => run_module(*command, &mut store),
        Command::Node { command } => run_node(*command, &mut store),
        Command::Access { command } => run_access(*command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn require_catalog(module: &str) -> Result<TaskCatalog> {
    trellis_travel_demo::find_catalog(module)?.ok_or_else(|| {
        anyhow!("unknown module `{module}`; run `trellis module list` for the known modules")
    })
}

fn run_module(command: ModuleCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        ModuleCommand::List => run_module_list(),
        ModuleCommand::Status(args) => run_module_status(&args, store),
        ModuleCommand::Migrate(args) => run_module_migrate(&args, store),
        ModuleCommand::History(args) => run_module_history(&args, store),
    }
}

fn run_module_list() -> Result<()> {
    let modules = trellis_travel_demo::catalogs()?
        .iter()
        .map(|catalog| {
            serde_json::json!({
                "module": catalog.module(),
                "latest_version": catalog.latest(),
                "releases": catalog.releases().collect::<Vec<_>>(),
                "tasks": catalog.entries().len()
            })
        })
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({ "modules": modules }))
}

fn run_module_status(args: &ModuleArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let catalog = require_catalog(&args.module)?;
    let engine = MigrationEngine::new(&catalog);

    let session = store.read_session()?;
    let installed = engine.detect(&session)?;
    drop(session);

    let (recognized, pending) = match engine.plan(installed.as_ref()) {
        Ok(plan) => (true, Some(plan)),
        Err(MigrationError::VersionUnrecognized { .. }) => (false, None),
        Err(err) => return Err(err.into()),
    };
    emit_json(serde_json::json!({
        "module": catalog.module(),
        "installed_version": installed,
        "latest_version": catalog.latest(),
        "recognized": recognized,
        "up_to_date": installed.as_ref() == Some(catalog.latest()),
        "pending_tasks": pending
    }))
}

fn run_module_migrate(args: &ModuleMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let catalog = require_catalog(&args.module)?;
    let engine = MigrationEngine::new(&catalog);
    let start = StartingPoint::from_args(args)?;

    if args.dry_run {
        let session = store.read_session()?;
        let from = match &start {
            StartingPoint::Detect => engine.detect(&session)?,
            StartingPoint::Clean => None,
            StartingPoint::From(version) => Some(version.clone()),
        };
        drop(session);
        let plan = engine.plan(from.as_ref())?;
        return emit_json(serde_json::json!({
            "dry_run": true,
            "module": catalog.module(),
            "from_version": from,
            "target_version": catalog.latest(),
            "would_run": plan
        }));
    }

    let result: MigrationResult = {
        let mut session = store.session()?;
        match start {
            StartingPoint::Detect => engine.run(&mut session, &NodeRoleRegistry),
            StartingPoint::Clean => engine.run_from(None, &mut session, &NodeRoleRegistry),
            StartingPoint::From(version) => {
                engine.run_from(Some(version), &mut session, &NodeRoleRegistry)
            }
        }
    };
    let record = store.record_run(&result)?;
    tracing::info!(
        module = %result.module,
        run_id = %result.run_id,
        status = result.status.as_str(),
        "migration run finished"
    );

    emit_json(serde_json::json!({
        "dry_run": false,
        "recorded_at": record.recorded_at,
        "run": result
    }))?;

    match &result.error {
        Some(error) if !result.is_committed() => {
            Err(anyhow!("migration of `{}` failed: {error}", result.module))
        }
        _ => Ok(()),
    }
}

fn run_module_history(args: &ModuleHistoryArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let runs = store.list_runs(args.module.as_deref())?;
    emit_json(serde_json::json!({
        "module": args.module,
        "runs": runs
    }))
}

fn run_node(command: NodeCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        NodeCommand::Show(args) => {
            store.migrate()?;
            let path = NodePath::parse(&args.path)?;
            let snapshot = store
                .read_node(&args.workspace, &path)?
                .ok_or_else(|| anyhow!("node not found: {}:{path}", args.workspace))?;
            let children = store.list_children(&args.workspace, &path)?;
            let mut value =
                serde_json::to_value(&snapshot).context("failed to serialize node snapshot")?;
            if let Value::Object(object) = &mut value {
                object.insert("children".to_string(), serde_json::json!(children));
            }
            emit_json(value)
        }
    }
}

fn run_access(command: AccessCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        AccessCommand::Check(args) => {
            store.migrate()?;
            let path = NodePath::parse(&args.path)?;
            let session = store.read_session()?;
            let definition = AccessDefinition::load(&session, &args.workspace, &path)?;
            drop(session);
            emit_json(serde_json::json!({
                "workspace": args.workspace,
                "path": path,
                "roles": args.roles,
                "granted": definition.is_granted(&args.roles),
                "voters": definition.voters
            }))
        }
    }
}
