//! CLI tool for managing synchronized tables.

mod error;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Serialize, de::DeserializeOwned};
use snafu::ResultExt;
use tablesync_core::{
    AllowAll, ColumnSpec, ConflictPolicy, ConflictResolution, DataETag, EngineConfig, Principal,
    RowETag, RowUpdate, SchemaETag, StorageLocation, SyncEngine, TableIdentity,
};
use tracing_subscriber::EnvFilter;

use crate::error::{
    CliResult, InvalidRootSnafu, InvalidValueSnafu, LoadConfigSnafu, OpenEngineSnafu,
    OperationSnafu, ParseInputSnafu, ReadInputSnafu, RenderSnafu,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictPolicyArg {
    Reject,
    Preserve,
}

impl From<ConflictPolicyArg> for ConflictPolicy {
    fn from(v: ConflictPolicyArg) -> Self {
        match v {
            ConflictPolicyArg::Reject => ConflictPolicy::Reject,
            ConflictPolicyArg::Preserve => ConflictPolicy::PreserveConflicts,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TakeArg {
    Local,
    Server,
}

impl From<TakeArg> for ConflictResolution {
    fn from(v: TakeArg) -> Self {
        match v {
            TakeArg::Local => ConflictResolution::TakeLocal,
            TakeArg::Server => ConflictResolution::TakeServer,
        }
    }
}

#[derive(Debug, clap::Args)]
struct TableArgs {
    #[arg(long)]
    app: String,

    #[arg(long)]
    table: String,

    /// Generation to address (default: the current one)
    #[arg(long = "schema-etag")]
    schema_etag: Option<String>,
}

#[derive(Debug, clap::Args)]
struct PageArgs {
    #[arg(long)]
    cursor: Option<String>,

    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a table from a JSON column list
    Create {
        #[arg(long)]
        app: String,

        #[arg(long)]
        table: String,

        /// JSON file holding an array of column definitions
        #[arg(long)]
        columns: PathBuf,
    },

    /// Replace a table's schema with a new, empty generation
    Schema {
        #[arg(long)]
        app: String,

        #[arg(long)]
        table: String,

        /// schemaETag the change is based on
        #[arg(long)]
        expected: String,

        #[arg(long)]
        columns: PathBuf,
    },

    /// List the tables of an application
    ListTables {
        #[arg(long)]
        app: String,
    },

    /// Print the nested data model of a table
    Model {
        #[arg(long)]
        app: String,

        #[arg(long)]
        table: String,
    },

    /// Insert or update one row
    Put {
        #[command(flatten)]
        target: TableArgs,

        #[arg(long = "row-id")]
        row_id: String,

        /// rowETag the update is based on (omit for inserts)
        #[arg(long)]
        etag: Option<String>,

        /// Repeatable COLUMN=VALUE
        #[arg(long = "value")]
        values: Vec<String>,

        /// Repeatable column to set to null
        #[arg(long = "null")]
        nulls: Vec<String>,
    },

    /// Submit a JSON array of row updates as one change set
    PutMany {
        #[command(flatten)]
        target: TableArgs,

        #[arg(long)]
        rows: PathBuf,

        /// dataETag the batch is based on
        #[arg(long = "expected-data-etag")]
        expected_data_etag: Option<String>,
    },

    /// Delete one row
    Delete {
        #[command(flatten)]
        target: TableArgs,

        #[arg(long = "row-id")]
        row_id: String,

        #[arg(long)]
        etag: Option<String>,
    },

    /// Print one row
    Get {
        #[command(flatten)]
        target: TableArgs,

        #[arg(long = "row-id")]
        row_id: String,
    },

    /// Page through the live rows by rowId
    Rows {
        #[command(flatten)]
        target: TableArgs,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Rows changed since a dataETag
    Diff {
        #[command(flatten)]
        target: TableArgs,

        /// dataETag to diff against (default: the empty table)
        #[arg(long)]
        since: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Change sets committed after a point in history
    ChangeSets {
        #[command(flatten)]
        target: TableArgs,

        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        sequence: Option<u64>,
    },

    /// Rows produced by one change set
    ChangeSetRows {
        #[command(flatten)]
        target: TableArgs,

        #[arg(long = "data-etag")]
        data_etag: String,

        /// List the rows the change set deleted instead of the live ones
        #[arg(long, default_value_t = false)]
        deleted: bool,

        #[command(flatten)]
        page: PageArgs,
    },

    /// List pending conflicts
    Conflicts {
        #[command(flatten)]
        target: TableArgs,
    },

    /// Settle a conflict by keeping one side
    Resolve {
        #[command(flatten)]
        target: TableArgs,

        #[arg(long = "row-id")]
        row_id: String,

        #[arg(long, value_enum)]
        take: TakeArg,
    },
}

#[derive(Debug, Parser)]
struct Cli {
    /// Directory holding the tables
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// User the commands run as
    #[arg(long, global = true, default_value = "cli")]
    user: String,

    /// Optional JSON engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured conflict policy
    #[arg(long = "conflict-policy", global = true, value_enum)]
    conflict_policy: Option<ConflictPolicyArg>,

    #[command(subcommand)]
    cmd: Command,
}

struct Session {
    engine: SyncEngine,
    principal: Principal,
}

impl Session {
    async fn open(cli: &Cli) -> CliResult<Self> {
        let root = cli.root.to_string_lossy();
        let location = StorageLocation::parse(&root).context(InvalidRootSnafu {
            root: root.to_string(),
        })?;

        let mut config = match &cli.config {
            Some(path) => EngineConfig::from_json_file(path)
                .await
                .context(LoadConfigSnafu)?,
            None => EngineConfig::default(),
        };
        if let Some(policy) = cli.conflict_policy {
            config = config.with_conflict_policy(policy.into());
        }
        tracing::debug!(root = %root, policy = %config.conflict_policy, "opening tables");

        let engine = SyncEngine::open(location, config, Arc::new(AllowAll))
            .await
            .context(OpenEngineSnafu {
                root: root.to_string(),
            })?;
        Ok(Self {
            engine,
            principal: Principal::new(&cli.user),
        })
    }

    async fn resolve(&self, target: &TableArgs) -> CliResult<TableIdentity> {
        match &target.schema_etag {
            Some(etag) => Ok(TableIdentity::new(
                &target.app,
                &target.table,
                SchemaETag::new(etag.as_str()),
            )),
            None => self
                .engine
                .table_identity(&self.principal, &target.app, &target.table)
                .await
                .context(OperationSnafu { op: "lookup" }),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let json = serde_json::to_string_pretty(value).context(RenderSnafu)?;
    println!("{json}");
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let display = path.display().to_string();
    let text = tokio::fs::read_to_string(path)
        .await
        .context(ReadInputSnafu {
            path: display.clone(),
        })?;
    serde_json::from_str(&text).context(ParseInputSnafu { path: display })
}

fn parse_value(spec: &str) -> CliResult<(String, String)> {
    match spec.split_once('=') {
        Some((column, value)) if !column.is_empty() => Ok((column.to_string(), value.to_string())),
        _ => InvalidValueSnafu { spec }.fail(),
    }
}

fn non_empty(etag: Option<String>) -> Option<String> {
    etag.filter(|e| !e.is_empty())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let session = Session::open(&cli).await?;
    let engine = &session.engine;
    let who = &session.principal;

    match cli.cmd {
        Command::Create {
            app,
            table,
            columns,
        } => {
            let columns: Vec<ColumnSpec> = read_json(&columns).await?;
            let identity = engine
                .create_table(who, &app, &table, &columns)
                .await
                .context(OperationSnafu { op: "create" })?;
            print_json(&identity)
        }

        Command::Schema {
            app,
            table,
            expected,
            columns,
        } => {
            let columns: Vec<ColumnSpec> = read_json(&columns).await?;
            let identity = engine
                .schema_change(who, &app, &table, &SchemaETag::new(expected), &columns)
                .await
                .context(OperationSnafu { op: "schema change" })?;
            print_json(&identity)
        }

        Command::ListTables { app } => print_json(&engine.list_tables(who, &app).await),

        Command::Model { app, table } => {
            let model = engine
                .data_model(who, &app, &table)
                .await
                .context(OperationSnafu { op: "model" })?;
            print_json(&model)
        }

        Command::Put {
            target,
            row_id,
            etag,
            values,
            nulls,
        } => {
            let table = session.resolve(&target).await?;
            let mut update = RowUpdate::new(row_id);
            if let Some(etag) = non_empty(etag) {
                update = update.with_etag(RowETag::new(etag));
            }
            for spec in &values {
                let (column, value) = parse_value(spec)?;
                update = update.value(column, value);
            }
            for column in nulls {
                update = update.null(column);
            }
            let row = engine
                .create_or_update_row(who, &table, update)
                .await
                .context(OperationSnafu { op: "put" })?;
            print_json(&row)
        }

        Command::PutMany {
            target,
            rows,
            expected_data_etag,
        } => {
            let table = session.resolve(&target).await?;
            let updates: Vec<RowUpdate> = read_json(&rows).await?;
            let expected = non_empty(expected_data_etag).map(DataETag::new);
            let outcome = engine
                .insert_or_update_rows(who, &table, expected.as_ref(), updates)
                .await
                .context(OperationSnafu { op: "put-many" })?;
            print_json(&outcome)
        }

        Command::Delete {
            target,
            row_id,
            etag,
        } => {
            let table = session.resolve(&target).await?;
            let row = engine
                .delete_row(who, &table, &row_id, non_empty(etag).map(RowETag::new))
                .await
                .context(OperationSnafu { op: "delete" })?;
            print_json(&row)
        }

        Command::Get { target, row_id } => {
            let table = session.resolve(&target).await?;
            let row = engine
                .get_row(who, &table, &row_id)
                .await
                .context(OperationSnafu { op: "get" })?;
            print_json(&row)
        }

        Command::Rows { target, page } => {
            let table = session.resolve(&target).await?;
            let rows = engine
                .get_rows(who, &table, page.cursor.as_deref(), page.limit)
                .await
                .context(OperationSnafu { op: "rows" })?;
            print_json(&rows)
        }

        Command::Diff {
            target,
            since,
            page,
        } => {
            let table = session.resolve(&target).await?;
            let since = non_empty(since).map(DataETag::new);
            let rows = engine
                .get_rows_since(
                    who,
                    &table,
                    since.as_ref(),
                    page.cursor.as_deref(),
                    page.limit,
                )
                .await
                .context(OperationSnafu { op: "diff" })?;
            print_json(&rows)
        }

        Command::ChangeSets {
            target,
            since,
            sequence,
        } => {
            let table = session.resolve(&target).await?;
            let since = non_empty(since).map(DataETag::new);
            let list = engine
                .get_change_sets_since(who, &table, since.as_ref(), sequence)
                .await
                .context(OperationSnafu { op: "change-sets" })?;
            print_json(&list)
        }

        Command::ChangeSetRows {
            target,
            data_etag,
            deleted,
            page,
        } => {
            let table = session.resolve(&target).await?;
            let rows = engine
                .get_change_set_rows(
                    who,
                    &table,
                    &DataETag::new(data_etag),
                    !deleted,
                    page.cursor.as_deref(),
                    page.limit,
                )
                .await
                .context(OperationSnafu {
                    op: "change-set-rows",
                })?;
            print_json(&rows)
        }

        Command::Conflicts { target } => {
            let table = session.resolve(&target).await?;
            let conflicts = engine
                .conflicts(who, &table)
                .await
                .context(OperationSnafu { op: "conflicts" })?;
            print_json(&conflicts)
        }

        Command::Resolve {
            target,
            row_id,
            take,
        } => {
            let table = session.resolve(&target).await?;
            let row = engine
                .resolve_conflict(who, &table, &row_id, take.into())
                .await
                .context(OperationSnafu { op: "resolve" })?;
            print_json(&row)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
