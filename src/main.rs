use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use graphrepo::db::{migrate, Db};
use graphrepo::error::GraphRepoError;
use graphrepo::index::{CURSOR_START, ProcessingIndexItem};
use graphrepo::{Config, LockOwner, Repository};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "graphrepo")]
#[command(about = "Query and maintain the relationship index of a digital object repository")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply migrations and verify the database schema (default)
    Verify,
    /// Rebuild index records of the given objects
    Rebuild {
        #[arg(required = true)]
        pids: Vec<String>,
    },
    /// Print the model of an object
    Model { pid: String },
    /// Print own and foster parents of an object
    Parents { pid: String },
    /// Print children of an object, all or for one relation
    Children {
        pid: String,
        #[arg(long)]
        relation: Option<String>,
    },
    /// List objects of a model sorted by title
    ByModel {
        model: String,
        #[arg(long)]
        title_prefix: Option<String>,
        #[arg(long, default_value = "20")]
        rows: usize,
        #[arg(long, default_value = "0", conflicts_with = "cursor")]
        page: usize,
        /// Cursor mark from a previous call; `*` starts a cursor scan
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Print the structure summary of an object
    Structure { pid: String },
    /// List every PID in the structural subtree of an object
    Subtree { pid: String },
    /// Find the first descendant carrying the viewable datastream
    FirstViewable { pid: String },
}

#[derive(Serialize)]
struct ByModelPage<'a> {
    items: &'a [ProcessingIndexItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.repository.log_level.as_str())
    ).init();

    match cli.command.unwrap_or(Command::Verify) {
        Command::Verify => run_schema_verification(&config).await,
        command => run_command(&config, command).await,
    }
}

/// Open the repository and run one query or maintenance command
async fn run_command(config: &Config, command: Command) -> Result<()> {
    let repo = Repository::open(config)
        .await
        .context("Failed to open repository")?;
    let owner = LockOwner::new();

    match command {
        Command::Verify => run_schema_verification(config).await?,
        Command::Rebuild { pids } => {
            let mut failed = 0;
            for pid in &pids {
                match repo.reindex(&owner, pid).await {
                    Ok(records) => log::info!("✓ {} ({} records)", pid, records),
                    Err(e) => {
                        failed += 1;
                        log::error!("✗ {}: {}", pid, e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} objects failed to rebuild", failed, pids.len());
            }
        }
        Command::Model { pid } => {
            print_json(&repo.index().get_model(&pid).await?)?;
        }
        Command::Parents { pid } => {
            print_json(&repo.index().get_owned_and_fostered_parents(&pid).await?)?;
        }
        Command::Children { pid, relation } => match relation {
            Some(relation) => print_json(&repo.index().get_children(&relation, &pid).await?)?,
            None => print_json(&repo.index().get_owned_and_fostered_children(&pid).await?)?,
        },
        Command::ByModel { model, title_prefix, rows, page, cursor } => {
            let prefix = title_prefix.as_deref();
            match cursor {
                Some(cursor) => {
                    let cursor = if cursor.is_empty() { CURSOR_START.to_string() } else { cursor };
                    let (items, next) = repo
                        .index()
                        .get_by_model_with_cursor(&model, prefix, rows, &cursor)
                        .await?;
                    print_json(&ByModelPage { items: &items, next_cursor: Some(next) })?;
                }
                None => {
                    let items = repo.index().get_by_model(&model, prefix, rows, page).await?;
                    print_json(&ByModelPage { items: &items, next_cursor: None })?;
                }
            }
        }
        Command::Structure { pid } => {
            let info = repo.structure_info(&owner, &pid).await?;
            print_json(&info.to_json()?)?;
        }
        Command::Subtree { pid } => {
            print_json(&repo.subtree_pids(&owner, &pid).await?)?;
        }
        Command::FirstViewable { pid } => {
            print_json(&repo.first_viewable_descendant(&owner, &pid).await?)?;
        }
    }

    Ok(())
}

/// Run migrations and verify the database schema
async fn run_schema_verification(config: &Config) -> Result<()> {
    log::info!("Starting graphrepo v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Objects dir: {}", config.objects_dir().display());
    log::info!("Database path: {}", config.db_path().display());

    let db = Db::new(config.db_path());
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;
    log::info!("Database initialized successfully");

    verify_database_schema(&db).await?;
    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = ["object_locks", "processing_index", "schema_migrations"];
        let mut all_tables_exist = true;
        for table in &expected_tables {
            if !tables.iter().any(|t| t == table) {
                log::error!("Missing table: {}", table);
                all_tables_exist = false;
            } else {
                log::debug!("✓ Table exists: {}", table);
            }
        }
        if !all_tables_exist {
            return Err(GraphRepoError::Config("Not all required tables exist".to_string()));
        }

        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name")?;
        let indexes: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        for index_name in [
            "idx_processing_index_source",
            "idx_processing_index_target",
            "idx_processing_index_model_title",
            "idx_object_locks_expiry",
        ] {
            if indexes.iter().any(|i| i == index_name) {
                log::debug!("✓ Index exists: {}", index_name);
            } else {
                log::warn!("Index not found: {}", index_name);
            }
        }

        let applied = migrate::get_applied_migrations(conn)?;
        log::debug!("✓ {} migrations applied", applied.len());

        let stale_locks: i64 = conn.query_row(
            "SELECT COUNT(*) FROM object_locks WHERE expires_at <= ?1",
            [chrono::Utc::now().timestamp_millis()],
            |row| row.get(0),
        )?;
        if stale_locks > 0 {
            log::warn!("{} expired lock(s) waiting to be reclaimed", stale_locks);
        }

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(GraphRepoError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }
        log::debug!("✓ Journal mode: WAL");

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(GraphRepoError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");

        Ok(())
    }).await?;

    log::info!("✓ Database schema verification complete");
    Ok(())
}
