use std::path::PathBuf;

use anyhow::Context;
use chwire::migrate::{MigrationOptions, Migrations, Migrator};
use chwire::{Block, Config, Db};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chwire")]
#[command(about = "Native protocol client for ClickHouse-compatible databases", long_about = None)]
struct Args {
    /// Connection string, e.g. clickhouse://default:@localhost:9000/default
    #[arg(long, env = "CHWIRE_DSN", global = true)]
    dsn: Option<String>,

    /// TOML configuration file (used when no DSN is given)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server answers
    Ping,

    /// Run a statement and print the number of rows it returned
    Exec { sql: String },

    /// Run a query and print its rows
    Query {
        sql: String,

        /// One JSON object per row
        #[arg(long)]
        json: bool,
    },

    /// Manage schema migrations
    Migrate {
        /// Directory holding *.up.sql / *.down.sql files
        #[arg(long, default_value = "./migrations")]
        dir: PathBuf,

        /// Record migrations without running them
        #[arg(long)]
        nop: bool,

        /// Only record migrations whose step succeeded
        #[arg(long)]
        apply_on_success: bool,

        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateAction {
    /// Create the migration and lock tables
    Init,
    /// Drop and recreate the migration tables
    Reset,
    /// Apply pending migrations
    Up,
    /// Roll back the last migration group
    Down,
    /// List migrations and their status
    Status,
    Lock,
    Unlock,
    /// Create an up/down SQL migration pair
    CreateSql { name: String },
    /// Create a Rust migration stub
    CreateCode { name: String },
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let cfg = match (&args.dsn, &args.config) {
        (Some(dsn), _) => Config::from_dsn(dsn)?,
        (None, Some(path)) => Config::from_toml_file(path)?,
        (None, None) => Config::default(),
    };
    Ok(cfg)
}

fn print_block(block: &Block, json: bool) -> anyhow::Result<()> {
    for row in 0..block.num_rows() {
        if json {
            let mut obj = serde_json::Map::new();
            for column in block.columns() {
                let value = column.data().value(row).unwrap_or(serde_json::Value::Null);
                obj.insert(column.name().to_string(), value);
            }
            println!("{}", serde_json::to_string(&obj)?);
        } else {
            let cells: Vec<String> = block
                .columns()
                .iter()
                .map(|c| match c.data().value(row) {
                    Some(serde_json::Value::String(s)) => s,
                    Some(v) => v.to_string(),
                    None => String::new(),
                })
                .collect();
            println!("{}", cells.join("\t"));
        }
    }
    Ok(())
}

async fn run_migrate(
    db: Db,
    dir: PathBuf,
    opts: MigrationOptions,
    apply_on_success: bool,
    action: MigrateAction,
) -> anyhow::Result<()> {
    let mut migrations = Migrations::new().with_directory(&dir);
    if dir.is_dir() {
        migrations
            .discover(&dir)
            .with_context(|| format!("failed to read migrations from {}", dir.display()))?;
    }
    let migrator = Migrator::new(db, migrations).apply_on_success(apply_on_success);

    match action {
        MigrateAction::Init => migrator.init().await?,
        MigrateAction::Reset => migrator.reset().await?,
        MigrateAction::Up => {
            let group = migrator.migrate(opts).await?;
            if group.is_zero() {
                println!("there are no new migrations to run");
            } else {
                println!("migrated to {}", group);
            }
        }
        MigrateAction::Down => {
            let group = migrator.rollback(opts).await?;
            if group.is_zero() {
                println!("there are no groups to roll back");
            } else {
                println!("rolled back {}", group);
            }
        }
        MigrateAction::Status => {
            let ms = migrator.migrations_with_status().await?;
            for m in ms.iter() {
                match m.migrated_at {
                    Some(at) if m.is_applied() => {
                        println!("{}\tgroup #{}\t{}", m.name, m.group_id, at.to_rfc3339())
                    }
                    _ => println!("{}\tpending", m.name),
                }
            }
            println!("last group: {}", ms.last_group());
        }
        MigrateAction::Lock => migrator.lock().await?,
        MigrateAction::Unlock => migrator.unlock().await?,
        MigrateAction::CreateSql { name } => {
            std::fs::create_dir_all(&dir)?;
            for file in migrator.create_sql_migrations(&name)? {
                println!("created {}", file.path.display());
            }
        }
        MigrateAction::CreateCode { name } => {
            std::fs::create_dir_all(&dir)?;
            let file = migrator.create_code_migration(&name)?;
            println!("created {}", file.path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chwire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = load_config(&args)?;
    tracing::debug!("Using server {} database {}", cfg.addr, cfg.database);
    let db = Db::new(cfg)?;

    match args.command {
        Command::Ping => {
            let info = db.server_info().await?;
            db.ping().await?;
            println!("pong from {} {} (revision {})", info.name, info.version(), info.revision);
        }
        Command::Exec { sql } => {
            let result = db.exec(&sql).await?;
            println!("{}", result.affected);
        }
        Command::Query { sql, json } => {
            let mut rows = db.query(&sql).await?;
            let mut block = Block::new();
            while rows.next_into(&mut block).await {
                print_block(&block, json)?;
            }
            if let Some(err) = rows.into_err() {
                return Err(err.into());
            }
        }
        Command::Migrate {
            dir,
            nop,
            apply_on_success,
            action,
        } => {
            run_migrate(db.clone(), dir, MigrationOptions { nop }, apply_on_success, action).await?;
        }
    }

    db.close();
    Ok(())
}
