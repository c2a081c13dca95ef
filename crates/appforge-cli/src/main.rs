mod config;
mod create_cmd;
mod log_cmd;
mod serve_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use appforge_core::progress::TaskLog;
use appforge_core::{Orchestrator, Pipeline};
use appforge_db::pool;

use config::{AppforgeConfig, CliOverrides};

#[derive(Parser)]
#[command(name = "appforge", about = "Saga-driven provisioning of mini-program novel apps")]
struct Cli {
    /// Database URL (overrides APPFORGE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Root directory for generated apps (overrides APPFORGE_USER_PATH)
    #[arg(long, global = true)]
    user_path: Option<PathBuf>,

    /// Directory holding one template per platform (overrides APPFORGE_TEMPLATE_ROOT)
    #[arg(long, global = true)]
    template_root: Option<PathBuf>,

    /// Directory holding common and per-platform resources (overrides APPFORGE_RESOURCE_ROOT)
    #[arg(long, global = true)]
    resource_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            database_url: self.database_url.clone(),
            user_path: self.user_path.clone(),
            template_root: self.template_root.clone(),
            resource_root: self.resource_root.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an appforge config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/appforge")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the appforge database and run migrations
    DbInit,
    /// Create an app from a JSON request file, streaming progress
    Create {
        /// Path to the request JSON (camelCase, as accepted by POST /api/apps)
        request: PathBuf,
    },
    /// Show a creation task, or list recent tasks
    Status {
        /// Task ID to show (omit to list recent tasks)
        task_id: Option<String>,
        /// How many recent tasks to list
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Replay the log of a creation task
    Log {
        /// Task ID to show entries for
        task_id: String,
        /// Only entries with a sequence number greater than this
        #[arg(long)]
        after: Option<i64>,
    },
    /// Serve the HTTP API and live build logs
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
}

/// Execute the `appforge init` command: write config file.
fn cmd_init(cli: &CliOverrides, db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        paths: config::PathsSection {
            user_path: cli.user_path.clone(),
            template_root: cli.template_root.clone(),
            resource_root: cli.resource_root.clone(),
        },
        limits: config::LimitsSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `appforge db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `appforge db-init` command: create database and run migrations.
async fn cmd_db_init(cli: &CliOverrides) -> anyhow::Result<()> {
    let resolved = AppforgeConfig::resolve(cli)?;

    println!("Initializing appforge database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("appforge db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = cli.overrides();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&overrides, &db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(&overrides).await?;
        }
        Commands::Create { request } => {
            let resolved = AppforgeConfig::resolve(&overrides)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = create_cmd::run_create(&db_pool, &resolved, &request).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { task_id, limit } => {
            let resolved = AppforgeConfig::resolve(&overrides)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, task_id.as_deref(), limit).await;
            db_pool.close().await;
            result?;
        }
        Commands::Log { task_id, after } => {
            let resolved = AppforgeConfig::resolve(&overrides)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = log_cmd::run_log(&db_pool, &task_id, after).await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, port } => {
            let resolved = AppforgeConfig::resolve(&overrides)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let pipeline =
                Pipeline::standard(db_pool.clone(), resolved.layout.clone(), &resolved.limits);
            let orchestrator = Orchestrator::new(
                db_pool.clone(),
                pipeline,
                TaskLog::postgres(db_pool.clone()),
                &resolved.limits,
            );
            let state = serve_cmd::AppState {
                pool: db_pool.clone(),
                orchestrator,
                shutdown: CancellationToken::new(),
            };
            let result = serve_cmd::run_serve(state, &bind, port).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
