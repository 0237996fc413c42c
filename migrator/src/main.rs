// Migration runner binary entry point

mod files;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgkit::{telemetry, DatabaseClient, MigrationManager, Settings};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pgkit-migrate")]
#[command(about = "Apply and inspect versioned PostgreSQL migrations", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding default.toml / local.toml
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Bookkeeping table name
    #[arg(long, default_value = pgkit::migrations::DEFAULT_MIGRATIONS_TABLE)]
    table: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check connectivity and print pool counters
    Health,
    /// List applied migrations
    Status,
    /// Apply every pending `<version>_<name>.sql` in a directory
    Up {
        #[arg(value_name = "DIRECTORY")]
        dir: PathBuf,
    },
    /// Apply a single migration file
    Apply {
        version: String,
        name: String,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Revert one migration using its `.down.sql` script
    Down {
        version: String,
        #[arg(value_name = "DIRECTORY")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config).context("loading configuration")?;
    settings
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(target_db = %settings.database.redacted_url(), "Configuration loaded");

    let client = DatabaseClient::connect(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;

    let outcome = run(&cli, &client).await;
    client.close().await;
    telemetry::shutdown_tracer();
    outcome
}

async fn run(cli: &Cli, client: &DatabaseClient) -> Result<()> {
    if let Command::Health = cli.command {
        let healthy = client.health_check().await;
        let report = serde_json::json!({
            "healthy": healthy,
            "pool": client.pool_info(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !healthy {
            anyhow::bail!("database is not reachable");
        }
        return Ok(());
    }

    let migrations = MigrationManager::with_table(cli.table.as_str())?;
    let mut session = client.session().await?;
    let result = run_migrations(cli, &migrations, &mut session).await;
    session.close().await?;
    result
}

async fn run_migrations(
    cli: &Cli,
    migrations: &MigrationManager,
    session: &mut pgkit::Session,
) -> Result<()> {
    migrations.initialize(session).await?;

    match &cli.command {
        Command::Health => {}
        Command::Status => {
            let status = migrations.get_migration_status(session).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Up { dir } => {
            let pending = files::load_migrations(dir)?;
            let applied = migrations.apply_pending(session, &pending).await?;
            info!(count = applied.len(), "Migrations applied");
            for version in applied {
                println!("applied {}", version);
            }
        }
        Command::Apply {
            version,
            name,
            file,
        } => {
            let sql = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            migrations
                .apply_migration(session, version, name, &sql)
                .await?;
            println!("applied {}", version);
        }
        Command::Down { version, dir } => {
            let down_sql = files::read_down_script(dir, version)?;
            if migrations.revert_migration(session, version, &down_sql).await? {
                println!("reverted {}", version);
            } else {
                println!("{} was not applied", version);
            }
        }
    }
    Ok(())
}
