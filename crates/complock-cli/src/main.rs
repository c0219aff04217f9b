//! Complock CLI - inspect and administer component edit leases

use chrono::Utc;
use clap::{Parser, Subcommand};
use complock_core::config::Config;
use complock_core::domain::locking::lease::expiry_cutoff;
use complock_core::domain::locking::{Lease, LeaseStore, SqliteLeaseStore};
use complock_core::Error;
use complock_core::storage::Database;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "complock")]
#[command(author, version, about = "Component edit lock administration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Lease database file (overrides database.path)
    #[arg(long, global = true, env = "COMPLOCK_DATABASE")]
    database: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and break edit leases
    Leases {
        #[command(subcommand)]
        action: LeaseAction,
    },

    /// Lease database maintenance
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum LeaseAction {
    /// List every lease
    List {
        /// Only show leases past the lease timeout
        #[arg(long)]
        expired: bool,
    },
    /// Show the exclusive lease on a component
    Show {
        /// Component ID
        component_id: String,
    },
    /// Delete every lease on a component, whoever holds it
    Release {
        /// Component ID
        component_id: String,
        /// Required: the holding session loses its lock without notice
        #[arg(short, long)]
        force: bool,
    },
    /// Delete every lease past the lease timeout
    PurgeExpired,
}

#[derive(Subcommand)]
enum DbAction {
    /// Apply pending schema migrations
    Migrate,
    /// Show schema version and lease count
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g., lock.lease_timeout_minutes)
        key: String,
    },
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Value to set
        value: String,
    },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("complock=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Leases { action } => {
            let config = Config::load()?;
            let db = open_database(&config, cli.database.as_deref()).await?;
            let result = cmd_leases(&db, &config, action, cli.format, cli.quiet).await;
            db.close().await;
            result
        }

        Commands::Db { action } => {
            let config = Config::load()?;
            cmd_db(&config, cli.database.as_deref(), action, cli.quiet).await
        }

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

async fn open_database(config: &Config, path: Option<&std::path::Path>) -> anyhow::Result<Database> {
    let mut db_config = config.to_database_config();
    if let Some(path) = path {
        db_config.path = path.to_path_buf();
    }
    Database::new(db_config).await
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_leases(
    db: &Database,
    config: &Config,
    action: LeaseAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let store = SqliteLeaseStore::new(db.pool().clone());
    let timeout = config.to_lock_config().lease_timeout;

    match action {
        LeaseAction::List { expired } => {
            let now = Utc::now();
            let leases: Vec<Lease> = store
                .list()
                .await?
                .into_iter()
                .filter(|lease| !expired || lease.is_expired(timeout, now))
                .collect();

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&leases)?),
                OutputFormat::Text if leases.is_empty() => {
                    if !quiet {
                        println!("No leases found.");
                    }
                }
                OutputFormat::Text => {
                    if !quiet {
                        println!("Leases:");
                    }
                    for lease in &leases {
                        println!("  {}", format_lease(lease, timeout));
                    }
                }
            }
        }

        LeaseAction::Show { component_id } => {
            let Some(lease) = store.get(&component_id).await? else {
                return Err(Error::LeaseNotFound(component_id).into());
            };

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&lease)?),
                OutputFormat::Text => {
                    let now = Utc::now();
                    println!("Component: {}", lease.component_id);
                    println!("  User: {}", lease.user_id);
                    println!("  Session: {}", lease.session);
                    println!("  Started: {}", lease.lease_start.format("%Y-%m-%d %H:%M:%S"));
                    println!("  Age: {}", format_age(lease.age(now)));
                    println!(
                        "  Expired: {}",
                        if lease.is_expired(timeout, now) { "yes" } else { "no" }
                    );
                }
            }
        }

        LeaseAction::Release {
            component_id,
            force,
        } => {
            if !force {
                return Err(anyhow::anyhow!(
                    "Releasing a lease takes the component away from its editor. \
                     Re-run with --force to confirm."
                ));
            }

            let removed = store.delete_all(&component_id).await?;
            if removed == 0 {
                warn!(component_id = %component_id, "No lease to release");
            } else {
                info!(component_id = %component_id, removed, "Lease released by administrator");
            }
            if !quiet {
                println!("Released {} lease(s) on '{}'.", removed, component_id);
            }
        }

        LeaseAction::PurgeExpired => {
            let removed = store.purge_expired(expiry_cutoff(timeout, Utc::now())).await?;
            if !quiet {
                println!("Purged {} expired lease(s).", removed);
            }
        }
    }

    Ok(())
}

async fn cmd_db(
    config: &Config,
    path: Option<&std::path::Path>,
    action: DbAction,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        DbAction::Migrate => {
            let db = open_database(config, path).await?;
            let status = db.migration_status().await?;
            if !quiet {
                println!(
                    "Database at schema version {} ({}).",
                    status.current_version,
                    db.path().display()
                );
            }
            db.close().await;
        }
        DbAction::Status => {
            let mut db_config = config.to_database_config().no_migrate();
            if let Some(path) = path {
                db_config.path = path.to_path_buf();
            }
            let db = Database::new(db_config).await?;
            db.health_check().await?;

            let status = db.migration_status().await?;
            println!("Database: {}", db.path().display());
            println!("  Schema version: {}", status.current_version);
            println!("  Latest version: {}", status.target_version);
            if status.needs_migration {
                println!("  Migrations pending. Run `complock db migrate`.");
            } else {
                let leases = SqliteLeaseStore::new(db.pool().clone()).list().await?;
                println!("  Leases: {}", leases.len());
            }
            db.close().await;
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn format_lease(lease: &Lease, timeout: Duration) -> String {
    let now = Utc::now();
    let session: String = lease.session.chars().take(8).collect();
    let expired = if lease.is_expired(timeout, now) {
        " [expired]"
    } else {
        ""
    };
    format!(
        "{} - {} ({}) {}{}",
        lease.component_id,
        lease.user_id,
        session,
        format_age(lease.age(now)),
        expired
    )
}

fn format_age(age: Duration) -> String {
    let minutes = age.as_secs() / 60;
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}
