use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use reportrunner::config::Config;
use reportrunner::driver::chrome::ChromeLauncher;
use reportrunner::engine::{self, EngineDeps};
use reportrunner::retry::TokioSleeper;
use reportrunner::sink::HttpSheetSink;
use reportrunner::store::{self, NewTenant, RunLog, TenantStore};
use reportrunner::vault::Vault;

#[derive(Parser)]
#[command(
    name = "reportrunner",
    about = "Scheduled extraction of daily dashboard reports",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the dashboard/sink configuration file
    #[arg(long, default_value = "config.toml", global = true)]
    config: String,

    /// Path to the SQLite database
    #[arg(long, default_value = "data/reportrunner.db", global = true)]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scheduling pass (intended to be invoked from cron)
    Run {
        /// Run exactly this tenant now, ignoring its schedule
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Manage tenants
    Tenants {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Show recent run outcomes
    History {
        /// Number of entries to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum TenantAction {
    /// List all tenants
    List,

    /// Add a new tenant (credentials are encrypted before storage)
    Add {
        /// Tenant name (unique)
        #[arg(long)]
        name: String,

        /// Dashboard login username
        #[arg(long)]
        username: String,

        /// Dashboard login password
        #[arg(long)]
        password: String,

        /// Report-unlock PIN; falls back to REPORTRUNNER_DEFAULT_PIN if unset
        #[arg(long)]
        pin: Option<String>,

        /// Local hour of day (0-23) the tenant's report should run
        #[arg(long)]
        run_hour: u8,

        /// Destination spreadsheet id
        #[arg(long)]
        sheet_id: String,

        /// Visible text of the tenant's entry in the scope dropdown
        #[arg(long)]
        scope: Option<String>,

        /// Create the tenant disabled
        #[arg(long)]
        inactive: bool,
    },

    /// Remove a tenant
    Remove {
        /// Tenant name
        #[arg(long)]
        name: String,
    },

    /// Flag a tenant to run on the next scheduling pass regardless of hour
    RunNow {
        /// Tenant name
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { tenant } => {
            let cfg = Config::load(Path::new(&cli.config))?;
            let vault = Vault::new(cfg.require_master_key()?)?;
            let sink = HttpSheetSink::new(&cfg.sink.endpoint, cfg.require_sink_token()?)?;

            let pool = store::open_pool(&cli.db)?;
            let tenants = TenantStore::new(pool.clone());
            let log = RunLog::new(pool);
            let launcher = ChromeLauncher;
            let sleeper = TokioSleeper;

            let deps = EngineDeps {
                tenants: &tenants,
                log: &log,
                vault: &vault,
                launcher: &launcher,
                sink: &sink,
                sleeper: &sleeper,
            };
            let summary =
                engine::run_once(&cfg, &deps, tenant.as_deref(), Utc::now()).await?;

            println!(
                "Selected: {}  Succeeded: {}  Failed: {}",
                summary.selected, summary.succeeded, summary.failed
            );
            if !summary.all_ok() {
                std::process::exit(1);
            }
        }
        Commands::Tenants { action } => {
            let pool = store::open_pool(&cli.db)?;
            let tenants = TenantStore::new(pool);

            match action {
                TenantAction::List => {
                    let list = tenants.list_all()?;
                    if list.is_empty() {
                        println!("No tenants configured.");
                    } else {
                        println!(
                            "{:<20} | {:<8} | {:<24} | {:<6} | Manual",
                            "Name", "Hour", "Sheet", "Active"
                        );
                        println!(
                            "{:-<20}-|-{:-<8}-|-{:-<24}-|-{:-<6}-|-{:-<6}",
                            "", "", "", "", ""
                        );
                        for t in list {
                            println!(
                                "{:<20} | {:<8} | {:<24} | {:<6} | {}",
                                t.name, t.run_hour, t.sheet_id, t.active, t.manual_run
                            );
                        }
                    }
                }
                TenantAction::Add {
                    name,
                    username,
                    password,
                    pin,
                    run_hour,
                    sheet_id,
                    scope,
                    inactive,
                } => {
                    if run_hour > 23 {
                        anyhow::bail!("run_hour must be between 0 and 23");
                    }
                    let cfg = Config::load(Path::new(&cli.config))?;
                    let vault = Vault::new(cfg.require_master_key()?)?;

                    let pin_enc = match pin {
                        Some(p) => Some(vault.encrypt(&p)?),
                        None => None,
                    };
                    tenants.insert(&NewTenant {
                        name: name.clone(),
                        username,
                        password_enc: vault.encrypt(&password)?,
                        pin_enc,
                        run_hour,
                        sheet_id,
                        scope_selector: scope,
                        active: !inactive,
                    })?;
                    println!("Tenant '{}' added.", name);
                }
                TenantAction::Remove { name } => {
                    tenants.remove(&name)?;
                    println!("Tenant '{}' removed.", name);
                }
                TenantAction::RunNow { name } => {
                    let tenant = tenants
                        .get_by_name(&name)?
                        .ok_or_else(|| anyhow::anyhow!("Tenant '{}' not found", name))?;
                    tenants.set_manual_run(tenant.id, true)?;
                    println!("Tenant '{}' flagged for the next pass.", name);
                }
            }
        }
        Commands::History { limit } => {
            let pool = store::open_pool(&cli.db)?;
            let log = RunLog::new(pool);

            let entries = log.recent(limit)?;
            if entries.is_empty() {
                println!("No runs recorded.");
            } else {
                println!(
                    "{:<20} | {:<25} | {:<6} | Message",
                    "Tenant", "Attempted", "OK"
                );
                println!("{:-<20}-|-{:-<25}-|-{:-<6}-|-{:-<40}", "", "", "", "");
                for (name, record) in entries {
                    println!(
                        "{:<20} | {:<25} | {:<6} | {}",
                        name,
                        record.attempted_at.to_rfc3339(),
                        record.success,
                        record.message
                    );
                }
            }
        }
    }

    Ok(())
}
