//! # Pulse: course automation scheduler
//!
//! Usage:
//!   pulse run                        # Sweep loop (one sweep per tick)
//!   pulse sweep --user 42            # One sweep, optionally for one user
//!   pulse import instance.json       # Save an instance and build its schedules
//!   pulse recreate --instance 7      # Rebuild an instance's schedules
//!   pulse report --instance 7        # Print the schedule report
//!   pulse init-config                # Write a default config file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pulse_core::{PulseConfig, SystemClock};
use pulse_scheduler::{
    AutomationInstance, Dispatcher, EngineContext, EventLog, InstanceRepository, Lifecycle, RecurrenceCalculator,
    ScheduleEngine, SchedulerDb, mailer_from_config, spawn_dispatcher,
};

#[derive(Parser)]
#[command(name = "pulse", version, about = "⏱️ Pulse: recurring credits and notifications for courses")]
struct Cli {
    /// Config file (default: ~/.pulse/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overrides database.path
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch loop
    Run,
    /// Run one credits sweep and one notification sweep
    Sweep {
        /// Only process schedules of this user
        #[arg(long)]
        user: Option<i64>,
    },
    /// Save an instance definition (JSON) and build its schedules
    Import { file: PathBuf },
    /// Tear down and rebuild the schedules of an instance
    Recreate {
        #[arg(long)]
        instance: i64,
    },
    /// Print the schedules of an instance
    Report {
        #[arg(long)]
        instance: i64,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn init_logging(config: &PulseConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn format_time(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

struct App {
    config: PulseConfig,
    db: Arc<SchedulerDb>,
    ctx: EngineContext,
}

impl App {
    fn open(config: PulseConfig, db_override: Option<&str>) -> Result<Self> {
        let db_path = expand_path(db_override.unwrap_or(&config.database.path));
        let db = Arc::new(
            SchedulerDb::open(std::path::Path::new(&db_path)).with_context(|| format!("Opening database {db_path}"))?,
        );
        let tz = config.scheduler.timezone().context("Invalid scheduler.utc_offset_minutes")?;
        let ctx = EngineContext::from_db(db.clone(), Arc::new(SystemClock), RecurrenceCalculator::new(tz));
        tracing::debug!("Database: {db_path}");
        Ok(Self { config, db, ctx })
    }

    fn dispatcher(&self) -> Result<Dispatcher> {
        let mailer = mailer_from_config(&self.config.mail)?;
        Ok(Dispatcher::new(
            self.ctx.clone(),
            self.db.clone(),
            mailer,
            Arc::new(EventLog::new()),
            self.config.scheduler.schedule_count,
        ))
    }

    fn engines(&self, instance_id: i64) -> Result<Vec<ScheduleEngine>> {
        let instance = self
            .ctx
            .instances
            .get_instance(instance_id)?
            .with_context(|| format!("Instance {instance_id} not found"))?;
        Ok(ScheduleEngine::for_instance(&self.ctx, &instance))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(PulseConfig::default_path);

    if let Command::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            println!("⚠️  Config already exists at {} (use --force to overwrite)", config_path.display());
            return Ok(());
        }
        PulseConfig::default().save_to(&config_path)?;
        println!("✅ Config written to {}", config_path.display());
        return Ok(());
    }

    let config = if config_path.exists() {
        PulseConfig::load_from(&config_path)?
    } else {
        PulseConfig::default()
    };
    init_logging(&config, cli.verbose);

    let app = App::open(config, cli.db.as_deref())?;

    match cli.command {
        Command::Run => {
            let tick = app.config.scheduler.tick_secs;
            let dispatcher = Arc::new(app.dispatcher()?);
            tokio::select! {
                _ = spawn_dispatcher(dispatcher, tick) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("👋 Shutting down");
                }
            }
        }
        Command::Sweep { user } => {
            let summary = app.dispatcher()?.run_all(user).await?;
            println!("💰 Credits:       {}", summary.credits);
            println!("📬 Notifications: {}", summary.notifications);
        }
        Command::Import { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("Reading {}", file.display()))?;
            let instance: AutomationInstance =
                serde_json::from_str(&raw).with_context(|| format!("Parsing {}", file.display()))?;
            let report = Lifecycle::new(app.ctx.clone(), app.config.credits.max_digits).on_instance_saved(&instance)?;
            println!("✅ Instance {} saved: {report}", instance.id);
        }
        Command::Recreate { instance } => {
            for engine in app.engines(instance)? {
                let report = engine.recreate_schedule_for_instance()?;
                println!("🔁 {} schedules of instance {instance}: {report}", engine.action_type().as_str());
            }
        }
        Command::Report { instance, json } => {
            let mut rows = Vec::new();
            for engine in app.engines(instance)? {
                let action = engine.action_type();
                rows.extend(engine.report()?.into_iter().map(|r| (action, r)));
            }
            if json {
                let out = rows
                    .iter()
                    .map(|(action, r)| {
                        let mut v = serde_json::to_value(r)
                            .with_context(|| format!("Serializing schedule {}", r.schedule_id))?;
                        v["action"] = serde_json::Value::from(action.as_str());
                        Ok(v)
                    })
                    .collect::<Result<Vec<serde_json::Value>>>()?;
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "{:<13} {:>6} {:>8} {:>8} {:<17} {:<16} {:>5} {:>9}",
                    "action", "id", "user", "related", "scheduled", "status", "count", "credits"
                );
                for (action, r) in &rows {
                    println!(
                        "{:<13} {:>6} {:>8} {:>8} {:<17} {:<16} {:>5} {:>9}",
                        action.as_str(),
                        r.schedule_id,
                        r.user_id,
                        r.related_user_id.map(|u| u.to_string()).unwrap_or_else(|| "-".into()),
                        format_time(r.schedule_time),
                        r.status,
                        r.notify_count,
                        r.credits.map(|c| format!("{c:.2}")).unwrap_or_else(|| "-".into()),
                    );
                    if let Some(err) = &r.error_log {
                        println!("{:>14} ↳ {err}", "");
                    }
                }
                if rows.is_empty() {
                    println!("(no schedules)");
                }
            }
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}
