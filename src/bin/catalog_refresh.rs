use anyhow::{bail, Context, Result};
use catalog_refresh::database_ops::entities::{
    CatchupRecording, Category, Channel, Country, Guide, Language, Programme, Region, Stream,
    Subdivision,
};
use catalog_refresh::database_ops::queries;
use catalog_refresh::jobs::bootstrap::{self, FirstFire};
use catalog_refresh::jobs::markers::RunMarkers;
use catalog_refresh::jobs::{JobKey, RunReport};
use catalog_refresh::logging::init_tracing;
use catalog_refresh::util::env;
use catalog_refresh::{Db, Entity, Repository, Settings};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "catalog_refresh", version, about = "Catalog refresh scheduler and admin CLI")]
struct Cli {
    /// Optional override for the database URL
    #[arg(long, global = true)]
    db_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Bootstrap every job and run until Ctrl-C
    Run,
    /// Run one static job right now through the normal job envelope
    Once {
        /// Static job name, e.g. `channels` or `guide-grab-scheduler`
        job: String,
    },
    /// Print the run markers of every job as JSON
    Status,
    /// Toggle catch-up recording for a channel
    Catchup {
        #[command(subcommand)]
        action: CatchupAction,
    },
    /// Delete every catalog row, children first, and forget run markers
    Reset {
        /// Required; reset is destructive
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum CatchupAction {
    Enable { channel: String },
    Disable { channel: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(url) = cli.db_url {
        settings.database_url = url;
    }
    env::preflight_check(
        "catalog_refresh",
        &[],
        &["DATABASE_URL", "FEED_BASE_URL", "JOB_CONCURRENCY", "CATCHUP_CONCURRENCY", "GRABBER_BIN", "TRANSCODER_BIN"],
    )?;

    let db = Db::connect(&settings.database_url, settings.db_max_connections).await?;
    db.apply_schema().await?;

    match cli.command {
        Commands::Run => run(db, settings).await,
        Commands::Once { job } => once(db, settings, &job).await,
        Commands::Status => status(db).await,
        Commands::Catchup { action } => {
            let (channel, enabled) = match action {
                CatchupAction::Enable { channel } => (channel, true),
                CatchupAction::Disable { channel } => (channel, false),
            };
            if !queries::set_catchup(&db, &channel, enabled).await? {
                bail!("unknown channel {channel}");
            }
            info!(channel = %channel, enabled, "catch-up flag updated");
            Ok(())
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes every catalog row; pass --yes to confirm");
            }
            reset(db).await
        }
    }
}

async fn run(db: Db, settings: Settings) -> Result<()> {
    settings.log_summary();
    let scheduler = bootstrap::start(&db, &settings, FirstFire::Staggered)?;
    info!("scheduler running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");
    scheduler.shutdown(settings.shutdown_grace).await;
    Ok(())
}

async fn once(db: Db, settings: Settings, job: &str) -> Result<()> {
    if bootstrap::static_job(job).is_none() {
        let known: Vec<&str> = bootstrap::STATIC_JOBS.iter().map(|j| j.name).collect();
        bail!("unknown job {job}; one of {}", known.join(", "));
    }
    let scheduler = bootstrap::start(&db, &settings, FirstFire::Deferred)?;
    let report = scheduler.run_now(&JobKey::catalog(job)).await?;
    scheduler.shutdown(settings.shutdown_grace).await;
    match report {
        RunReport::Completed { items, took } => {
            info!(job, items, took_ms = took.as_millis() as u64, "done");
            Ok(())
        }
        RunReport::Skipped(reason) => {
            warn!(job, reason = %reason, "skipped");
            Ok(())
        }
        RunReport::Failed(error) => bail!("{job} failed: {error}"),
    }
}

async fn status(db: Db) -> Result<()> {
    let markers = RunMarkers::new(db).all().await?;
    println!("{}", serde_json::to_string_pretty(&markers)?);
    Ok(())
}

async fn clear<E: Entity>(db: &Db) -> Result<u64> {
    let removed = Repository::<E>::new(db.clone())
        .delete_all()
        .await
        .with_context(|| format!("failed to clear {}", E::TABLE))?;
    info!(table = E::TABLE, removed, "cleared");
    Ok(removed)
}

async fn reset(db: Db) -> Result<()> {
    // children first; join tables cascade
    clear::<CatchupRecording>(&db).await?;
    clear::<Programme>(&db).await?;
    clear::<Guide>(&db).await?;
    clear::<Stream>(&db).await?;
    sqlx::query("UPDATE channels SET replaced_by = NULL")
        .execute(&db.pool)
        .await?;
    clear::<Channel>(&db).await?;
    clear::<Subdivision>(&db).await?;
    clear::<Region>(&db).await?;
    clear::<Country>(&db).await?;
    clear::<Category>(&db).await?;
    clear::<Language>(&db).await?;
    let markers = RunMarkers::new(db).clear().await?;
    info!(markers, "reset complete");
    Ok(())
}
