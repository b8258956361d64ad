use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jmat_core::ReactionEventParser;
use jmat_storage::{
    ApplicationLedger, ApplicationStore, DedupLedger, FileApplicationStore, LedgerReader,
    PgApplicationStore,
};
use jmat_sync::{
    build_cron_scheduler, http_fetcher, run_until_cancelled, transport_for, AppConfig, SyncRunner,
    Transport,
};
use jmat_web::{AcknowledgmentHandler, AppState};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jmat")]
#[command(about = "Job Match & Track: score job postings, notify, track applications")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and exit
    Sync,
    /// Poll on schedule and serve acknowledgment events until ctrl-c
    Watch,
    /// Serve acknowledgment events only
    Serve,
    /// Apply Postgres migrations
    Migrate,
    /// Apply the dedup retention window now
    Prune,
    /// Print dedup ledger and application counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;
    init_tracing(&config.log_level)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let http = Arc::new(http_fetcher(&config)?);
            let transport = transport_for(&config, Arc::clone(&http));
            let runner = SyncRunner::from_config(&config, http, transport).await?;
            let summary = runner.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Watch => watch_command(&config).await?,
        Commands::Serve => {
            let http = Arc::new(http_fetcher(&config)?);
            let transport = transport_for(&config, http);
            // the scheduler owns the ledger file; this process only reads it
            let seen = LedgerReader::load(config.ledger_path(), config.retention()).await?;
            let store = application_store(&config).await?;
            let state = events_state(&config, transport, store, seen);
            jmat_web::serve(config.web_bind, state, shutdown_signal()).await?;
        }
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL is not set; the file-backed application store needs no migrations");
            };
            let store = PgApplicationStore::connect(url, config.db_acquire_timeout).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Prune => {
            let (ledger, pruned) =
                DedupLedger::open(config.ledger_path(), config.retention(), Utc::now()).await?;
            println!(
                "pruned {pruned} entries older than {} days; {} remain",
                config.retention_days,
                ledger.len().await
            );
        }
        Commands::Stats => {
            let seen = LedgerReader::load(config.ledger_path(), config.retention()).await?;
            let stats = seen.stats(Utc::now()).await?;
            let store = application_store(&config).await?;
            println!("seen jobs:        {}", stats.total);
            println!("seen last 7 days: {}", stats.last_7_days);
            println!(
                "oldest entry:     {}",
                stats.oldest.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
            );
            println!(
                "newest entry:     {}",
                stats.newest.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
            );
            println!(
                "applications:     {} ({})",
                store.count().await?,
                store.backend()
            );
        }
    }

    Ok(())
}

async fn watch_command(config: &AppConfig) -> Result<()> {
    let http = Arc::new(http_fetcher(config)?);
    let transport = transport_for(config, Arc::clone(&http));
    let runner = Arc::new(SyncRunner::from_config(config, http, transport.clone()).await?);
    let store = application_store(config).await?;
    let state = events_state(config, transport, store, runner.ledger_reader());

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let mut scheduler = None;
    let mut poller = None;
    match &config.sync_cron {
        Some(cron) => {
            let sched = build_cron_scheduler(Arc::clone(&runner), cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "cron scheduler started");
            scheduler = Some(sched);
        }
        None => {
            info!(interval_secs = config.poll_interval.as_secs(), "polling loop started");
            poller = Some(tokio::spawn(run_until_cancelled(
                Arc::clone(&runner),
                config.poll_interval,
                stop_rx.clone(),
            )));
        }
    }

    let mut web_stop = stop_rx.clone();
    jmat_web::serve(config.web_bind, state, async move {
        let _ = web_stop.wait_for(|stop| *stop).await;
    })
    .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    if let Some(poller) = poller {
        poller.await.context("joining polling loop")?;
    }
    info!("shutdown complete");
    Ok(())
}

/// Postgres when `DATABASE_URL` is set, otherwise the JSON file under the
/// data directory.
async fn application_store(config: &AppConfig) -> Result<Arc<dyn ApplicationStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgApplicationStore::connect(url, config.db_acquire_timeout)
                .await
                .context("connecting to Postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(FileApplicationStore::new(config.applications_path()))),
    }
}

fn events_state(
    config: &AppConfig,
    transport: Arc<Transport>,
    store: Arc<dyn ApplicationStore>,
    seen: LedgerReader,
) -> AppState {
    let handler = AcknowledgmentHandler::new(
        ReactionEventParser::new(&config.track_reaction, &config.slack_channel_id),
        transport,
        Arc::new(ApplicationLedger::new(store)),
        &config.confirm_reaction,
    );
    AppState::new(Arc::new(handler), seen)
}

fn init_tracing(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("received shutdown signal, starting graceful shutdown");
}
