//! Sync orchestration: fetch -> match pipeline -> dedup ledger -> notify.

pub mod config;
pub mod pipeline;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jmat_adapters::{adapter_for_config, fetch_source, SourceRegistry};
use jmat_core::{JobPosting, NotificationPayload, DEFAULT_MAX_CONCEPTS};
use jmat_storage::{DedupLedger, HttpClientConfig, HttpFetcher, LedgerReader};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{AppConfig, ConfigError};
pub use pipeline::{MatchPipeline, MatchSettings, PipelineRun, PipelineStats, ScoreError};
pub use transport::{
    DeliveryReceipt, LogNotifier, MessageSource, Notifier, SlackTransport, TransportError,
};

pub const CRATE_NAME: &str = "jmat-sync";

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub duplicates: usize,
    pub already_seen: usize,
    pub filtered: usize,
    pub suppressed: usize,
    pub eligible: usize,
    pub failed_scoring: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
    pub pruned: usize,
}

pub fn http_fetcher(config: &AppConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

/// Slack when a bot token is configured, otherwise the dry-run logger.
pub fn transport_for(config: &AppConfig, http: Arc<HttpFetcher>) -> Arc<Transport> {
    match &config.slack_bot_token {
        Some(token) => Arc::new(Transport::Slack(SlackTransport::new(
            http,
            &config.slack_api_base,
            token,
            &config.slack_channel_id,
            &config.track_reaction,
        ))),
        None => {
            warn!("JMAT_SLACK_BOT_TOKEN unset; notifications are logged only");
            Arc::new(Transport::DryRun(LogNotifier::new(&config.track_reaction)))
        }
    }
}

#[derive(Debug, Clone)]
pub enum Transport {
    Slack(SlackTransport),
    DryRun(LogNotifier),
}

#[async_trait::async_trait]
impl Notifier for Transport {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<DeliveryReceipt, TransportError> {
        match self {
            Self::Slack(slack) => slack.deliver(payload).await,
            Self::DryRun(log) => log.deliver(payload).await,
        }
    }
}

#[async_trait::async_trait]
impl MessageSource for Transport {
    async fn message_text(&self, channel: &str, ts: &str) -> Result<String, TransportError> {
        match self {
            Self::Slack(slack) => slack.message_text(channel, ts).await,
            Self::DryRun(log) => log.message_text(channel, ts).await,
        }
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), TransportError> {
        match self {
            Self::Slack(slack) => slack.add_reaction(channel, ts, name).await,
            Self::DryRun(log) => log.add_reaction(channel, ts, name).await,
        }
    }
}

pub struct SyncRunner {
    registry: SourceRegistry,
    http: Arc<HttpFetcher>,
    pipeline: MatchPipeline,
    ledger: DedupLedger,
    notifier: Arc<dyn Notifier>,
    retention: chrono::Duration,
}

impl SyncRunner {
    pub fn new(
        registry: SourceRegistry,
        http: Arc<HttpFetcher>,
        pipeline: MatchPipeline,
        ledger: DedupLedger,
        notifier: Arc<dyn Notifier>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            http,
            pipeline,
            ledger,
            notifier,
            retention,
        }
    }

    /// Loads sources, taxonomy and role filter from the config directory and
    /// opens (and prunes) the dedup ledger. A corrupt ledger is fatal here.
    pub async fn from_config(
        config: &AppConfig,
        http: Arc<HttpFetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let sources_path = config.sources_path();
        let registry = SourceRegistry::from_yaml_file(&sources_path)
            .with_context(|| format!("loading sources {}", sources_path.display()))?;
        let pipeline = MatchPipeline::from_config_dir(
            &config.config_dir,
            MatchSettings {
                threshold: config.match_threshold,
                saturation_hits: config.saturation_hits,
            },
        )?;
        let (ledger, pruned) = DedupLedger::open(config.ledger_path(), config.retention(), Utc::now())
            .await
            .with_context(|| format!("opening dedup ledger {}", config.ledger_path().display()))?;
        if pruned > 0 {
            info!(pruned, "pruned stale ledger entries at startup");
        }
        Ok(Self::new(
            registry,
            http,
            pipeline,
            ledger,
            notifier,
            config.retention(),
        ))
    }

    pub fn ledger_reader(&self) -> LedgerReader {
        self.ledger.reader()
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    /// One full poll of every enabled source.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id);
        async move {
            let started_at = Utc::now();
            let mut postings = Vec::new();
            let mut fetch_failures = 0usize;

            for source in self.registry.enabled() {
                let adapter = match adapter_for_config(&source.source_id, source.api_base.as_deref()) {
                    Ok(adapter) => adapter,
                    Err(err) => {
                        warn!(source_id = %source.source_id, error = %err, "skipping source");
                        continue;
                    }
                };
                let (mut batch, failures) =
                    fetch_source(adapter.as_ref(), &self.http, run_id, &source.companies).await;
                fetch_failures += failures;
                postings.append(&mut batch);
            }

            let mut summary = self
                .process_postings(run_id, started_at, postings, Utc::now())
                .await?;
            summary.fetch_failures = fetch_failures;
            info!(
                fetched = summary.fetched,
                fetch_failures,
                eligible = summary.eligible,
                delivered = summary.delivered,
                delivery_failures = summary.delivery_failures,
                pruned = summary.pruned,
                "sync cycle finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Everything after fetching. The ledger is persisted before any
    /// notification goes out; if that fails nothing is sent this cycle.
    pub async fn process_postings(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        postings: Vec<JobPosting>,
        now: DateTime<Utc>,
    ) -> Result<CycleSummary> {
        let fetched = postings.len();
        let run = self.pipeline.run(postings, &self.ledger, now).await;
        let pruned = self.ledger.prune(self.retention, now).await;
        if let Err(err) = self.ledger.flush().await {
            // unpersisted marks are dropped so the next cycle sees these jobs again
            let unmarked = self.ledger.unmark_batch(&run.marked).await;
            warn!(unmarked, error = %err, "dedup ledger flush failed; notifications withheld");
            return Err(err).context("persisting dedup ledger; notifications withheld");
        }

        let mut delivered = 0usize;
        let mut delivery_failures = 0usize;
        for (posting, outcome) in &run.notify {
            let payload = NotificationPayload::from_outcome(posting, outcome, DEFAULT_MAX_CONCEPTS);
            match self.notifier.deliver(&payload).await {
                Ok(receipt) => {
                    delivered += 1;
                    info!(job_id = %posting.id, score = outcome.score, ts = %receipt.ts, "notification sent");
                }
                Err(err) => {
                    delivery_failures += 1;
                    error!(job_id = %posting.id, error = %err, "notification failed");
                }
            }
        }

        let stats = run.stats;
        Ok(CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched,
            fetch_failures: 0,
            duplicates: stats.duplicates,
            already_seen: stats.already_seen,
            filtered: stats.filtered,
            suppressed: stats.suppressed,
            eligible: stats.eligible,
            failed_scoring: stats.failed,
            delivered,
            delivery_failures,
            pruned,
        })
    }

    /// Prune and persist outside of a cycle.
    pub async fn prune_now(&self) -> Result<usize> {
        let pruned = self.ledger.prune(self.retention, Utc::now()).await;
        self.ledger.flush().await.context("persisting dedup ledger")?;
        Ok(pruned)
    }
}

/// Polls immediately, then every `interval`, until `shutdown` flips to true.
/// A failed cycle is logged and the loop keeps going.
pub async fn run_until_cancelled(
    runner: Arc<SyncRunner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut cycles = 0usize;
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(err) = runner.run_cycle().await {
            error!(error = %format!("{err:#}"), "sync cycle failed");
        }
        cycles += 1;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(cycles, "polling loop stopped");
    cycles
}

/// Cron-driven alternative to the fixed interval. Overlapping triggers wait
/// for the running cycle to finish.
pub async fn build_cron_scheduler(runner: Arc<SyncRunner>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            let _running = gate.lock().await;
            if let Err(err) = runner.run_cycle().await {
                error!(error = %format!("{err:#}"), "scheduled sync cycle failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
