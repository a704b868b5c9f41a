//! Sync pipeline orchestration: staged runs, whole-run retry, scheduling and alerting.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use ygcdm_adapters::{build_board_index, HubSet, StickerCatalog, TaskAdapter};
use ygcdm_core::IntegrityWarning;
use ygcdm_storage::{
    FixturePageSource, HttpClientConfig, HttpPageSource, PageSource, PaginatedFetcher,
    TokenBucket, TokenBucketConfig,
};

mod config;
mod notify;
mod reconcile;
mod sink;

pub use config::{
    PipelineFile, PipelineSettings, SyncConfig, TelegramConfig, DEFAULT_BASE_URL,
    DEFAULT_SYNC_CRON, DEFAULT_TARGET_TABLE,
};
pub use notify::{
    deliver, failure_alert, integrity_alert, LogNotifier, Notifier, TelegramNotifier,
    TELEGRAM_API_BASE,
};
pub use reconcile::{
    dedup_rows, millis_to_date, parse_loading_dates, parse_quantity, reconcile_records,
    task_count_guard, Reconciliation,
};
pub use sink::{
    fact_batch, fact_schema, FactSink, ParquetSnapshotSink, PostgresSink, SinkError, SinkReceipt,
    SnapshotManifest, SnapshotManifestFile, TargetTable,
};

pub const CRATE_NAME: &str = "ygcdm-sync";

/// Stages of one run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BoardIndex,
    Dictionaries,
    ColumnTasks,
    Subtasks,
    Reconcile,
    Persist,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::BoardIndex => "board_index",
            Stage::Dictionaries => "dictionaries",
            Stage::ColumnTasks => "column_tasks",
            Stage::Subtasks => "subtasks",
            Stage::Reconcile => "reconcile",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed run, tagged with the stage that failed.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: anyhow::Error,
}

impl StageFailure {
    fn at<E: Into<anyhow::Error>>(stage: Stage) -> impl FnOnce(E) -> Self {
        move |err| Self {
            stage,
            error: err.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {:#}", self.stage, self.error)
    }
}

impl std::error::Error for StageFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.error)
    }
}

/// Delay between whole-run attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub run_ts: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub columns_in_scope: usize,
    pub tasks: usize,
    pub subtasks: usize,
    pub rows_written: usize,
    pub sink: String,
    pub warnings: Vec<IntegrityWarning>,
}

/// How the CLI wants the pipeline wired.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Replay recorded listings from this directory instead of calling the API.
    pub fixtures: Option<PathBuf>,
    /// Write a parquet snapshot instead of inserting into Postgres.
    pub snapshot_only: bool,
}

pub struct SyncPipeline {
    settings: PipelineSettings,
    adapter: TaskAdapter,
    fetcher: PaginatedFetcher,
    sink: Arc<dyn FactSink>,
    notifier: Arc<dyn Notifier>,
    backoff: BackoffPolicy,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        settings: PipelineSettings,
        fetcher: PaginatedFetcher,
        sink: Arc<dyn FactSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let adapter = TaskAdapter::new(&settings.task_stickers, &settings.subtask_stickers);
        Self {
            settings,
            adapter,
            fetcher,
            sink,
            notifier,
            backoff: BackoffPolicy::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn from_config(config: &SyncConfig, options: &PipelineOptions) -> Result<Self> {
        let file = PipelineFile::load(&config.pipeline_config)?;
        let settings = PipelineSettings::resolve(file, config)?;

        let (source, limiter): (Arc<dyn PageSource>, TokenBucket) = match &options.fixtures {
            Some(dir) => {
                let source = FixturePageSource::load_dir(dir)?;
                (Arc::new(source), TokenBucket::unthrottled())
            }
            None => {
                let Some(token) = config.oauth_token.clone() else {
                    bail!("YG_OAUTH_TOKEN is required for live runs");
                };
                let source = HttpPageSource::new(HttpClientConfig {
                    base_url: config.base_url.clone(),
                    bearer_token: token,
                    timeout: config.http_timeout,
                    user_agent: Some(format!("ygcdm/{}", env!("CARGO_PKG_VERSION"))),
                })?;
                let limiter = TokenBucket::new(TokenBucketConfig {
                    capacity: 1,
                    refill_every: config.request_interval,
                });
                (Arc::new(source), limiter)
            }
        };
        let fetcher = PaginatedFetcher::new(source, Arc::new(limiter));

        let sink: Arc<dyn FactSink> = if options.snapshot_only {
            Arc::new(ParquetSnapshotSink::new(config.snapshot_dir.clone()))
        } else {
            Arc::new(
                PostgresSink::connect_lazy(&config.database_url, &settings.target_table)
                    .context("configuring postgres sink")?,
            )
        };

        let notifier: Arc<dyn Notifier> = match &config.telegram {
            Some(tg) => Arc::new(TelegramNotifier::new(
                tg.bot_token.clone(),
                tg.chat_id.clone(),
                config.http_timeout,
            )?),
            None => Arc::new(LogNotifier),
        };

        let backoff = BackoffPolicy {
            max_retries: config.run_retries,
            ..BackoffPolicy::default()
        };
        Ok(Self::new(settings, fetcher, sink, notifier).with_backoff(backoff))
    }

    /// One complete run. Nothing reaches the sink unless every earlier stage succeeded.
    pub async fn run_once(&self, run_ts: DateTime<Utc>) -> Result<SyncRunSummary, StageFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %run_ts);
        self.execute(run_id, run_ts).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        run_ts: DateTime<Utc>,
    ) -> Result<SyncRunSummary, StageFailure> {
        let started_at = Utc::now();
        let sizes = &self.settings.page_sizes;
        info!(sink = %self.sink.describe(), boards = self.settings.tracked_boards.len(), "sync run started");

        let index = build_board_index(&self.fetcher, &self.settings.tracked_boards, sizes)
            .await
            .map_err(StageFailure::at(Stage::BoardIndex))?;

        let catalog = StickerCatalog::fetch(&self.fetcher, sizes.string_stickers)
            .await
            .map_err(StageFailure::at(Stage::Dictionaries))?;
        let hubs = HubSet::from_catalog(&catalog, &self.settings.dictionaries);

        let tasks = self
            .adapter
            .fetch_column_tasks(&self.fetcher, &index, sizes.column_tasks)
            .await
            .map_err(StageFailure::at(Stage::ColumnTasks))?;

        let subtasks = self
            .adapter
            .fetch_all_subtasks(&self.fetcher, sizes.subtasks)
            .await
            .map_err(StageFailure::at(Stage::Subtasks))?;

        let Reconciliation { rows, mut warnings } =
            reconcile_records(&index, &hubs, &tasks, &subtasks, run_ts)
                .map_err(StageFailure::at(Stage::Reconcile))?;
        if self.settings.task_count_guard {
            warnings.extend(task_count_guard(&index, &tasks, &subtasks));
        }

        for warning in &warnings {
            warn!(%warning, "integrity warning");
        }
        if let Some(alert) = integrity_alert(run_id, &warnings) {
            deliver(self.notifier.as_ref(), &alert).await;
        }

        let receipt = self
            .sink
            .persist(run_id, &rows)
            .await
            .map_err(StageFailure::at(Stage::Persist))?;

        let summary = SyncRunSummary {
            run_id,
            run_ts,
            started_at,
            finished_at: Utc::now(),
            columns_in_scope: index.len(),
            tasks: tasks.len(),
            subtasks: subtasks.len(),
            rows_written: receipt.rows_written,
            sink: receipt.location,
            warnings,
        };
        info!(rows = summary.rows_written, warnings = summary.warnings.len(), "sync run finished");
        Ok(summary)
    }

    /// Run, retrying the whole run on failure. The operator is alerted once, after the last
    /// attempt fails. Concurrent callers wait for each other.
    pub async fn run_with_retries(
        &self,
        run_ts: DateTime<Utc>,
    ) -> Result<SyncRunSummary, StageFailure> {
        let _guard = self.run_lock.lock().await;
        let mut attempt = 0usize;
        loop {
            match self.run_once(run_ts).await {
                Ok(summary) => return Ok(summary),
                Err(failure) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(attempt, stage = %failure.stage, error = %failure, ?delay, "sync run failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    error!(attempts = attempt + 1, stage = %failure.stage, error = %failure, "sync run failed");
                    deliver(self.notifier.as_ref(), &failure_alert(&failure)).await;
                    return Err(failure);
                }
            }
        }
    }
}

/// Cron-triggered runs; each trigger time becomes the run's logical timestamp.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let run_ts = Utc::now();
            match pipeline.run_with_retries(run_ts).await {
                Ok(summary) => info!(run_id = %summary.run_id, rows = summary.rows_written, "scheduled sync complete"),
                Err(failure) => error!(stage = %failure.stage, error = %failure, "scheduled sync gave up"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Apply `migrations/` to the configured database.
pub async fn run_migrations(database_url: &str) -> Result<()> {
    let pool = sqlx::PgPool::connect(database_url)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn run_sync_once_from_env(
    run_ts: DateTime<Utc>,
    options: &PipelineOptions,
) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(&config, options)?;
    Ok(pipeline.run_with_retries(run_ts).await?)
}
