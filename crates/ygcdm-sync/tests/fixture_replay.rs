use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use uuid::Uuid;
use ygcdm_core::{FactRow, IntegrityWarning};
use ygcdm_storage::{FixturePageSource, PaginatedFetcher, TokenBucket};
use ygcdm_sync::{
    FactSink, Notifier, PipelineFile, PipelineOptions, PipelineSettings, SinkError, SinkReceipt,
    SnapshotManifest, SyncConfig, SyncPipeline,
};

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[derive(Default)]
struct MemorySink {
    rows: Mutex<Vec<FactRow>>,
}

#[async_trait]
impl FactSink for MemorySink {
    fn describe(&self) -> String {
        "memory".into()
    }

    async fn persist(&self, _run_id: Uuid, rows: &[FactRow]) -> Result<SinkReceipt, SinkError> {
        self.rows.lock().unwrap().extend_from_slice(rows);
        Ok(SinkReceipt {
            rows_written: rows.len(),
            location: self.describe(),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

fn fixture_pipeline(sink: Arc<MemorySink>, notifier: Arc<RecordingNotifier>) -> SyncPipeline {
    let config = SyncConfig::from_lookup(|_| None).unwrap();
    let file = PipelineFile::load(&repo_root().join("pipeline.yaml")).unwrap();
    let settings = PipelineSettings::resolve(file, &config).unwrap();
    let source = FixturePageSource::load_dir(repo_root().join("fixtures/yougile")).unwrap();
    let fetcher = PaginatedFetcher::new(Arc::new(source), Arc::new(TokenBucket::unthrottled()));
    SyncPipeline::new(settings, fetcher, sink, notifier)
}

fn day(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

#[tokio::test]
async fn fixture_workspace_reconciles_into_fact_rows() {
    let sink = Arc::new(MemorySink::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = fixture_pipeline(sink.clone(), notifier.clone());
    let run_ts = Utc.with_ymd_and_hms(2024, 6, 21, 5, 0, 0).single().unwrap();

    let summary = pipeline.run_once(run_ts).await.unwrap();

    assert_eq!(summary.columns_in_scope, 3);
    assert_eq!(summary.tasks, 2);
    assert_eq!(summary.rows_written, 4);
    assert_eq!(
        summary.warnings,
        vec![IntegrityWarning::MissingSubtask {
            task_id: "t0000000-0000-4000-8000-000000000001".into(),
            subtask_id: "s0000000-0000-4000-8000-000000000004".into(),
        }]
    );
    assert_eq!(notifier.sent.lock().unwrap().len(), 1);

    let rows = sink.rows.lock().unwrap().clone();
    assert!(rows.iter().all(|r| r.loaded_ts == run_ts));
    assert!(rows
        .iter()
        .all(|r| r.subtask_id.as_deref() != Some("s0000000-0000-4000-8000-000000000003")));

    let lot_one = &rows[0];
    assert_eq!(lot_one.task_name.as_deref(), Some("Contract 101"));
    assert_eq!(lot_one.board_name.as_deref(), Some("Sales 2024"));
    assert_eq!(lot_one.column_name.as_deref(), Some("In progress"));
    assert_eq!(lot_one.task_status.as_deref(), Some("Won"));
    assert_eq!(lot_one.subtask_status.as_deref(), Some("Shipped"));
    assert_eq!(lot_one.delivery_term.as_deref(), Some("FOB"));
    assert_eq!(lot_one.loading_place.as_deref(), Some("Novorossiysk"));
    assert_eq!(lot_one.quantity_plan, Some(5000.0));
    assert_eq!(lot_one.quantity_fact, Some(4980.5));
    assert_eq!(lot_one.loading_start_date, day(2024, 5, 1));
    assert_eq!(lot_one.loading_end_date, day(2024, 5, 10));
    assert_eq!(lot_one.discharging_place.as_deref(), Some("Rotterdam"));
    assert_eq!(lot_one.deadline_end_date, day(2024, 5, 10));
    assert_eq!(lot_one.prov_paid.as_deref(), Some("Yes"));
    assert_eq!(lot_one.final_paid.as_deref(), Some("No"));

    let lot_two = &rows[1];
    assert_eq!(lot_two.subtask_status.as_deref(), Some("Planned"));
    assert_eq!(lot_two.discharging_place.as_deref(), Some("Hamburg"));
    assert_eq!(lot_two.loading_start_date, day(2024, 5, 15));

    let lost = &rows[2];
    assert_eq!(lost.subtask_name, None);
    assert_eq!(lost.task_status.as_deref(), Some("Won"));

    let bare = &rows[3];
    assert_eq!(bare.task_status.as_deref(), Some("Lost"));
    assert_eq!(bare.column_name.as_deref(), Some("Closed"));
    assert_eq!(bare.subtask_id, None);
    assert_eq!(bare.task_creation_dt, day(2024, 5, 10));
}

#[tokio::test]
async fn snapshot_only_run_from_config_writes_parquet() {
    let snapshots = tempfile::tempdir().unwrap();
    let vars: HashMap<&str, String> = HashMap::from([
        ("YG_PIPELINE_CONFIG", repo_root().join("pipeline.yaml").display().to_string()),
        ("YG_SNAPSHOT_DIR", snapshots.path().display().to_string()),
    ]);
    let config = SyncConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let options = PipelineOptions {
        fixtures: Some(repo_root().join("fixtures/yougile")),
        snapshot_only: true,
    };
    let pipeline = SyncPipeline::from_config(&config, &options).unwrap();

    let summary = pipeline.run_with_retries(Utc::now()).await.unwrap();

    let manifest: SnapshotManifest =
        serde_json::from_slice(&std::fs::read(&summary.sink).unwrap()).unwrap();
    assert_eq!(manifest.run_id, summary.run_id);
    assert_eq!(manifest.rows, 4);
}

#[tokio::test]
async fn live_run_without_token_is_rejected() {
    let vars: HashMap<&str, String> = HashMap::from([(
        "YG_PIPELINE_CONFIG",
        repo_root().join("pipeline.yaml").display().to_string(),
    )]);
    let config = SyncConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

    let err = SyncPipeline::from_config(&config, &PipelineOptions::default())
        .err()
        .unwrap();
    assert!(err.to_string().contains("YG_OAUTH_TOKEN"));
}
