use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::adapters::console::{ConsoleAdapter, ConsoleRefresher, PlaywrightTokenDriver};
use crate::adapters::quickbi::QuickbiAdapter;
use crate::adapters::xmp_internal::XmpInternalAdapter;
use crate::adapters::xmp_open::XmpOpenAdapter;
use crate::adapters::{Extraction, ProviderAdapter};
use crate::archive::BlobArchive;
use crate::config::AppConfig;
use crate::contracts::{AlarmLevel, PipelineError, PipelineResult};
use crate::credentials::CredentialStore;
use crate::data_models::{
    batch::{today_local, yesterday_local},
    BatchId, DateWindow, ReportSpec,
};
use crate::lark::alert::AlarmSink;
use crate::lark::ReportSink;
use crate::report::ReportComposer;
use crate::warehouse::loader::BatchLogEntry;
use crate::warehouse::Warehouse;

/// Upper bound for one adapter's whole extraction (pagination included).
const ADAPTER_DEADLINE: std::time::Duration = std::time::Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Success,
    Failed,
}

/// Per-source result of one coordinator tick.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source: String,
    pub status: SourceStatus,
    pub row_count: usize,
    pub error: Option<PipelineError>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct IngestReport {
    pub batch_id: BatchId,
    pub outcomes: Vec<SourceOutcome>,
}

impl IngestReport {
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty()
            && self.outcomes.iter().all(|o| o.status == SourceStatus::Failed)
    }

    pub fn any_failed(&self) -> bool {
        self.outcomes.iter().any(|o| o.status == SourceStatus::Failed)
    }
}

/// # NDOC
/// component: `pipeline`
/// purpose: Batch coordinator. Allocates one batch id per tick, fans out the
///          adapters, and routes rows to the warehouse and payloads to the
///          blob archive.
/// invariants:
///   - All sources that succeed in one tick share the same batch id.
///   - One source's failure never aborts another's; failed sources carry no
///     rows for the batch and are left as a gap (not retried next tick).
pub struct BatchCoordinator {
    config: AppConfig,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    quickbi: Arc<QuickbiAdapter>,
    warehouse: Warehouse,
    archive: BlobArchive,
    alarm: Arc<AlarmSink>,
}

impl BatchCoordinator {
    /// Wires the whole component graph from configuration.
    pub fn from_config(config: AppConfig) -> PipelineResult<Self> {
        let archive = BlobArchive::new(&config.gcs_bucket_name, &config.archive_root);
        let warehouse = Warehouse::open(
            &config.warehouse_path,
            &config.quickbi_dataset_id,
            &config.xmp_dataset_id,
        )?;
        let alarm = Arc::new(AlarmSink::new(&config.lark_alert_webhook));

        let mut credentials =
            CredentialStore::new(&config.credential_dir).with_archive(archive.clone());
        // The console provider refreshes by replaying saved cookies through a
        // headless browser; everything else signs per request.
        let driver = Arc::new(PlaywrightTokenDriver::new(true).with_archive(archive.clone()));
        // The refresher reads and writes the same credential files through its
        // own handle; the store's per-provider lock already serializes them.
        let store_for_refresher =
            Arc::new(CredentialStore::new(&config.credential_dir).with_archive(archive.clone()));
        credentials.register_refresher(
            "xmp",
            Arc::new(ConsoleRefresher::new(
                driver,
                store_for_refresher,
                config.xmp_username.clone(),
                config.xmp_password.clone(),
            )),
        );
        let credentials = Arc::new(credentials);

        let quickbi = Arc::new(QuickbiAdapter::new(
            config.aliyun_access_key_id.clone(),
            config.aliyun_access_key_secret.clone(),
            config.quickbi_api_id.clone(),
            config.quickbi_overview_api_id.clone(),
        ));
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
            quickbi.clone(),
            Arc::new(XmpOpenAdapter::new(
                config.xmp_client_id.clone(),
                config.xmp_client_secret.clone(),
                config.max_rows_per_source,
            )),
            Arc::new(XmpInternalAdapter::new(
                credentials.clone(),
                config.max_rows_per_source,
            )),
            Arc::new(ConsoleAdapter::new(
                credentials,
                config.max_rows_per_source,
            )),
        ];

        Ok(Self {
            config,
            adapters,
            quickbi,
            warehouse,
            archive,
            alarm,
        })
    }

    /// Test seam: hand-assembled graph with stub adapters.
    pub fn with_components(
        config: AppConfig,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        quickbi: Arc<QuickbiAdapter>,
        warehouse: Warehouse,
        archive: BlobArchive,
        alarm: Arc<AlarmSink>,
    ) -> Self {
        Self {
            config,
            adapters,
            quickbi,
            warehouse,
            archive,
            alarm,
        }
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// The ingest window for an unparameterized tick: today, or T-1 under
    /// `FETCH_YESTERDAY`.
    pub fn default_window(&self) -> DateWindow {
        if self.config.fetch_yesterday {
            DateWindow::single(yesterday_local())
        } else {
            DateWindow::single(today_local())
        }
    }

    /// One ingest tick over all configured sources.
    pub async fn run_ingest(&self, window: DateWindow) -> PipelineResult<IngestReport> {
        self.run_ingest_with_batch(BatchId::now(), window).await
    }

    /// Same tick with an explicit batch id (backfills and tests).
    pub async fn run_ingest_with_batch(
        &self,
        batch_id: BatchId,
        window: DateWindow,
    ) -> PipelineResult<IngestReport> {
        crate::utils::logger::set_current_batch_id(batch_id.as_str().to_string());
        log::info!(
            "ingest tick started: batch {} window {}",
            batch_id,
            window
        );

        // One in-flight call per provider; the set itself is the global cap.
        let mut tasks: JoinSet<(String, PipelineResult<Extraction>)> = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = adapter.clone();
            tasks.spawn(async move {
                let name = adapter.name().to_string();
                let result = match tokio::time::timeout(ADAPTER_DEADLINE, adapter.extract(window))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::transient(format!(
                        "{name} extraction exceeded {}s deadline",
                        ADAPTER_DEADLINE.as_secs()
                    ))),
                };
                (name, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    log::error!("adapter task panicked: {err}");
                    continue;
                }
            };
            let outcome = match result {
                Ok(extraction) => self.load_extraction(&batch_id, window, extraction).await,
                Err(err) => {
                    log::error!("source {} failed: {}", name, err);
                    self.alarm.send_failure("ingest", &name, &err, window).await;
                    SourceOutcome {
                        source: name,
                        status: SourceStatus::Failed,
                        row_count: 0,
                        error: Some(err),
                        warnings: Vec::new(),
                    }
                }
            };
            self.record_outcome(&batch_id, &outcome);
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.source.cmp(&b.source));

        crate::utils::logger::clear_current_batch_id();
        log::info!(
            "ingest tick finished: batch {} ({} sources, {} failed)",
            batch_id,
            outcomes.len(),
            outcomes.iter().filter(|o| o.status == SourceStatus::Failed).count()
        );
        Ok(IngestReport { batch_id, outcomes })
    }

    async fn load_extraction(
        &self,
        batch_id: &BatchId,
        window: DateWindow,
        extraction: Extraction,
    ) -> SourceOutcome {
        let source = extraction.source.to_string();
        let fetched_at = Utc::now();
        let mut row_count = 0usize;

        for batch in &extraction.batches {
            match self.warehouse.append(batch, batch_id, fetched_at) {
                Ok(count) => row_count += count,
                Err(err) => {
                    log::error!(
                        "append to {} failed for source {}: {}",
                        batch.table_name(),
                        source,
                        err
                    );
                    self.alarm.send_failure("ingest", &source, &err, window).await;
                    return SourceOutcome {
                        source,
                        status: SourceStatus::Failed,
                        row_count: 0,
                        error: Some(err),
                        warnings: extraction.warnings.clone(),
                    };
                }
            }
        }

        // Archive failures warn but never fail the batch.
        if let Err(err) = self
            .archive
            .put(&source, batch_id, &extraction.raw_payload)
        {
            log::warn!("archive failed for {}: {}", source, err);
            self.alarm
                .send(
                    &format!("blob archive failed for {source}"),
                    AlarmLevel::Warning,
                    &err.message,
                )
                .await;
        }

        if !extraction.warnings.is_empty() {
            let body = extraction.warnings.join("\n");
            self.alarm
                .send(
                    &format!("data anomalies in {source}"),
                    AlarmLevel::Warning,
                    &body,
                )
                .await;
        }

        SourceOutcome {
            source,
            status: SourceStatus::Success,
            row_count,
            error: None,
            warnings: extraction.warnings,
        }
    }

    fn record_outcome(&self, batch_id: &BatchId, outcome: &SourceOutcome) {
        let entry = BatchLogEntry {
            batch_id: batch_id.as_str().to_string(),
            source: outcome.source.clone(),
            status: match outcome.status {
                SourceStatus::Success => "success".to_string(),
                SourceStatus::Failed => "failed".to_string(),
            },
            row_count: outcome.row_count as i64,
            message: outcome.error.as_ref().map(|e| e.message.clone()),
            created_at: Utc::now().to_rfc3339(),
        };
        if let Err(err) = self.warehouse.log_batch(&entry) {
            log::error!("batch log write failed: {err}");
        }
    }

    /// One report job: compose from the query layer, render through the sink.
    /// Query errors short-circuit; sink errors alarm through the alert path.
    pub async fn run_report(
        &self,
        spec: &ReportSpec,
        sink: &dyn ReportSink,
    ) -> PipelineResult<()> {
        let composer = ReportComposer::new(&self.warehouse, &self.config);
        let model = match composer.compose(spec) {
            Ok(model) => model,
            Err(err) => {
                self.alarm
                    .send_failure("report", "query_layer", &err, spec.window)
                    .await;
                return Err(err);
            }
        };
        if let Err(err) = sink.render(&model).await {
            self.alarm
                .send_failure("report", sink.name(), &err, spec.window)
                .await;
            return Err(err);
        }
        Ok(())
    }

    /// Re-fetches the BI slice for a date and patches `media_user_revenue`
    /// onto already-loaded rows.
    pub async fn run_backfill(
        &self,
        window: DateWindow,
        batch_id: Option<&BatchId>,
    ) -> PipelineResult<usize> {
        let extraction = self.quickbi.extract(window).await?;
        let mut values: HashMap<String, f64> = HashMap::new();
        for batch in &extraction.batches {
            if let crate::data_models::FactBatch::QuickbiCampaigns(rows) = batch {
                for row in rows {
                    values.insert(row.campaign_id.clone(), row.media_user_revenue);
                }
            }
        }
        if values.is_empty() {
            return Err(PipelineError::invalid(
                "backfill fetch returned no campaign rows",
            ));
        }
        let updated = self
            .warehouse
            .backfill_media_revenue(window.start, batch_id, &values)?;
        log::info!(
            "backfilled media_user_revenue on {} rows for {}",
            updated,
            window.start
        );
        Ok(updated)
    }
}
