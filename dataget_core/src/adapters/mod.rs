pub mod console;
pub mod quickbi;
pub mod xmp_internal;
pub mod xmp_open;

use async_trait::async_trait;
use serde_json::Value;

use crate::contracts::PipelineResult;
use crate::data_models::{DateWindow, FactBatch};

/// Read timeout for provider HTTP calls and BI queries.
pub const HTTP_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(180);

/// Safety bound: no adapter walks past this many pages.
pub const MAX_PAGES: usize = 500;

/// Safety bound: stop after this many consecutive empty pages.
pub const MAX_EMPTY_PAGES: usize = 3;

/// What one adapter run produced: typed rows per target table, the raw
/// payload for the blob archive, and any non-fatal data-quality warnings.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub source: &'static str,
    pub batches: Vec<FactBatch>,
    pub raw_payload: Value,
    pub warnings: Vec<String>,
}

impl Extraction {
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(FactBatch::len).sum()
    }
}

/// # NDOC
/// component: `adapters`
/// purpose: Contract every upstream provider adapter implements.
/// invariants:
///   - `extract` fails with one of {AuthExpired, RateLimited, Transient, Invalid}.
///   - Pagination is serial and bounded (500 pages / configured row cap).
///   - One `AuthExpired` forces a credential refresh and one more attempt; a
///     second is fatal for the source this batch.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, window: DateWindow) -> PipelineResult<Extraction>;
}

/// Outcome of feeding one page into the pagination guard.
#[derive(Debug, PartialEq, Eq)]
pub enum PageVerdict {
    Continue,
    /// Stop reason doubles as the bounded-by-safety warning text, when the
    /// stop was a safety bound rather than natural exhaustion.
    Stop(Option<String>),
}

/// Tracks page/row safety bounds shared by every paginated adapter.
#[derive(Debug)]
pub struct PageGuard {
    source: &'static str,
    max_rows: usize,
    pages_seen: usize,
    rows_seen: usize,
    empty_streak: usize,
}

impl PageGuard {
    pub fn new(source: &'static str, max_rows: usize) -> Self {
        Self {
            source,
            max_rows,
            pages_seen: 0,
            rows_seen: 0,
            empty_streak: 0,
        }
    }

    /// Records one fetched page and decides whether pagination continues.
    pub fn record_page(&mut self, rows_in_page: usize, page_size: usize) -> PageVerdict {
        self.pages_seen += 1;
        self.rows_seen += rows_in_page;

        if rows_in_page == 0 {
            self.empty_streak += 1;
        } else {
            self.empty_streak = 0;
        }

        if self.empty_streak >= MAX_EMPTY_PAGES {
            return PageVerdict::Stop(None);
        }
        if rows_in_page > 0 && rows_in_page < page_size {
            // Short page: upstream is exhausted.
            return PageVerdict::Stop(None);
        }
        if self.pages_seen >= MAX_PAGES {
            return PageVerdict::Stop(Some(format!(
                "{}: pagination stopped at the {MAX_PAGES}-page safety cap with {} rows",
                self.source, self.rows_seen
            )));
        }
        if self.rows_seen >= self.max_rows {
            return PageVerdict::Stop(Some(format!(
                "{}: pagination stopped at the {}-row safety cap",
                self.source, self.max_rows
            )));
        }
        PageVerdict::Continue
    }

    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }
}

/// One (label, spend, revenue, impressions) cell checked by the data-quality
/// rules. Warnings never abort a batch; they ride to the alarm path.
#[derive(Debug, Clone)]
pub struct SpendObservation {
    pub label: String,
    pub spend: f64,
    pub revenue: f64,
    pub impressions: i64,
}

/// Response validation per the anomaly rules: zero-impression spend, ROAS
/// above 500%, and single-day spend above $100k all warn.
pub fn validate_observations(observations: &[SpendObservation]) -> Vec<String> {
    let mut warnings = Vec::new();
    for obs in observations {
        if obs.spend > 0.0 && obs.impressions == 0 {
            warnings.push(format!(
                "{}: spend ${:.2} with zero impressions",
                obs.label, obs.spend
            ));
        }
        if obs.spend > 0.0 {
            let roas = obs.revenue / obs.spend;
            if roas > 5.0 {
                warnings.push(format!(
                    "{}: ROAS unusually high at {:.1}%",
                    obs.label,
                    roas * 100.0
                ));
            }
        }
        if obs.spend > 100_000.0 {
            warnings.push(format!(
                "{}: single-day spend unusually large at ${:.2}",
                obs.label, obs.spend
            ));
        }
    }
    warnings
}

/// Retries `op` up to `delays.len() + 1` times, sleeping between attempts.
/// Only retryable errors are retried; the last error is returned as-is.
pub async fn retry_with_backoff<T, F, Fut>(
    delays: &[std::time::Duration],
    mut op: F,
) -> PipelineResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = PipelineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable && attempt < delays.len() => {
                log::warn!(
                    "attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    err.message,
                    delays[attempt]
                );
                tokio::time::sleep(delays[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
