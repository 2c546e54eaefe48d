use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Shanghai;
use serde::{Deserialize, Serialize};

use crate::contracts::PipelineError;

const BATCH_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// # NDOC
/// component: `data_models::batch`
/// purpose: Monotonic batch token naming one extraction run per source.
/// invariants:
///   - Shape is `YYYYMMDD_HHMMSS` in the pipeline's operational zone (Asia/Shanghai).
///   - Lexicographic order equals wall-clock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    /// Allocates a batch ID from the current Asia/Shanghai wall clock.
    pub fn now() -> Self {
        Self(Utc::now().with_timezone(&Shanghai).format(BATCH_ID_FORMAT).to_string())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.with_timezone(&Shanghai).format(BATCH_ID_FORMAT).to_string())
    }

    /// Parses and validates an operator-supplied batch ID.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        NaiveDateTime::parse_from_str(raw, BATCH_ID_FORMAT).map_err(|_| {
            PipelineError::invalid(format!(
                "batch id '{raw}' does not match YYYYMMDD_HHMMSS"
            ))
        })?;
        Ok(Self(raw.to_string()))
    }

    /// The wall-clock instant this batch was allocated, as UTC.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(&self.0, BATCH_ID_FORMAT)
            .expect("validated on construction");
        Shanghai
            .from_local_datetime(&naive)
            .earliest()
            .expect("Asia/Shanghai has no gaps")
            .with_timezone(&Utc)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// "Today" in the operational time zone.
pub fn today_local() -> chrono::NaiveDate {
    Utc::now().with_timezone(&Shanghai).date_naive()
}

/// "Yesterday" in the operational time zone (the `FETCH_YESTERDAY` target).
pub fn yesterday_local() -> chrono::NaiveDate {
    today_local() - chrono::Duration::days(1)
}
