pub mod batch;
pub mod rows;

pub use batch::BatchId;
pub use rows::{
    AdSpendFact, CampaignFact, Channel, DramaMapping, EditorRollup, FactBatch, HourlySnapshot,
    MaterialFact, OptimizerRollup,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Inclusive calendar-date window every extraction and report resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// The window of identical length immediately preceding this one.
    pub fn previous(&self) -> Self {
        let span = self.end - self.start;
        Self {
            start: self.start - span - chrono::Duration::days(1),
            end: self.start - chrono::Duration::days(1),
        }
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ~ {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    Daily,
    Weekly,
    Intraday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkKind {
    Chat,
    Doc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    Team,
    All,
}

/// What to report, over which window, and where to publish it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSpec {
    pub kind: ReportKind,
    pub window: DateWindow,
    pub sink: SinkKind,
    pub audience: Audience,
}
