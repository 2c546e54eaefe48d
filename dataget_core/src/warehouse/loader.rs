use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Warehouse;
use crate::contracts::{PipelineError, PipelineResult};
use crate::data_models::{BatchId, DramaMapping, FactBatch};

/// Bulk insert chunk size; one transaction per batch keeps visibility atomic.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColKind {
    Text,
    Real,
    Integer,
}

type Column = (&'static str, ColKind);

const QUICKBI_CAMPAIGN_COLUMNS: &[Column] = &[
    ("stat_date", ColKind::Text),
    ("channel", ColKind::Text),
    ("campaign_id", ColKind::Text),
    ("campaign_name", ColKind::Text),
    ("optimizer", ColKind::Text),
    ("country", ColKind::Text),
    ("spend", ColKind::Real),
    ("new_user_revenue", ColKind::Real),
    ("media_user_revenue", ColKind::Real),
    ("impressions", ColKind::Integer),
    ("clicks", ColKind::Integer),
    ("installs", ColKind::Integer),
    ("extra", ColKind::Text),
];

const HOURLY_SNAPSHOT_COLUMNS: &[Column] = &[
    ("stat_date", ColKind::Text),
    ("snapshot_time", ColKind::Text),
    ("hour", ColKind::Integer),
    ("total_spend", ColKind::Real),
    ("d0_roas", ColKind::Real),
];

const CAMPAIGN_COLUMNS: &[Column] = &[
    ("stat_date", ColKind::Text),
    ("channel", ColKind::Text),
    ("campaign_id", ColKind::Text),
    ("campaign_name", ColKind::Text),
    ("country", ColKind::Text),
    ("spend", ColKind::Real),
    ("revenue", ColKind::Real),
    ("impressions", ColKind::Integer),
    ("clicks", ColKind::Integer),
    ("extra", ColKind::Text),
];

const MATERIAL_COLUMNS: &[Column] = &[
    ("stat_date", ColKind::Text),
    ("material_id", ColKind::Text),
    ("designer_name", ColKind::Text),
    ("cost", ColKind::Real),
    ("impression", ColKind::Integer),
    ("click", ColKind::Integer),
    ("extra", ColKind::Text),
];

const EDITOR_STAT_COLUMNS: &[Column] = &[
    ("stat_date", ColKind::Text),
    ("editor_name", ColKind::Text),
    ("channel", ColKind::Text),
    ("spend", ColKind::Real),
    ("revenue", ColKind::Real),
    ("roas", ColKind::Real),
    ("material_count", ColKind::Integer),
    ("hot_count", ColKind::Integer),
    ("hot_rate", ColKind::Real),
    ("top_material", ColKind::Text),
    ("top_material_spend", ColKind::Real),
];

const OPTIMIZER_STAT_COLUMNS: &[Column] = &[
    ("stat_date", ColKind::Text),
    ("optimizer_name", ColKind::Text),
    ("channel", ColKind::Text),
    ("spend", ColKind::Real),
    ("revenue", ColKind::Real),
    ("roas", ColKind::Real),
    ("campaign_count", ColKind::Integer),
];

fn columns_for(batch: &FactBatch) -> &'static [Column] {
    match batch {
        FactBatch::QuickbiCampaigns(_) => QUICKBI_CAMPAIGN_COLUMNS,
        FactBatch::HourlySnapshots(_) => HOURLY_SNAPSHOT_COLUMNS,
        FactBatch::XmpCampaigns(_) | FactBatch::XmpInternalCampaigns(_) => CAMPAIGN_COLUMNS,
        FactBatch::XmpMaterials(_) => MATERIAL_COLUMNS,
        FactBatch::XmpEditorStats(_) => EDITOR_STAT_COLUMNS,
        FactBatch::XmpOptimizerStats(_) => OPTIMIZER_STAT_COLUMNS,
        FactBatch::DramaMappings(_) => &[],
    }
}

fn rows_as_json(batch: &FactBatch) -> PipelineResult<Vec<Value>> {
    let value = match batch {
        FactBatch::QuickbiCampaigns(rows) => serde_json::to_value(rows)?,
        FactBatch::HourlySnapshots(rows) => serde_json::to_value(rows)?,
        FactBatch::XmpCampaigns(rows) => serde_json::to_value(rows)?,
        FactBatch::XmpInternalCampaigns(rows) => serde_json::to_value(rows)?,
        FactBatch::XmpMaterials(rows) => serde_json::to_value(rows)?,
        FactBatch::XmpEditorStats(rows) => serde_json::to_value(rows)?,
        FactBatch::XmpOptimizerStats(rows) => serde_json::to_value(rows)?,
        FactBatch::DramaMappings(rows) => serde_json::to_value(rows)?,
    };
    match value {
        Value::Array(rows) => Ok(rows),
        _ => Err(PipelineError::internal("fact batch must serialize to an array")),
    }
}

/// Per-source outcome recorded for every coordinator tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLogEntry {
    pub batch_id: String,
    pub source: String,
    pub status: String,
    pub row_count: i64,
    pub message: Option<String>,
    pub created_at: String,
}

impl Warehouse {
    /// Streaming, idempotent batch append.
    ///
    /// The `(table, batch_id)` pair is the idempotency key: a batch that is
    /// already present leaves the table untouched. Rows become visible only
    /// when the whole append commits.
    pub fn append(
        &self,
        batch: &FactBatch,
        batch_id: &BatchId,
        fetched_at: DateTime<Utc>,
    ) -> PipelineResult<usize> {
        if let FactBatch::DramaMappings(rows) = batch {
            return self.upsert_drama_mapping(rows);
        }
        if fetched_at < batch_id.timestamp() {
            return Err(PipelineError::invalid(format!(
                "fetched_at {} predates batch {}",
                fetched_at, batch_id
            )));
        }

        let table = self.physical_table(batch.table_name());
        let columns = columns_for(batch);
        let rows = rows_as_json(batch)?;

        let mut conn = self.lock();
        ensure_fact_table(&conn, &table, columns)?;
        check_required_columns(&conn, &table, columns)?;

        let already_present: bool = conn
            .query_row(
                &format!("SELECT EXISTS(SELECT 1 FROM \"{table}\" WHERE batch_id = ?1)"),
                params![batch_id.as_str()],
                |row| row.get(0),
            )
            .map_err(PipelineError::from)?;
        if already_present {
            log::info!(
                "batch {} already appended to {}, skipping",
                batch_id,
                table
            );
            return Ok(0);
        }

        let column_names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let placeholders: Vec<String> = (1..=column_names.len() + 2)
            .map(|i| format!("?{i}"))
            .collect();
        let sql = format!(
            "INSERT INTO \"{table}\" (batch_id, fetched_at, {}) VALUES ({})",
            column_names.join(", "),
            placeholders.join(", ")
        );

        let tx = conn.transaction().map_err(PipelineError::from)?;
        let mut inserted = 0usize;
        {
            let mut statement = tx.prepare(&sql).map_err(PipelineError::from)?;
            for chunk in rows.chunks(INSERT_CHUNK) {
                for row in chunk {
                    let obj = row.as_object().ok_or_else(|| {
                        PipelineError::internal("fact row must serialize to an object")
                    })?;
                    let mut values: Vec<SqlValue> = Vec::with_capacity(columns.len() + 2);
                    values.push(SqlValue::Text(batch_id.as_str().to_string()));
                    values.push(SqlValue::Text(fetched_at.to_rfc3339()));
                    for (name, kind) in columns {
                        values.push(sql_value(name, obj.get(*name), *kind).map_err(PipelineError::from)?);
                    }
                    statement
                        .execute(params_from_iter(values))
                        .map_err(PipelineError::from)?;
                    inserted += 1;
                }
            }
        }
        tx.commit().map_err(PipelineError::from)?;

        log::info!(
            "appended {} rows to {} under batch {}",
            inserted,
            table,
            batch_id
        );
        Ok(inserted)
    }

    /// Drama-name upsert: key conflicts resolve last-write-wins and are logged.
    pub fn upsert_drama_mapping(&self, rows: &[DramaMapping]) -> PipelineResult<usize> {
        let table = self.physical_table("drama_mapping");
        let conn = self.lock();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                   drama_id TEXT PRIMARY KEY, \
                   drama_name TEXT NOT NULL, \
                   updated_at TEXT NOT NULL\
                 )"
            ),
            [],
        )
        .map_err(PipelineError::from)?;

        let mut written = 0usize;
        for row in rows {
            let existing: Option<String> = conn
                .query_row(
                    &format!("SELECT drama_name FROM \"{table}\" WHERE drama_id = ?1"),
                    params![row.drama_id],
                    |r| r.get(0),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .map_err(PipelineError::from)?;
            if let Some(previous) = &existing {
                if previous != &row.drama_name {
                    log::warn!(
                        "drama {} name conflict: '{}' replaced by '{}'",
                        row.drama_id,
                        previous,
                        row.drama_name
                    );
                }
            }
            conn.execute(
                &format!(
                    "INSERT INTO \"{table}\" (drama_id, drama_name, updated_at) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT(drama_id) DO UPDATE SET \
                       drama_name = excluded.drama_name, \
                       updated_at = excluded.updated_at"
                ),
                params![row.drama_id, row.drama_name, Utc::now().to_rfc3339()],
            )
            .map_err(PipelineError::from)?;
            written += 1;
        }
        Ok(written)
    }

    /// `drama_id -> drama_name` lookup for report labeling.
    pub fn drama_names(&self) -> PipelineResult<HashMap<String, String>> {
        let table = self.physical_table("drama_mapping");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(HashMap::new());
        }
        let mut statement = conn
            .prepare(&format!("SELECT drama_id, drama_name FROM \"{table}\""))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(PipelineError::from)?;
        let mut names = HashMap::new();
        for row in rows {
            let (id, name) = row.map_err(PipelineError::from)?;
            names.insert(id, name);
        }
        Ok(names)
    }

    /// Records one per-source coordinator outcome.
    pub fn log_batch(&self, entry: &BatchLogEntry) -> PipelineResult<()> {
        let conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS \"pipeline__batch_log\" (\
               batch_id TEXT NOT NULL, \
               source TEXT NOT NULL, \
               status TEXT NOT NULL, \
               row_count INTEGER NOT NULL, \
               message TEXT, \
               created_at TEXT NOT NULL\
             )",
            [],
        )
        .map_err(PipelineError::from)?;
        conn.execute(
            "INSERT INTO \"pipeline__batch_log\" \
             (batch_id, source, status, row_count, message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.batch_id,
                entry.source,
                entry.status,
                entry.row_count,
                entry.message,
                entry.created_at
            ],
        )
        .map_err(PipelineError::from)?;
        Ok(())
    }

    pub fn batch_log(&self, batch_id: &BatchId) -> PipelineResult<Vec<BatchLogEntry>> {
        let conn = self.lock();
        if !table_exists(&conn, "pipeline__batch_log")? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(
                "SELECT batch_id, source, status, row_count, message, created_at \
                 FROM \"pipeline__batch_log\" WHERE batch_id = ?1 ORDER BY source",
            )
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(params![batch_id.as_str()], |row| {
                Ok(BatchLogEntry {
                    batch_id: row.get(0)?,
                    source: row.get(1)?,
                    status: row.get(2)?,
                    row_count: row.get(3)?,
                    message: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(PipelineError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PipelineError::from)
    }

    /// Total row count for one `(table, batch_id)` pair; used by idempotence
    /// checks and diagnostics.
    pub fn batch_row_count(&self, logical_table: &str, batch_id: &BatchId) -> PipelineResult<i64> {
        let table = self.physical_table(logical_table);
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(0);
        }
        conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{table}\" WHERE batch_id = ?1"),
            params![batch_id.as_str()],
            |row| row.get(0),
        )
        .map_err(PipelineError::from)
    }

    /// Back-fills `media_user_revenue` on already-loaded ad-spend rows.
    pub fn backfill_media_revenue(
        &self,
        stat_date: NaiveDate,
        batch_id: Option<&BatchId>,
        values: &HashMap<String, f64>,
    ) -> PipelineResult<usize> {
        let table = self.physical_table("quickbi_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(0);
        }
        let mut updated = 0usize;
        for (campaign_id, revenue) in values {
            let count = match batch_id {
                Some(batch) => conn
                    .execute(
                        &format!(
                            "UPDATE \"{table}\" SET media_user_revenue = ?1 \
                             WHERE stat_date = ?2 AND campaign_id = ?3 AND batch_id = ?4"
                        ),
                        params![revenue, stat_date.to_string(), campaign_id, batch.as_str()],
                    )
                    .map_err(PipelineError::from)?,
                None => conn
                    .execute(
                        &format!(
                            "UPDATE \"{table}\" SET media_user_revenue = ?1 \
                             WHERE stat_date = ?2 AND campaign_id = ?3"
                        ),
                        params![revenue, stat_date.to_string(), campaign_id],
                    )
                    .map_err(PipelineError::from)?,
            };
            updated += count;
        }
        Ok(updated)
    }
}

fn ensure_fact_table(conn: &Connection, table: &str, columns: &[Column]) -> PipelineResult<()> {
    let mut definitions = vec![
        "batch_id TEXT NOT NULL".to_string(),
        "fetched_at TEXT NOT NULL".to_string(),
    ];
    for (name, kind) in columns {
        let sql_type = match kind {
            ColKind::Text => "TEXT",
            ColKind::Real => "REAL",
            ColKind::Integer => "INTEGER",
        };
        definitions.push(format!("{name} {sql_type}"));
    }
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" ({})",
            definitions.join(", ")
        ),
        [],
    )
    .map_err(PipelineError::from)?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS \"{table}_batch_idx\" \
             ON \"{table}\" (stat_date, batch_id)"
        ),
        [],
    )
    .ok();
    Ok(())
}

fn check_required_columns(
    conn: &Connection,
    table: &str,
    columns: &[Column],
) -> PipelineResult<()> {
    let mut statement = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .map_err(PipelineError::from)?;
    let present: HashSet<String> = statement
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(PipelineError::from)?
        .collect::<Result<_, _>>()
        .map_err(PipelineError::from)?;

    let mut missing: Vec<&str> = columns
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !present.contains(*name))
        .collect();
    for required in ["batch_id", "fetched_at"] {
        if !present.contains(required) {
            missing.push(required);
        }
    }
    if !missing.is_empty() {
        return Err(PipelineError::invalid(format!(
            "table {table} is missing required columns: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> PipelineResult<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )
    .map_err(PipelineError::from)
}

/// A row value that cannot be bound into its declared column type.
#[derive(Debug, thiserror::Error)]
#[error("cannot bind {value} into column {column} as {kind:?}")]
struct BindError {
    column: String,
    kind: ColKind,
    value: String,
}

impl From<BindError> for PipelineError {
    fn from(value: BindError) -> Self {
        PipelineError::invalid(value.to_string())
    }
}

fn sql_value(column: &str, value: Option<&Value>, kind: ColKind) -> Result<SqlValue, BindError> {
    let Some(value) = value else {
        return Ok(SqlValue::Null);
    };
    Ok(match (kind, value) {
        (_, Value::Null) => SqlValue::Null,
        (ColKind::Text, Value::String(s)) => SqlValue::Text(s.clone()),
        (ColKind::Text, other) => SqlValue::Text(other.to_string()),
        (ColKind::Real, Value::Number(n)) => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        (ColKind::Integer, Value::Number(n)) => SqlValue::Integer(n.as_i64().unwrap_or(0)),
        (kind, other) => {
            return Err(BindError {
                column: column.to_string(),
                kind,
                value: other.to_string(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_models::{AdSpendFact, Channel, HourlySnapshot};
    use serde_json::Map;

    fn fact(campaign_id: &str, spend: f64) -> AdSpendFact {
        AdSpendFact {
            stat_date: NaiveDate::from_ymd_opt(2026, 1, 16).unwrap(),
            channel: Channel::Facebook,
            campaign_id: campaign_id.to_string(),
            campaign_name: format!("15000201-{campaign_id}"),
            optimizer: "kino".to_string(),
            country: "US".to_string(),
            spend,
            new_user_revenue: spend * 0.4,
            media_user_revenue: 0.0,
            impressions: 1000,
            clicks: 50,
            installs: 10,
            extra: Map::new(),
        }
    }

    fn batch_at(raw: &str) -> (BatchId, DateTime<Utc>) {
        let id = BatchId::parse(raw).expect("valid");
        let fetched_at = id.timestamp() + chrono::Duration::seconds(30);
        (id, fetched_at)
    }

    #[test]
    fn append_then_reappend_is_a_no_op() {
        let warehouse = Warehouse::in_memory().expect("open");
        let (batch_id, fetched_at) = batch_at("20260116_140330");
        let rows = FactBatch::QuickbiCampaigns(vec![fact("c-1", 10.0), fact("c-2", 20.0)]);

        assert_eq!(warehouse.append(&rows, &batch_id, fetched_at).expect("append"), 2);
        assert_eq!(warehouse.append(&rows, &batch_id, fetched_at).expect("re-append"), 0);
        assert_eq!(
            warehouse
                .batch_row_count("quickbi_campaigns", &batch_id)
                .expect("count"),
            2
        );
    }

    #[test]
    fn fetched_at_before_batch_timestamp_is_rejected() {
        let warehouse = Warehouse::in_memory().expect("open");
        let batch_id = BatchId::parse("20260116_140330").expect("valid");
        let too_early = batch_id.timestamp() - chrono::Duration::seconds(5);
        let err = warehouse
            .append(
                &FactBatch::QuickbiCampaigns(vec![fact("c-1", 10.0)]),
                &batch_id,
                too_early,
            )
            .expect_err("must reject");
        assert_eq!(err.kind, crate::contracts::ErrorKind::Invalid);
    }

    #[test]
    fn schema_missing_columns_is_rejected() {
        let warehouse = Warehouse::in_memory().expect("open");
        warehouse
            .lock()
            .execute(
                "CREATE TABLE \"quickbi_data__quickbi_campaigns\" (batch_id TEXT, stat_date TEXT)",
                [],
            )
            .expect("create partial table");

        let (batch_id, fetched_at) = batch_at("20260116_140330");
        let err = warehouse
            .append(
                &FactBatch::QuickbiCampaigns(vec![fact("c-1", 10.0)]),
                &batch_id,
                fetched_at,
            )
            .expect_err("missing columns");
        assert!(err.message.contains("missing required columns"));
        assert!(err.message.contains("spend"));
        assert!(err.message.contains("fetched_at"));
    }

    #[test]
    fn drama_upsert_is_last_write_wins() {
        let warehouse = Warehouse::in_memory().expect("open");
        warehouse
            .upsert_drama_mapping(&[DramaMapping {
                drama_id: "15000201".to_string(),
                drama_name: "X".to_string(),
            }])
            .expect("first upsert");
        warehouse
            .upsert_drama_mapping(&[DramaMapping {
                drama_id: "15000201".to_string(),
                drama_name: "Y".to_string(),
            }])
            .expect("second upsert");

        let names = warehouse.drama_names().expect("names");
        assert_eq!(names.len(), 1);
        assert_eq!(names["15000201"], "Y");
    }

    #[test]
    fn empty_batch_appends_zero_rows_successfully() {
        let warehouse = Warehouse::in_memory().expect("open");
        let (batch_id, fetched_at) = batch_at("20260116_140330");
        let count = warehouse
            .append(&FactBatch::QuickbiCampaigns(Vec::new()), &batch_id, fetched_at)
            .expect("empty append succeeds");
        assert_eq!(count, 0);
    }

    #[test]
    fn hourly_snapshots_round_trip() {
        let warehouse = Warehouse::in_memory().expect("open");
        let (batch_id, fetched_at) = batch_at("20260116_150000");
        let snapshot = HourlySnapshot {
            stat_date: NaiveDate::from_ymd_opt(2026, 1, 16).unwrap(),
            snapshot_time: "2026-01-16 15:00:00".to_string(),
            hour: 15,
            total_spend: 1234.5,
            d0_roas: 0.37,
        };
        warehouse
            .append(
                &FactBatch::HourlySnapshots(vec![snapshot]),
                &batch_id,
                fetched_at,
            )
            .expect("append");
        assert_eq!(
            warehouse
                .batch_row_count("hourly_snapshots", &batch_id)
                .expect("count"),
            1
        );
    }

    #[test]
    fn batch_log_round_trips() {
        let warehouse = Warehouse::in_memory().expect("open");
        let batch_id = BatchId::parse("20260116_140330").expect("valid");
        warehouse
            .log_batch(&BatchLogEntry {
                batch_id: batch_id.as_str().to_string(),
                source: "quickbi".to_string(),
                status: "success".to_string(),
                row_count: 42,
                message: None,
                created_at: Utc::now().to_rfc3339(),
            })
            .expect("log");
        warehouse
            .log_batch(&BatchLogEntry {
                batch_id: batch_id.as_str().to_string(),
                source: "xmp".to_string(),
                status: "failed".to_string(),
                row_count: 0,
                message: Some("503 three times".to_string()),
                created_at: Utc::now().to_rfc3339(),
            })
            .expect("log");

        let entries = warehouse.batch_log(&batch_id).expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, "quickbi");
        assert_eq!(entries[1].status, "failed");
    }

    #[test]
    fn backfill_updates_matching_rows_only() {
        let warehouse = Warehouse::in_memory().expect("open");
        let (batch_id, fetched_at) = batch_at("20260116_140330");
        warehouse
            .append(
                &FactBatch::QuickbiCampaigns(vec![fact("c-1", 10.0), fact("c-2", 20.0)]),
                &batch_id,
                fetched_at,
            )
            .expect("append");

        let values = HashMap::from([("c-1".to_string(), 7.5)]);
        let updated = warehouse
            .backfill_media_revenue(
                NaiveDate::from_ymd_opt(2026, 1, 16).unwrap(),
                Some(&batch_id),
                &values,
            )
            .expect("backfill");
        assert_eq!(updated, 1);

        let revenue: f64 = warehouse
            .lock()
            .query_row(
                "SELECT media_user_revenue FROM \"quickbi_data__quickbi_campaigns\" \
                 WHERE campaign_id = 'c-1'",
                [],
                |row| row.get(0),
            )
            .expect("read");
        assert!((revenue - 7.5).abs() < 1e-9);
    }
}
