use std::collections::BTreeMap;

use chrono::NaiveDate;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::loader::table_exists;
use super::Warehouse;
use crate::config::{AppConfig, Team};
use crate::contracts::{PipelineError, PipelineResult};
use crate::data_models::DateWindow;

// The closed set of parameterized aggregations reports are built from.
// Every query reduces through latest-batch-per-date before grouping; raw
// cross-batch sums would double-count. Rank ties break by the ranked
// measure, then by name ascending.

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub cpm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeekSummary {
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub daily_avg_spend: f64,
    pub avg_cpm: f64,
}

/// Current week beside the previous week's same aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeekOverWeek {
    pub current: WeekSummary,
    pub previous: WeekSummary,
    /// Relative change; `None` when the previous week had no spend.
    pub spend_change: Option<f64>,
    pub revenue_change: Option<f64>,
    /// ROAS delta in fraction points (current minus previous).
    pub roas_change: Option<f64>,
    pub cpm_change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub spend: f64,
    pub roas: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopDimension {
    Campaign,
    Drama,
    Country,
    Editor,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopMeasure {
    Spend,
    Roas,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEntry {
    pub name: String,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub campaign_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankSubject {
    Optimizers,
    Editors,
}

/// Per-person performance with channel split, ranks, and label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonPerf {
    pub name: String,
    pub meta_spend: f64,
    pub meta_roas: f64,
    pub tt_spend: f64,
    pub tt_roas: f64,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    /// Ranks are only assigned to people clearing the minimum-spend gate.
    pub spend_rank: Option<u32>,
    pub roas_rank: Option<u32>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DramaPerf {
    pub drama_id: String,
    pub name: String,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub roas_change: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryBuckets {
    pub top_dramas: Vec<DramaPerf>,
    pub potential_dramas: Vec<DramaPerf>,
    pub declining_dramas: Vec<DramaPerf>,
    pub losing_dramas: Vec<DramaPerf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRollupRow {
    pub team: String,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub campaign_count: i64,
    pub member_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel: String,
    pub campaign_count: i64,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntradayCampaign {
    pub channel: String,
    pub campaign_name: String,
    pub country: String,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
}

/// The latest-batch-per-date reducer every query joins through: for each
/// `stat_date`, only rows tagged with the maximum observed `batch_id` count.
fn latest_filter(table: &str) -> String {
    format!(
        "t1.batch_id = (SELECT MAX(t2.batch_id) FROM \"{table}\" t2 \
         WHERE t2.stat_date = t1.stat_date)"
    )
}

/// Campaign names lead with the drama id (`15000201-US-...`); six or more
/// leading digits form the drama key.
pub fn drama_key(campaign_name: &str) -> Option<String> {
    let digits: String = campaign_name
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() >= 6 {
        Some(digits)
    } else {
        None
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn relative_change(current: f64, previous: f64) -> Option<f64> {
    if previous > 0.0 {
        Some((current - previous) / previous)
    } else {
        None
    }
}

impl Warehouse {
    /// One day's overall spend, revenue, ROAS, and CPM.
    pub fn daily_summary(&self, date: NaiveDate) -> PipelineResult<DailySummary> {
        let table = self.physical_table("quickbi_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(DailySummary {
                spend: 0.0,
                revenue: 0.0,
                roas: 0.0,
                cpm: 0.0,
            });
        }
        let (spend, revenue, impressions): (f64, f64, f64) = conn
            .query_row(
                &format!(
                    "SELECT COALESCE(SUM(spend), 0), \
                            COALESCE(SUM(new_user_revenue), 0), \
                            COALESCE(SUM(impressions), 0) \
                     FROM \"{table}\" t1 \
                     WHERE t1.stat_date = ?1 AND {}",
                    latest_filter(&table)
                ),
                params![date.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(PipelineError::from)?;
        Ok(DailySummary {
            spend,
            revenue,
            roas: ratio(revenue, spend),
            cpm: ratio(spend, impressions) * 1000.0,
        })
    }

    /// Weekly aggregate plus the previous week for week-over-week deltas.
    pub fn week_summary(&self, window: DateWindow) -> PipelineResult<WeekOverWeek> {
        let current = self.window_summary(window)?;
        let previous = self.window_summary(window.previous())?;
        Ok(WeekOverWeek {
            current,
            previous,
            spend_change: relative_change(current.spend, previous.spend),
            revenue_change: relative_change(current.revenue, previous.revenue),
            roas_change: if previous.spend > 0.0 {
                Some(current.roas - previous.roas)
            } else {
                None
            },
            cpm_change: relative_change(current.avg_cpm, previous.avg_cpm),
        })
    }

    fn window_summary(&self, window: DateWindow) -> PipelineResult<WeekSummary> {
        let table = self.physical_table("quickbi_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(WeekSummary {
                spend: 0.0,
                revenue: 0.0,
                roas: 0.0,
                daily_avg_spend: 0.0,
                avg_cpm: 0.0,
            });
        }
        let (spend, revenue, impressions): (f64, f64, f64) = conn
            .query_row(
                &format!(
                    "SELECT COALESCE(SUM(spend), 0), \
                            COALESCE(SUM(new_user_revenue), 0), \
                            COALESCE(SUM(impressions), 0) \
                     FROM \"{table}\" t1 \
                     WHERE t1.stat_date BETWEEN ?1 AND ?2 AND {}",
                    latest_filter(&table)
                ),
                params![window.start.to_string(), window.end.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(PipelineError::from)?;
        Ok(WeekSummary {
            spend,
            revenue,
            roas: ratio(revenue, spend),
            daily_avg_spend: spend / window.days() as f64,
            avg_cpm: ratio(spend, impressions) * 1000.0,
        })
    }

    /// Ascending per-day spend and ROAS.
    pub fn daily_trend(&self, window: DateWindow) -> PipelineResult<Vec<TrendPoint>> {
        let table = self.physical_table("quickbi_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(&format!(
                "SELECT t1.stat_date, \
                        COALESCE(SUM(spend), 0), \
                        COALESCE(SUM(new_user_revenue), 0) \
                 FROM \"{table}\" t1 \
                 WHERE t1.stat_date BETWEEN ?1 AND ?2 AND {} \
                 GROUP BY t1.stat_date \
                 ORDER BY t1.stat_date ASC",
                latest_filter(&table)
            ))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(
                params![window.start.to_string(), window.end.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .map_err(PipelineError::from)?;

        let mut points = Vec::new();
        for row in rows {
            let (date, spend, revenue) = row.map_err(PipelineError::from)?;
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(|err| PipelineError::internal(format!("bad stat_date in store: {err}")))?;
            points.push(TrendPoint {
                date,
                spend,
                roas: ratio(revenue, spend),
            });
        }
        Ok(points)
    }

    /// Ranked top-N along one dimension.
    pub fn top_n_by(
        &self,
        dimension: TopDimension,
        measure: TopMeasure,
        window: DateWindow,
        n: usize,
    ) -> PipelineResult<Vec<TopEntry>> {
        let mut entries = match dimension {
            TopDimension::Campaign => self.grouped_campaigns(window, "campaign_name")?,
            TopDimension::Country => self.grouped_campaigns(window, "country")?,
            TopDimension::Channel => self.grouped_campaigns(window, "channel")?,
            TopDimension::Editor => self.grouped_editors(window)?,
            TopDimension::Drama => {
                let names = self.drama_names()?;
                self.grouped_dramas(window)?
                    .into_iter()
                    .map(|perf| TopEntry {
                        name: names
                            .get(&perf.drama_id)
                            .cloned()
                            .unwrap_or_else(|| perf.drama_id.clone()),
                        spend: perf.spend,
                        revenue: perf.revenue,
                        roas: perf.roas,
                        campaign_count: 0,
                    })
                    .collect()
            }
        };

        entries.sort_by(|a, b| {
            let (ma, mb) = match measure {
                TopMeasure::Spend => (a.spend, b.spend),
                TopMeasure::Roas => (a.roas, b.roas),
            };
            mb.partial_cmp(&ma)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        entries.truncate(n);
        Ok(entries)
    }

    fn grouped_campaigns(
        &self,
        window: DateWindow,
        dimension_col: &str,
    ) -> PipelineResult<Vec<TopEntry>> {
        let table = self.physical_table("quickbi_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(&format!(
                "SELECT {dimension_col}, \
                        COALESCE(SUM(spend), 0), \
                        COALESCE(SUM(new_user_revenue), 0), \
                        COUNT(DISTINCT campaign_id) \
                 FROM \"{table}\" t1 \
                 WHERE t1.stat_date BETWEEN ?1 AND ?2 AND {} \
                 GROUP BY {dimension_col}",
                latest_filter(&table)
            ))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(
                params![window.start.to_string(), window.end.to_string()],
                |row| {
                    Ok(TopEntry {
                        name: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        spend: row.get(1)?,
                        revenue: row.get(2)?,
                        roas: 0.0,
                        campaign_count: row.get(3)?,
                    })
                },
            )
            .map_err(PipelineError::from)?;
        let mut entries = Vec::new();
        for row in rows {
            let mut entry = row.map_err(PipelineError::from)?;
            entry.roas = ratio(entry.revenue, entry.spend);
            entries.push(entry);
        }
        Ok(entries)
    }

    fn grouped_editors(&self, window: DateWindow) -> PipelineResult<Vec<TopEntry>> {
        let table = self.physical_table("xmp_editor_stats");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(&format!(
                "SELECT editor_name, \
                        COALESCE(SUM(spend), 0), \
                        COALESCE(SUM(revenue), 0), \
                        COALESCE(SUM(material_count), 0) \
                 FROM \"{table}\" t1 \
                 WHERE t1.stat_date BETWEEN ?1 AND ?2 AND {} \
                 GROUP BY editor_name",
                latest_filter(&table)
            ))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(
                params![window.start.to_string(), window.end.to_string()],
                |row| {
                    Ok(TopEntry {
                        name: row.get(0)?,
                        spend: row.get(1)?,
                        revenue: row.get(2)?,
                        roas: 0.0,
                        campaign_count: row.get(3)?,
                    })
                },
            )
            .map_err(PipelineError::from)?;
        let mut entries = Vec::new();
        for row in rows {
            let mut entry = row.map_err(PipelineError::from)?;
            entry.roas = ratio(entry.revenue, entry.spend);
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Per-drama aggregation for one window, keyed by the campaign-name
    /// drama prefix.
    fn grouped_dramas(&self, window: DateWindow) -> PipelineResult<Vec<DramaPerf>> {
        let campaigns = self.grouped_campaigns(window, "campaign_name")?;
        let mut by_drama: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        for entry in campaigns {
            let Some(key) = drama_key(&entry.name) else {
                continue;
            };
            let slot = by_drama.entry(key).or_insert((0.0, 0.0));
            slot.0 += entry.spend;
            slot.1 += entry.revenue;
        }
        Ok(by_drama
            .into_iter()
            .map(|(drama_id, (spend, revenue))| DramaPerf {
                name: drama_id.clone(),
                drama_id,
                spend,
                revenue,
                roas: ratio(revenue, spend),
                roas_change: None,
            })
            .collect())
    }

    /// Per-person ranks and `Spend Top1` / `ROAS Top1` labels with a
    /// minimum-spend gate.
    pub fn rank_labels(
        &self,
        subject: RankSubject,
        window: DateWindow,
        min_spend: f64,
    ) -> PipelineResult<Vec<PersonPerf>> {
        let raw = match subject {
            RankSubject::Optimizers => self.person_split(
                &self.physical_table("quickbi_campaigns"),
                "optimizer",
                "new_user_revenue",
                window,
            )?,
            RankSubject::Editors => self.person_split(
                &self.physical_table("xmp_editor_stats"),
                "editor_name",
                "revenue",
                window,
            )?,
        };

        let mut people: Vec<PersonPerf> = raw
            .into_iter()
            .filter(|p| p.spend > 0.0)
            .collect();

        // Deterministic ranks: measure descending, then name ascending.
        let mut by_spend: Vec<usize> = (0..people.len())
            .filter(|&i| people[i].spend >= min_spend)
            .collect();
        by_spend.sort_by(|&a, &b| {
            people[b]
                .spend
                .partial_cmp(&people[a].spend)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| people[a].name.cmp(&people[b].name))
        });
        for (rank, &idx) in by_spend.iter().enumerate() {
            people[idx].spend_rank = Some(rank as u32 + 1);
        }

        let mut by_roas: Vec<usize> = (0..people.len())
            .filter(|&i| people[i].spend >= min_spend)
            .collect();
        by_roas.sort_by(|&a, &b| {
            people[b]
                .roas
                .partial_cmp(&people[a].roas)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| people[a].name.cmp(&people[b].name))
        });
        for (rank, &idx) in by_roas.iter().enumerate() {
            people[idx].roas_rank = Some(rank as u32 + 1);
        }

        for person in &mut people {
            let mut labels = Vec::new();
            if person.spend_rank == Some(1) {
                labels.push("Spend Top1");
            }
            if person.roas_rank == Some(1) {
                labels.push("ROAS Top1");
            }
            person.label = labels.join(", ");
        }

        people.sort_by(|a, b| {
            b.spend
                .partial_cmp(&a.spend)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(people)
    }

    fn person_split(
        &self,
        table: &str,
        name_col: &str,
        revenue_col: &str,
        window: DateWindow,
    ) -> PipelineResult<Vec<PersonPerf>> {
        let conn = self.lock();
        if !table_exists(&conn, table)? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(&format!(
                "SELECT {name_col}, \
                        COALESCE(SUM(CASE WHEN channel = 'facebook' THEN spend ELSE 0 END), 0), \
                        COALESCE(SUM(CASE WHEN channel = 'facebook' THEN {revenue_col} ELSE 0 END), 0), \
                        COALESCE(SUM(CASE WHEN channel = 'tiktok' THEN spend ELSE 0 END), 0), \
                        COALESCE(SUM(CASE WHEN channel = 'tiktok' THEN {revenue_col} ELSE 0 END), 0), \
                        COALESCE(SUM(spend), 0), \
                        COALESCE(SUM({revenue_col}), 0) \
                 FROM \"{table}\" t1 \
                 WHERE t1.stat_date BETWEEN ?1 AND ?2 AND {} \
                 GROUP BY {name_col}",
                latest_filter(table)
            ))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(
                params![window.start.to_string(), window.end.to_string()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                    ))
                },
            )
            .map_err(PipelineError::from)?;

        let mut people = Vec::new();
        for row in rows {
            let (name, meta_spend, meta_revenue, tt_spend, tt_revenue, spend, revenue) =
                row.map_err(PipelineError::from)?;
            if name.is_empty() {
                continue;
            }
            people.push(PersonPerf {
                name,
                meta_spend,
                meta_roas: ratio(meta_revenue, meta_spend),
                tt_spend,
                tt_roas: ratio(tt_revenue, tt_spend),
                spend,
                revenue,
                roas: ratio(revenue, spend),
                spend_rank: None,
                roas_rank: None,
                label: String::new(),
            });
        }
        Ok(people)
    }

    /// Drama buckets for the weekly report.
    pub fn category_buckets(&self, window: DateWindow) -> PipelineResult<CategoryBuckets> {
        let names = self.drama_names()?;
        let current = self.grouped_dramas(window)?;
        let previous = self.grouped_dramas(window.previous())?;
        let previous_roas: BTreeMap<&str, f64> = previous
            .iter()
            .filter(|d| d.spend > 0.0)
            .map(|d| (d.drama_id.as_str(), d.roas))
            .collect();

        let mut buckets = CategoryBuckets::default();
        for mut drama in current {
            drama.roas_change = previous_roas
                .get(drama.drama_id.as_str())
                .map(|prev| drama.roas - prev);
            if let Some(name) = names.get(&drama.drama_id) {
                drama.name = name.clone();
            }

            if drama.spend > 10_000.0 && drama.roas > 0.40 {
                buckets.top_dramas.push(drama.clone());
            }
            if drama.spend > 1_000.0 && drama.spend < 10_000.0 && drama.roas > 0.50 {
                buckets.potential_dramas.push(drama.clone());
            }
            if matches!(drama.roas_change, Some(change) if change < -0.10) {
                buckets.declining_dramas.push(drama.clone());
            }
            if drama.spend > 1_000.0 && drama.roas < 0.25 {
                buckets.losing_dramas.push(drama);
            }
        }

        let by_spend = |a: &DramaPerf, b: &DramaPerf| {
            b.spend
                .partial_cmp(&a.spend)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        };
        buckets.top_dramas.sort_by(by_spend);
        buckets.potential_dramas.sort_by(by_spend);
        buckets.losing_dramas.sort_by(by_spend);
        buckets.declining_dramas.sort_by(|a, b| {
            a.roas_change
                .unwrap_or(0.0)
                .partial_cmp(&b.roas_change.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(buckets)
    }

    /// Per-team roll-up from the configured optimizer membership map.
    pub fn team_rollup(
        &self,
        window: DateWindow,
        config: &AppConfig,
    ) -> PipelineResult<Vec<TeamRollupRow>> {
        let people = self.person_with_campaign_counts(window)?;
        let mut rollup: BTreeMap<&'static str, TeamRollupRow> = BTreeMap::new();
        for (name, spend, revenue, campaigns) in people {
            let team = config.team_for(&name);
            let row = rollup
                .entry(team.as_str())
                .or_insert_with(|| TeamRollupRow {
                    team: team.as_str().to_string(),
                    spend: 0.0,
                    revenue: 0.0,
                    roas: 0.0,
                    campaign_count: 0,
                    member_count: 0,
                });
            row.spend += spend;
            row.revenue += revenue;
            row.campaign_count += campaigns;
            row.member_count += 1;
        }

        let mut rows: Vec<TeamRollupRow> = rollup
            .into_values()
            .map(|mut row| {
                row.roas = ratio(row.revenue, row.spend);
                row
            })
            .collect();
        // Stable presentation order: CN, KR, then the rest.
        let order = |team: &str| match team {
            "CN" => 0,
            "KR" => 1,
            _ => 2,
        };
        rows.sort_by_key(|row| order(&row.team));
        Ok(rows)
    }

    fn person_with_campaign_counts(
        &self,
        window: DateWindow,
    ) -> PipelineResult<Vec<(String, f64, f64, i64)>> {
        let table = self.physical_table("quickbi_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(&format!(
                "SELECT optimizer, \
                        COALESCE(SUM(spend), 0), \
                        COALESCE(SUM(new_user_revenue), 0), \
                        COUNT(DISTINCT campaign_id) \
                 FROM \"{table}\" t1 \
                 WHERE t1.stat_date BETWEEN ?1 AND ?2 AND {} \
                 GROUP BY optimizer",
                latest_filter(&table)
            ))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(
                params![window.start.to_string(), window.end.to_string()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .map_err(PipelineError::from)?;
        let mut people = Vec::new();
        for row in rows {
            let entry = row.map_err(PipelineError::from)?;
            if entry.0.is_empty() {
                continue;
            }
            people.push(entry);
        }
        Ok(people)
    }

    /// Intraday channel breakdown from the internal campaign slice.
    pub fn channel_summary(&self, date: NaiveDate) -> PipelineResult<Vec<ChannelSummary>> {
        let table = self.physical_table("xmp_internal_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(&format!(
                "SELECT channel, \
                        COUNT(DISTINCT campaign_id), \
                        COALESCE(SUM(spend), 0), \
                        COALESCE(SUM(revenue), 0) \
                 FROM \"{table}\" t1 \
                 WHERE t1.stat_date = ?1 AND {} \
                 GROUP BY channel \
                 ORDER BY SUM(spend) DESC",
                latest_filter(&table)
            ))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(params![date.to_string()], |row| {
                Ok(ChannelSummary {
                    channel: row.get(0)?,
                    campaign_count: row.get(1)?,
                    spend: row.get(2)?,
                    revenue: row.get(3)?,
                    roas: 0.0,
                })
            })
            .map_err(PipelineError::from)?;
        let mut channels = Vec::new();
        for row in rows {
            let mut channel = row.map_err(PipelineError::from)?;
            channel.roas = ratio(channel.revenue, channel.spend);
            channels.push(channel);
        }
        Ok(channels)
    }

    /// Intraday top spenders from the internal campaign slice.
    pub fn intraday_top_campaigns(
        &self,
        date: NaiveDate,
        n: usize,
    ) -> PipelineResult<Vec<IntradayCampaign>> {
        let table = self.physical_table("xmp_internal_campaigns");
        let conn = self.lock();
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut statement = conn
            .prepare(&format!(
                "SELECT channel, campaign_name, country, spend, revenue \
                 FROM \"{table}\" t1 \
                 WHERE t1.stat_date = ?1 AND {} \
                 ORDER BY spend DESC, campaign_name ASC \
                 LIMIT ?2",
                latest_filter(&table)
            ))
            .map_err(PipelineError::from)?;
        let rows = statement
            .query_map(params![date.to_string(), n as i64], |row| {
                Ok(IntradayCampaign {
                    channel: row.get(0)?,
                    campaign_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    country: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    spend: row.get(3)?,
                    revenue: row.get(4)?,
                    roas: 0.0,
                })
            })
            .map_err(PipelineError::from)?;
        let mut campaigns = Vec::new();
        for row in rows {
            let mut campaign = row.map_err(PipelineError::from)?;
            campaign.roas = ratio(campaign.revenue, campaign.spend);
            campaigns.push(campaign);
        }
        Ok(campaigns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_models::{
        AdSpendFact, BatchId, Channel, EditorRollup, FactBatch,
    };
    use approx::assert_relative_eq;
    use chrono::{DateTime, Utc};
    use serde_json::Map;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn fact(
        stat_date: &str,
        channel: Channel,
        campaign: &str,
        optimizer: &str,
        spend: f64,
        revenue: f64,
    ) -> AdSpendFact {
        AdSpendFact {
            stat_date: date(stat_date),
            channel,
            campaign_id: format!("id-{campaign}"),
            campaign_name: campaign.to_string(),
            optimizer: optimizer.to_string(),
            country: "US".to_string(),
            spend,
            new_user_revenue: revenue,
            media_user_revenue: 0.0,
            impressions: 10_000,
            clicks: 100,
            installs: 5,
            extra: Map::new(),
        }
    }

    fn append(warehouse: &Warehouse, batch: &str, rows: Vec<AdSpendFact>) {
        let batch_id = BatchId::parse(batch).unwrap();
        let fetched_at: DateTime<Utc> = batch_id.timestamp() + chrono::Duration::seconds(10);
        warehouse
            .append(&FactBatch::QuickbiCampaigns(rows), &batch_id, fetched_at)
            .expect("append");
    }

    #[test]
    fn latest_batch_per_date_hides_stale_batches() {
        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260116_140330",
            vec![
                fact("2026-01-16", Channel::Facebook, "a", "kino", 10.0, 4.0),
                fact("2026-01-16", Channel::Facebook, "b", "kino", 10.0, 4.0),
            ],
        );
        append(
            &warehouse,
            "20260116_143309",
            vec![fact("2026-01-16", Channel::Facebook, "a", "kino", 99.0, 33.0)],
        );

        let summary = warehouse.daily_summary(date("2026-01-16")).expect("summary");
        // Only the 14:33 batch is visible; the 14:03 rows are hidden.
        assert_relative_eq!(summary.spend, 99.0, epsilon = 1e-9);
        assert_relative_eq!(summary.revenue, 33.0, epsilon = 1e-9);
    }

    #[test]
    fn daily_summary_computes_roas_and_cpm() {
        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260116_140330",
            vec![fact("2026-01-16", Channel::Facebook, "a", "kino", 200.0, 80.0)],
        );
        let summary = warehouse.daily_summary(date("2026-01-16")).expect("summary");
        assert_relative_eq!(summary.roas, 0.4, epsilon = 1e-9);
        // 200 spend over 10k impressions -> $20 CPM.
        assert_relative_eq!(summary.cpm, 20.0, epsilon = 1e-9);
    }

    #[test]
    fn week_over_week_changes_match_seed_scenario() {
        let warehouse = Warehouse::in_memory().expect("open");
        // Current week: spend 1000, revenue 500. Previous: 800 / 500.
        append(
            &warehouse,
            "20260119_010000",
            vec![fact("2026-01-12", Channel::Facebook, "a", "kino", 1000.0, 500.0)],
        );
        append(
            &warehouse,
            "20260112_010000",
            vec![fact("2026-01-05", Channel::Facebook, "a", "kino", 800.0, 500.0)],
        );

        let window = DateWindow {
            start: date("2026-01-12"),
            end: date("2026-01-18"),
        };
        let wow = warehouse.week_summary(window).expect("wow");
        assert_relative_eq!(wow.spend_change.unwrap(), 0.25, epsilon = 1e-9);
        assert_relative_eq!(wow.roas_change.unwrap(), -0.125, epsilon = 1e-9);
        assert_relative_eq!(wow.revenue_change.unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn daily_trend_is_ascending() {
        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260117_010000",
            vec![
                fact("2026-01-16", Channel::Facebook, "a", "kino", 50.0, 20.0),
                fact("2026-01-15", Channel::Facebook, "a", "kino", 40.0, 10.0),
            ],
        );
        let trend = warehouse
            .daily_trend(DateWindow {
                start: date("2026-01-15"),
                end: date("2026-01-16"),
            })
            .expect("trend");
        assert_eq!(trend.len(), 2);
        assert_eq!(trend[0].date, date("2026-01-15"));
        assert_relative_eq!(trend[1].roas, 0.4, epsilon = 1e-9);
    }

    #[test]
    fn rank_labels_match_seed_scenario() {
        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260116_140330",
            vec![
                fact("2026-01-16", Channel::Facebook, "a", "alice", 23_000.0, 13_700.0),
                fact("2026-01-16", Channel::Facebook, "b", "bob", 17_000.0, 11_600.0),
                fact("2026-01-16", Channel::Facebook, "c", "carol", 11_000.0, 5_500.0),
            ],
        );
        let window = DateWindow::single(date("2026-01-16"));
        let people = warehouse
            .rank_labels(RankSubject::Optimizers, window, 100.0)
            .expect("ranks");

        assert_eq!(people.len(), 3);
        assert_eq!(people[0].name, "alice");
        assert_eq!(people[0].label, "Spend Top1");
        assert_eq!(people[1].name, "bob");
        assert_eq!(people[1].label, "ROAS Top1");
        assert_eq!(people[2].name, "carol");
        assert_eq!(people[2].label, "");
    }

    #[test]
    fn rank_gate_excludes_small_spenders_from_ranks() {
        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260116_140330",
            vec![
                fact("2026-01-16", Channel::Facebook, "a", "alice", 5_000.0, 1_000.0),
                fact("2026-01-16", Channel::Facebook, "b", "bob", 50.0, 500.0),
            ],
        );
        let people = warehouse
            .rank_labels(
                RankSubject::Optimizers,
                DateWindow::single(date("2026-01-16")),
                100.0,
            )
            .expect("ranks");
        let bob = people.iter().find(|p| p.name == "bob").expect("bob");
        // Bob's 1000% ROAS does not earn a label below the spend gate.
        assert_eq!(bob.roas_rank, None);
        assert_eq!(bob.label, "");
        let alice = people.iter().find(|p| p.name == "alice").expect("alice");
        assert_eq!(alice.label, "Spend Top1, ROAS Top1");
    }

    #[test]
    fn rank_ties_resolve_by_name_ascending() {
        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260116_140330",
            vec![
                fact("2026-01-16", Channel::Facebook, "a", "zane", 1_000.0, 400.0),
                fact("2026-01-16", Channel::Facebook, "b", "echo", 1_000.0, 400.0),
            ],
        );
        let people = warehouse
            .rank_labels(
                RankSubject::Optimizers,
                DateWindow::single(date("2026-01-16")),
                100.0,
            )
            .expect("ranks");
        // Identical spend and ROAS: echo wins both labels on name order.
        assert_eq!(people[0].name, "echo");
        assert_eq!(people[0].label, "Spend Top1, ROAS Top1");
        assert_eq!(people[1].name, "zane");
        assert_eq!(people[1].label, "");
    }

    #[test]
    fn editor_ranks_read_editor_stats() {
        let warehouse = Warehouse::in_memory().expect("open");
        let batch_id = BatchId::parse("20260116_140330").unwrap();
        let rollup = EditorRollup {
            stat_date: date("2026-01-16"),
            editor_name: "ivy".to_string(),
            channel: Channel::Facebook,
            spend: 2_000.0,
            revenue: 900.0,
            roas: 0.45,
            material_count: 4,
            hot_count: 1,
            hot_rate: 0.25,
            top_material: "video m-1".to_string(),
            top_material_spend: 1_500.0,
        };
        warehouse
            .append(
                &FactBatch::XmpEditorStats(vec![rollup]),
                &batch_id,
                batch_id.timestamp() + chrono::Duration::seconds(5),
            )
            .expect("append");

        let people = warehouse
            .rank_labels(
                RankSubject::Editors,
                DateWindow::single(date("2026-01-16")),
                100.0,
            )
            .expect("ranks");
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].name, "ivy");
        assert_relative_eq!(people[0].meta_spend, 2_000.0, epsilon = 1e-9);
        assert_eq!(people[0].label, "Spend Top1, ROAS Top1");
    }

    #[test]
    fn category_buckets_apply_thresholds() {
        let warehouse = Warehouse::in_memory().expect("open");
        let current = vec![
            // top: spend > 10k, roas > 40%
            fact("2026-01-16", Channel::Facebook, "11000001-top", "kino", 12_000.0, 6_000.0),
            // potential: 1k < spend < 10k, roas > 50%
            fact("2026-01-16", Channel::Facebook, "11000002-pot", "kino", 2_000.0, 1_100.0),
            // losing: spend > 1k, roas < 25%
            fact("2026-01-16", Channel::Facebook, "11000003-lose", "kino", 3_000.0, 300.0),
            // declining: roas drops from 60% to 30%
            fact("2026-01-16", Channel::Facebook, "11000004-dec", "kino", 5_000.0, 1_500.0),
        ];
        append(&warehouse, "20260116_140330", current);
        append(
            &warehouse,
            "20260109_140330",
            vec![fact("2026-01-09", Channel::Facebook, "11000004-dec", "kino", 4_000.0, 2_400.0)],
        );

        let window = DateWindow {
            start: date("2026-01-10"),
            end: date("2026-01-16"),
        };
        let buckets = warehouse.category_buckets(window).expect("buckets");
        assert_eq!(buckets.top_dramas.len(), 1);
        assert_eq!(buckets.top_dramas[0].drama_id, "11000001");
        assert_eq!(buckets.potential_dramas.len(), 1);
        assert_eq!(buckets.potential_dramas[0].drama_id, "11000002");
        assert_eq!(buckets.losing_dramas.len(), 1);
        assert_eq!(buckets.losing_dramas[0].drama_id, "11000003");
        assert_eq!(buckets.declining_dramas.len(), 1);
        assert_eq!(buckets.declining_dramas[0].drama_id, "11000004");
        assert_relative_eq!(
            buckets.declining_dramas[0].roas_change.unwrap(),
            -0.3,
            epsilon = 1e-9
        );
    }

    #[test]
    fn drama_names_resolve_in_buckets() {
        let warehouse = Warehouse::in_memory().expect("open");
        warehouse
            .upsert_drama_mapping(&[crate::data_models::DramaMapping {
                drama_id: "11000001".to_string(),
                drama_name: "Fated Hearts".to_string(),
            }])
            .expect("upsert");
        append(
            &warehouse,
            "20260116_140330",
            vec![fact("2026-01-16", Channel::Facebook, "11000001-US", "kino", 12_000.0, 6_000.0)],
        );
        let buckets = warehouse
            .category_buckets(DateWindow::single(date("2026-01-16")))
            .expect("buckets");
        assert_eq!(buckets.top_dramas[0].name, "Fated Hearts");
    }

    #[test]
    fn team_rollup_groups_by_membership() {
        let env = std::collections::HashMap::from([
            ("BQ_PROJECT_ID", "p"),
            ("ALIYUN_ACCESS_KEY_ID", "a"),
            ("ALIYUN_ACCESS_KEY_SECRET", "s"),
            ("QUICKBI_API_ID", "q"),
            ("XMP_CLIENT_ID", "c"),
            ("XMP_CLIENT_SECRET", "cs"),
            ("LARK_APP_ID", "l"),
            ("LARK_APP_SECRET", "ls"),
            ("LARK_WEBHOOK_URL", "https://example.com/hook"),
            ("GCS_BUCKET_NAME", "b"),
        ]);
        let config =
            AppConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).expect("config");

        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260116_140330",
            vec![
                fact("2026-01-16", Channel::Facebook, "a", "kino", 1_000.0, 400.0),
                fact("2026-01-16", Channel::Facebook, "b", "echo", 500.0, 100.0),
                fact("2026-01-16", Channel::Tiktok, "c", "lyla", 800.0, 480.0),
                fact("2026-01-16", Channel::Tiktok, "d", "stranger", 100.0, 10.0),
            ],
        );

        let rows = warehouse
            .team_rollup(DateWindow::single(date("2026-01-16")), &config)
            .expect("rollup");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].team, "CN");
        assert_relative_eq!(rows[0].spend, 1_500.0, epsilon = 1e-9);
        assert_eq!(rows[0].member_count, 2);
        assert_eq!(rows[1].team, "KR");
        assert_relative_eq!(rows[1].roas, 0.6, epsilon = 1e-9);
        assert_eq!(rows[2].team, "Other");
    }

    #[test]
    fn top_n_ties_break_by_name() {
        let warehouse = Warehouse::in_memory().expect("open");
        append(
            &warehouse,
            "20260116_140330",
            vec![
                fact("2026-01-16", Channel::Facebook, "zeta", "kino", 100.0, 40.0),
                fact("2026-01-16", Channel::Facebook, "alpha", "kino", 100.0, 40.0),
            ],
        );
        let top = warehouse
            .top_n_by(
                TopDimension::Campaign,
                TopMeasure::Spend,
                DateWindow::single(date("2026-01-16")),
                10,
            )
            .expect("top");
        assert_eq!(top[0].name, "alpha");
        assert_eq!(top[1].name, "zeta");
    }

    #[test]
    fn drama_key_requires_six_leading_digits() {
        assert_eq!(drama_key("15000201-US-video"), Some("15000201".to_string()));
        assert_eq!(drama_key("123-US"), None);
        assert_eq!(drama_key("US-15000201"), None);
    }

    #[test]
    fn queries_on_empty_store_return_zeroes() {
        let warehouse = Warehouse::in_memory().expect("open");
        let summary = warehouse.daily_summary(date("2026-01-16")).expect("summary");
        assert_eq!(summary.spend, 0.0);
        assert!(warehouse
            .daily_trend(DateWindow::single(date("2026-01-16")))
            .expect("trend")
            .is_empty());
        assert!(warehouse
            .channel_summary(date("2026-01-16"))
            .expect("channels")
            .is_empty());
    }
}
