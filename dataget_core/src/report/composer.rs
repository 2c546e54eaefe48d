use chrono::Utc;
use chrono_tz::Asia::Shanghai;

use super::model::{
    fmt_currency0, fmt_currency2, fmt_pct1, fmt_signed_pct1, DocumentModel, Section, TableModel,
};
use crate::config::AppConfig;
use crate::contracts::PipelineResult;
use crate::data_models::{Audience, ReportKind, ReportSpec};
use crate::warehouse::queries::{
    PersonPerf, RankSubject, TopDimension, TopMeasure, TrendPoint,
};
use crate::warehouse::Warehouse;

/// Minimum-spend gates for rank labels.
const DAILY_MIN_SPEND: f64 = 100.0;
const WEEKLY_MIN_SPEND: f64 = 1_000.0;

const TOP_CAMPAIGN_COUNT: usize = 5;
const TOP_COUNTRY_COUNT: usize = 5;

/// # NDOC
/// component: `report::composer`
/// purpose: Turns a report spec into a sink-neutral document model. Owns the
///          business rules: bucket thresholds, team membership, and the
///          `Spend Top1` / `ROAS Top1` labels.
pub struct ReportComposer<'a> {
    warehouse: &'a Warehouse,
    config: &'a AppConfig,
}

impl<'a> ReportComposer<'a> {
    pub fn new(warehouse: &'a Warehouse, config: &'a AppConfig) -> Self {
        Self { warehouse, config }
    }

    pub fn compose(&self, spec: &ReportSpec) -> PipelineResult<DocumentModel> {
        match spec.kind {
            ReportKind::Daily => self.compose_daily(spec),
            ReportKind::Weekly => self.compose_weekly(spec),
            ReportKind::Intraday => self.compose_intraday(spec),
        }
    }

    fn compose_daily(&self, spec: &ReportSpec) -> PipelineResult<DocumentModel> {
        let date = spec.window.start;
        let summary = self.warehouse.daily_summary(date)?;

        let mut sections = vec![Some(
            Section::new("Overview")
                .paragraph(format!("Total spend: {}", fmt_currency0(summary.spend)))
                .paragraph(format!("Total revenue: {}", fmt_currency0(summary.revenue)))
                .paragraph(format!("ROAS: {}", fmt_pct1(summary.roas)))
                .paragraph(format!("CPM: {}", fmt_currency2(summary.cpm))),
        )];

        if spec.audience == Audience::Team {
            let optimizers =
                self.warehouse
                    .rank_labels(RankSubject::Optimizers, spec.window, DAILY_MIN_SPEND)?;
            if !optimizers.is_empty() {
                sections.push(Some(
                    Section::new("Optimizer Daily").table(person_table("Optimizer", &optimizers)),
                ));
            }
            let editors =
                self.warehouse
                    .rank_labels(RankSubject::Editors, spec.window, DAILY_MIN_SPEND)?;
            if !editors.is_empty() {
                sections.push(Some(
                    Section::new("Editor Daily").table(person_table("Editor", &editors)),
                ));
            }
        }

        sections.push(self.team_section(spec)?);

        Ok(DocumentModel {
            title: format!("Daily Report {date}"),
            sections: sections.into_iter().flatten().collect(),
        })
    }

    fn compose_weekly(&self, spec: &ReportSpec) -> PipelineResult<DocumentModel> {
        let wow = self.warehouse.week_summary(spec.window)?;
        let current = wow.current;

        let mut summary = Section::new("Weekly Summary")
            .paragraph(format!(
                "Week total spend: {}{}",
                fmt_currency0(current.spend),
                wow.spend_change
                    .map(|c| format!(" ({})", fmt_signed_pct1(c)))
                    .unwrap_or_default()
            ))
            .paragraph(format!(
                "Week total revenue: {}{}",
                fmt_currency0(current.revenue),
                wow.revenue_change
                    .map(|c| format!(" ({})", fmt_signed_pct1(c)))
                    .unwrap_or_default()
            ))
            .paragraph(format!(
                "Week avg ROAS: {}{}",
                fmt_pct1(current.roas),
                wow.roas_change
                    .map(|c| format!(" ({} pp)", fmt_signed_pct1(c)))
                    .unwrap_or_default()
            ))
            .paragraph(format!(
                "Daily avg spend: {}",
                fmt_currency0(current.daily_avg_spend)
            ));
        if current.avg_cpm > 0.0 {
            summary = summary.paragraph(format!(
                "Avg CPM: {}{}",
                fmt_currency2(current.avg_cpm),
                wow.cpm_change
                    .map(|c| format!(" ({})", fmt_signed_pct1(c)))
                    .unwrap_or_default()
            ));
        }
        let mut sections = vec![Some(summary)];

        sections.push(self.team_section(spec)?);

        let trend = self.warehouse.daily_trend(spec.window)?;
        if !trend.is_empty() {
            sections.push(Some(Section::new("Daily Trend").table(trend_table(&trend))));
        }

        if spec.audience == Audience::Team {
            let optimizers = self.warehouse.rank_labels(
                RankSubject::Optimizers,
                spec.window,
                WEEKLY_MIN_SPEND,
            )?;
            if !optimizers.is_empty() {
                sections.push(Some(
                    Section::new("Optimizer Weekly").table(ranked_person_table(&optimizers)),
                ));
            }
            let editors =
                self.warehouse
                    .rank_labels(RankSubject::Editors, spec.window, WEEKLY_MIN_SPEND)?;
            if !editors.is_empty() {
                let mut section = Section::new("Editor Output");
                for (i, editor) in editors.iter().take(10).enumerate() {
                    section = section.paragraph(format!(
                        "{}. {}: spend {} | ROAS {}{}",
                        i + 1,
                        editor.name,
                        fmt_currency0(editor.spend),
                        fmt_pct1(editor.roas),
                        if editor.label.is_empty() {
                            String::new()
                        } else {
                            format!(" | {}", editor.label)
                        }
                    ));
                }
                sections.push(Some(section));
            }
        }

        sections.push(Some(self.drama_section(spec)?));
        sections.push(Some(self.market_section(spec)?));
        sections.push(Some(self.plan_section(spec)?));

        Ok(DocumentModel {
            title: format!("Weekly Report {} ~ {}", spec.window.start, spec.window.end),
            sections: sections.into_iter().flatten().collect(),
        })
    }

    fn compose_intraday(&self, spec: &ReportSpec) -> PipelineResult<DocumentModel> {
        let date = spec.window.start;
        let channels = self.warehouse.channel_summary(date)?;
        let total_spend: f64 = channels.iter().map(|c| c.spend).sum();
        let total_revenue: f64 = channels.iter().map(|c| c.revenue).sum();
        let roas = if total_spend > 0.0 {
            total_revenue / total_spend
        } else {
            0.0
        };

        let now_local = Utc::now().with_timezone(&Shanghai);
        let mut sections = vec![Section::new("Overview")
            .paragraph(format!("Total spend: {}", fmt_currency2(total_spend)))
            .paragraph(format!("Total revenue: {}", fmt_currency2(total_revenue)))
            .paragraph(format!("Overall ROAS: {}", fmt_pct1(roas)))];

        if !channels.is_empty() {
            let mut breakdown = Section::new("Channel Breakdown");
            for channel in &channels {
                breakdown = breakdown.paragraph(format!(
                    "{}: {} | revenue {} | ROAS {} | {} campaigns",
                    channel.channel.to_uppercase(),
                    fmt_currency0(channel.spend),
                    fmt_currency0(channel.revenue),
                    fmt_pct1(channel.roas),
                    channel.campaign_count
                ));
            }
            sections.push(breakdown);
        }

        let top = self
            .warehouse
            .intraday_top_campaigns(date, TOP_CAMPAIGN_COUNT)?;
        if !top.is_empty() {
            let mut table = TableModel::new(&["#", "Channel", "Campaign", "Country", "Spend", "ROAS"]);
            for (i, campaign) in top.iter().enumerate() {
                table.push_row(vec![
                    (i + 1).to_string(),
                    campaign.channel.clone(),
                    truncate_name(&campaign.campaign_name, 30),
                    campaign.country.clone(),
                    fmt_currency2(campaign.spend),
                    fmt_pct1(campaign.roas),
                ]);
            }
            sections.push(Section::new("Top Spend Campaigns").table(table));
        }

        Ok(DocumentModel {
            title: format!(
                "Intraday Broadcast {} {}",
                date,
                now_local.format("%H:%M")
            ),
            sections,
        })
    }

    /// Team roll-up section; only meaningful for the team audience.
    fn team_section(&self, spec: &ReportSpec) -> PipelineResult<Option<Section>> {
        if spec.audience != Audience::Team {
            return Ok(None);
        }
        let rows = self.warehouse.team_rollup(spec.window, self.config)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let total_spend: f64 = rows.iter().map(|r| r.spend).sum();
        let mut section = Section::new("Team Performance");
        for row in rows.iter().filter(|r| r.member_count > 0) {
            let share = if total_spend > 0.0 {
                row.spend / total_spend
            } else {
                0.0
            };
            section = section.paragraph(format!(
                "{} team: {} ({} of spend) | ROAS {} | {} campaigns, {} members",
                row.team,
                fmt_currency0(row.spend),
                fmt_pct1(share),
                fmt_pct1(row.roas),
                row.campaign_count,
                row.member_count
            ));
        }
        Ok(Some(section))
    }

    fn drama_section(&self, spec: &ReportSpec) -> PipelineResult<Section> {
        let buckets = self.warehouse.category_buckets(spec.window)?;
        let mut section = Section::new("Drama Performance");

        if !buckets.top_dramas.is_empty() {
            section = section.paragraph("Top dramas (spend > $10k, ROAS > 40%):".to_string());
            for (i, drama) in buckets.top_dramas.iter().take(5).enumerate() {
                section = section.paragraph(format!(
                    "{}. {}: {} | ROAS {}",
                    i + 1,
                    drama.name,
                    fmt_currency0(drama.spend),
                    fmt_pct1(drama.roas)
                ));
            }
        }
        if !buckets.potential_dramas.is_empty() {
            section =
                section.paragraph("Potential dramas ($1k-$10k, ROAS > 50%):".to_string());
            for (i, drama) in buckets.potential_dramas.iter().take(3).enumerate() {
                section = section.paragraph(format!(
                    "{}. {}: {} | ROAS {} (scale up)",
                    i + 1,
                    drama.name,
                    fmt_currency0(drama.spend),
                    fmt_pct1(drama.roas)
                ));
            }
        }
        if !buckets.declining_dramas.is_empty() {
            section = section.paragraph("Declining (ROAS WoW drop > 10pp):".to_string());
            for (i, drama) in buckets.declining_dramas.iter().take(3).enumerate() {
                section = section.paragraph(format!(
                    "{}. {}: ROAS {} ({} pp)",
                    i + 1,
                    drama.name,
                    fmt_pct1(drama.roas),
                    fmt_signed_pct1(drama.roas_change.unwrap_or(0.0))
                ));
            }
        }
        if !buckets.losing_dramas.is_empty() {
            section = section.paragraph("Losing tail (spend > $1k, ROAS < 25%):".to_string());
            for (i, drama) in buckets.losing_dramas.iter().take(5).enumerate() {
                section = section.paragraph(format!(
                    "{}. {}: {} | ROAS {} (cut losses)",
                    i + 1,
                    drama.name,
                    fmt_currency0(drama.spend),
                    fmt_pct1(drama.roas)
                ));
            }
        }
        if section.paragraphs.is_empty() {
            section = section.paragraph("No dramas crossed any bucket threshold.".to_string());
        }
        Ok(section)
    }

    fn market_section(&self, spec: &ReportSpec) -> PipelineResult<Section> {
        let countries = self.warehouse.top_n_by(
            TopDimension::Country,
            TopMeasure::Spend,
            spec.window,
            TOP_COUNTRY_COUNT,
        )?;
        let mut section = Section::new("Market Analysis");
        if countries.is_empty() {
            return Ok(section.paragraph("No market data in this window.".to_string()));
        }
        for country in &countries {
            section = section.paragraph(format!(
                "{}: {} | ROAS {}",
                country.name,
                fmt_currency0(country.spend),
                fmt_pct1(country.roas)
            ));
        }
        Ok(section)
    }

    /// Next-window actions derived from the buckets.
    fn plan_section(&self, spec: &ReportSpec) -> PipelineResult<Section> {
        let buckets = self.warehouse.category_buckets(spec.window)?;
        let mut section = Section::new("Summary & Next Week");
        let mut actions = Vec::new();
        if let Some(top) = buckets.potential_dramas.first() {
            actions.push(format!(
                "Scale up: push volume on {} (current ROAS {})",
                top.name,
                fmt_pct1(top.roas)
            ));
        }
        if let Some(top) = buckets.losing_dramas.first() {
            actions.push(format!(
                "Stop loss: pause campaigns for {} (ROAS {})",
                top.name,
                fmt_pct1(top.roas)
            ));
        }
        if actions.is_empty() {
            actions.push("Hold course; no bucket crossed an action threshold.".to_string());
        }
        for (i, action) in actions.iter().take(3).enumerate() {
            section = section.paragraph(format!("{}. {}", i + 1, action));
        }
        Ok(section)
    }
}

fn person_table(role: &str, people: &[PersonPerf]) -> TableModel {
    let mut table = TableModel::new(&[
        role,
        "Meta Spend",
        "Meta ROAS",
        "TT Spend",
        "TT ROAS",
        "Total Spend",
        "Total ROAS",
        "Label",
    ]);
    for person in people {
        table.push_row(vec![
            person.name.clone(),
            fmt_currency2(person.meta_spend),
            fmt_pct1(person.meta_roas),
            fmt_currency2(person.tt_spend),
            fmt_pct1(person.tt_roas),
            fmt_currency2(person.spend),
            fmt_pct1(person.roas),
            person.label.clone(),
        ]);
    }
    table
}

fn ranked_person_table(people: &[PersonPerf]) -> TableModel {
    let mut table = TableModel::new(&["Rank", "Optimizer", "Spend", "ROAS", "Label"]);
    for (i, person) in people.iter().enumerate() {
        table.push_row(vec![
            (i + 1).to_string(),
            person.name.clone(),
            fmt_currency2(person.spend),
            fmt_pct1(person.roas),
            person.label.clone(),
        ]);
    }
    table
}

fn trend_table(points: &[TrendPoint]) -> TableModel {
    let mut table = TableModel::new(&["Date", "Spend", "ROAS", "Trend"]);
    let mut prev_roas = 0.0;
    for point in points {
        let trend = if point.roas > prev_roas {
            "up"
        } else if point.roas < prev_roas {
            "down"
        } else {
            "flat"
        };
        prev_roas = point.roas;
        table.push_row(vec![
            point.date.format("%m/%d").to_string(),
            fmt_currency2(point.spend),
            fmt_pct1(point.roas),
            trend.to_string(),
        ]);
    }
    table
}

fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() > max {
        let prefix: String = name.chars().take(max.saturating_sub(3)).collect();
        format!("{prefix}...")
    } else {
        name.to_string()
    }
}
