use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Advertising platform family a fact row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Facebook,
    Tiktok,
    Other,
}

impl Channel {
    /// Upstream systems spell the Meta family several ways; fold them here.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "facebook" | "meta" | "fb" => Channel::Facebook,
            "tiktok" | "tt" => Channel::Tiktok,
            _ => Channel::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Facebook => "facebook",
            Channel::Tiktok => "tiktok",
            Channel::Other => "other",
        }
    }
}

/// # NDOC
/// component: `data_models::rows`
/// purpose: Ad-spend fact from the BI reporting API, one (date, campaign, channel) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSpendFact {
    pub stat_date: NaiveDate,
    pub channel: Channel,
    pub campaign_id: String,
    pub campaign_name: String,
    pub optimizer: String,
    pub country: String,
    pub spend: f64,
    pub new_user_revenue: f64,
    pub media_user_revenue: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub installs: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Per-editor creative roll-up from the web console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorRollup {
    pub stat_date: NaiveDate,
    pub editor_name: String,
    pub channel: Channel,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub material_count: i64,
    pub hot_count: i64,
    pub hot_rate: f64,
    pub top_material: String,
    pub top_material_spend: f64,
}

/// Per-optimizer roll-up from the internal ad-management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerRollup {
    pub stat_date: NaiveDate,
    pub optimizer_name: String,
    pub channel: Channel,
    pub spend: f64,
    pub revenue: f64,
    pub roas: f64,
    pub campaign_count: i64,
}

/// Campaign fact from the internal ad-management platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignFact {
    pub stat_date: NaiveDate,
    pub channel: Channel,
    pub campaign_id: String,
    pub campaign_name: String,
    pub country: String,
    pub spend: f64,
    pub revenue: f64,
    pub impressions: i64,
    pub clicks: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Creative material fact scraped from the console material list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialFact {
    pub stat_date: NaiveDate,
    pub material_id: String,
    pub designer_name: String,
    pub cost: f64,
    pub impression: i64,
    pub click: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Drama catalogue entry; `drama_id` is the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DramaMapping {
    pub drama_id: String,
    pub drama_name: String,
}

/// Intraday spend snapshot, one row per extraction hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlySnapshot {
    pub stat_date: NaiveDate,
    pub snapshot_time: String,
    pub hour: u32,
    pub total_spend: f64,
    pub d0_roas: f64,
}

/// One homogeneous set of rows destined for a single warehouse table.
///
/// An adapter may emit several of these per extraction (e.g. campaigns plus
/// the drama mappings discovered alongside them).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactBatch {
    QuickbiCampaigns(Vec<AdSpendFact>),
    HourlySnapshots(Vec<HourlySnapshot>),
    XmpCampaigns(Vec<CampaignFact>),
    XmpInternalCampaigns(Vec<CampaignFact>),
    XmpMaterials(Vec<MaterialFact>),
    XmpEditorStats(Vec<EditorRollup>),
    XmpOptimizerStats(Vec<OptimizerRollup>),
    DramaMappings(Vec<DramaMapping>),
}

impl FactBatch {
    pub fn table_name(&self) -> &'static str {
        match self {
            FactBatch::QuickbiCampaigns(_) => "quickbi_campaigns",
            FactBatch::HourlySnapshots(_) => "hourly_snapshots",
            FactBatch::XmpCampaigns(_) => "xmp_campaigns",
            FactBatch::XmpInternalCampaigns(_) => "xmp_internal_campaigns",
            FactBatch::XmpMaterials(_) => "xmp_materials",
            FactBatch::XmpEditorStats(_) => "xmp_editor_stats",
            FactBatch::XmpOptimizerStats(_) => "xmp_optimizer_stats",
            FactBatch::DramaMappings(_) => "drama_mapping",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FactBatch::QuickbiCampaigns(rows) => rows.len(),
            FactBatch::HourlySnapshots(rows) => rows.len(),
            FactBatch::XmpCampaigns(rows) => rows.len(),
            FactBatch::XmpInternalCampaigns(rows) => rows.len(),
            FactBatch::XmpMaterials(rows) => rows.len(),
            FactBatch::XmpEditorStats(rows) => rows.len(),
            FactBatch::XmpOptimizerStats(rows) => rows.len(),
            FactBatch::DramaMappings(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parse_folds_aliases() {
        assert_eq!(Channel::parse("Meta"), Channel::Facebook);
        assert_eq!(Channel::parse("FACEBOOK"), Channel::Facebook);
        assert_eq!(Channel::parse("tiktok"), Channel::Tiktok);
        assert_eq!(Channel::parse("unity"), Channel::Other);
    }

    #[test]
    fn ad_spend_fact_round_trips_with_extra_fields() {
        let mut extra = Map::new();
        extra.insert("cpi".to_string(), Value::from(1.32));
        let fact = AdSpendFact {
            stat_date: NaiveDate::from_ymd_opt(2026, 1, 16).unwrap(),
            channel: Channel::Facebook,
            campaign_id: "c-1".to_string(),
            campaign_name: "15000201-US-video".to_string(),
            optimizer: "kino".to_string(),
            country: "US".to_string(),
            spend: 120.5,
            new_user_revenue: 60.1,
            media_user_revenue: 12.0,
            impressions: 10_000,
            clicks: 240,
            installs: 35,
            extra,
        };
        let json = serde_json::to_string(&fact).expect("serialize");
        let back: AdSpendFact = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, fact);
        assert_eq!(back.extra["cpi"], Value::from(1.32));
    }

    #[test]
    fn fact_batch_reports_target_table() {
        let batch = FactBatch::DramaMappings(vec![DramaMapping {
            drama_id: "15000201".to_string(),
            drama_name: "X".to_string(),
        }]);
        assert_eq!(batch.table_name(), "drama_mapping");
        assert_eq!(batch.len(), 1);
    }
}
