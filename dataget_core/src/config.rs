use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::contracts::{PipelineError, PipelineResult};

/// Default team rosters; overridable via `DATAGET_CN_TEAM` / `DATAGET_KR_TEAM`.
const DEFAULT_CN_TEAM: &[&str] = &["hannibal", "kino", "zane", "silas", "kimi", "echo", "felix"];
const DEFAULT_KR_TEAM: &[&str] = &["lyla", "juria", "jade"];

/// # NDOC
/// component: `config`
/// purpose: One typed configuration value for the whole component graph.
/// invariants:
///   - Loaded once at startup; missing or malformed keys fail with `ConfigError`.
///   - No process-wide singletons; the value is passed down explicitly.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Warehouse
    pub bq_project_id: String,
    pub quickbi_dataset_id: String,
    pub xmp_dataset_id: String,
    pub warehouse_path: PathBuf,

    // Blob archive
    pub gcs_bucket_name: String,
    pub archive_root: PathBuf,

    // Quick BI (signed-BI provider)
    pub aliyun_access_key_id: String,
    pub aliyun_access_key_secret: String,
    pub quickbi_api_id: String,
    pub quickbi_overview_api_id: String,

    // XMP open API (HMAC provider)
    pub xmp_client_id: String,
    pub xmp_client_secret: String,

    // XMP console (interactive-login fallback)
    pub xmp_username: String,
    pub xmp_password: String,

    // Lark publisher + alarm
    pub lark_app_id: String,
    pub lark_app_secret: String,
    pub lark_webhook_url: String,
    pub lark_alert_webhook: String,

    // Ingest mode
    pub fetch_yesterday: bool,

    // Credential files live here ({provider}_token.json / {provider}_cookies.json)
    pub credential_dir: PathBuf,

    // Safety bounds and platform limits
    pub max_rows_per_source: usize,
    pub doc_table_row_cap: usize,
    pub card_table_row_cap: usize,

    // Optimizer -> team membership, rebuilt at config load
    teams: HashMap<String, Team>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Team {
    Cn,
    Kr,
    Other,
}

impl Team {
    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Cn => "CN",
            Team::Kr => "KR",
            Team::Other => "Other",
        }
    }
}

impl AppConfig {
    /// Loads configuration from the process environment (after `.env`).
    pub fn from_env() -> PipelineResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup; the seam tests use.
    pub fn from_lookup<F>(get: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut required = |key: &str| -> String {
            match get(key) {
                Some(v) if !v.trim().is_empty() => v,
                _ => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        };

        let bq_project_id = required("BQ_PROJECT_ID");
        let aliyun_access_key_id = required("ALIYUN_ACCESS_KEY_ID");
        let aliyun_access_key_secret = required("ALIYUN_ACCESS_KEY_SECRET");
        let quickbi_api_id = required("QUICKBI_API_ID");
        let xmp_client_id = required("XMP_CLIENT_ID");
        let xmp_client_secret = required("XMP_CLIENT_SECRET");
        let lark_app_id = required("LARK_APP_ID");
        let lark_app_secret = required("LARK_APP_SECRET");
        let lark_webhook_url = required("LARK_WEBHOOK_URL");
        let gcs_bucket_name = required("GCS_BUCKET_NAME");

        if !missing.is_empty() {
            return Err(PipelineError::config(format!(
                "missing required configuration keys: {}",
                missing.join(", ")
            )));
        }
        if url::Url::parse(&lark_webhook_url).is_err() {
            return Err(PipelineError::config(format!(
                "LARK_WEBHOOK_URL is not a valid URL: '{lark_webhook_url}'"
            )));
        }
        if let Some(alert) = get("LARK_ALERT_WEBHOOK") {
            if url::Url::parse(&alert).is_err() {
                return Err(PipelineError::config(format!(
                    "LARK_ALERT_WEBHOOK is not a valid URL: '{alert}'"
                )));
            }
        }

        let fetch_yesterday = get("FETCH_YESTERDAY")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let max_rows_per_source = parse_usize(&get, "DATAGET_MAX_ROWS", 200_000)?;
        let doc_table_row_cap = parse_usize(&get, "DATAGET_DOC_TABLE_ROW_CAP", 5)?;
        let card_table_row_cap = parse_usize(&get, "DATAGET_CARD_TABLE_ROW_CAP", 10)?;
        if doc_table_row_cap == 0 || card_table_row_cap == 0 {
            return Err(PipelineError::config("table row caps must be positive"));
        }

        let teams = build_team_map(
            get("DATAGET_CN_TEAM").as_deref(),
            get("DATAGET_KR_TEAM").as_deref(),
        );

        Ok(Self {
            bq_project_id,
            quickbi_dataset_id: get("QUICKBI_BQ_DATASET_ID")
                .unwrap_or_else(|| "quickbi_data".to_string()),
            xmp_dataset_id: get("XMP_DATASET_ID").unwrap_or_else(|| "xmp_data".to_string()),
            warehouse_path: get("DATAGET_WAREHOUSE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/warehouse.db")),
            archive_root: get("DATAGET_ARCHIVE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/archive").join(&gcs_bucket_name)),
            gcs_bucket_name,
            aliyun_access_key_id,
            aliyun_access_key_secret,
            quickbi_api_id,
            quickbi_overview_api_id: get("QUICKBI_OVERVIEW_API_ID").unwrap_or_default(),
            xmp_client_id,
            xmp_client_secret,
            xmp_username: get("XMP_USERNAME").unwrap_or_default(),
            xmp_password: get("XMP_PASSWORD").unwrap_or_default(),
            lark_app_id,
            lark_app_secret,
            lark_webhook_url,
            lark_alert_webhook: get("LARK_ALERT_WEBHOOK")
                .unwrap_or_else(|| get("LARK_WEBHOOK_URL").unwrap_or_default()),
            fetch_yesterday,
            credential_dir: get("DATAGET_CREDENTIAL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/credentials")),
            max_rows_per_source,
            doc_table_row_cap,
            card_table_row_cap,
            teams,
        })
    }

    /// Team the optimizer belongs to; names compare case-insensitively.
    pub fn team_for(&self, optimizer: &str) -> Team {
        self.teams
            .get(&optimizer.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(Team::Other)
    }

    pub fn quickbi_table(&self, table: &str) -> String {
        format!("{}_{}", self.quickbi_dataset_id, table)
    }

    pub fn xmp_table(&self, table: &str) -> String {
        format!("{}_{}", self.xmp_dataset_id, table)
    }
}

fn parse_usize<F>(get: &F, key: &str, default: usize) -> PipelineResult<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| PipelineError::config(format!("{key} must be an integer, got '{raw}'"))),
    }
}

fn build_team_map(cn_override: Option<&str>, kr_override: Option<&str>) -> HashMap<String, Team> {
    let mut teams = HashMap::new();
    let cn: Vec<String> = match cn_override {
        Some(raw) => split_names(raw),
        None => DEFAULT_CN_TEAM.iter().map(|s| s.to_string()).collect(),
    };
    let kr: Vec<String> = match kr_override {
        Some(raw) => split_names(raw),
        None => DEFAULT_KR_TEAM.iter().map(|s| s.to_string()).collect(),
    };
    for name in cn {
        teams.insert(name, Team::Cn);
    }
    for name in kr {
        teams.insert(name, Team::Kr);
    }
    teams
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
