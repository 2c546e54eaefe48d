use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    retry_with_backoff, validate_observations, Extraction, PageGuard, PageVerdict,
    ProviderAdapter, SpendObservation, HTTP_READ_TIMEOUT,
};
use crate::contracts::{PipelineError, PipelineResult};
use crate::data_models::{CampaignFact, Channel, DateWindow, FactBatch};

const DEFAULT_BASE_URL: &str = "https://xmp-open.mobvista.com";
const PAGE_SIZE: usize = 100;

/// Upstream asks for at least 6 seconds between open-API calls.
const MIN_CALL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(6);

const RETRY_DELAYS: [std::time::Duration; 2] = [
    std::time::Duration::from_secs(2),
    std::time::Duration::from_secs(5),
];

/// `sign = md5(client_secret || unix_seconds)` lowercase hex.
pub fn sign_for(client_secret: &str, timestamp: i64) -> String {
    format!("{:x}", md5::compute(format!("{client_secret}{timestamp}")))
}

/// Available metric descriptor returned by the `fields` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub field: String,
    pub title: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// # NDOC
/// component: `adapters::xmp_open`
/// purpose: HMAC-signed REST adapter for the ad-management open API; feeds
///          `xmp_campaigns`.
/// invariants:
///   - Every request carries a freshly computed `sign` (re-signed per retry).
///   - Calls are spaced at least 6 seconds apart.
pub struct XmpOpenAdapter {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    max_rows: usize,
    min_interval: std::time::Duration,
    last_call: Mutex<Option<Instant>>,
}

impl XmpOpenAdapter {
    pub fn new(client_id: String, client_secret: String, max_rows: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client_id,
            client_secret,
            max_rows,
            min_interval: MIN_CALL_INTERVAL,
            last_call: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        self.base_url = base;
        self.min_interval = std::time::Duration::ZERO;
        self
    }

    /// Lists the metric fields the report endpoint can serve.
    pub async fn list_fields(&self) -> PipelineResult<Vec<FieldDef>> {
        let data = self
            .call("/v1/media/report/fields", json!({"report_type": "ad"}))
            .await?;
        let fields = data
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| PipelineError::invalid("fields response missing 'fields' array"))?;
        fields
            .iter()
            .map(|raw| {
                serde_json::from_value(raw.clone())
                    .map_err(|err| PipelineError::invalid(format!("bad field entry: {err}")))
            })
            .collect()
    }

    /// Lists authorized ad accounts for the given channel.
    pub async fn list_accounts(&self, channel: Channel) -> PipelineResult<Vec<Value>> {
        let data = self
            .call(
                "/v2/media/account/list",
                json!({
                    "channel": [channel.as_str()],
                    "page": 1,
                    "page_size": PAGE_SIZE,
                }),
            )
            .await?;
        Ok(Self::rows_of(&data).to_vec())
    }

    /// Declared row accessor: the open API nests rows at `data.list`.
    fn rows_of(data: &Value) -> &[Value] {
        data.get("list")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    async fn call(&self, path: &str, payload: Value) -> PipelineResult<Value> {
        self.respect_rate_limit().await;
        let url = format!("{}{}", self.base_url, path);

        retry_with_backoff(&RETRY_DELAYS, |_attempt| {
            // Fresh timestamp and sign per attempt.
            let timestamp = Utc::now().timestamp();
            let body = payload.as_object().cloned().map(|mut map| {
                map.insert("client_id".to_string(), Value::from(self.client_id.clone()));
                map.insert("timestamp".to_string(), Value::from(timestamp));
                map.insert(
                    "sign".to_string(),
                    Value::from(sign_for(&self.client_secret, timestamp)),
                );
                Value::Object(map)
            });
            let url = url.clone();
            async move {
                let body = body
                    .ok_or_else(|| PipelineError::internal("open API payload must be an object"))?;
                let response = self
                    .client
                    .post(&url)
                    .timeout(HTTP_READ_TIMEOUT)
                    .json(&body)
                    .send()
                    .await?;

                let status = response.status();
                if status.as_u16() == 429 {
                    return Err(PipelineError::rate_limited(format!("{url} returned 429")));
                }
                if status.is_server_error() {
                    return Err(PipelineError::transient(format!("{url} returned {status}")));
                }
                if !status.is_success() {
                    return Err(PipelineError::invalid(format!("{url} returned {status}")));
                }

                let envelope: OpenApiEnvelope = response.json().await.map_err(|err| {
                    PipelineError::invalid(format!("open API returned non-JSON body: {err}"))
                })?;
                match envelope.code {
                    0 => envelope.data.ok_or_else(|| {
                        PipelineError::invalid("open API success without a data object")
                    }),
                    401 | 403 => Err(PipelineError::auth_expired(
                        envelope.msg.unwrap_or_else(|| "signature rejected".to_string()),
                    )),
                    _ => Err(PipelineError::invalid(format!(
                        "open API error code {}: {}",
                        envelope.code,
                        envelope.msg.unwrap_or_default()
                    ))),
                }
            }
        })
        .await
    }

    async fn respect_rate_limit(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn parse_row(&self, raw: &Value, window: DateWindow) -> Option<CampaignFact> {
        let obj = raw.as_object()?;
        let stat_date = obj
            .get("date")
            .and_then(Value::as_str)
            .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .unwrap_or(window.start);
        let known = [
            "date",
            "channel",
            "campaign_id",
            "campaign_name",
            "country",
            "cost",
            "revenue",
            "impression",
            "click",
        ];
        let extra = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(CampaignFact {
            stat_date,
            channel: Channel::parse(obj.get("channel").and_then(Value::as_str).unwrap_or("")),
            campaign_id: str_field(obj, "campaign_id"),
            campaign_name: str_field(obj, "campaign_name"),
            country: str_field(obj, "country"),
            spend: num_field(obj, "cost"),
            revenue: num_field(obj, "revenue"),
            impressions: num_field(obj, "impression") as i64,
            clicks: num_field(obj, "click") as i64,
            extra,
        })
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn num_field(obj: &serde_json::Map<String, Value>, key: &str) -> f64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[async_trait]
impl ProviderAdapter for XmpOpenAdapter {
    fn name(&self) -> &'static str {
        "xmp_open"
    }

    async fn extract(&self, window: DateWindow) -> PipelineResult<Extraction> {
        let mut rows = Vec::new();
        let mut pages = Vec::new();
        let mut warnings = Vec::new();
        let mut guard = PageGuard::new("xmp_open", self.max_rows);
        let mut page = 1usize;

        loop {
            let data = self
                .call(
                    "/v2/media/account/report",
                    json!({
                        "start_date": window.start.to_string(),
                        "end_date": window.end.to_string(),
                        "dimension": ["date", "campaign", "country"],
                        "metrics": ["impression", "click", "cost", "revenue"],
                        "currency": "USD",
                        "page": page,
                        "page_size": PAGE_SIZE,
                    }),
                )
                .await?;

            let page_rows = Self::rows_of(&data);
            for raw in page_rows {
                if let Some(fact) = self.parse_row(raw, window) {
                    rows.push(fact);
                }
            }
            pages.push(json!({
                "page": page,
                "count": page_rows.len(),
                "list": page_rows,
            }));

            match guard.record_page(page_rows.len(), PAGE_SIZE) {
                PageVerdict::Continue => page += 1,
                PageVerdict::Stop(reason) => {
                    if let Some(warning) = reason {
                        log::warn!("{}", warning);
                        warnings.push(warning);
                    }
                    break;
                }
            }
        }

        let observations: Vec<SpendObservation> = rows
            .iter()
            .map(|row| SpendObservation {
                label: format!("xmp_open campaign {}", row.campaign_id),
                spend: row.spend,
                revenue: row.revenue,
                impressions: row.impressions,
            })
            .collect();
        warnings.extend(validate_observations(&observations));

        let raw_payload = json!({
            "code": 0,
            "data": {
                "total": rows.len(),
                "pages": pages,
            },
            "message": "success",
        });

        Ok(Extraction {
            source: "xmp_open",
            batches: vec![FactBatch::XmpCampaigns(rows)],
            raw_payload,
            warnings,
        })
    }
}
