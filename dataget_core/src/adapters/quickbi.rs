use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Asia::Shanghai;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    retry_with_backoff, validate_observations, Extraction, ProviderAdapter, SpendObservation,
    HTTP_READ_TIMEOUT,
};
use crate::contracts::{PipelineError, PipelineResult};
use crate::data_models::{AdSpendFact, Channel, DateWindow, FactBatch, HourlySnapshot};

const DEFAULT_BASE_URL: &str = "https://quickbi-public.cn-hangzhou.aliyuncs.com";

/// Vendor-documented backoff for transient query-service failures.
const QUERY_RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_secs(10),
    std::time::Duration::from_secs(30),
    std::time::Duration::from_secs(60),
];

#[derive(Debug, Deserialize)]
struct QueryServiceResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<QueryServiceResult>,
}

#[derive(Debug, Deserialize)]
struct QueryServiceResult {
    #[serde(default)]
    values: Vec<Value>,
}

/// # NDOC
/// component: `adapters::quickbi`
/// purpose: Signed-BI query adapter; feeds `quickbi_campaigns` and the
///          intraday `hourly_snapshots` row.
/// invariants:
///   - Transient vendor failures (`503`, `ServiceUnavailable`, timeout,
///     `SQL.ExecuteFailed`) retry with 10s/30s/60s backoff.
///   - Conditions always carry `stat_date` as `YYYYMMDD`.
pub struct QuickbiAdapter {
    client: reqwest::Client,
    base_url: String,
    access_key_id: String,
    access_key_secret: String,
    api_id: String,
    overview_api_id: String,
    retry_delays: Vec<std::time::Duration>,
}

impl QuickbiAdapter {
    pub fn new(
        access_key_id: String,
        access_key_secret: String,
        api_id: String,
        overview_api_id: String,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            access_key_id,
            access_key_secret,
            api_id,
            overview_api_id,
            retry_delays: QUERY_RETRY_DELAYS.to_vec(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        self.base_url = base;
        self.retry_delays = vec![std::time::Duration::from_millis(1); 3];
        self
    }

    /// Runs one data-service query and returns its value rows.
    pub async fn query_data_service(
        &self,
        api_id: &str,
        conditions: &Value,
    ) -> PipelineResult<Vec<Value>> {
        let url = format!("{}/dataservice/query", self.base_url);
        let conditions_json = serde_json::to_string(conditions)?;

        retry_with_backoff(&self.retry_delays, |_attempt| {
            let url = url.clone();
            let conditions_json = conditions_json.clone();
            async move {
                let timestamp = Utc::now().timestamp();
                let body = json!({
                    "api_id": api_id,
                    "conditions": conditions_json,
                    "access_key_id": self.access_key_id,
                    "timestamp": timestamp,
                    "sign": super::xmp_open::sign_for(&self.access_key_secret, timestamp),
                });
                let response = self
                    .client
                    .post(&url)
                    .timeout(HTTP_READ_TIMEOUT)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|err| {
                        if err.is_timeout() {
                            PipelineError::transient(format!("query service timeout: {err}"))
                        } else {
                            PipelineError::transient(format!("query service unreachable: {err}"))
                        }
                    })?;

                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if status.as_u16() == 503 {
                    return Err(PipelineError::rate_limited(format!(
                        "query service unavailable ({status}): {}",
                        truncate(&text, 200)
                    )));
                }
                if !status.is_success() {
                    if is_retryable_vendor_error(&text) {
                        return Err(PipelineError::rate_limited(format!(
                            "query service unavailable ({status}): {}",
                            truncate(&text, 200)
                        )));
                    }
                    return Err(PipelineError::invalid(format!(
                        "query service returned {status}: {}",
                        truncate(&text, 200)
                    )));
                }

                let parsed: QueryServiceResponse = serde_json::from_str(&text).map_err(|err| {
                    PipelineError::invalid(format!("query service body not JSON: {err}"))
                })?;
                if !parsed.success {
                    let message = parsed.message.unwrap_or_default();
                    if is_retryable_vendor_error(&message) {
                        return Err(PipelineError::rate_limited(message));
                    }
                    return Err(PipelineError::invalid(format!(
                        "query service rejected request: {message}"
                    )));
                }
                Ok(parsed.result.map(|r| r.values).unwrap_or_default())
            }
        })
        .await
    }

    /// Overview query: the platform-wide `total_revenue` for the date.
    pub async fn fetch_overview(&self, stat_date: &str) -> PipelineResult<f64> {
        if self.overview_api_id.is_empty() {
            return Ok(0.0);
        }
        let overview_api_id = self.overview_api_id.clone();
        let values = self
            .query_data_service(&overview_api_id, &json!({"stat_date": stat_date}))
            .await?;
        Ok(values
            .first()
            .and_then(|row| row.get("total_revenue"))
            .map(any_to_f64)
            .unwrap_or(0.0))
    }

    fn parse_row(&self, raw: &Value, window: DateWindow) -> Option<AdSpendFact> {
        let obj = raw.as_object()?;
        let stat_date = obj
            .get("stat_date")
            .and_then(Value::as_str)
            .and_then(parse_stat_date)
            .unwrap_or(window.start);
        let known = [
            "stat_date",
            "channel",
            "campaign_id",
            "campaign_name",
            "optimizer",
            "country",
            "spend",
            "new_user_revenue",
            "media_user_revenue",
            "impressions",
            "clicks",
            "installs",
        ];
        let extra: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(AdSpendFact {
            stat_date,
            channel: Channel::parse(obj.get("channel").and_then(Value::as_str).unwrap_or("")),
            campaign_id: string_of(obj.get("campaign_id")),
            campaign_name: string_of(obj.get("campaign_name")),
            optimizer: string_of(obj.get("optimizer")),
            country: string_of(obj.get("country")),
            spend: obj.get("spend").map(any_to_f64).unwrap_or(0.0),
            new_user_revenue: obj.get("new_user_revenue").map(any_to_f64).unwrap_or(0.0),
            media_user_revenue: obj.get("media_user_revenue").map(any_to_f64).unwrap_or(0.0),
            impressions: obj.get("impressions").map(any_to_f64).unwrap_or(0.0) as i64,
            clicks: obj.get("clicks").map(any_to_f64).unwrap_or(0.0) as i64,
            installs: obj.get("installs").map(any_to_f64).unwrap_or(0.0) as i64,
            extra,
        })
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn is_retryable_vendor_error(text: &str) -> bool {
    text.contains("503")
        || text.contains("ServiceUnavailable")
        || text.to_lowercase().contains("timeout")
        || text.contains("SQL.ExecuteFailed")
}

fn parse_stat_date(raw: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn string_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn any_to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[async_trait]
impl ProviderAdapter for QuickbiAdapter {
    fn name(&self) -> &'static str {
        "quickbi"
    }

    async fn extract(&self, window: DateWindow) -> PipelineResult<Extraction> {
        let stat_date = window.start.format("%Y%m%d").to_string();
        let api_id = self.api_id.clone();
        let values = self
            .query_data_service(&api_id, &json!({"stat_date": stat_date}))
            .await?;

        let rows: Vec<AdSpendFact> = values
            .iter()
            .filter_map(|raw| self.parse_row(raw, window))
            .collect();
        if rows.len() != values.len() {
            return Err(PipelineError::invalid(format!(
                "quickbi returned {} values but only {} parsed as rows",
                values.len(),
                rows.len()
            )));
        }

        let total_revenue = self.fetch_overview(&stat_date).await.unwrap_or_else(|err| {
            log::warn!("overview query failed, snapshot revenue falls back to 0: {err}");
            0.0
        });
        let total_spend: f64 = rows.iter().map(|r| r.spend).sum();

        let now_local = Utc::now().with_timezone(&Shanghai);
        let snapshot = HourlySnapshot {
            stat_date: window.start,
            snapshot_time: now_local.format("%Y-%m-%d %H:%M:%S").to_string(),
            hour: chrono::Timelike::hour(&now_local),
            total_spend,
            d0_roas: if total_spend > 0.0 {
                total_revenue / total_spend
            } else {
                0.0
            },
        };

        let mut observations: Vec<SpendObservation> = rows
            .iter()
            .map(|row| SpendObservation {
                label: format!("quickbi campaign {}", row.campaign_id),
                spend: row.spend,
                revenue: row.new_user_revenue,
                impressions: row.impressions,
            })
            .collect();
        observations.push(SpendObservation {
            label: "quickbi daily total".to_string(),
            spend: total_spend,
            revenue: total_revenue,
            impressions: rows.iter().map(|r| r.impressions).sum(),
        });
        let warnings = validate_observations(&observations);

        let raw_payload = json!({
            "code": 200,
            "data": {
                "total": values.len(),
                "list": values,
            },
            "overview": {"total_revenue": total_revenue},
            "fetched_at": Utc::now().to_rfc3339(),
        });

        Ok(Extraction {
            source: "quickbi",
            batches: vec![
                FactBatch::QuickbiCampaigns(rows),
                FactBatch::HourlySnapshots(vec![snapshot]),
            ],
            raw_payload,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    fn adapter_for(server: &Server) -> QuickbiAdapter {
        QuickbiAdapter::new(
            "ak".to_string(),
            "sk".to_string(),
            "ddee1f146b3a".to_string(),
            "7a15b44f69fd".to_string(),
        )
        .with_base_url(server.url_str(""))
    }

    fn window() -> DateWindow {
        DateWindow::single(NaiveDate::from_ymd_opt(2026, 1, 16).unwrap())
    }

    fn campaign_value(id: &str, spend: f64, revenue: f64) -> Value {
        json!({
            "stat_date": "20260116",
            "channel": "meta",
            "campaign_id": id,
            "campaign_name": format!("15000201-{id}"),
            "optimizer": "kino",
            "country": "US",
            "spend": spend,
            "new_user_revenue": revenue,
            "media_user_revenue": 1.0,
            "impressions": 5000,
            "clicks": 120,
            "installs": 30,
        })
    }

    #[tokio::test]
    async fn extract_parses_rows_and_builds_snapshot() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/dataservice/query"),
                request::body(json_decoded(|body: &Value| {
                    body["api_id"] == json!("ddee1f146b3a")
                        && body["conditions"]
                            .as_str()
                            .map(|c| c.contains("20260116"))
                            .unwrap_or(false)
                })),
            ])
            .respond_with(json_encoded(json!({
                "success": true,
                "result": {"values": [
                    campaign_value("c-1", 100.0, 40.0),
                    campaign_value("c-2", 50.0, 10.0),
                ]},
            }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/dataservice/query"),
                request::body(json_decoded(|body: &Value| {
                    body["api_id"] == json!("7a15b44f69fd")
                })),
            ])
            .respond_with(json_encoded(json!({
                "success": true,
                "result": {"values": [{"total_revenue": "75.5"}]},
            }))),
        );

        let extraction = adapter_for(&server).extract(window()).await.expect("extract");
        assert_eq!(extraction.batches.len(), 2);
        match &extraction.batches[0] {
            FactBatch::QuickbiCampaigns(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].channel, Channel::Facebook);
                assert_eq!(rows[0].optimizer, "kino");
            }
            other => panic!("unexpected batch {other:?}"),
        }
        match &extraction.batches[1] {
            FactBatch::HourlySnapshots(snaps) => {
                assert_eq!(snaps.len(), 1);
                assert!((snaps[0].total_spend - 150.0).abs() < 1e-9);
                assert!((snaps[0].d0_roas - 75.5 / 150.0).abs() < 1e-9);
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[tokio::test]
    async fn vendor_unavailable_is_retried_three_times() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/dataservice/query"))
                .times(3)
                .respond_with(cycle![
                    status_code(503),
                    json_encoded(json!({"success": false, "message": "ServiceUnavailable"})),
                    json_encoded(json!({
                        "success": true,
                        "result": {"values": []},
                    })),
                ]),
        );

        let adapter = QuickbiAdapter::new(
            "ak".to_string(),
            "sk".to_string(),
            "api".to_string(),
            String::new(),
        )
        .with_base_url(server.url_str(""));
        let rows = adapter
            .query_data_service("api", &json!({"stat_date": "20260116"}))
            .await
            .expect("third attempt succeeds");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn sql_execute_failures_exhaust_retries_then_fail() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/dataservice/query"))
                .times(4)
                .respond_with(json_encoded(json!({
                    "success": false,
                    "message": "Datasource.Sql.ExecuteFailed",
                }))),
        );

        let adapter = QuickbiAdapter::new(
            "ak".to_string(),
            "sk".to_string(),
            "api".to_string(),
            String::new(),
        )
        .with_base_url(server.url_str(""));
        let err = adapter
            .query_data_service("api", &json!({"stat_date": "20260116"}))
            .await
            .expect_err("exhausted");
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn unparsable_rows_fail_the_source() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/dataservice/query"),
                request::body(json_decoded(|body: &Value| body["api_id"] == json!("ddee1f146b3a"))),
            ])
            .respond_with(json_encoded(json!({
                "success": true,
                "result": {"values": ["not-an-object"]},
            }))),
        );

        let err = adapter_for(&server)
            .extract(window())
            .await
            .expect_err("invalid rows");
        assert_eq!(err.kind, crate::contracts::ErrorKind::Invalid);
    }

    #[test]
    fn retryable_vendor_error_detection() {
        assert!(is_retryable_vendor_error("HTTP 503 from gateway"));
        assert!(is_retryable_vendor_error("ServiceUnavailable"));
        assert!(is_retryable_vendor_error("read Timeout after 180s"));
        assert!(is_retryable_vendor_error("Datasource.Sql.ExecuteFailed"));
        assert!(!is_retryable_vendor_error("Ram.AuthCheck.Error"));
    }
}
