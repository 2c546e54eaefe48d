use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    retry_with_backoff, validate_observations, Extraction, PageGuard, PageVerdict,
    ProviderAdapter, SpendObservation, HTTP_READ_TIMEOUT,
};
use crate::contracts::{PipelineError, PipelineResult};
use crate::credentials::CredentialStore;
use crate::data_models::{
    CampaignFact, Channel, DateWindow, FactBatch, OptimizerRollup,
};

const DEFAULT_BASE_URL: &str = "https://xmp-api.mobvista.com";
const PAGE_SIZE: usize = 100;
const PROVIDER: &str = "xmp";

const RETRY_DELAYS: [std::time::Duration; 2] = [
    std::time::Duration::from_secs(5),
    std::time::Duration::from_secs(15),
];

const CAMPAIGN_FIELDS: &str =
    "campaign_id,campaign_name,country,cost,total_complete_payment_rate,impression,click";
const OPTIMIZER_FIELDS: &str =
    "optimizer_name,cost,total_complete_payment_rate,campaign_count";

/// Query granularity of the internal reporting endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelScope {
    Designer,
    Optimizer,
    Account,
    Campaign,
    Ad,
}

impl LevelScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelScope::Designer => "designer",
            LevelScope::Optimizer => "optimizer",
            LevelScope::Account => "account",
            LevelScope::Campaign => "campaign",
            LevelScope::Ad => "ad",
        }
    }
}

/// # NDOC
/// component: `adapters::xmp_internal`
/// purpose: Bearer-REST adapter over the internal ad-management API; feeds
///          `xmp_internal_campaigns` and `xmp_optimizer_stats`.
/// invariants:
///   - One `AuthExpired` forces a credential refresh plus one more attempt;
///     a second `AuthExpired` is fatal for this batch.
///   - Pagination stops at a short page, the advertised total, three empty
///     pages, or the 500-page safety cap.
pub struct XmpInternalAdapter {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    max_rows: usize,
    page_delay: std::time::Duration,
}

impl XmpInternalAdapter {
    pub fn new(credentials: Arc<CredentialStore>, max_rows: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials,
            max_rows,
            page_delay: std::time::Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        self.base_url = base;
        self.page_delay = std::time::Duration::ZERO;
        self
    }

    /// Fetches every page of one level-scoped query.
    pub async fn fetch_level(
        &self,
        level: LevelScope,
        channel: Channel,
        window: DateWindow,
        field: &str,
        search: &[Value],
    ) -> PipelineResult<(Vec<Value>, Vec<String>)> {
        let mut rows = Vec::new();
        let mut warnings = Vec::new();
        let mut guard = PageGuard::new("xmp_internal", self.max_rows);
        let mut page = 1usize;
        let mut advertised_total: Option<usize> = None;

        loop {
            let payload = json!({
                "level": level.as_str(),
                "channel": channel.as_str(),
                "start_time": window.start.to_string(),
                "end_time": window.end.to_string(),
                "field": field,
                "page": page,
                "page_size": PAGE_SIZE,
                "search": search,
            });
            let data = self.call_authorized("/admanage/channel/list", &payload).await?;

            let page_rows = Self::rows_of(&data);
            if advertised_total.is_none() {
                advertised_total = data.get("total").and_then(Value::as_u64).map(|t| t as usize);
            }
            let fetched = page_rows.len();
            rows.extend(page_rows.iter().cloned());

            match guard.record_page(fetched, PAGE_SIZE) {
                PageVerdict::Continue => {}
                PageVerdict::Stop(reason) => {
                    if let Some(warning) = reason {
                        log::warn!("{}", warning);
                        warnings.push(warning);
                    }
                    break;
                }
            }
            if let Some(total) = advertised_total {
                if rows.len() >= total {
                    break;
                }
            }
            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }

        Ok((rows, warnings))
    }

    /// Channel-level summary (`data.sum`) for the intraday broadcast path.
    pub async fn fetch_summary(
        &self,
        channel: Channel,
        window: DateWindow,
        field: &str,
    ) -> PipelineResult<Value> {
        let payload = json!({
            "level": "account",
            "channel": channel.as_str(),
            "start_time": window.start.to_string(),
            "end_time": window.end.to_string(),
            "field": field,
            "page": 1,
            "page_size": PAGE_SIZE,
            "report_timezone": "",
        });
        let data = self.call_authorized("/admanage/channel/summary", &payload).await?;
        Ok(data.get("sum").cloned().unwrap_or(Value::Null))
    }

    /// Declared row accessor: the internal API nests rows at `data.list`.
    fn rows_of(data: &Value) -> &[Value] {
        data.get("list")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// One request with bearer auth; a rejected token triggers exactly one
    /// refresh-and-retry before the failure becomes fatal.
    async fn call_authorized(&self, path: &str, payload: &Value) -> PipelineResult<Value> {
        let mut refreshed = false;
        loop {
            let credential = if refreshed {
                self.credentials.force_refresh(PROVIDER).await?
            } else {
                self.credentials.get(PROVIDER).await?
            };
            match self.call_once(path, payload, &credential.token_material).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_auth_expired() && !refreshed => {
                    log::warn!("bearer token rejected, refreshing once: {}", err.message);
                    refreshed = true;
                }
                Err(err) if err.is_auth_expired() => {
                    return Err(PipelineError::auth_expired(format!(
                        "bearer token rejected twice for {path}: {}",
                        err.message
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        path: &str,
        payload: &Value,
        token_material: &str,
    ) -> PipelineResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let authorization = authorization_value(token_material);

        retry_with_backoff(&RETRY_DELAYS, |_attempt| {
            let url = url.clone();
            let authorization = authorization.clone();
            async move {
                let response = self
                    .client
                    .post(&url)
                    .timeout(HTTP_READ_TIMEOUT)
                    .header("Authorization", authorization)
                    .header("Origin", "https://xmp.mobvista.com")
                    .header("Referer", "https://xmp.mobvista.com/")
                    .json(payload)
                    .send()
                    .await?;

                let status = response.status();
                if status.as_u16() == 429 {
                    return Err(PipelineError::rate_limited(format!("{url} returned 429")));
                }
                if status.is_server_error() {
                    return Err(PipelineError::transient(format!("{url} returned {status}")));
                }

                let body: Value = response.json().await.map_err(|err| {
                    PipelineError::invalid(format!("internal API body not JSON: {err}"))
                })?;
                match body.get("code").and_then(Value::as_i64) {
                    Some(0) => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
                    Some(401) | Some(403) | Some(-1) => Err(PipelineError::auth_expired(
                        body.get("msg")
                            .and_then(Value::as_str)
                            .unwrap_or("token invalid")
                            .to_string(),
                    )),
                    Some(code) => Err(PipelineError::invalid(format!(
                        "internal API error code {code}: {}",
                        body.get("msg").and_then(Value::as_str).unwrap_or_default()
                    ))),
                    None => Err(PipelineError::invalid("internal API response missing code")),
                }
            }
        })
        .await
    }

    fn parse_campaign(&self, raw: &Value, channel: Channel, window: DateWindow) -> CampaignFact {
        let empty = serde_json::Map::new();
        let obj = raw.as_object().unwrap_or(&empty);
        let spend = field_f64(obj, "cost");
        let revenue = field_f64(obj, "total_complete_payment_rate");
        let known = [
            "campaign_id",
            "campaign_name",
            "country",
            "cost",
            "total_complete_payment_rate",
            "impression",
            "click",
        ];
        let extra = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        CampaignFact {
            stat_date: window.start,
            channel,
            campaign_id: field_string(obj, "campaign_id"),
            campaign_name: field_string(obj, "campaign_name"),
            country: field_string(obj, "country"),
            spend,
            revenue,
            impressions: field_f64(obj, "impression") as i64,
            clicks: field_f64(obj, "click") as i64,
            extra,
        }
    }

    fn parse_optimizer(&self, raw: &Value, channel: Channel, window: DateWindow) -> OptimizerRollup {
        let empty = serde_json::Map::new();
        let obj = raw.as_object().unwrap_or(&empty);
        let spend = field_f64(obj, "cost");
        let revenue = field_f64(obj, "total_complete_payment_rate");
        OptimizerRollup {
            stat_date: window.start,
            optimizer_name: field_string(obj, "optimizer_name"),
            channel,
            spend,
            revenue,
            roas: if spend > 0.0 { revenue / spend } else { 0.0 },
            campaign_count: field_f64(obj, "campaign_count") as i64,
        }
    }
}

/// The console stores the captured header verbatim; accept both shapes.
fn authorization_value(token_material: &str) -> String {
    if token_material.starts_with("Bearer ") {
        token_material.to_string()
    } else {
        format!("Bearer {token_material}")
    }
}

fn field_string(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn field_f64(obj: &serde_json::Map<String, Value>, key: &str) -> f64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[async_trait]
impl ProviderAdapter for XmpInternalAdapter {
    fn name(&self) -> &'static str {
        "xmp_internal"
    }

    async fn extract(&self, window: DateWindow) -> PipelineResult<Extraction> {
        let mut campaigns = Vec::new();
        let mut optimizers = Vec::new();
        let mut warnings = Vec::new();
        let mut raw_sections = serde_json::Map::new();

        for channel in [Channel::Facebook, Channel::Tiktok] {
            let (rows, mut channel_warnings) = self
                .fetch_level(LevelScope::Campaign, channel, window, CAMPAIGN_FIELDS, &[])
                .await?;
            warnings.append(&mut channel_warnings);
            raw_sections.insert(
                format!("{}_campaigns", channel.as_str()),
                Value::Array(rows.clone()),
            );
            campaigns.extend(rows.iter().map(|r| self.parse_campaign(r, channel, window)));

            let (rows, mut channel_warnings) = self
                .fetch_level(LevelScope::Optimizer, channel, window, OPTIMIZER_FIELDS, &[])
                .await?;
            warnings.append(&mut channel_warnings);
            raw_sections.insert(
                format!("{}_optimizers", channel.as_str()),
                Value::Array(rows.clone()),
            );
            optimizers.extend(rows.iter().map(|r| self.parse_optimizer(r, channel, window)));
        }

        let observations: Vec<SpendObservation> = campaigns
            .iter()
            .map(|row| SpendObservation {
                label: format!("xmp_internal campaign {}", row.campaign_id),
                spend: row.spend,
                revenue: row.revenue,
                impressions: row.impressions,
            })
            .collect();
        warnings.extend(validate_observations(&observations));

        self.credentials.mark_used(PROVIDER)?;

        Ok(Extraction {
            source: "xmp_internal",
            batches: vec![
                FactBatch::XmpInternalCampaigns(campaigns),
                FactBatch::XmpOptimizerStats(optimizers),
            ],
            raw_payload: Value::Object(raw_sections),
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use tempfile::tempdir;

    struct StaticRefresher {
        token: String,
    }

    #[async_trait]
    impl crate::credentials::CredentialRefresher for StaticRefresher {
        async fn refresh(&self, provider: &str) -> PipelineResult<crate::credentials::Credential> {
            Ok(crate::credentials::Credential::new(provider, self.token.clone()))
        }
    }

    fn store_with_token(dir: &std::path::Path, token: &str) -> Arc<CredentialStore> {
        let mut store = CredentialStore::new(dir);
        store.register_refresher(
            PROVIDER,
            Arc::new(StaticRefresher {
                token: format!("{token}-refreshed"),
            }),
        );
        store.save(PROVIDER, token).expect("seed token");
        Arc::new(store)
    }

    fn window() -> DateWindow {
        DateWindow::single(NaiveDate::from_ymd_opt(2026, 1, 16).unwrap())
    }

    fn list_response(rows: Vec<Value>, total: usize) -> Value {
        json!({"code": 0, "msg": "ok", "data": {"list": rows, "total": total}})
    }

    #[test]
    fn authorization_header_accepts_both_shapes() {
        assert_eq!(authorization_value("abc"), "Bearer abc");
        assert_eq!(authorization_value("Bearer abc"), "Bearer abc");
    }

    #[tokio::test]
    async fn extract_collects_campaigns_and_optimizers_per_channel() {
        let dir = tempdir().expect("dir");
        let server = Server::run();
        // level=campaign and level=optimizer for each of the two channels.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/admanage/channel/list"),
                request::body(json_decoded(|body: &Value| body["level"] == json!("campaign"))),
            ])
            .times(2)
            .respond_with(json_encoded(list_response(
                vec![json!({
                    "campaign_id": "c-9",
                    "campaign_name": "15000201-US",
                    "country": "US",
                    "cost": 40.0,
                    "total_complete_payment_rate": 18.0,
                    "impression": 4000,
                    "click": 80,
                })],
                1,
            ))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/admanage/channel/list"),
                request::body(json_decoded(|body: &Value| body["level"] == json!("optimizer"))),
            ])
            .times(2)
            .respond_with(json_encoded(list_response(
                vec![json!({
                    "optimizer_name": "kino",
                    "cost": 40.0,
                    "total_complete_payment_rate": 18.0,
                    "campaign_count": 3,
                })],
                1,
            ))),
        );

        let adapter = XmpInternalAdapter::new(store_with_token(dir.path(), "tok"), 100_000)
            .with_base_url(server.url_str(""));
        let extraction = adapter.extract(window()).await.expect("extract");

        match &extraction.batches[0] {
            FactBatch::XmpInternalCampaigns(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].channel, Channel::Facebook);
                assert_eq!(rows[1].channel, Channel::Tiktok);
                assert!((rows[0].revenue - 18.0).abs() < 1e-9);
            }
            other => panic!("unexpected batch {other:?}"),
        }
        match &extraction.batches[1] {
            FactBatch::XmpOptimizerStats(rows) => {
                assert_eq!(rows.len(), 2);
                assert!((rows[0].roas - 0.45).abs() < 1e-9);
                assert_eq!(rows[0].campaign_count, 3);
            }
            other => panic!("unexpected batch {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_token_refreshes_once_then_succeeds() {
        let dir = tempdir().expect("dir");
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/admanage/channel/list"),
                request::headers(contains(("authorization", "Bearer stale"))),
            ])
            .respond_with(json_encoded(json!({"code": 401, "msg": "Token 无效"}))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/admanage/channel/list"),
                request::headers(contains(("authorization", "Bearer stale-refreshed"))),
            ])
            .respond_with(json_encoded(list_response(vec![], 0))),
        );

        let adapter = XmpInternalAdapter::new(store_with_token(dir.path(), "stale"), 100_000)
            .with_base_url(server.url_str(""));
        let (rows, warnings) = adapter
            .fetch_level(LevelScope::Campaign, Channel::Tiktok, window(), CAMPAIGN_FIELDS, &[])
            .await
            .expect("refresh recovers");
        assert!(rows.is_empty());
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn second_auth_rejection_is_fatal() {
        let dir = tempdir().expect("dir");
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/admanage/channel/list"))
                .times(2)
                .respond_with(json_encoded(json!({"code": -1, "msg": "Token 无效"}))),
        );

        let adapter = XmpInternalAdapter::new(store_with_token(dir.path(), "bad"), 100_000)
            .with_base_url(server.url_str(""));
        let err = adapter
            .fetch_level(LevelScope::Campaign, Channel::Tiktok, window(), CAMPAIGN_FIELDS, &[])
            .await
            .expect_err("fatal after second rejection");
        assert_eq!(err.kind, crate::contracts::ErrorKind::AuthExpired);
        assert!(err.message.contains("twice"));
    }

    #[tokio::test]
    async fn pagination_respects_advertised_total() {
        let dir = tempdir().expect("dir");
        let server = Server::run();
        let full_page: Vec<Value> = (0..PAGE_SIZE)
            .map(|i| json!({"campaign_id": format!("c-{i}"), "cost": 1.0}))
            .collect();
        // Advertised total of 100 means page 2 is never requested.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/admanage/channel/list"),
                request::body(json_decoded(|body: &Value| body["page"] == json!(1))),
            ])
            .respond_with(json_encoded(list_response(full_page, PAGE_SIZE))),
        );

        let adapter = XmpInternalAdapter::new(store_with_token(dir.path(), "tok"), 100_000)
            .with_base_url(server.url_str(""));
        let (rows, _) = adapter
            .fetch_level(LevelScope::Campaign, Channel::Facebook, window(), CAMPAIGN_FIELDS, &[])
            .await
            .expect("fetch");
        assert_eq!(rows.len(), PAGE_SIZE);
    }

    #[tokio::test]
    async fn summary_returns_sum_object() {
        let dir = tempdir().expect("dir");
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/admanage/channel/summary"))
                .respond_with(json_encoded(json!({
                    "code": 0,
                    "data": {"sum": {"cost": 120.0, "total_complete_payment_rate": 55.0}},
                }))),
        );

        let adapter = XmpInternalAdapter::new(store_with_token(dir.path(), "tok"), 100_000)
            .with_base_url(server.url_str(""));
        let sum = adapter
            .fetch_summary(Channel::Tiktok, window(), "cost,total_complete_payment_rate")
            .await
            .expect("summary");
        assert_eq!(sum["cost"], json!(120.0));
    }
}
