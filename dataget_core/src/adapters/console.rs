use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use playwright::Playwright;
use serde_json::{json, Value};

use super::{
    retry_with_backoff, validate_observations, Extraction, PageGuard, PageVerdict,
    ProviderAdapter, SpendObservation, HTTP_READ_TIMEOUT,
};
use crate::archive::BlobArchive;
use crate::contracts::{PipelineError, PipelineResult};
use crate::credentials::{Credential, CredentialRefresher, CredentialStore};
use crate::data_models::{
    Channel, DateWindow, DramaMapping, EditorRollup, FactBatch, MaterialFact,
};

const DEFAULT_API_BASE_URL: &str = "https://xmp-api.mobvista.com";
const LOGIN_URL: &str = "https://xmp.mobvista.com/m/login";
const DATA_URL: &str = "https://xmp.mobvista.com/ads_manage/summary/material";
const PAGE_SIZE: usize = 100;
const PROVIDER: &str = "xmp";

/// A material is "hot" once its spend crosses this threshold.
const DEFAULT_HOT_MATERIAL_SPEND: f64 = 1_000.0;

const RETRY_DELAYS: [std::time::Duration; 2] = [
    std::time::Duration::from_secs(5),
    std::time::Duration::from_secs(15),
];

/// Everything a capture run needs to drive the console session.
#[derive(Debug, Clone)]
pub struct CaptureHint {
    pub login_url: String,
    pub data_url: String,
    pub username: String,
    pub password: String,
    /// Saved cookie jar; present for the non-interactive replay path.
    pub cookies: Option<Value>,
}

/// Artifacts a successful capture must produce.
#[derive(Debug, Clone)]
pub struct CapturedSession {
    pub bearer_token: String,
    pub cookies: Value,
}

/// # NDOC
/// component: `adapters::console`
/// purpose: Browser driver seam for harvesting a bearer token from the
///          console session; headless-browser-backed in production, stubbed
///          in tests.
#[async_trait]
pub trait TokenCaptureDriver: Send + Sync {
    async fn capture_bearer(&self, hint: &CaptureHint) -> PipelineResult<CapturedSession>;
}

/// Playwright-backed capture: load saved cookies, open the data page, log in
/// through the form when the session is gone, then lift the bearer token the
/// SPA keeps in local storage. A failed run leaves a screenshot in the
/// archive for operators.
pub struct PlaywrightTokenDriver {
    headless: bool,
    archive: Option<BlobArchive>,
}

impl PlaywrightTokenDriver {
    pub fn new(headless: bool) -> Self {
        Self {
            headless,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: BlobArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    fn save_debug_screenshot(&self, bytes: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        let name = format!("login_failure_{}.png", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = BlobArchive::screenshot_path(PROVIDER, &name);
        if let Err(err) = archive.put_bytes(&path, bytes) {
            log::warn!("could not archive login screenshot: {}", err);
        }
    }
}

fn browser_err(stage: &str, err: impl std::fmt::Debug) -> PipelineError {
    PipelineError::transient(format!("browser {stage} failed: {err:?}"))
}

#[async_trait]
impl TokenCaptureDriver for PlaywrightTokenDriver {
    async fn capture_bearer(&self, hint: &CaptureHint) -> PipelineResult<CapturedSession> {
        let playwright = Playwright::initialize()
            .await
            .map_err(|e| browser_err("init", e))?;
        let chromium = playwright.chromium();
        let browser = chromium
            .launcher()
            .headless(self.headless)
            .launch()
            .await
            .map_err(|e| browser_err("launch", e))?;
        let context = browser
            .context_builder()
            .build()
            .await
            .map_err(|e| browser_err("context", e))?;

        if let Some(jar) = &hint.cookies {
            match serde_json::from_value::<Vec<playwright::api::Cookie>>(jar.clone()) {
                Ok(cookies) => {
                    if let Err(e) = context.add_cookies(&cookies).await {
                        log::warn!("saved cookies were rejected by the browser: {e:?}");
                    }
                }
                Err(e) => log::warn!("saved cookie jar is malformed: {e}"),
            }
        }

        let page = context
            .new_page()
            .await
            .map_err(|e| browser_err("new page", e))?;
        page.goto_builder(&hint.data_url)
            .goto()
            .await
            .map_err(|e| browser_err("goto", e))?;
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;

        let current_url: String = page
            .eval("() => location.href")
            .await
            .map_err(|e| browser_err("eval href", e))?;

        if current_url.to_lowercase().contains("login") {
            log::info!("console session expired, submitting login form");
            page.goto_builder(&hint.login_url)
                .goto()
                .await
                .map_err(|e| browser_err("goto login", e))?;
            page.fill_builder("input[type=\"text\"]", &hint.username)
                .fill()
                .await
                .map_err(|e| browser_err("fill username", e))?;
            page.fill_builder("input[type=\"password\"]", &hint.password)
                .fill()
                .await
                .map_err(|e| browser_err("fill password", e))?;
            page.click_builder("button[type=\"submit\"]")
                .click()
                .await
                .map_err(|e| browser_err("click login", e))?;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            page.goto_builder(&hint.data_url)
                .goto()
                .await
                .map_err(|e| browser_err("goto data", e))?;
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        }

        // The SPA keeps the bearer token in local storage as a JWT.
        let token: String = page
            .eval(
                "() => { \
                   for (let i = 0; i < localStorage.length; i++) { \
                     const v = localStorage.getItem(localStorage.key(i)); \
                     if (v && v.startsWith('eyJ')) return v; \
                   } \
                   return ''; \
                 }",
            )
            .await
            .map_err(|e| browser_err("eval token", e))?;

        let cookies = context
            .cookies(&[])
            .await
            .map_err(|e| browser_err("read cookies", e))?;
        let cookies = serde_json::to_value(&cookies)
            .map_err(|e| PipelineError::internal(format!("cookie jar not serializable: {e}")))?;

        if token.is_empty() {
            if let Ok(bytes) = page.screenshot_builder().full_page(true).screenshot().await {
                self.save_debug_screenshot(&bytes);
            }
            let _ = browser.close().await;
            return Err(PipelineError::auth_interactive(
                "no bearer token appeared after cookie replay; interactive login required",
            ));
        }

        browser.close().await.map_err(|e| browser_err("close", e))?;
        Ok(CapturedSession {
            bearer_token: token,
            cookies,
        })
    }
}

/// Non-interactive credential refresh for the console provider: replay the
/// saved cookie jar through the capture driver and persist what comes back.
pub struct ConsoleRefresher {
    driver: Arc<dyn TokenCaptureDriver>,
    credentials: Arc<CredentialStore>,
    username: String,
    password: String,
}

impl ConsoleRefresher {
    pub fn new(
        driver: Arc<dyn TokenCaptureDriver>,
        credentials: Arc<CredentialStore>,
        username: String,
        password: String,
    ) -> Self {
        Self {
            driver,
            credentials,
            username,
            password,
        }
    }
}

#[async_trait]
impl CredentialRefresher for ConsoleRefresher {
    async fn refresh(&self, provider: &str) -> PipelineResult<Credential> {
        let hint = CaptureHint {
            login_url: LOGIN_URL.to_string(),
            data_url: DATA_URL.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            cookies: self.credentials.load_cookies(provider)?,
        };
        let session = self.driver.capture_bearer(&hint).await?;
        self.credentials.save_cookies(provider, &session.cookies)?;
        Ok(Credential::new(provider, session.bearer_token))
    }
}

/// # NDOC
/// component: `adapters::console`
/// purpose: Cookie-session adapter; once a bearer is captured it replays the
///          material-list XHR directly and feeds `xmp_materials`,
///          `xmp_editor_stats`, and the drama catalogue.
pub struct ConsoleAdapter {
    client: reqwest::Client,
    api_base_url: String,
    credentials: Arc<CredentialStore>,
    max_rows: usize,
    hot_spend_threshold: f64,
    page_delay: std::time::Duration,
}

impl ConsoleAdapter {
    pub fn new(credentials: Arc<CredentialStore>, max_rows: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            credentials,
            max_rows,
            hot_spend_threshold: DEFAULT_HOT_MATERIAL_SPEND,
            page_delay: std::time::Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        self.api_base_url = base;
        self.page_delay = std::time::Duration::ZERO;
        self
    }

    /// Replays the captured material-list request for one channel, page by
    /// page, with the standard single-refresh auth recovery.
    async fn fetch_materials(
        &self,
        channel: Channel,
        window: DateWindow,
    ) -> PipelineResult<(Vec<Value>, Vec<String>)> {
        let mut rows = Vec::new();
        let mut warnings = Vec::new();
        let mut guard = PageGuard::new("console", self.max_rows);
        let mut page = 1usize;

        loop {
            let payload = json!({
                "level": "designer",
                "channel": channel.as_str(),
                "start_time": window.start.to_string(),
                "end_time": window.end.to_string(),
                "page": page,
                "page_size": PAGE_SIZE,
            });
            let data = self.replay_request("/admanage/material/list", &payload).await?;
            let page_rows = data
                .get("list")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let advertised_total = data.get("total").and_then(Value::as_u64).map(|t| t as usize);
            let fetched = page_rows.len();
            rows.extend(page_rows);

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

    async fn replay_request(&self, path: &str, payload: &Value) -> PipelineResult<Value> {
        let mut refreshed = false;
        loop {
            let credential = if refreshed {
                self.credentials.force_refresh(PROVIDER).await?
            } else {
                self.credentials.get(PROVIDER).await?
            };
            match self.replay_once(path, payload, &credential.token_material).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_auth_expired() && !refreshed => {
                    refreshed = true;
                }
                Err(err) if err.is_auth_expired() => {
                    return Err(PipelineError::auth_expired(format!(
                        "console bearer rejected twice: {}",
                        err.message
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn replay_once(
        &self,
        path: &str,
        payload: &Value,
        token_material: &str,
    ) -> PipelineResult<Value> {
        let url = format!("{}{}", self.api_base_url, path);
        let authorization = if token_material.starts_with("Bearer ") {
            token_material.to_string()
        } else {
            format!("Bearer {token_material}")
        };

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

                if response.status().is_server_error() {
                    return Err(PipelineError::transient(format!(
                        "{url} returned {}",
                        response.status()
                    )));
                }
                let body: Value = response.json().await.map_err(|err| {
                    PipelineError::invalid(format!("console XHR body not JSON: {err}"))
                })?;
                match body.get("code").and_then(Value::as_i64) {
                    Some(0) | Some(200) => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
                    Some(401) | Some(403) | Some(-1) => Err(PipelineError::auth_expired(
                        body.get("msg")
                            .and_then(Value::as_str)
                            .unwrap_or("session rejected")
                            .to_string(),
                    )),
                    Some(code) => Err(PipelineError::invalid(format!(
                        "console XHR error code {code}"
                    ))),
                    None => Err(PipelineError::invalid("console XHR response missing code")),
                }
            }
        })
        .await
    }

    fn parse_material(&self, raw: &Value, window: DateWindow) -> Option<MaterialFact> {
        let obj = raw.as_object()?;
        let known = [
            "material_id",
            "designer_name",
            "cost",
            "impression",
            "click",
        ];
        let extra = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(MaterialFact {
            stat_date: window.start,
            material_id: string_field(obj, "material_id"),
            designer_name: string_field(obj, "designer_name"),
            cost: number_field(obj, "cost"),
            impression: number_field(obj, "impression") as i64,
            click: number_field(obj, "click") as i64,
            extra,
        })
    }

    /// Per-designer roll-up over one channel's materials.
    fn rollup_editors(
        &self,
        materials: &[(Value, MaterialFact)],
        channel: Channel,
        window: DateWindow,
    ) -> Vec<EditorRollup> {
        let by_editor: BTreeMap<String, Vec<&(Value, MaterialFact)>> = materials
            .iter()
            .filter(|entry| !entry.1.designer_name.is_empty())
            .map(|entry| (entry.1.designer_name.clone(), entry))
            .into_group_map()
            .into_iter()
            .collect();

        by_editor
            .into_iter()
            .map(|(editor_name, entries)| {
                let spend: f64 = entries.iter().map(|(_, m)| m.cost).sum();
                let revenue: f64 = entries
                    .iter()
                    .map(|(raw, _)| {
                        raw.get("total_complete_payment_rate")
                            .map(value_to_f64)
                            .unwrap_or(0.0)
                    })
                    .sum();
                let hot_count = entries
                    .iter()
                    .filter(|(_, m)| m.cost >= self.hot_spend_threshold)
                    .count() as i64;
                let top = entries
                    .iter()
                    .max_by(|a, b| {
                        a.1.cost
                            .partial_cmp(&b.1.cost)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .expect("group is non-empty");
                let material_count = entries.len() as i64;
                EditorRollup {
                    stat_date: window.start,
                    editor_name,
                    channel,
                    spend,
                    revenue,
                    roas: if spend > 0.0 { revenue / spend } else { 0.0 },
                    material_count,
                    hot_count,
                    hot_rate: hot_count as f64 / material_count as f64,
                    top_material: top
                        .0
                        .get("material_name")
                        .and_then(Value::as_str)
                        .unwrap_or(&top.1.material_id)
                        .to_string(),
                    top_material_spend: top.1.cost,
                }
            })
            .collect()
    }
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn number_field(obj: &serde_json::Map<String, Value>, key: &str) -> f64 {
    obj.get(key).map(value_to_f64).unwrap_or(0.0)
}

fn value_to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Drama catalogue entries carried on material rows; within one run the last
/// write for an id wins and the conflict is logged.
fn collect_drama_mappings(rows: &[Value]) -> Vec<DramaMapping> {
    let mut by_id: BTreeMap<String, String> = BTreeMap::new();
    for raw in rows {
        let Some(obj) = raw.as_object() else { continue };
        let id = string_field(obj, "drama_id");
        let name = string_field(obj, "drama_name");
        if id.is_empty() || name.is_empty() {
            continue;
        }
        if let Some(previous) = by_id.get(&id) {
            if previous != &name {
                log::warn!(
                    "drama {} renamed within one run: '{}' -> '{}'",
                    id,
                    previous,
                    name
                );
            }
        }
        by_id.insert(id, name);
    }
    by_id
        .into_iter()
        .map(|(drama_id, drama_name)| DramaMapping {
            drama_id,
            drama_name,
        })
        .collect()
}

#[async_trait]
impl ProviderAdapter for ConsoleAdapter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn extract(&self, window: DateWindow) -> PipelineResult<Extraction> {
        let mut materials = Vec::new();
        let mut editor_stats = Vec::new();
        let mut all_raw_rows = Vec::new();
        let mut warnings = Vec::new();
        let mut raw_sections = serde_json::Map::new();

        for channel in [Channel::Facebook, Channel::Tiktok] {
            let (raw_rows, mut channel_warnings) =
                self.fetch_materials(channel, window).await?;
            warnings.append(&mut channel_warnings);

            let parsed: Vec<(Value, MaterialFact)> = raw_rows
                .iter()
                .filter_map(|raw| self.parse_material(raw, window).map(|m| (raw.clone(), m)))
                .collect();
            editor_stats.extend(self.rollup_editors(&parsed, channel, window));
            materials.extend(parsed.into_iter().map(|(_, m)| m));

            raw_sections.insert(
                format!("{}_materials", channel.as_str()),
                Value::Array(raw_rows.clone()),
            );
            all_raw_rows.extend(raw_rows);
        }

        let dramas = collect_drama_mappings(&all_raw_rows);

        let observations: Vec<SpendObservation> = editor_stats
            .iter()
            .map(|e| SpendObservation {
                label: format!("console editor {} ({})", e.editor_name, e.channel.as_str()),
                spend: e.spend,
                revenue: e.revenue,
                impressions: 1, // editor roll-ups carry no impression column
            })
            .collect();
        warnings.extend(validate_observations(&observations));

        self.credentials.mark_used(PROVIDER)?;

        Ok(Extraction {
            source: "xmp",
            batches: vec![
                FactBatch::XmpMaterials(materials),
                FactBatch::XmpEditorStats(editor_stats),
                FactBatch::DramaMappings(dramas),
            ],
            raw_payload: Value::Object(raw_sections),
            warnings,
        })
    }
}
