use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ReportSink, DOC_RPC_TIMEOUT};
use crate::contracts::{PipelineError, PipelineResult};
use crate::report::{DocumentModel, TableModel};

const DEFAULT_BASE_URL: &str = "https://open.larksuite.com/open-apis";

/// Cell fills are serialized with at least this much spacing.
const CELL_FILL_DELAY: std::time::Duration = std::time::Duration::from_millis(200);
const CREATE_DELAY: std::time::Duration = std::time::Duration::from_millis(300);
const RATE_LIMIT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
const MAX_RPC_ATTEMPTS: usize = 3;

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// # NDOC
/// component: `lark::doc`
/// purpose: Block-RPC client for the long-form document sink.
/// invariants:
///   - Tables are created empty and their cells filled by patch calls,
///     serialized with >= 200 ms spacing and backoff on 429.
///   - The tenant token is cached until 60 s before expiry.
pub struct LarkDocClient {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    token: Mutex<Option<CachedToken>>,
    cell_fill_delay: std::time::Duration,
    create_delay: std::time::Duration,
    rate_limit_backoff: std::time::Duration,
}

impl LarkDocClient {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token: Mutex::new(None),
            cell_fill_delay: CELL_FILL_DELAY,
            create_delay: CREATE_DELAY,
            rate_limit_backoff: RATE_LIMIT_BACKOFF,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        self.base_url = base;
        self.cell_fill_delay = std::time::Duration::ZERO;
        self.create_delay = std::time::Duration::ZERO;
        self.rate_limit_backoff = std::time::Duration::from_millis(1);
        self
    }

    async fn tenant_access_token(&self) -> PipelineResult<String> {
        let mut cache = self.token.lock().await;
        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }

        let url = format!("{}/auth/v3/tenant_access_token/internal", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(DOC_RPC_TIMEOUT)
            .json(&json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await
            .map_err(|err| PipelineError::sink(format!("token endpoint unreachable: {err}")))?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| PipelineError::sink(format!("token body not JSON: {err}")))?;
        if body.get("code").and_then(Value::as_i64) != Some(0) {
            return Err(PipelineError::sink(format!(
                "tenant token refused: {}",
                body.get("msg").and_then(Value::as_str).unwrap_or_default()
            )));
        }
        let token = body
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::sink("token response missing tenant_access_token"))?
            .to_string();
        let expire = body.get("expire").and_then(Value::as_u64).unwrap_or(7200);
        *cache = Some(CachedToken {
            value: token.clone(),
            expires_at: Instant::now() + std::time::Duration::from_secs(expire.saturating_sub(60)),
        });
        log::info!("tenant access token refreshed");
        Ok(token)
    }

    /// One block RPC with 429 backoff; `patch` switches POST to PATCH.
    async fn block_rpc(&self, method: reqwest::Method, url: &str, payload: Option<&Value>) -> PipelineResult<Value> {
        let token = self.tenant_access_token().await?;
        for attempt in 0..MAX_RPC_ATTEMPTS {
            let mut request = self
                .client
                .request(method.clone(), url)
                .timeout(DOC_RPC_TIMEOUT)
                .bearer_auth(&token);
            if let Some(body) = payload {
                request = request.json(body);
            }
            let response = request
                .send()
                .await
                .map_err(|err| PipelineError::sink(format!("doc RPC unreachable: {err}")))?;

            if response.status().as_u16() == 429 {
                let wait = self.rate_limit_backoff * (attempt as u32 + 1);
                log::warn!("doc RPC rate limited, backing off {:?}", wait);
                tokio::time::sleep(wait).await;
                continue;
            }
            let body: Value = response
                .json()
                .await
                .map_err(|err| PipelineError::sink(format!("doc RPC body not JSON: {err}")))?;
            if body.get("code").and_then(Value::as_i64) != Some(0) {
                return Err(PipelineError::sink(format!(
                    "doc RPC {url} failed: code {} {}",
                    body.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    body.get("msg").and_then(Value::as_str).unwrap_or_default()
                )));
            }
            return Ok(body);
        }
        Err(PipelineError::rate_limited(format!(
            "doc RPC {url} rate limited {MAX_RPC_ATTEMPTS} times"
        )))
    }

    /// Creates child blocks under `block_id` (the document root block id
    /// equals the document token). Returns the created children.
    pub async fn create_block(
        &self,
        doc_token: &str,
        block_id: &str,
        children: Vec<Value>,
    ) -> PipelineResult<Vec<Value>> {
        let url = format!(
            "{}/docx/v1/documents/{doc_token}/blocks/{block_id}/children",
            self.base_url
        );
        let body = self
            .block_rpc(reqwest::Method::POST, &url, Some(&json!({"children": children})))
            .await?;
        tokio::time::sleep(self.create_delay).await;
        Ok(body["data"]["children"].as_array().cloned().unwrap_or_default())
    }

    pub async fn get_block_children(
        &self,
        doc_token: &str,
        block_id: &str,
    ) -> PipelineResult<Vec<Value>> {
        let url = format!(
            "{}/docx/v1/documents/{doc_token}/blocks/{block_id}/children",
            self.base_url
        );
        let body = self.block_rpc(reqwest::Method::GET, &url, None).await?;
        Ok(body["data"]["items"].as_array().cloned().unwrap_or_default())
    }

    /// Fills one text block; cells are created empty and patched afterwards.
    pub async fn update_cell(
        &self,
        doc_token: &str,
        block_id: &str,
        content: &str,
        bold: bool,
    ) -> PipelineResult<()> {
        let url = format!(
            "{}/docx/v1/documents/{doc_token}/blocks/{block_id}",
            self.base_url
        );
        let payload = json!({
            "update_text_elements": {
                "elements": [text_element(content, bold)],
            }
        });
        self.block_rpc(reqwest::Method::PATCH, &url, Some(&payload)).await?;
        tokio::time::sleep(self.cell_fill_delay).await;
        Ok(())
    }

    /// Creates one table block and fills its cells row-major.
    pub async fn create_table(
        &self,
        doc_token: &str,
        block_id: &str,
        table: &TableModel,
    ) -> PipelineResult<()> {
        let row_count = table.rows.len() + 1;
        let col_count = table.headers.len();
        log::info!("creating table: {} rows x {} cols", row_count, col_count);

        let table_block = json!({
            "block_type": 31,
            "table": {
                "property": {
                    "row_size": row_count,
                    "column_size": col_count,
                    "column_width": vec![120; col_count],
                }
            }
        });
        let created = self.create_block(doc_token, block_id, vec![table_block]).await?;
        let table_block_id = created
            .first()
            .and_then(block_id_of)
            .ok_or_else(|| PipelineError::sink("table create returned no block id"))?;

        let cells: Vec<String> = self
            .get_block_children(doc_token, &table_block_id)
            .await?
            .iter()
            .filter(|item| item.get("block_type").and_then(Value::as_i64) == Some(32))
            .filter_map(block_id_of)
            .collect();

        let mut text_ids = Vec::with_capacity(cells.len());
        for cell_id in &cells {
            let children = self.get_block_children(doc_token, cell_id).await?;
            let existing = children
                .iter()
                .find(|item| item.get("block_type").and_then(Value::as_i64) == Some(2))
                .and_then(block_id_of);
            let text_id = match existing {
                Some(id) => id,
                None => {
                    let created = self
                        .create_block(
                            doc_token,
                            cell_id,
                            vec![json!({
                                "block_type": 2,
                                "text": {"elements": [{"text_run": {"content": ""}}]},
                            })],
                        )
                        .await?;
                    created.first().and_then(block_id_of).ok_or_else(|| {
                        PipelineError::sink("cell text create returned no block id")
                    })?
                }
            };
            text_ids.push(text_id);
        }

        let contents: Vec<&String> = table
            .headers
            .iter()
            .chain(table.rows.iter().flatten())
            .collect();
        if text_ids.len() < contents.len() {
            log::warn!(
                "table has {} cells but {} values; filling what is there",
                text_ids.len(),
                contents.len()
            );
        }
        for (i, (text_id, content)) in text_ids.iter().zip(contents).enumerate() {
            let is_header = i < table.headers.len();
            self.update_cell(doc_token, text_id, content, is_header).await?;
        }
        Ok(())
    }

    /// Resolves a wiki node to its backing document object.
    pub async fn resolve_wiki_node(&self, wiki_token: &str) -> PipelineResult<String> {
        let url = format!(
            "{}/wiki/v2/spaces/get_node?token={wiki_token}",
            self.base_url
        );
        let body = self.block_rpc(reqwest::Method::GET, &url, None).await?;
        let node = &body["data"]["node"];
        let obj_type = node["obj_type"].as_str().unwrap_or_default();
        if obj_type != "docx" {
            return Err(PipelineError::sink(format!(
                "UnsupportedTarget: wiki node is '{obj_type}', not a document"
            )));
        }
        node["obj_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::sink("wiki node missing obj_token"))
    }
}

/// Either the raw `{"block_id": ...}` object or a bare id string; the
/// platform has returned both shapes.
fn block_id_of(item: &Value) -> Option<String> {
    match item {
        Value::String(id) => Some(id.clone()),
        Value::Object(obj) => obj.get("block_id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn text_element(content: &str, bold: bool) -> Value {
    let mut style = serde_json::Map::new();
    if bold {
        style.insert("bold".to_string(), Value::Bool(true));
    }
    json!({
        "text_run": {
            "content": content,
            "text_element_style": Value::Object(style),
        }
    })
}

fn text_block(content: &str, bold: bool) -> Value {
    json!({
        "block_type": 2,
        "text": {"elements": [text_element(content, bold)]},
    })
}

fn heading_block(content: &str, level: u8) -> Value {
    // heading1 = block_type 3, heading2 = 4, and so on.
    let mut block = serde_json::Map::new();
    block.insert("block_type".to_string(), Value::from(2 + level));
    block.insert(
        format!("heading{level}"),
        json!({"elements": [text_element(content, true)]}),
    );
    Value::Object(block)
}

fn divider_block() -> Value {
    json!({"block_type": 22, "divider": {}})
}

/// Where a document render lands: a plain document or a wiki node that
/// resolves to one.
#[derive(Debug, Clone)]
pub enum DocTarget {
    Document(String),
    WikiNode(String),
}

/// # NDOC
/// component: `lark::doc`
/// purpose: Long-form document sink; renders the model as heading, text,
///          divider, and chunked table blocks.
pub struct LarkDocSink {
    client: LarkDocClient,
    target: DocTarget,
    table_row_cap: usize,
}

impl LarkDocSink {
    pub fn new(client: LarkDocClient, target: DocTarget, table_row_cap: usize) -> Self {
        Self {
            client,
            target,
            table_row_cap,
        }
    }
}

#[async_trait]
impl ReportSink for LarkDocSink {
    fn name(&self) -> &'static str {
        "document"
    }

    async fn render(&self, model: &DocumentModel) -> PipelineResult<()> {
        let doc_token = match &self.target {
            DocTarget::Document(token) => token.clone(),
            DocTarget::WikiNode(wiki_token) => {
                self.client.resolve_wiki_node(wiki_token).await?
            }
        };

        self.client
            .create_block(
                &doc_token,
                &doc_token,
                vec![heading_block(&model.title, 1), divider_block()],
            )
            .await?;

        for section in &model.sections {
            let mut blocks = vec![heading_block(&section.heading, 2)];
            for paragraph in &section.paragraphs {
                blocks.push(text_block(paragraph, false));
            }
            self.client.create_block(&doc_token, &doc_token, blocks).await?;

            for table in &section.tables {
                // The platform caps data rows per table create; chunk and
                // repeat the header on every piece.
                for chunk in table.chunked(self.table_row_cap) {
                    self.client.create_table(&doc_token, &doc_token, &chunk).await?;
                }
            }

            self.client
                .create_block(&doc_token, &doc_token, vec![divider_block()])
                .await?;
        }

        log::info!("document published: {}", model.title);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Section;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    fn client_for(server: &Server) -> LarkDocClient {
        LarkDocClient::new("app", "secret").with_base_url(server.url_str(""))
    }

    fn expect_token(server: &Server) {
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/auth/v3/tenant_access_token/internal",
            ))
            .respond_with(json_encoded(json!({
                "code": 0,
                "tenant_access_token": "t-xyz",
                "expire": 7200,
            }))),
        );
    }

    #[tokio::test]
    async fn tenant_token_is_cached_across_calls() {
        let server = Server::run();
        expect_token(&server); // default times(1): a second fetch would fail
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/docx/v1/documents/doc-1/blocks/doc-1/children",
            ))
            .times(2)
            .respond_with(json_encoded(json!({"code": 0, "data": {"children": []}}))),
        );

        let client = client_for(&server);
        client
            .create_block("doc-1", "doc-1", vec![divider_block()])
            .await
            .expect("first create");
        client
            .create_block("doc-1", "doc-1", vec![divider_block()])
            .await
            .expect("second create");
    }

    #[tokio::test]
    async fn rate_limited_create_backs_off_and_retries() {
        let server = Server::run();
        expect_token(&server);
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/docx/v1/documents/doc-1/blocks/doc-1/children",
            ))
            .times(2)
            .respond_with(cycle![
                status_code(429),
                json_encoded(json!({"code": 0, "data": {"children": []}})),
            ]),
        );

        let client = client_for(&server);
        client
            .create_block("doc-1", "doc-1", vec![divider_block()])
            .await
            .expect("retry succeeds");
    }

    #[tokio::test]
    async fn create_table_fills_cells_row_major_with_bold_header() {
        let server = Server::run();
        expect_token(&server);
        // 1 data row x 2 cols -> row_size 2, 4 cells.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/docx/v1/documents/d/blocks/d/children"),
                request::body(json_decoded(|b: &Value| {
                    b["children"][0]["block_type"] == json!(31)
                        && b["children"][0]["table"]["property"]["row_size"] == json!(2)
                        && b["children"][0]["table"]["property"]["column_size"] == json!(2)
                })),
            ])
            .respond_with(json_encoded(json!({
                "code": 0,
                "data": {"children": [{"block_id": "tbl", "block_type": 31}]},
            }))),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/docx/v1/documents/d/blocks/tbl/children",
            ))
            .respond_with(json_encoded(json!({
                "code": 0,
                "data": {"items": [
                    {"block_id": "cell-0", "block_type": 32},
                    {"block_id": "cell-1", "block_type": 32},
                    {"block_id": "cell-2", "block_type": 32},
                    {"block_id": "cell-3", "block_type": 32},
                ]},
            }))),
        );
        let cell_paths = [
            "/docx/v1/documents/d/blocks/cell-0/children",
            "/docx/v1/documents/d/blocks/cell-1/children",
            "/docx/v1/documents/d/blocks/cell-2/children",
            "/docx/v1/documents/d/blocks/cell-3/children",
        ];
        let text_ids = ["txt-0", "txt-1", "txt-2", "txt-3"];
        for (path, text_id) in cell_paths.iter().zip(text_ids) {
            server.expect(
                Expectation::matching(request::method_path("GET", *path))
                    .respond_with(json_encoded(json!({
                        "code": 0,
                        "data": {"items": [{"block_id": text_id, "block_type": 2}]},
                    }))),
            );
        }
        // Header cells are bold, data cells are not.
        let header_patches = [
            "/docx/v1/documents/d/blocks/txt-0",
            "/docx/v1/documents/d/blocks/txt-1",
        ];
        for path in header_patches {
            server.expect(
                Expectation::matching(all_of![
                    request::method_path("PATCH", path),
                    request::body(json_decoded(|b: &Value| {
                        b["update_text_elements"]["elements"][0]["text_run"]
                            ["text_element_style"]["bold"]
                            == json!(true)
                    })),
                ])
                .respond_with(json_encoded(json!({"code": 0}))),
            );
        }
        let data_patches = [
            "/docx/v1/documents/d/blocks/txt-2",
            "/docx/v1/documents/d/blocks/txt-3",
        ];
        for path in data_patches {
            server.expect(
                Expectation::matching(request::method_path("PATCH", path))
                    .respond_with(json_encoded(json!({"code": 0}))),
            );
        }

        let client = client_for(&server);
        let mut table = TableModel::new(&["Name", "Spend"]);
        table.push_row(vec!["kino".to_string(), "$23,000.00".to_string()]);
        client.create_table("d", "d", &table).await.expect("table");
    }

    #[tokio::test]
    async fn wiki_node_that_is_not_a_document_is_unsupported() {
        let server = Server::run();
        expect_token(&server);
        server.expect(
            Expectation::matching(request::method_path("GET", "/wiki/v2/spaces/get_node"))
                .respond_with(json_encoded(json!({
                    "code": 0,
                    "data": {"node": {"obj_token": "s-1", "obj_type": "sheet"}},
                }))),
        );

        let client = client_for(&server);
        let err = client
            .resolve_wiki_node("wiki-1")
            .await
            .expect_err("not a doc");
        assert!(err.message.contains("UnsupportedTarget"));
    }

    #[tokio::test]
    async fn render_chunks_wide_tables_into_platform_sized_pieces() {
        let server = Server::run();
        expect_token(&server);
        // Twelve data rows under a five-row cap: exactly three table creates.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/docx/v1/documents/d/blocks/d/children"),
                request::body(json_decoded(|b: &Value| {
                    b["children"][0]["block_type"] == json!(31)
                })),
            ])
            .times(3)
            .respond_with(json_encoded(json!({
                "code": 0,
                "data": {"children": [{"block_id": "tbl", "block_type": 31}]},
            }))),
        );
        // Cells come back empty so the fill loop has nothing to patch.
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/docx/v1/documents/d/blocks/tbl/children",
            ))
            .times(3)
            .respond_with(json_encoded(json!({"code": 0, "data": {"items": []}}))),
        );
        // Title, section text, and divider creates.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/docx/v1/documents/d/blocks/d/children"),
                request::body(json_decoded(|b: &Value| {
                    b["children"][0]["block_type"] != json!(31)
                })),
            ])
            .times(1..)
            .respond_with(json_encoded(json!({"code": 0, "data": {"children": []}}))),
        );

        let mut table = TableModel::new(&["Name", "Spend"]);
        for i in 0..12 {
            table.push_row(vec![format!("p{i}"), format!("${i}")]);
        }
        let model = DocumentModel {
            title: "Weekly Report".to_string(),
            sections: vec![Section::new("Optimizer Weekly").table(table)],
        };

        let sink = LarkDocSink::new(
            client_for(&server),
            DocTarget::Document("d".to_string()),
            5,
        );
        sink.render(&model).await.expect("render");
    }

    #[test]
    fn heading_block_maps_levels_to_block_types() {
        let h1 = heading_block("Title", 1);
        assert_eq!(h1["block_type"], json!(3));
        assert!(h1.get("heading1").is_some());
        let h2 = heading_block("Section", 2);
        assert_eq!(h2["block_type"], json!(4));
    }

    #[test]
    fn block_id_of_accepts_both_shapes() {
        assert_eq!(
            block_id_of(&json!({"block_id": "b-1", "block_type": 2})),
            Some("b-1".to_string())
        );
        assert_eq!(block_id_of(&json!("b-2")), Some("b-2".to_string()));
        assert_eq!(block_id_of(&json!(42)), None);
    }
}
