use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ReportSink, WEBHOOK_TIMEOUT};
use crate::contracts::{PipelineError, PipelineResult};
use crate::report::{DocumentModel, TableModel};

/// # NDOC
/// component: `lark::card`
/// purpose: Chat-card sink. Flattens the document model into one interactive
///          card; no structural pagination, long tables truncate at the row
///          cap with an ellipsis row.
pub struct LarkCardSink {
    client: reqwest::Client,
    webhook_url: String,
    row_cap: usize,
}

impl LarkCardSink {
    pub fn new(webhook_url: impl Into<String>, row_cap: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            row_cap,
        }
    }
}

#[async_trait]
impl ReportSink for LarkCardSink {
    fn name(&self) -> &'static str {
        "chat_card"
    }

    async fn render(&self, model: &DocumentModel) -> PipelineResult<()> {
        let card = build_card(model, self.row_cap);
        let response = self
            .client
            .post(&self.webhook_url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&card)
            .send()
            .await
            .map_err(|err| PipelineError::sink(format!("chat webhook unreachable: {err}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::sink(format!(
                "chat webhook returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| PipelineError::sink(format!("chat webhook body not JSON: {err}")))?;
        match body.get("code").and_then(Value::as_i64) {
            Some(0) | None => {
                log::info!("chat card published: {}", model.title);
                Ok(())
            }
            Some(code) => Err(PipelineError::sink(format!(
                "chat webhook rejected card with code {code}: {}",
                body.get("msg").and_then(Value::as_str).unwrap_or_default()
            ))),
        }
    }
}

/// Card layout: header, one markdown block per section, dividers between
/// sections, tables as fixed-width text lines.
pub fn build_card(model: &DocumentModel, row_cap: usize) -> Value {
    let mut elements = Vec::new();
    for (i, section) in model.sections.iter().enumerate() {
        if i > 0 {
            elements.push(json!({"tag": "hr"}));
        }
        let mut lines = vec![format!("**{}**", section.heading)];
        lines.extend(section.paragraphs.iter().cloned());
        for table in &section.tables {
            lines.extend(table_lines(table, row_cap));
        }
        elements.push(json!({
            "tag": "div",
            "text": {"tag": "lark_md", "content": lines.join("\n")},
        }));
    }

    json!({
        "msg_type": "interactive",
        "card": {
            "header": {
                "title": {"tag": "plain_text", "content": model.title},
                "template": "blue",
            },
            "elements": elements,
        },
    })
}

fn table_lines(table: &TableModel, row_cap: usize) -> Vec<String> {
    let mut lines = vec![table.headers.join(" | ")];
    for row in table.rows.iter().take(row_cap) {
        lines.push(row.join(" | "));
    }
    if table.rows.len() > row_cap {
        lines.push(format!("… ({} more rows)", table.rows.len() - row_cap));
    }
    lines
}
