use chrono::Utc;
use chrono_tz::Asia::Shanghai;
use serde_json::{json, Value};

use super::WEBHOOK_TIMEOUT;
use crate::contracts::{AlarmLevel, PipelineError};
use crate::data_models::DateWindow;

/// # NDOC
/// component: `lark::alert`
/// purpose: High-visibility alarm cards posted to the alert webhook.
/// invariants:
///   - Alarm-sink failures are logged, never retried indefinitely.
pub struct AlarmSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl AlarmSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    /// Posts one alarm card; returns whether the webhook accepted it.
    pub async fn send(&self, title: &str, level: AlarmLevel, body: &str) -> bool {
        if self.webhook_url.is_empty() {
            log::warn!("no alert webhook configured, dropping alarm: {}", title);
            return false;
        }
        let card = build_alarm_card(title, level, body);
        match self
            .client
            .post(&self.webhook_url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&card)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                log::info!("alarm sent: {}", title);
                true
            }
            Ok(response) => {
                log::error!(
                    "alarm webhook rejected '{}' with status {}",
                    title,
                    response.status()
                );
                false
            }
            Err(err) => {
                log::error!("alarm webhook unreachable for '{}': {}", title, err);
                false
            }
        }
    }

    /// The standard failure alarm: job name, source, error kind, and window.
    pub async fn send_failure(
        &self,
        job: &str,
        source: &str,
        err: &PipelineError,
        window: DateWindow,
    ) -> bool {
        let body = format!(
            "**Job**: {job}\n**Source**: {source}\n**Error kind**: {:?}\n**Window**: {window}\n**Detail**: {}",
            err.kind, err.message
        );
        self.send(
            &format!("{job} failed for {source}"),
            err.kind.alarm_level(),
            &body,
        )
        .await
    }
}

pub fn build_alarm_card(title: &str, level: AlarmLevel, body: &str) -> Value {
    let (color, icon) = match level {
        AlarmLevel::Info => ("blue", "ℹ️"),
        AlarmLevel::Warning => ("orange", "⚠️"),
        AlarmLevel::Error => ("red", "🚨"),
    };
    let timestamp = Utc::now()
        .with_timezone(&Shanghai)
        .format("%Y-%m-%d %H:%M:%S");
    json!({
        "msg_type": "interactive",
        "card": {
            "header": {
                "title": {"tag": "plain_text", "content": format!("{icon} {title}")},
                "template": color,
            },
            "elements": [
                {"tag": "div", "text": {"tag": "lark_md", "content": body}},
                {"tag": "div", "text": {"tag": "lark_md", "content": format!("**Time**: {timestamp}")}},
            ],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    #[test]
    fn alarm_card_carries_level_color_and_body() {
        let card = build_alarm_card("QuickBI sync failed", AlarmLevel::Error, "**Error**: 503");
        assert_eq!(card["card"]["header"]["template"], "red");
        assert!(card["card"]["header"]["title"]["content"]
            .as_str()
            .unwrap()
            .contains("QuickBI sync failed"));
        assert_eq!(
            card["card"]["elements"][0]["text"]["content"],
            "**Error**: 503"
        );
    }

    #[tokio::test]
    async fn send_posts_card_to_webhook() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/hook"),
                request::body(json_decoded(|body: &serde_json::Value| {
                    body["msg_type"] == "interactive"
                })),
            ])
            .respond_with(json_encoded(serde_json::json!({"code": 0}))),
        );

        let sink = AlarmSink::new(server.url_str("/hook"));
        assert!(sink.send("title", AlarmLevel::Warning, "body").await);
    }

    #[tokio::test]
    async fn send_failure_includes_job_source_kind_and_window() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::body(json_decoded(|body: &serde_json::Value| {
                let content = body["card"]["elements"][0]["text"]["content"]
                    .as_str()
                    .unwrap_or_default();
                content.contains("ingest")
                    && content.contains("quickbi")
                    && content.contains("RateLimited")
                    && content.contains("2026-01-16")
            })))
            .respond_with(json_encoded(serde_json::json!({"code": 0}))),
        );

        let sink = AlarmSink::new(server.url_str("/hook"));
        let window = DateWindow::single(chrono::NaiveDate::from_ymd_opt(2026, 1, 16).unwrap());
        let err = PipelineError::rate_limited("503 three times");
        assert!(sink.send_failure("ingest", "quickbi", &err, window).await);
    }

    #[tokio::test]
    async fn unreachable_webhook_reports_false_without_retry() {
        let sink = AlarmSink::new("http://127.0.0.1:9/hook");
        assert!(!sink.send("title", AlarmLevel::Info, "body").await);
    }
}
