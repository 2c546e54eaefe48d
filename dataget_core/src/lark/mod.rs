pub mod alert;
pub mod card;
pub mod doc;

use async_trait::async_trait;

use crate::contracts::PipelineResult;
use crate::report::DocumentModel;

/// RPC timeout for document block calls.
pub const DOC_RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Webhook posts are quick or dead.
pub const WEBHOOK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// # NDOC
/// component: `lark`
/// purpose: Common rendering contract of the two publisher sinks.
#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, model: &DocumentModel) -> PipelineResult<()>;
}
