use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

use crate::jobs::handler::{JobArtifact, JobContext, JobHandler};
use crate::jobs::payloads::ThumbnailPayload;
use crate::jobs::JobFamily;

pub const DEFAULT_FAN_OUT: usize = 4;

/// Generates product thumbnails for one SKU at a time.
#[async_trait]
pub trait ThumbnailRenderer: Send + Sync {
    /// SKUs processed when the request does not name any.
    async fn list_skus(&self) -> anyhow::Result<Vec<String>>;

    async fn render(&self, sku_id: &str, sizes: &[u32]) -> anyhow::Result<()>;
}

/// Renders SKUs with bounded fan-out and reports progress as they finish.
pub struct ThumbnailHandler {
    renderer: Arc<dyn ThumbnailRenderer>,
    fan_out: usize,
}

impl ThumbnailHandler {
    pub fn new(renderer: Arc<dyn ThumbnailRenderer>) -> Self {
        Self {
            renderer,
            fan_out: DEFAULT_FAN_OUT,
        }
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }
}

#[async_trait]
impl JobHandler for ThumbnailHandler {
    fn family(&self) -> JobFamily {
        JobFamily::Thumbnail
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<Option<JobArtifact>> {
        let request: ThumbnailPayload = ctx.payload()?;
        let skus = match &request.sku_ids {
            Some(skus) => skus.clone(),
            None => self.renderer.list_skus().await?,
        };
        let total = skus.len();

        let detail = format!("0/{}", total);
        if !ctx
            .progress
            .update("rendering", Some(detail.as_str()), 0, None)
            .await?
        {
            return Ok(None);
        }

        let sizes = request.sizes.as_slice();
        let renderer = &self.renderer;
        let mut results = stream::iter(skus)
            .map(|sku| async move {
                let result = renderer.render(&sku, sizes).await;
                (sku, result)
            })
            .buffer_unordered(self.fan_out);

        let mut rendered = 0usize;
        let mut failed = Vec::new();
        while let Some((sku, result)) = results.next().await {
            match result {
                Ok(()) => rendered += 1,
                Err(e) => {
                    warn!("[{}] Thumbnail for {} failed: {:#}", ctx.job_id, sku, e);
                    failed.push(sku);
                }
            }

            let done = rendered + failed.len();
            let metrics = serde_json::json!({
                "total": total,
                "rendered": rendered,
                "failed": failed.len(),
            });
            let percent = (done * 100 / total.max(1)) as i32;
            let detail = format!("{}/{}", done, total);
            if !ctx
                .progress
                .update(
                    "rendering",
                    Some(detail.as_str()),
                    percent,
                    Some(metrics),
                )
                .await?
            {
                return Ok(None);
            }
        }

        if total > 0 && rendered == 0 {
            anyhow::bail!("All {} thumbnails failed", total);
        }
        info!(
            "[{}] Rendered {} of {} thumbnails for {}",
            ctx.job_id, rendered, total, request.triggered_by
        );
        Ok(None)
    }
}
