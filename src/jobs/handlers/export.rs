use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::jobs::handler::{JobArtifact, JobContext, JobHandler};
use crate::jobs::payloads::ExportPayload;
use crate::jobs::JobFamily;

/// Produces the XLSX or PDF document for an export request.
#[async_trait]
pub trait ExportRenderer: Send + Sync {
    async fn render(&self, request: &ExportPayload) -> anyhow::Result<Vec<u8>>;
}

pub struct ExportHandler {
    renderer: Arc<dyn ExportRenderer>,
}

impl ExportHandler {
    pub fn new(renderer: Arc<dyn ExportRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    fn family(&self) -> JobFamily {
        JobFamily::Export
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<Option<JobArtifact>> {
        let request: ExportPayload = ctx.payload()?;
        let format = request.format.extension();

        if !ctx
            .progress
            .update("rendering", Some(format), 10, None)
            .await?
        {
            return Ok(None);
        }

        let bytes = self.renderer.render(&request).await?;
        info!(
            "[{}] Rendered {} export for {} ({} bytes)",
            ctx.job_id,
            format,
            request.user_id,
            bytes.len()
        );

        let metrics = serde_json::json!({ "sizeBytes": bytes.len() });
        if !ctx
            .progress
            .update("uploading", None, 90, Some(metrics))
            .await?
        {
            return Ok(None);
        }

        Ok(Some(JobArtifact::new(
            format!("export-{}.{}", request.job_id, format),
            bytes,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_utils::setup_test_db;
    use crate::jobs::handler::ProgressHandle;
    use crate::jobs::store::JobStore;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct FixedRenderer;

    #[async_trait]
    impl ExportRenderer for FixedRenderer {
        async fn render(&self, request: &ExportPayload) -> anyhow::Result<Vec<u8>> {
            Ok(format!("{}:{}", request.user_role, request.filters).into_bytes())
        }
    }

    #[tokio::test]
    async fn test_export_names_artifact_by_format() {
        let store = JobStore::new(setup_test_db().await);
        store.create("exp-5", JobFamily::Export).await.unwrap();
        store.mark_processing("exp-5", "starting").await.unwrap();

        let ctx = JobContext {
            job_id: "exp-5".to_string(),
            family: JobFamily::Export,
            payload: json!({
                "jobId": "exp-5",
                "type": "xlsx",
                "userId": "u-1",
                "userRole": "admin",
                "filters": {}
            }),
            attempt: 1,
            progress: ProgressHandle::new(store.clone(), "exp-5", CancellationToken::new()),
        };

        let handler = ExportHandler::new(Arc::new(FixedRenderer));
        let artifact = handler.run(&ctx).await.unwrap().unwrap();
        assert_eq!(artifact.filename, "export-exp-5.xlsx");
        assert_eq!(artifact.bytes, b"admin:{}".to_vec());
        assert_eq!(store.require("exp-5").await.unwrap().progress_percent, 90);
    }
}
