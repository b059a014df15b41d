use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::JobFamily;
use crate::errors::{JobError, JobResult};

/// A payload that can be enqueued; its job id doubles as the queue key.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const FAMILY: JobFamily;

    fn job_id(&self) -> &str;

    fn to_value(&self) -> JobResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_value(value: serde_json::Value) -> JobResult<Self> {
        serde_json::from_value(value).map_err(|e| JobError::InvalidPayload {
            family: Self::FAMILY.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Xlsx,
    Pdf,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    pub job_id: String,
    #[serde(rename = "type")]
    pub format: ExportFormat,
    pub user_id: String,
    pub user_role: String,
    #[serde(default)]
    pub filters: serde_json::Value,
}

impl JobPayload for ExportPayload {
    const FAMILY: JobFamily = JobFamily::Export;

    fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailPayload {
    pub run_id: String,
    pub sizes: Vec<u32>,
    /// Limits the run to these SKUs; all SKUs when absent
    #[serde(default)]
    pub sku_ids: Option<Vec<String>>,
    pub triggered_by: String,
}

impl JobPayload for ThumbnailPayload {
    const FAMILY: JobFamily = JobFamily::Thumbnail;

    fn job_id(&self) -> &str {
        &self.run_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub job_id: String,
    pub connection_id: String,
    pub entity_type: String,
    #[serde(default)]
    pub delete_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub job_id: String,
    pub connection_id: String,
    /// Platform topic such as `products/update`
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Work handled by the sync family: a full entity pull or one webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncRequest {
    Entity(SyncPayload),
    Webhook(WebhookPayload),
}

impl JobPayload for SyncRequest {
    const FAMILY: JobFamily = JobFamily::Sync;

    fn job_id(&self) -> &str {
        match self {
            SyncRequest::Entity(payload) => &payload.job_id,
            SyncRequest::Webhook(payload) => &payload.job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_export_payload_wire_format() {
        let payload = ExportPayload::from_value(json!({
            "jobId": "exp-1",
            "type": "pdf",
            "userId": "u-7",
            "userRole": "buyer",
            "filters": {"season": "SS27"}
        }))
        .unwrap();
        assert_eq!(payload.format, ExportFormat::Pdf);
        assert_eq!(payload.job_id(), "exp-1");
    }

    #[test]
    fn test_thumbnail_job_id_is_run_id() {
        let payload = ThumbnailPayload::from_value(json!({
            "runId": "run-3",
            "sizes": [64, 256],
            "triggeredBy": "admin"
        }))
        .unwrap();
        assert_eq!(payload.job_id(), "run-3");
        assert!(payload.sku_ids.is_none());
    }

    #[test]
    fn test_sync_request_is_tagged() {
        let request = SyncRequest::Entity(SyncPayload {
            job_id: "sync-1".to_string(),
            connection_id: "shop-1".to_string(),
            entity_type: "Product".to_string(),
            delete_stale: true,
        });
        let value = request.to_value().unwrap();
        assert_eq!(value["kind"], "entity");
        assert_eq!(value["deleteStale"], true);

        let err = SyncRequest::from_value(json!({"kind": "refund"})).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }
}
