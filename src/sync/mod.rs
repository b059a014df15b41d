//! Remote-to-relational synchronization.
//!
//! [`SyncJobHandler`] pages through one remote entity, maps each record with
//! [`RecordMapper`] and upserts the rows per target table. Webhook deliveries
//! for a single record go through [`WebhookApplier`].

pub mod handler;
pub mod mapper;
pub mod source;
pub mod webhook;

pub use handler::SyncJobHandler;
pub use mapper::{select_mappings, MappedRecord, MappingSelection, RecordMapper};
pub use source::{GraphqlRecordSource, Page, RemoteRecordSource};
pub use webhook::{normalize_payload, WebhookAction, WebhookApplier, WebhookOutcome};
