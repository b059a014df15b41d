//! Handlers for the export and thumbnail families. Rendering itself is
//! delegated to injected renderers; the sync family handler lives in `sync`.

pub mod export;
pub mod thumbnail;

pub use export::{ExportHandler, ExportRenderer};
pub use thumbnail::{ThumbnailHandler, ThumbnailRenderer};
