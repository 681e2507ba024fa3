//! Upload and download engines, queue-driven with segment-granular
//! resume, plus the operations facade external collaborators consume.

pub mod article;
pub mod cache;
pub mod download;
pub mod error;
pub mod facade;
pub mod publish;
pub mod upload;

use std::time::Duration;

/// One retry shape for both engines, paced by the config.
pub(crate) fn retry_policy(config: &common::EngineConfig) -> transport::RetryPolicy {
    transport::RetryPolicy {
        max_retries: config.max_retries,
        base: Duration::from_millis(config.retry_base_ms),
        cap: Duration::from_millis(config.retry_base_ms.saturating_mul(16)),
    }
}

pub use cache::SegmentCache;
pub use download::{DownloadEngine, DownloadRequest};
pub use error::{EngineError, Result};
pub use facade::{AccessSpec, Credentials, Handle, Recipient, UsenetSync, UserDescriptor};
pub use publish::Publisher;
pub use upload::UploadEngine;
