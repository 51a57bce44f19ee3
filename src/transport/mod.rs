//! Collector transport
//!
//! The dispatch worker talks to the collector only through [`Transport`], so
//! tests can swap in scripted doubles and the HTTP client stays replaceable.

pub mod http;
pub mod payload;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpTransport;
pub use payload::{anonymize_ip, build_batch, encode_hit, BatchLimits, EncodedBatch};

/// One POST worth of serialized hits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub use_https: bool,
    pub lines: Vec<String>,
}

impl BatchRequest {
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Collector answer to a batch that reached it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// Accepted except for these batch indexes, which are invalid for good
    PartiallyRejected(Vec<usize>),
    /// The whole request was refused and must not be retried as-is
    Rejected { status: u16 },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("collector answered {0}")]
    Status(u16),
    #[error("collector unreachable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Submits one batch. `Err` means the batch may be retried unchanged.
    async fn submit(&self, batch: &BatchRequest) -> Result<Delivery, TransportError>;
}
