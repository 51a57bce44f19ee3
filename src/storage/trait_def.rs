use crate::models::{Hit, QueuedHit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode hit: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt queue row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Hits read from the head of one tracker's queue
#[derive(Debug, Default)]
pub struct PendingPage {
    pub hits: Vec<QueuedHit>,
    /// Unreadable rows removed while reading this page
    pub dropped: u64,
}

/// Durable, ordered store of pending hits.
///
/// Only the dispatch worker calls into a store, so implementations need no
/// caller-visible locking beyond what `Send + Sync` requires.
#[async_trait]
pub trait HitStore: Send + Sync {
    /// Create tables and indexes
    async fn init(&self) -> StorageResult<()>;

    /// Append a hit and return its sequence id
    async fn append(&self, hit: &Hit) -> StorageResult<i64>;

    /// Tracking ids with pending hits, ordered by their oldest pending hit
    async fn pending_trackers(&self) -> StorageResult<Vec<String>>;

    /// Up to `limit` oldest hits of one tracker, in enqueue order.
    /// Rows that cannot be decoded are removed, counted in `dropped`, and
    /// reading continues past them; an empty page means the queue is empty.
    async fn oldest(&self, tracking_id: &str, limit: usize) -> StorageResult<PendingPage>;

    /// Delete acknowledged or dropped hits in one statement
    async fn remove(&self, ids: &[i64]) -> StorageResult<u64>;

    /// Delete hits captured before `cutoff`
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;

    /// Pending hits for one tracker, or for all trackers
    async fn count(&self, tracking_id: Option<&str>) -> StorageResult<u64>;

    async fn property(&self, key: &str) -> StorageResult<Option<String>>;

    async fn set_property(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Release connections; called once when the worker stops
    async fn close(&self) {}
}
