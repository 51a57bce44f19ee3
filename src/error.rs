//! Error kinds and the side-channel error reports
//!
//! Validation and sampling outcomes never show up here: the send call that
//! triggered them already answered with a plain `bool`. What does show up is
//! everything that happens after the call returned, on the dispatch worker.

use serde::Serialize;
use thiserror::Error;

use crate::models::ParamError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Coarse classification of asynchronous failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoError = 0,
    /// Durable storage could not be read or written
    DatabaseError = 1,
    /// The collector could not be reached or refused hits
    NetworkError = 2,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A non-fatal failure observed by the dispatch worker.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    /// Tracker whose hits were affected, when the failure is tracker scoped
    pub tracking_id: Option<String>,
    pub message: String,
    /// Hits permanently removed from the queue because of this failure
    pub dropped_hits: u64,
}

impl ErrorReport {
    pub fn database(tracking_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::DatabaseError,
            tracking_id: tracking_id.map(str::to_string),
            message: message.into(),
            dropped_hits: 0,
        }
    }

    pub fn network(tracking_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NetworkError,
            tracking_id: tracking_id.map(str::to_string),
            message: message.into(),
            dropped_hits: 0,
        }
    }

    pub fn with_dropped(mut self, dropped_hits: u64) -> Self {
        self.dropped_hits = dropped_hits;
        self
    }
}

/// Errors surfaced by the public API
#[derive(Debug, Error)]
pub enum HitlineError {
    #[error("tracking id must not be empty")]
    EmptyTrackingId,
    #[error("dispatch worker is no longer running")]
    WorkerStopped,
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, HitlineError>;
