//! Background delivery of queued hits

pub mod backoff;
pub mod schedule;
pub(crate) mod worker;

pub use backoff::Backoff;
pub use schedule::DispatchSchedule;
pub use worker::WorkerSettings;
