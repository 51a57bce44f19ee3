pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod registry;
pub mod sampler;
pub mod session;
pub mod storage;
pub mod tracked_view;
pub mod tracker;
pub mod transport;

pub use config::Config;
pub use error::{ErrorKind, ErrorReport, HitlineError, Result};
pub use models::{Hit, HitType, Param, Transaction, TransactionItem};
pub use registry::Analytics;
pub use session::{Clock, ManualClock, SystemClock};
pub use tracked_view::TrackedView;
pub use tracker::Tracker;
