pub mod sqlite;
pub mod trait_def;

pub use sqlite::SqliteHitStore;
pub use trait_def::{HitStore, PendingPage, StorageError, StorageResult};
