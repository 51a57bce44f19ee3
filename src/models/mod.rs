pub mod hit;
pub mod param;
pub mod transaction;

pub use hit::{Hit, HitType, QueuedHit, MAX_CUSTOM_INDEX};
pub use param::{Param, ParamError};
pub use transaction::{Transaction, TransactionItem};
