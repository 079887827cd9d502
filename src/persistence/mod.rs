pub mod lock;
pub mod store;

pub use lock::SingleWriterLock;
pub use store::{dec_from_db, dec_to_db, ts_from_db, IdempotencyCheck, StateStore};
