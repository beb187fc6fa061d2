pub mod engine;
pub mod record;
pub mod store;

pub use engine::{StorageEngine, META_CF, QUEUE_CF, RECORDS_CF};
pub use record::Record;
pub use store::{ChangeKind, LocalStore, StoreChange, StoreStats, StoreTransaction};
